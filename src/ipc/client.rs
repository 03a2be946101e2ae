//! Client side of the daemon socket.
//!
//! A background task reads frames, hands every tick to the attached
//! observers in order and answers the daemon with the client's interval
//! so the poller stays active while the client is connected.

use super::protocol::{self, ClientFrame, Command, Handshake, Reply, ServerFrame, KEEPALIVE_ID};
use crate::error::{Error, Result};
use crate::snapshot::Snapshot;
use crate::timer::SharedState;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, warn};

const REPLY_TIMEOUT: Duration = Duration::from_secs(90);

pub type ObserverId = u64;
type Observer = Box<dyn Fn(&Snapshot) + Send + Sync>;

#[derive(Default)]
struct Shared {
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    observers: Mutex<Vec<(ObserverId, Observer)>>,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Reply>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn observers(&self) -> MutexGuard<'_, Vec<(ObserverId, Observer)>> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, snapshot: &Snapshot) {
        for (_, observer) in self.observers().iter() {
            observer(snapshot);
        }
    }

    fn resolve(&self, reply: Reply) {
        if let Some(waiter) = self.pending().remove(&reply.id) {
            let _ = waiter.send(reply);
        }
    }
}

pub struct Client {
    init: Handshake,
    interval: Duration,
    state: SharedState,
    outgoing: mpsc::Sender<String>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    pump: Option<JoinHandle<()>>,
}

fn wait_bound(interval: Duration) -> Duration {
    (interval * 3).max(Duration::from_secs(3))
}

impl Client {
    /// Attaches to the daemon at `path` asking for ticks every `interval`.
    /// Returns once the daemon has sent its handshake.
    pub async fn connect(path: impl AsRef<Path>, interval: Duration) -> Result<Self> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).await.map_err(|err| match err.kind() {
            ErrorKind::NotFound | ErrorKind::ConnectionRefused => {
                Error::not_found(path.display().to_string(), err.to_string())
            }
            _ => Error::Io(err),
        })?;
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        let hello = ClientFrame::Hello {
            secret: protocol::secret(),
            version: protocol::VERSION.to_string(),
        };
        let keepalive = protocol::encode(&ClientFrame::Request {
            id: KEEPALIVE_ID,
            command: Command::Interval(interval.as_millis() as u64),
        })?;
        protocol::write_frame(&mut writer, &hello).await?;
        writer.write_all(keepalive.as_bytes()).await?;

        let bound = wait_bound(interval);
        let (init, first) = time::timeout(bound, handshake(&mut lines))
            .await
            .map_err(|_| Error::timeout("daemon handshake", bound))??;
        debug!(interval_ms = init.interval_ms, model = %init.board.model, "attached to daemon");

        let (state_tx, state) = watch::channel(first.map(Arc::new));
        let (outgoing, outgoing_rx) = mpsc::channel(16);
        let shared = Arc::new(Shared::default());
        let pump = tokio::spawn(pump(
            lines,
            writer,
            outgoing_rx,
            state_tx,
            Arc::clone(&shared),
            keepalive,
        ));

        Ok(Self {
            init,
            interval,
            state,
            outgoing,
            shared,
            next_id: AtomicU64::new(KEEPALIVE_ID + 1),
            pump: Some(pump),
        })
    }

    pub fn init(&self) -> &Handshake {
        &self.init
    }

    pub fn is_connected(&self) -> bool {
        self.pump.as_ref().is_some_and(|pump| !pump.is_finished())
    }

    /// Latest snapshot. Returns at once when one has arrived, otherwise
    /// waits for the first tick, at most `max(3 s, 3 × interval)`.
    pub async fn snapshot(&self) -> Result<Arc<Snapshot>> {
        if !self.is_connected() {
            return Err(Error::Protocol("client is not connected".to_string()));
        }
        let bound = wait_bound(self.interval);
        let mut state = self.state.clone();
        let latest = match time::timeout(bound, state.wait_for(Option::is_some)).await {
            Err(_) => return Err(Error::timeout("snapshot", bound)),
            Ok(Err(_)) => return Err(Error::Protocol("connection to daemon lost".to_string())),
            Ok(Ok(current)) => (*current).clone(),
        };
        latest.ok_or_else(|| Error::Protocol("connection to daemon lost".to_string()))
    }

    /// Registers `observer` for every following tick. Observers run on the
    /// connection task, one tick at a time, and must not attach or detach.
    pub fn attach<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&Snapshot) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.observers().push((id, Box::new(observer)));
        id
    }

    pub fn detach(&self, id: ObserverId) -> bool {
        let mut observers = self.shared.observers();
        let before = observers.len();
        observers.retain(|(other, _)| *other != id);
        observers.len() != before
    }

    pub async fn send(&self, command: Command) -> Result<Reply> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = protocol::encode(&ClientFrame::Request { id, command })?;
        let (tx, rx) = oneshot::channel();
        self.shared.pending().insert(id, tx);

        if self.outgoing.send(frame).await.is_err() {
            self.shared.pending().remove(&id);
            return Err(Error::Protocol("client is not connected".to_string()));
        }
        match time::timeout(REPLY_TIMEOUT, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Error::Protocol("connection closed before the reply".to_string())),
            Err(_) => {
                self.shared.pending().remove(&id);
                Err(Error::timeout("daemon reply", REPLY_TIMEOUT))
            }
        }
    }

    /// Drops the connection. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
            self.shared.pending().clear();
            debug!("detached from daemon");
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

async fn handshake(
    lines: &mut Lines<BufReader<OwnedReadHalf>>,
) -> Result<(Handshake, Option<Snapshot>)> {
    let mut first = None;
    loop {
        let Some(line) = lines.next_line().await? else {
            return Err(Error::Protocol("daemon closed the connection".to_string()));
        };
        match protocol::decode::<ServerFrame>(&line)? {
            ServerFrame::Init(init) => return Ok((init, first)),
            ServerFrame::Tick(snapshot) => first = Some(snapshot),
            ServerFrame::Error { message } => return Err(Error::Protocol(message)),
            ServerFrame::Reply(reply) if !reply.ok => {
                return Err(Error::Protocol(reply.error.unwrap_or_default()))
            }
            ServerFrame::Reply(_) => {}
        }
    }
}

async fn pump(
    mut lines: Lines<BufReader<OwnedReadHalf>>,
    mut writer: OwnedWriteHalf,
    mut outgoing: mpsc::Receiver<String>,
    state: watch::Sender<Option<Arc<Snapshot>>>,
    shared: Arc<Shared>,
    keepalive: String,
) {
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        debug!("daemon closed the connection");
                        break;
                    }
                    Err(err) => {
                        warn!(error = %err, "daemon connection failed");
                        break;
                    }
                };
                match protocol::decode::<ServerFrame>(&line) {
                    Ok(ServerFrame::Tick(snapshot)) => {
                        shared.notify(&snapshot);
                        state.send_replace(Some(Arc::new(snapshot)));
                        if let Err(err) = writer.write_all(keepalive.as_bytes()).await {
                            warn!(error = %err, "interval renewal failed");
                            break;
                        }
                    }
                    Ok(ServerFrame::Reply(reply)) => shared.resolve(reply),
                    Ok(ServerFrame::Init(_)) => {}
                    Ok(ServerFrame::Error { message }) => {
                        warn!(%message, "daemon dropped the client");
                        break;
                    }
                    Err(err) => warn!(error = %err, "malformed frame from daemon"),
                }
            }
            frame = outgoing.recv() => {
                let Some(frame) = frame else {
                    break;
                };
                if let Err(err) = writer.write_all(frame.as_bytes()).await {
                    warn!(error = %err, "request not sent");
                    break;
                }
            }
        }
    }
    state.send_replace(None);
    shared.pending().clear();
}
