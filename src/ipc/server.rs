//! Daemon main loop: accepts clients, drains the command queue and starts
//! or idles the polling timer depending on client activity.

use super::endpoint::Endpoint;
use super::protocol::{
    self, ClientFrame, Command, ConfigAction, Handshake, PowerModes, Reply, ServerFrame,
};
use crate::builder::Services;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::timer::{PollingTimer, SharedState, Tick};
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const QUEUE_DEPTH: usize = 64;
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);
const LIFECYCLE_CHECK: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum Response {
    Done,
    Text(String),
    Init(Box<Handshake>),
}

pub struct Envelope {
    pub command: Command,
    pub reply: oneshot::Sender<Result<Response>>,
}

pub struct Daemon<T: Tick> {
    cfg: Config,
    timer: PollingTimer<T>,
    services: Services,
    metrics: Arc<Metrics>,
    queue: mpsc::Sender<Envelope>,
    commands: mpsc::Receiver<Envelope>,
}

impl<T: Tick> Daemon<T> {
    pub fn new(cfg: Config, source: T, services: Services, metrics: Arc<Metrics>) -> Self {
        let (timer, _) = PollingTimer::new(source, Arc::clone(&metrics));
        timer.set_interval(cfg.interval());
        let (queue, commands) = mpsc::channel(QUEUE_DEPTH);
        Self {
            cfg,
            timer,
            services,
            metrics,
            queue,
            commands,
        }
    }

    /// Serves clients until `shutdown` flips. Returns the polling loop's
    /// failure, if any; the endpoint file is removed either way.
    pub async fn run(mut self, endpoint: Endpoint, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let secret: Arc<str> = protocol::secret().into();
        let mut check = time::interval(LIFECYCLE_CHECK);
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tasks = JoinSet::new();
        let mut last_activity = Instant::now();

        let outcome = loop {
            let running = self.timer.is_running();
            let idle_at = last_activity + self.cfg.idle_after(self.timer.interval());
            tokio::select! {
                accepted = endpoint.accept() => match accepted {
                    Ok(stream) => {
                        let conn = Connection {
                            secret: Arc::clone(&secret),
                            queue: self.queue.clone(),
                            state: self.timer.subscribe(),
                            metrics: Arc::clone(&self.metrics),
                            shutdown: shutdown.clone(),
                        };
                        tokio::spawn(async move {
                            if let Err(err) = conn.serve(stream).await {
                                debug!(error = %err, "client connection closed");
                            }
                        });
                    }
                    Err(err) => warn!(error = %err, "accept failed"),
                },
                Some(envelope) = self.commands.recv() => {
                    last_activity = Instant::now();
                    if let Err(err) = self.dispatch(envelope, &mut tasks).await {
                        break Err(err);
                    }
                }
                _ = time::sleep_until(idle_at), if running => {
                    info!("no client renewed its interval, going idle");
                    if let Err(err) = self.go_idle().await {
                        break Err(err);
                    }
                }
                _ = check.tick() => {
                    if let Err(err) = self.timer.check().await {
                        break Err(err);
                    }
                }
                Some(joined) = tasks.join_next() => {
                    if let Err(err) = joined {
                        warn!(error = %err, "command task failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("shutdown requested");
                    break Ok(());
                }
            }
        };

        tasks.shutdown().await;
        let stopped = self.timer.stop(self.cfg.stop_timeout()).await;
        drop(endpoint);
        if let Err(err) = &outcome {
            warn!(error = %err, "daemon loop failed");
        }
        outcome.and(stopped)
    }

    async fn go_idle(&mut self) -> Result<()> {
        self.timer.stop(self.cfg.stop_timeout()).await?;
        self.timer.reset();
        Ok(())
    }

    fn handshake(&self) -> Handshake {
        let services = &self.services;
        Handshake {
            version: protocol::VERSION.to_string(),
            board: services.board.clone(),
            interval_ms: self.timer.interval().as_millis() as u64,
            memory: services.memory.layout(),
            fan: services.fan.as_ref().map(|f| f.layout()).unwrap_or_default(),
            jetson_clocks: services.jetson_clocks.is_some(),
            power_modes: services.nvpmodel.as_ref().map(|nvp| PowerModes {
                models: nvp.models().iter().map(|m| m.name.clone()).collect(),
                default: nvp.default_mode(),
            }),
        }
    }

    /// `0` asks for the configured default.
    async fn set_interval(&mut self, ms: u64) -> Result<Response> {
        let ms = if ms == 0 {
            self.cfg.interval_ms
        } else {
            ms.max(self.cfg.min_interval_ms)
        };
        let interval = Duration::from_millis(ms);
        self.timer.start(interval).await?;
        Ok(Response::Init(Box::new(self.handshake())))
    }

    /// Routes one command. Quick commands finish inline; the ones that run
    /// external programs or wait for hardware go to `tasks`.
    async fn dispatch(&mut self, envelope: Envelope, tasks: &mut JoinSet<()>) -> Result<()> {
        let Envelope { command, reply } = envelope;
        let target = command.target();
        debug!(target, "command received");

        match command {
            Command::Interval(ms) => {
                match self.set_interval(ms).await {
                    Err(Error::Fatal(cause)) => {
                        respond(&self.metrics, target, reply, Err(Error::Fatal(cause.clone())));
                        return Err(Error::Fatal(cause));
                    }
                    outcome => respond(&self.metrics, target, reply, outcome),
                }
            }
            Command::Gpu(cmd) => {
                let outcome = self.services.gpu.apply(&cmd).map(|()| Response::Done);
                respond(&self.metrics, target, reply, outcome);
            }
            Command::ClearCache => {
                let outcome = self.services.memory.clear_cache().map(|()| Response::Done);
                respond(&self.metrics, target, reply, outcome);
            }
            Command::Config(ConfigAction::Reset) => {
                let outcome = self.services.reset_settings().map(|()| Response::Done);
                respond(&self.metrics, target, reply, outcome);
            }
            Command::Metrics => {
                let outcome = self
                    .metrics
                    .encode_metrics()
                    .map_err(|err| Error::Io(io::Error::other(err.to_string())))
                    .and_then(|body| {
                        String::from_utf8(body).map_err(|err| Error::Io(io::Error::other(err)))
                    })
                    .map(Response::Text);
                respond(&self.metrics, target, reply, outcome);
            }
            Command::Nvp { id, force } => match &self.services.nvpmodel {
                None => respond(
                    &self.metrics,
                    target,
                    reply,
                    Err(Error::not_found("nvpmodel", "power modes not configured")),
                ),
                // Validation errors are answered now; the change itself
                // answers when its task ends.
                Some(nvp) => match nvp.apply(id, force) {
                    Ok(None) => respond(
                        &self.metrics,
                        target,
                        reply,
                        Ok(Response::Text(format!("power mode {id} already set"))),
                    ),
                    Ok(Some(handle)) => self.spawn_command(tasks, target, reply, async move {
                        match handle.await {
                            Ok(Ok(mode)) => {
                                Ok(Response::Text(format!("power mode {} applied", mode.name)))
                            }
                            Ok(Err(err)) => Err(err),
                            Err(err) => Err(Error::Io(io::Error::other(err.to_string()))),
                        }
                    }),
                    Err(err) => respond(&self.metrics, target, reply, Err(err)),
                },
            },
            Command::Swap(cmd) => {
                let memory = self.services.memory.clone();
                self.spawn_command(tasks, target, reply, async move {
                    memory.apply_swap(&cmd).await.map(|()| Response::Done)
                });
            }
            Command::Fan(cmd) => match self.services.fan.clone() {
                Some(fan) => self.spawn_command(tasks, target, reply, async move {
                    fan.apply(&cmd).await.map(|()| Response::Done)
                }),
                None => respond(
                    &self.metrics,
                    target,
                    reply,
                    Err(Error::not_found("fan", "no pwm fan on this board")),
                ),
            },
            Command::Jc(cmd) => match self.services.jetson_clocks.clone() {
                Some(jc) => self.spawn_command(tasks, target, reply, async move {
                    jc.apply(cmd).await.map(|()| Response::Done)
                }),
                None => respond(
                    &self.metrics,
                    target,
                    reply,
                    Err(Error::not_found("jetson_clocks", "program not installed")),
                ),
            },
        }
        Ok(())
    }

    fn spawn_command<F>(
        &self,
        tasks: &mut JoinSet<()>,
        target: &'static str,
        reply: oneshot::Sender<Result<Response>>,
        work: F,
    ) where
        F: Future<Output = Result<Response>> + Send + 'static,
    {
        let metrics = Arc::clone(&self.metrics);
        tasks.spawn(async move {
            let outcome = work.await;
            respond(&metrics, target, reply, outcome);
        });
    }
}

fn respond(
    metrics: &Metrics,
    target: &'static str,
    reply: oneshot::Sender<Result<Response>>,
    outcome: Result<Response>,
) {
    match &outcome {
        Ok(_) => metrics.inc_command(target, "ok"),
        Err(err) => {
            metrics.inc_command(target, err.kind());
            warn!(target, error = %err, "command failed");
        }
    }
    if reply.send(outcome).is_err() {
        debug!(target, "client left before the reply");
    }
}

struct Connection {
    secret: Arc<str>,
    queue: mpsc::Sender<Envelope>,
    state: SharedState,
    metrics: Arc<Metrics>,
    shutdown: watch::Receiver<bool>,
}

struct Attached(Arc<Metrics>);

impl Drop for Attached {
    fn drop(&mut self) {
        self.0.client_detached();
    }
}

impl Connection {
    async fn serve(mut self, stream: UnixStream) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        let hello = time::timeout(HELLO_TIMEOUT, lines.next_line())
            .await
            .map_err(|_| Error::timeout("client hello", HELLO_TIMEOUT))??;
        let Some(hello) = hello else {
            return Ok(());
        };
        match protocol::decode::<ClientFrame>(&hello) {
            Ok(ClientFrame::Hello { secret, version }) if *secret == *self.secret => {
                if version != protocol::VERSION {
                    warn!(client = %version, daemon = protocol::VERSION, "client version differs");
                }
            }
            _ => {
                self.metrics.inc_protocol_error();
                let refusal = ServerFrame::Error {
                    message: "authentication failed".to_string(),
                };
                protocol::write_frame(&mut writer, &refusal).await?;
                return Err(Error::Protocol("client failed authentication".to_string()));
            }
        }

        self.metrics.client_attached();
        let _attached = Attached(Arc::clone(&self.metrics));
        debug!("client attached");

        let (out_tx, mut out_rx) = mpsc::channel::<(u64, Result<Response>)>(QUEUE_DEPTH);
        let mut initialized = false;
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        break;
                    };
                    if !self.handle_line(&line, &out_tx, &mut writer).await? {
                        break;
                    }
                }
                Some((id, outcome)) = out_rx.recv() => {
                    let frame = match outcome {
                        Ok(Response::Init(handshake)) if !initialized => {
                            initialized = true;
                            ServerFrame::Init(*handshake)
                        }
                        Ok(Response::Text(body)) => ServerFrame::Reply(Reply::ok(id, Some(body))),
                        Ok(_) => ServerFrame::Reply(Reply::ok(id, None)),
                        Err(err) => ServerFrame::Reply(Reply::failed(id, &err)),
                    };
                    protocol::write_frame(&mut writer, &frame).await?;
                }
                changed = self.state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let latest = self.state.borrow_and_update().clone();
                    if let Some(snapshot) = latest {
                        writer.write_all(protocol::encode_tick(&snapshot)?.as_bytes()).await?;
                    }
                }
                _ = self.shutdown.changed() => break,
            }
        }
        debug!("client detached");
        Ok(())
    }

    /// Queues one request. Returns `false` once the daemon is gone.
    async fn handle_line<W>(
        &self,
        line: &str,
        out: &mpsc::Sender<(u64, Result<Response>)>,
        writer: &mut W,
    ) -> Result<bool>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        let (id, command) = match protocol::decode::<ClientFrame>(line) {
            Ok(ClientFrame::Request { id, command }) => (id, command),
            Ok(ClientFrame::Hello { .. }) => {
                self.metrics.inc_protocol_error();
                debug!("repeated hello ignored");
                return Ok(true);
            }
            Err(err) => {
                self.metrics.inc_protocol_error();
                warn!(error = %err, "malformed frame dropped");
                if let Some(id) = protocol::request_id(line) {
                    let frame = ServerFrame::Reply(Reply::failed(id, &err));
                    protocol::write_frame(writer, &frame).await?;
                }
                return Ok(true);
            }
        };

        let (tx, rx) = oneshot::channel();
        let envelope = Envelope { command, reply: tx };
        if self.queue.send(envelope).await.is_err() {
            return Ok(false);
        }
        let out = out.clone();
        tokio::spawn(async move {
            let outcome = rx
                .await
                .unwrap_or_else(|_| Err(Error::State("daemon shutting down".to_string())));
            let _ = out.send((id, outcome)).await;
        });
        Ok(true)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::builder;
    use crate::snapshot::Snapshot;
    use std::path::{Path, PathBuf};
    use tokio::io::Lines;
    use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::task::JoinHandle;

    pub(crate) struct Harness {
        pub socket: PathBuf,
        pub metrics: Arc<Metrics>,
        pub shutdown: watch::Sender<bool>,
        pub handle: JoinHandle<Result<()>>,
    }

    pub(crate) async fn spawn_daemon(root: &Path, tweak: impl FnOnce(&mut Config)) -> Harness {
        let mut cfg = builder::tests::fake_board(root);
        cfg.socket_path = root.join("run/jetsond.sock");
        cfg.interval_ms = 50;
        cfg.min_interval_ms = 10;
        tweak(&mut cfg);
        let (source, services) = builder::assemble(&cfg).await;
        let metrics = Metrics::new().expect("metrics");
        let endpoint = Endpoint::bind(&cfg.socket_path, None, false).expect("bind");
        let socket = cfg.socket_path.clone();
        let daemon = Daemon::new(cfg, source, services, Arc::clone(&metrics));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(daemon.run(endpoint, shutdown_rx));
        Harness {
            socket,
            metrics,
            shutdown,
            handle,
        }
    }

    struct Raw {
        lines: Lines<BufReader<OwnedReadHalf>>,
        writer: OwnedWriteHalf,
    }

    impl Raw {
        async fn connect(path: &Path) -> Self {
            let stream = UnixStream::connect(path).await.expect("connect");
            let (reader, writer) = stream.into_split();
            Self {
                lines: BufReader::new(reader).lines(),
                writer,
            }
        }

        async fn send_line(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.expect("write");
            self.writer.write_all(b"\n").await.expect("write");
        }

        async fn send(&mut self, frame: &ClientFrame) {
            protocol::write_frame(&mut self.writer, frame).await.expect("write");
        }

        async fn hello(&mut self) {
            self.send(&ClientFrame::Hello {
                secret: protocol::secret(),
                version: protocol::VERSION.to_string(),
            })
            .await;
        }

        async fn request(&mut self, id: u64, command: Command) {
            self.send(&ClientFrame::Request { id, command }).await;
        }

        async fn next(&mut self) -> Option<ServerFrame> {
            let line = time::timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .expect("frame in time")
                .expect("read")?;
            Some(protocol::decode(&line).expect("server frame"))
        }

        async fn next_reply(&mut self, id: u64) -> Reply {
            loop {
                match self.next().await.expect("open") {
                    ServerFrame::Reply(reply) if reply.id == id => return reply,
                    _ => {}
                }
            }
        }

        async fn next_init(&mut self) -> Handshake {
            loop {
                if let ServerFrame::Init(handshake) = self.next().await.expect("open") {
                    return handshake;
                }
            }
        }

        async fn next_tick(&mut self) -> Snapshot {
            loop {
                if let ServerFrame::Tick(snapshot) = self.next().await.expect("open") {
                    return snapshot;
                }
            }
        }

        async fn attach(path: &Path, interval_ms: u64) -> (Self, Handshake) {
            let mut raw = Self::connect(path).await;
            raw.hello().await;
            raw.request(protocol::KEEPALIVE_ID, Command::Interval(interval_ms)).await;
            let init = raw.next_init().await;
            (raw, init)
        }
    }

    pub(crate) async fn stop(harness: Harness) {
        harness.shutdown.send(true).expect("daemon alive");
        let outcome = time::timeout(Duration::from_secs(5), harness.handle)
            .await
            .expect("daemon stopped in time")
            .expect("join");
        assert!(outcome.is_ok(), "daemon failed: {outcome:?}");
        assert!(!harness.socket.exists());
    }

    #[tokio::test]
    async fn interval_request_starts_poller_and_returns_handshake() {
        let dir = tempfile::tempdir().expect("tempdir");
        let harness = spawn_daemon(dir.path(), |_| {}).await;

        let (mut client, init) = Raw::attach(&harness.socket, 80).await;
        assert_eq!(init.interval_ms, 80);
        assert_eq!(init.memory.ram_total, Some(1000));
        assert!(!init.jetson_clocks);
        assert!(init.power_modes.is_none());
        assert!(init.fan.is_empty());

        let first = client.next_tick().await;
        let second = client.next_tick().await;
        assert!(second.seq > first.seq);
        assert_eq!(harness.metrics.jetsond_clients.get(), 1.0);
        assert_eq!(harness.metrics.jetsond_poller_running.get(), 1.0);

        client.request(5, Command::Metrics).await;
        let reply = client.next_reply(5).await;
        assert!(reply.ok);
        assert!(reply.body.expect("body").contains("jetsond_ticks_total"));

        stop(harness).await;
    }

    #[tokio::test]
    async fn wrong_secret_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let harness = spawn_daemon(dir.path(), |_| {}).await;

        let mut client = Raw::connect(&harness.socket).await;
        client
            .send(&ClientFrame::Hello {
                secret: "0".repeat(64),
                version: protocol::VERSION.to_string(),
            })
            .await;
        match client.next().await {
            Some(ServerFrame::Error { message }) => assert!(message.contains("authentication")),
            other => panic!("expected refusal, got {other:?}"),
        }
        assert!(client.next().await.is_none());
        assert_eq!(harness.metrics.jetsond_protocol_errors_total.get(), 1.0);
        assert_eq!(harness.metrics.jetsond_clients.get(), 0.0);

        stop(harness).await;
    }

    #[tokio::test]
    async fn command_errors_go_back_to_the_sender() {
        let dir = tempfile::tempdir().expect("tempdir");
        let harness = spawn_daemon(dir.path(), |_| {}).await;
        let (mut client, _) = Raw::attach(&harness.socket, 100).await;

        client
            .request(
                1,
                Command::Fan(crate::sources::fan::FanCommand::Speed {
                    name: "pwmfan".to_string(),
                    idx: 0,
                    speed: 50,
                }),
            )
            .await;
        let reply = client.next_reply(1).await;
        assert!(!reply.ok);
        assert!(reply.error.expect("error").contains("not found"));

        client.request(2, Command::Nvp { id: 1, force: true }).await;
        assert!(!client.next_reply(2).await.ok);

        client.send_line(r#"{"request":{"id":3,"command":{"warp":9}}}"#).await;
        let reply = client.next_reply(3).await;
        assert!(!reply.ok);
        assert!(reply.error.expect("error").contains("protocol"));

        client.send_line("garbage").await;
        client.request(4, Command::ClearCache).await;
        let reply = client.next_reply(4).await;
        assert!(!reply.ok, "drop_caches is absent from the fake tree");

        client.request(6, Command::Config(ConfigAction::Reset)).await;
        assert!(client.next_reply(6).await.ok);

        let body = String::from_utf8(harness.metrics.encode_metrics().expect("encode")).expect("utf8");
        assert!(body.contains("jetsond_commands_total{outcome=\"not_found\",target=\"fan\"} 1"));
        assert!(harness.metrics.jetsond_protocol_errors_total.get() >= 2.0);

        stop(harness).await;
    }

    fn fake_nvpmodel(root: &Path, query: &str, apply: &str) -> crate::config::NvpModelConfig {
        use std::os::unix::fs::PermissionsExt;
        let conf = root.join("etc/nvpmodel.conf");
        std::fs::create_dir_all(root.join("etc")).expect("mkdir");
        std::fs::write(
            &conf,
            "< POWER_MODEL ID=0 NAME=MAXN >\n< POWER_MODEL ID=1 NAME=MODE_10W >\n< PM_CONFIG DEFAULT=0 >\n",
        )
        .expect("write conf");
        let program = root.join("nvpmodel");
        std::fs::write(
            &program,
            format!("#!/bin/sh\ncase \"$1\" in\n-q) {query} ;;\n-m) {apply} ;;\nesac\n"),
        )
        .expect("write script");
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        crate::config::NvpModelConfig {
            program: program.display().to_string(),
            config_path: conf,
            apply_retries: 2,
            settle_attempts: 3,
            settle_interval_ms: 10,
        }
    }

    #[tokio::test]
    async fn power_mode_reply_carries_the_change_outcome() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nvpmodel = fake_nvpmodel(
            dir.path(),
            "echo 0",
            "sleep 0.2; echo 'NVPM ERROR: failed to set mode'",
        );
        let harness = spawn_daemon(dir.path(), |cfg| cfg.nvpmodel = nvpmodel).await;
        let (mut client, init) = Raw::attach(&harness.socket, 100).await;
        let modes = init.power_modes.expect("power modes");
        assert_eq!(modes.models, vec!["MAXN".to_string(), "MODE_10W".to_string()]);

        client.request(1, Command::Nvp { id: 1, force: false }).await;
        client.request(2, Command::Nvp { id: 0, force: true }).await;
        let busy = client.next_reply(2).await;
        assert!(!busy.ok);
        assert!(busy.error.expect("error").contains("in progress"));

        let failed = client.next_reply(1).await;
        assert!(!failed.ok);
        assert!(failed.error.expect("error").contains("NVPM ERROR"));

        client.request(3, Command::Nvp { id: 0, force: false }).await;
        let same = client.next_reply(3).await;
        assert!(same.ok);
        assert!(same.body.expect("body").contains("already set"));

        stop(harness).await;
    }

    #[tokio::test]
    async fn applied_power_mode_is_reported_to_the_sender() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = dir.path().join("mode");
        let nvpmodel = fake_nvpmodel(
            dir.path(),
            &format!("cat {} 2>/dev/null || echo 0", state.display()),
            &format!("echo $2 > {}", state.display()),
        );
        let harness = spawn_daemon(dir.path(), |cfg| cfg.nvpmodel = nvpmodel).await;
        let (mut client, _) = Raw::attach(&harness.socket, 50).await;

        client.request(1, Command::Nvp { id: 1, force: false }).await;
        let reply = client.next_reply(1).await;
        assert!(reply.ok, "{:?}", reply.error);
        assert_eq!(reply.body.as_deref(), Some("power mode MODE_10W applied"));

        let mut current = None;
        for _ in 0..20 {
            let tick = client.next_tick().await;
            current = tick.power_mode.and_then(|p| p.current).map(|m| m.id);
            if current == Some(1) {
                break;
            }
        }
        assert_eq!(current, Some(1));

        stop(harness).await;
    }

    #[tokio::test]
    async fn last_interval_wins_and_every_client_gets_ticks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let harness = spawn_daemon(dir.path(), |_| {}).await;

        let (mut fast, fast_init) = Raw::attach(&harness.socket, 200).await;
        let (mut slow, slow_init) = Raw::attach(&harness.socket, 500).await;
        assert_eq!(fast_init.interval_ms, 200);
        assert_eq!(slow_init.interval_ms, 500);

        let a = fast.next_tick().await;
        let b = slow.next_tick().await;
        assert!(a.seq >= 1 && b.seq >= 1);
        assert_eq!(harness.metrics.jetsond_clients.get(), 2.0);

        stop(harness).await;
    }

    #[tokio::test]
    async fn goes_idle_without_renewal_and_resets_accumulators() {
        let dir = tempfile::tempdir().expect("tempdir");
        let harness = spawn_daemon(dir.path(), |cfg| cfg.idle_floor_ms = 300).await;

        let (mut client, _) = Raw::attach(&harness.socket, 50).await;
        let mut last = client.next_tick().await;
        while last.seq < 4 {
            last = client.next_tick().await;
        }

        time::timeout(Duration::from_secs(5), async {
            while harness.metrics.jetsond_poller_running.get() != 0.0 {
                time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("poller went idle");

        // Without a reset the first tick would show this jump as load.
        std::fs::write(
            dir.path().join("proc/stat"),
            "cpu 900 0 100 900 0 0 0 0 0 0\ncpu0 900 0 100 900 0 0 0 0 0 0\n",
        )
        .expect("write");
        client.request(protocol::KEEPALIVE_ID, Command::Interval(300)).await;
        let mut previous = last.seq;
        let restarted = loop {
            let tick = client.next_tick().await;
            if tick.seq == 1 {
                break tick;
            }
            assert!(tick.seq > previous, "first tick after restart was skipped");
            previous = tick.seq;
        };
        assert_eq!(restarted.cpu.total.user, 0.0);
        assert_eq!(restarted.cpu.total.system, 0.0);

        stop(harness).await;
    }
}
