//! Polling timer: the single writer of the shared snapshot.

use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::snapshot::Snapshot;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{self, JoinHandle};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

/// Latest snapshot, `None` while not ready.
pub type SharedState = watch::Receiver<Option<Arc<Snapshot>>>;

pub trait Tick: Send + 'static {
    fn tick(&mut self) -> Result<Snapshot>;

    fn reset(&mut self);
}

struct Running {
    handle: JoinHandle<Result<()>>,
    stop: watch::Sender<bool>,
}

pub struct PollingTimer<T: Tick> {
    source: Arc<Mutex<T>>,
    state: Arc<watch::Sender<Option<Arc<Snapshot>>>>,
    interval: watch::Sender<Duration>,
    metrics: Arc<Metrics>,
    running: Option<Running>,
}

impl<T: Tick> PollingTimer<T> {
    pub fn new(source: T, metrics: Arc<Metrics>) -> (Self, SharedState) {
        let (state, rx) = watch::channel(None);
        let (interval, _) = watch::channel(Duration::from_secs(1));
        let timer = Self {
            source: Arc::new(Mutex::new(source)),
            state: Arc::new(state),
            interval,
            metrics,
            running: None,
        };
        (timer, rx)
    }

    pub fn subscribe(&self) -> SharedState {
        self.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn interval(&self) -> Duration {
        *self.interval.borrow()
    }

    /// `Ok(false)` when it was already running.
    pub async fn start(&mut self, interval: Duration) -> Result<bool> {
        self.check().await?;
        self.set_interval(interval);
        if self.running.is_some() {
            return Ok(false);
        }

        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_loop(
            Arc::clone(&self.source),
            Arc::clone(&self.state),
            self.interval.subscribe(),
            stop_rx,
            Arc::clone(&self.metrics),
        ));
        self.running = Some(Running { handle, stop });
        self.metrics.set_poller_running(true);
        info!(interval_ms = interval.as_millis() as u64, "polling timer started");
        Ok(true)
    }

    /// Changes the period of a running loop, starting with the next sleep.
    pub fn set_interval(&self, interval: Duration) {
        self.interval.send_if_modified(|current| {
            if *current == interval {
                return false;
            }
            debug!(interval_ms = interval.as_millis() as u64, "polling interval changed");
            *current = interval;
            true
        });
    }

    pub async fn check(&mut self) -> Result<()> {
        let finished = self
            .running
            .as_ref()
            .is_some_and(|running| running.handle.is_finished());
        if !finished {
            return Ok(());
        }
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        self.metrics.set_poller_running(false);
        self.state.send_replace(None);
        flatten(running.handle.await)
    }

    /// Stops the loop, waiting at most `timeout` before aborting it, and
    /// marks the shared snapshot as not ready.
    pub async fn stop(&mut self, timeout: Duration) -> Result<()> {
        let Some(mut running) = self.running.take() else {
            return Ok(());
        };
        let _ = running.stop.send(true);
        let outcome = match time::timeout(timeout, &mut running.handle).await {
            Ok(joined) => flatten(joined),
            Err(_elapsed) => {
                warn!(?timeout, "polling timer did not stop in time, aborting it");
                running.handle.abort();
                Ok(())
            }
        };
        self.metrics.set_poller_running(false);
        self.state.send_replace(None);
        info!("polling timer stopped");
        outcome
    }

    /// Resets the source's accumulators. Skipped while a sample that
    /// outlived a forced stop still holds the source.
    pub fn reset(&self) {
        match self.source.try_lock() {
            Ok(mut source) => source.reset(),
            Err(_) => warn!("tick source busy, accumulators not reset"),
        }
    }
}

fn flatten(joined: std::result::Result<Result<()>, task::JoinError>) -> Result<()> {
    match joined {
        Ok(outcome) => outcome,
        Err(err) if err.is_cancelled() => Ok(()),
        Err(err) => Err(Error::Fatal(format!("polling task panicked: {err}"))),
    }
}

async fn run_loop<T: Tick>(
    source: Arc<Mutex<T>>,
    state: Arc<watch::Sender<Option<Arc<Snapshot>>>>,
    interval: watch::Receiver<Duration>,
    mut stop: watch::Receiver<bool>,
    metrics: Arc<Metrics>,
) -> Result<()> {
    loop {
        let started = Instant::now();
        let sampled = Arc::clone(&source);
        let snapshot = task::spawn_blocking(move || {
            let mut source = sampled
                .lock()
                .map_err(|_| Error::Fatal("tick source poisoned".to_string()))?;
            source.tick()
        })
        .await
        .map_err(|err| Error::Fatal(format!("tick panicked: {err}")))?
        .map_err(|err| match err {
            Error::Fatal(_) => err,
            other => Error::Fatal(other.to_string()),
        })?;

        let elapsed = started.elapsed();
        state.send_replace(Some(Arc::new(snapshot)));
        metrics.observe_tick(elapsed);

        let period = *interval.borrow();
        tokio::select! {
            _ = stop.changed() => return Ok(()),
            _ = time::sleep_until(started + period) => {}
        }
        if *stop.borrow() {
            return Ok(());
        }
    }
}
