use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, Registry, TextEncoder};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Daemon self-metrics, served over the local socket only.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub jetsond_ticks_total: Counter,
    pub jetsond_tick_duration_seconds: Gauge,
    pub jetsond_last_tick_timestamp_seconds: Gauge,
    pub jetsond_clients: Gauge,
    pub jetsond_poller_running: Gauge,
    pub jetsond_commands_total: CounterVec,
    pub jetsond_protocol_errors_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let jetsond_ticks_total = Counter::with_opts(opts!(
            "jetsond_ticks_total",
            "Snapshots published since start"
        ))?;
        let jetsond_tick_duration_seconds = Gauge::with_opts(opts!(
            "jetsond_tick_duration_seconds",
            "Time spent building the last snapshot"
        ))?;
        let jetsond_last_tick_timestamp_seconds = Gauge::with_opts(opts!(
            "jetsond_last_tick_timestamp_seconds",
            "Unix time of the last published snapshot"
        ))?;
        let jetsond_clients =
            Gauge::with_opts(opts!("jetsond_clients", "Attached clients"))?;
        let jetsond_poller_running = Gauge::with_opts(opts!(
            "jetsond_poller_running",
            "1 while the polling timer runs, 0 when idle"
        ))?;
        let jetsond_commands_total = CounterVec::new(
            opts!(
                "jetsond_commands_total",
                "Control commands handled, by target and outcome"
            ),
            &["target", "outcome"],
        )?;
        let jetsond_protocol_errors_total = Counter::with_opts(opts!(
            "jetsond_protocol_errors_total",
            "Malformed or unauthenticated frames dropped"
        ))?;

        register(&registry, &jetsond_ticks_total)?;
        register(&registry, &jetsond_tick_duration_seconds)?;
        register(&registry, &jetsond_last_tick_timestamp_seconds)?;
        register(&registry, &jetsond_clients)?;
        register(&registry, &jetsond_poller_running)?;
        register(&registry, &jetsond_commands_total)?;
        register(&registry, &jetsond_protocol_errors_total)?;

        Ok(Arc::new(Self {
            registry,
            jetsond_ticks_total,
            jetsond_tick_duration_seconds,
            jetsond_last_tick_timestamp_seconds,
            jetsond_clients,
            jetsond_poller_running,
            jetsond_commands_total,
            jetsond_protocol_errors_total,
        }))
    }

    pub fn observe_tick(&self, elapsed: Duration) {
        self.jetsond_ticks_total.inc();
        self.jetsond_tick_duration_seconds.set(elapsed.as_secs_f64());
        self.jetsond_last_tick_timestamp_seconds
            .set(now_unix_secs());
    }

    pub fn set_poller_running(&self, running: bool) {
        self.jetsond_poller_running
            .set(if running { 1.0 } else { 0.0 });
    }

    pub fn client_attached(&self) {
        self.jetsond_clients.inc();
    }

    pub fn client_detached(&self) {
        self.jetsond_clients.dec();
    }

    pub fn inc_command(&self, target: &str, outcome: &str) {
        self.jetsond_commands_total
            .with_label_values(&[target, outcome])
            .inc();
    }

    pub fn inc_protocol_error(&self) {
        self.jetsond_protocol_errors_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

fn now_unix_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_registered_series() {
        let metrics = Metrics::new().expect("metrics");
        metrics.observe_tick(Duration::from_millis(12));
        metrics.inc_command("fan", "ok");
        metrics.client_attached();
        metrics.set_poller_running(true);

        let body = String::from_utf8(metrics.encode_metrics().expect("encode")).expect("utf8");
        assert!(body.contains("jetsond_ticks_total 1"));
        assert!(body.contains("jetsond_commands_total{outcome=\"ok\",target=\"fan\"} 1"));
        assert!(body.contains("jetsond_clients 1"));
        assert!(body.contains("jetsond_poller_running 1"));
    }
}
