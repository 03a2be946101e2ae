//! Wiring of the hardware sources into one snapshot per tick.

use crate::board::BoardIdentity;
use crate::config::{Config, SettingsStore};
use crate::error::Result;
use crate::snapshot::{
    CpuFragment, EnginesFragment, FanFragment, GpuFragment, MemoryFragment, PowerFragment,
    Snapshot, TemperatureFragment,
};
use crate::sources::cpu::CpuSource;
use crate::sources::engines::{ClkEngines, StreamEngines};
use crate::sources::fan::FanService;
use crate::sources::gpu::{self, GpuControl, StreamGpu, SysfsGpu};
use crate::sources::jetson_clocks::JetsonClocksService;
use crate::sources::memory::{MemoryControl, MeminfoSource, StreamMemory};
use crate::sources::nvpmodel::NvpModelService;
use crate::sources::power::{Ina3221, StreamPower};
use crate::sources::stream::StatsStream;
use crate::sources::system::SystemSource;
use crate::sources::temperature::{StreamTemperature, ThermalZones};
use crate::sources::{select, Backend, RetryPolicy, Source};
use crate::timer::Tick;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::info;

/// Handles used by command dispatch and the client handshake.
#[derive(Clone)]
pub struct Services {
    pub board: BoardIdentity,
    pub gpu: GpuControl,
    pub memory: MemoryControl,
    pub fan: Option<Arc<FanService>>,
    pub jetson_clocks: Option<Arc<JetsonClocksService>>,
    pub nvpmodel: Option<Arc<NvpModelService>>,
    pub settings: Arc<SettingsStore>,
}

pub struct SnapshotBuilder {
    cpu: Option<Backend<CpuFragment>>,
    gpu: Option<Backend<GpuFragment>>,
    memory: Option<Backend<MemoryFragment>>,
    engines: Option<Backend<EnginesFragment>>,
    temperature: Option<Backend<TemperatureFragment>>,
    power: Option<Backend<PowerFragment>>,
    fan: Option<Backend<FanFragment>>,
    system: SystemSource,
    jetson_clocks: Option<Arc<JetsonClocksService>>,
    nvpmodel: Option<Arc<NvpModelService>>,
    seq: u64,
    // Owns the stats child process.
    _stream: Option<StatsStream>,
}

/// Probes the board and picks one backend per subsystem.
pub async fn assemble(cfg: &Config) -> (SnapshotBuilder, Services) {
    let root = cfg.sys_root.as_path();
    let stream = if cfg.stats_stream.enabled {
        match StatsStream::spawn(&cfg.stats_stream.program, cfg.interval()) {
            Ok(stream) => Some(stream),
            Err(err) => {
                info!(error = %err, "stats stream unavailable");
                None
            }
        }
    } else {
        None
    };
    let reader = stream.as_ref().map(StatsStream::reader);
    let settings = Arc::new(SettingsStore::open(&cfg.state_path));
    let settle = RetryPolicy::new(
        cfg.nvpmodel.settle_attempts,
        Duration::from_millis(cfg.nvpmodel.settle_interval_ms),
    );

    let gpus = gpu::discover(root);
    let fan = Arc::new(FanService::new(root, Arc::clone(&settings), settle));
    let fan = (!fan.is_empty()).then_some(fan);
    let jetson_clocks = Arc::new(JetsonClocksService::new(
        root,
        &cfg.jetson_clocks,
        Arc::clone(&settings),
        settle,
        cfg.command_timeout(),
    ));
    let jetson_clocks = jetson_clocks.available().then_some(jetson_clocks);
    let nvpmodel = NvpModelService::load(&cfg.nvpmodel, jetson_clocks.clone(), cfg.command_timeout())
        .await
        .map(Arc::new);

    let builder = SnapshotBuilder {
        cpu: select(
            "cpu",
            vec![Box::new(CpuSource::new(root)) as Backend<CpuFragment>],
        ),
        gpu: select(
            "gpu",
            vec![
                Box::new(SysfsGpu::new(gpus.clone())) as Backend<GpuFragment>,
                Box::new(StreamGpu::new(reader.clone())),
            ],
        ),
        memory: select(
            "memory",
            vec![
                Box::new(MeminfoSource::new(root, reader.clone())) as Backend<MemoryFragment>,
                Box::new(StreamMemory::new(reader.clone())),
            ],
        ),
        engines: select(
            "engines",
            vec![
                Box::new(ClkEngines::new(root)) as Backend<EnginesFragment>,
                Box::new(StreamEngines::new(reader.clone())),
            ],
        ),
        temperature: select(
            "temperature",
            vec![
                Box::new(ThermalZones::new(root)) as Backend<TemperatureFragment>,
                Box::new(StreamTemperature::new(reader.clone())),
            ],
        ),
        power: select(
            "power",
            vec![
                Box::new(Ina3221::new(root)) as Backend<PowerFragment>,
                Box::new(StreamPower::new(reader)),
            ],
        ),
        fan: select(
            "fan",
            fan.iter()
                .map(|f| Box::new(Arc::clone(f)) as Backend<FanFragment>)
                .collect(),
        ),
        system: SystemSource::new(root, cfg.processes.limit),
        jetson_clocks: jetson_clocks.clone(),
        nvpmodel: nvpmodel.clone(),
        seq: 0,
        _stream: stream,
    };

    let services = Services {
        board: BoardIdentity::detect(root),
        gpu: GpuControl::new(gpus),
        memory: MemoryControl::new(root, cfg.command_timeout()),
        fan,
        jetson_clocks,
        nvpmodel,
        settings,
    };
    (builder, services)
}

impl Services {
    pub async fn restore(&self) {
        if let Some(fan) = &self.fan {
            fan.restore();
        }
        if let Some(jc) = &self.jetson_clocks {
            jc.restore_on_boot().await;
        }
    }

    pub fn reset_settings(&self) -> Result<()> {
        self.settings.reset()?;
        info!("persisted settings reset to defaults");
        Ok(())
    }
}

fn status_or_default<F: Default>(backend: &mut Option<Backend<F>>) -> F {
    backend
        .as_mut()
        .map(|b| b.get_status())
        .unwrap_or_default()
}

impl Tick for SnapshotBuilder {
    fn tick(&mut self) -> Result<Snapshot> {
        self.seq += 1;
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Ok(Snapshot {
            seq: self.seq,
            timestamp_ms,
            cpu: status_or_default(&mut self.cpu),
            gpu: status_or_default(&mut self.gpu),
            memory: status_or_default(&mut self.memory),
            engines: status_or_default(&mut self.engines),
            temperature: status_or_default(&mut self.temperature),
            power: status_or_default(&mut self.power),
            fan: status_or_default(&mut self.fan),
            jetson_clocks: self.jetson_clocks.as_ref().map(|jc| jc.status()),
            power_mode: self.nvpmodel.as_ref().map(|nvp| nvp.status()),
            uptime: self.system.uptime(),
            processes: self.system.processes(),
        })
    }

    fn reset(&mut self) {
        self.seq = 0;
        reset_backend(&mut self.cpu);
        reset_backend(&mut self.gpu);
        reset_backend(&mut self.memory);
        reset_backend(&mut self.engines);
        reset_backend(&mut self.temperature);
        reset_backend(&mut self.power);
        reset_backend(&mut self.fan);
        self.system.reset();
    }
}

fn reset_backend<F>(backend: &mut Option<Backend<F>>) {
    if let Some(backend) = backend {
        backend.reset();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    fn write(root: &Path, rel: &str, text: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, text).expect("write");
    }

    pub(crate) fn fake_board(root: &Path) -> Config {
        write(root, "proc/stat", "cpu 100 0 100 800 0 0 0 0 0 0\ncpu0 100 0 100 800 0 0 0 0 0 0\n");
        write(root, "proc/meminfo", "MemTotal: 1000 kB\nMemFree: 500 kB\nBuffers: 0 kB\nCached: 100 kB\n");
        write(root, "proc/uptime", "12.5 10.0\n");
        write(root, "sys/class/thermal/thermal_zone0/type", "CPU-therm\n");
        write(root, "sys/class/thermal/thermal_zone0/temp", "41000\n");
        Config {
            sys_root: root.to_path_buf(),
            state_path: root.join("state/settings.yaml"),
            stats_stream: crate::config::StatsStreamConfig {
                enabled: false,
                ..Default::default()
            },
            nvpmodel: crate::config::NvpModelConfig {
                config_path: root.join("missing/nvpmodel.conf"),
                ..Default::default()
            },
            jetson_clocks: crate::config::JetsonClocksConfig {
                program: root.join("missing/jetson_clocks").display().to_string(),
                store_path: root.join("state/l4t_dfs.conf"),
            },
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn builds_snapshots_with_stable_sections() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = fake_board(dir.path());
        let (mut builder, services) = assemble(&cfg).await;
        assert!(services.jetson_clocks.is_none());
        assert!(services.nvpmodel.is_none());
        assert!(services.fan.is_none());

        let first = builder.tick().expect("tick");
        assert_eq!(first.seq, 1);
        assert_eq!(first.cpu.cores.len(), 1);
        assert_eq!(first.memory.ram.total, Some(1000));
        assert_eq!(first.temperature.sensors["CPU"].temp, Some(41.0));
        assert!((first.uptime - 12.5).abs() < 1e-9);
        assert!(first.gpu.devices.is_empty());
        assert_eq!(first.jetson_clocks, None);

        write(dir.path(), "proc/stat", "cpu 200 0 100 900 0 0 0 0 0 0\ncpu0 200 0 100 900 0 0 0 0 0 0\n");
        let second = builder.tick().expect("tick");
        assert_eq!(second.seq, 2);
        assert!(second.cpu.total.user > 0.0);
        let keys = |s: &Snapshot| {
            serde_json::to_value(s)
                .expect("json")
                .as_object()
                .expect("object")
                .keys()
                .cloned()
                .collect::<Vec<_>>()
        };
        assert_eq!(keys(&first), keys(&second));
    }

    #[tokio::test]
    async fn reset_restarts_sequence_and_deltas() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = fake_board(dir.path());
        let (mut builder, _) = assemble(&cfg).await;
        builder.tick().expect("tick");
        write(dir.path(), "proc/stat", "cpu 200 0 100 900 0 0 0 0 0 0\ncpu0 200 0 100 900 0 0 0 0 0 0\n");

        builder.reset();
        let snapshot = builder.tick().expect("tick");
        assert_eq!(snapshot.seq, 1);
        assert_eq!(snapshot.cpu.total.user, 0.0);
    }
}
