use super::stream::StreamReader;
use super::{read_flag, read_trimmed, read_value, write_value, Source};
use crate::error::{Error, Result};
use crate::snapshot::{Frequency, GpuDevice, GpuFragment};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// devfreq node names used by integrated Tegra GPUs.
const GPU_MARKERS: [&str; 5] = ["gpu", "gv11b", "gp10b", "ga10b", "gb10b"];

/// Finds integrated GPUs under `/sys/class/devfreq`, keyed by short name.
pub fn discover(root: &Path) -> BTreeMap<String, PathBuf> {
    let Ok(entries) = fs::read_dir(root.join("sys/class/devfreq")) else {
        return BTreeMap::new();
    };
    entries
        .flatten()
        .filter_map(|entry| {
            let dir_name = entry.file_name().to_str()?.to_string();
            let short = dir_name
                .rsplit_once('.')
                .map(|(_, s)| s.to_string())
                .unwrap_or_else(|| dir_name.clone());
            GPU_MARKERS
                .iter()
                .any(|m| short.contains(m))
                .then(|| (short, entry.path()))
        })
        .collect()
}

pub struct SysfsGpu {
    devices: BTreeMap<String, PathBuf>,
}

impl SysfsGpu {
    pub fn new(devices: BTreeMap<String, PathBuf>) -> Self {
        Self { devices }
    }
}

impl Source for SysfsGpu {
    type Fragment = GpuFragment;

    fn name(&self) -> &'static str {
        "devfreq"
    }

    fn available(&self) -> bool {
        !self.devices.is_empty()
    }

    fn get_status(&mut self) -> GpuFragment {
        let devices = self
            .devices
            .iter()
            .map(|(name, path)| {
                let hz = |file: &str| read_value::<u64>(&path.join(file)).map(|v| v / 1000);
                let device = path.join("device");
                let status = GpuDevice {
                    load: read_value::<f64>(&device.join("load")).map(|v| v / 10.0),
                    governor: read_trimmed(&path.join("governor")),
                    freq: Frequency {
                        min: hz("min_freq"),
                        max: hz("max_freq"),
                        cur: hz("cur_freq"),
                    },
                    railgate: read_flag(&device.join("railgate_enable")),
                    scaling_3d: read_flag(&device.join("enable_3d_scaling")),
                };
                (name.clone(), status)
            })
            .collect();
        GpuFragment { devices }
    }
}

/// GPU load taken from the `GR3D` engine of the stats stream.
pub struct StreamGpu {
    reader: Option<StreamReader>,
}

impl StreamGpu {
    pub fn new(reader: Option<StreamReader>) -> Self {
        Self { reader }
    }
}

impl Source for StreamGpu {
    type Fragment = GpuFragment;

    fn name(&self) -> &'static str {
        "stats-stream"
    }

    fn available(&self) -> bool {
        self.reader.is_some()
    }

    fn get_status(&mut self) -> GpuFragment {
        let engine = self
            .reader
            .as_ref()
            .and_then(StreamReader::latest)
            .and_then(|line| line.engines.get("GR3D").cloned());
        let device = GpuDevice {
            load: engine.as_ref().and_then(|e| e.util),
            freq: Frequency {
                cur: engine.and_then(|e| e.freq).map(|mhz| u64::from(mhz) * 1000),
                ..Frequency::default()
            },
            ..GpuDevice::default()
        };
        GpuFragment {
            devices: BTreeMap::from([("gpu".to_string(), device)]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum GpuCommand {
    Railgate { name: String, value: bool },
    #[serde(rename = "3d_scaling")]
    Scaling3d { name: String, value: bool },
}

#[derive(Debug, Clone, Default)]
pub struct GpuControl {
    devices: BTreeMap<String, PathBuf>,
}

impl GpuControl {
    pub fn new(devices: BTreeMap<String, PathBuf>) -> Self {
        Self { devices }
    }

    pub fn apply(&self, command: &GpuCommand) -> Result<()> {
        match command {
            GpuCommand::Railgate { name, value } => self.set_railgate(name, *value),
            GpuCommand::Scaling3d { name, value } => self.set_3d_scaling(name, *value),
        }
    }

    pub fn set_railgate(&self, name: &str, enable: bool) -> Result<()> {
        self.write_switch(name, "railgate_enable", enable)
    }

    pub fn set_3d_scaling(&self, name: &str, enable: bool) -> Result<()> {
        self.write_switch(name, "enable_3d_scaling", enable)
    }

    fn write_switch(&self, name: &str, file: &str, enable: bool) -> Result<()> {
        let path = self
            .devices
            .get(name)
            .ok_or_else(|| Error::not_found(format!("gpu {name}"), "no such device"))?
            .join("device")
            .join(file);
        write_value(&path, u8::from(enable))?;
        info!(gpu = name, switch = file, enable, "gpu switch written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder;

    fn fake_gpu(root: &Path) -> PathBuf {
        let dir = root.join("sys/class/devfreq/17000000.ga10b");
        fs::create_dir_all(dir.join("device")).expect("mkdir");
        fs::create_dir_all(root.join("sys/class/devfreq/3d00000.host1x")).expect("mkdir");
        fs::write(dir.join("cur_freq"), "305000000\n").expect("write");
        fs::write(dir.join("min_freq"), "306000000\n").expect("write");
        fs::write(dir.join("max_freq"), "624750000\n").expect("write");
        fs::write(dir.join("governor"), "nvhost_podgov\n").expect("write");
        fs::write(dir.join("device/load"), "125\n").expect("write");
        fs::write(dir.join("device/railgate_enable"), "1\n").expect("write");
        fs::write(dir.join("device/enable_3d_scaling"), "0\n").expect("write");
        dir
    }

    #[test]
    fn reads_devfreq_gpu() {
        let dir = tempfile::tempdir().expect("tempdir");
        fake_gpu(dir.path());
        let devices = discover(dir.path());
        assert_eq!(devices.keys().collect::<Vec<_>>(), vec!["ga10b"]);

        let mut source = SysfsGpu::new(devices);
        assert!(source.available());
        let gpu = &source.get_status().devices["ga10b"];
        assert_eq!(gpu.load, Some(12.5));
        assert_eq!(gpu.freq.cur, Some(305_000));
        assert_eq!(gpu.governor.as_deref(), Some("nvhost_podgov"));
        assert_eq!(gpu.railgate, Some(true));
        assert_eq!(gpu.scaling_3d, Some(false));
    }

    #[test]
    fn control_writes_switches() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = fake_gpu(dir.path());
        let control = GpuControl::new(discover(dir.path()));
        control.set_railgate("ga10b", false).expect("write");
        control.set_3d_scaling("ga10b", true).expect("write");
        assert_eq!(read_flag(&path.join("device/railgate_enable")), Some(false));
        assert_eq!(read_flag(&path.join("device/enable_3d_scaling")), Some(true));
        assert!(matches!(
            control.set_railgate("gv11b", true),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn command_wire_shape() {
        let cmd: GpuCommand =
            serde_json::from_str(r#"{"command":"3d_scaling","name":"ga10b","value":true}"#)
                .expect("parse");
        assert_eq!(
            cmd,
            GpuCommand::Scaling3d {
                name: "ga10b".to_string(),
                value: true
            }
        );
    }

    #[test]
    fn stream_fallback_uses_gr3d() {
        let reader = StreamReader::fixed(decoder::decode("GR3D_FREQ 40%@[612,612]"));
        let mut source = StreamGpu::new(Some(reader));
        let gpu = &source.get_status().devices["gpu"];
        assert_eq!(gpu.load, Some(40.0));
        assert_eq!(gpu.freq.cur, Some(612_000));
        assert!(!StreamGpu::new(None).available());
    }
}
