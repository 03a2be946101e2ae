use super::stream::StreamReader;
use super::{read_trimmed, read_value, Source};
use crate::snapshot::{SensorReading, TemperatureFragment};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Raw reading of a zone that is powered down.
const OFFLINE_MILLIDEGREES: i64 = -256_000;

struct Zone {
    name: String,
    dir: PathBuf,
    crit: Option<f64>,
}

pub struct ThermalZones {
    zones: Vec<Zone>,
}

impl ThermalZones {
    pub fn new(root: &Path) -> Self {
        let Ok(entries) = fs::read_dir(root.join("sys/class/thermal")) else {
            return Self { zones: Vec::new() };
        };
        let mut dirs: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("thermal_zone"))
            })
            .collect();
        dirs.sort_by_key(|p| zone_index(p));

        let mut zones: Vec<Zone> = Vec::new();
        for dir in dirs {
            let fallback = dir
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("zone")
                .to_string();
            let base = read_trimmed(&dir.join("type")).unwrap_or(fallback);
            let base = base.strip_suffix("-therm").unwrap_or(&base).to_string();
            let mut name = base.clone();
            let mut n = 1;
            while zones.iter().any(|z| z.name == name) {
                name = format!("{base}{n}");
                n += 1;
            }
            let crit = critical_trip(&dir);
            zones.push(Zone { name, dir, crit });
        }
        Self { zones }
    }
}

fn zone_index(path: &Path) -> usize {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_prefix("thermal_zone"))
        .and_then(|n| n.parse().ok())
        .unwrap_or(usize::MAX)
}

/// Temperature of the first `critical` trip point, in °C.
fn critical_trip(dir: &Path) -> Option<f64> {
    (0..16).find_map(|i| {
        let kind = read_trimmed(&dir.join(format!("trip_point_{i}_type")))?;
        if kind != "critical" {
            return None;
        }
        read_value::<i64>(&dir.join(format!("trip_point_{i}_temp"))).map(|v| v as f64 / 1000.0)
    })
}

impl Source for ThermalZones {
    type Fragment = TemperatureFragment;

    fn name(&self) -> &'static str {
        "thermal"
    }

    fn available(&self) -> bool {
        !self.zones.is_empty()
    }

    fn get_status(&mut self) -> TemperatureFragment {
        let sensors = self
            .zones
            .iter()
            .map(|zone| {
                let raw = read_value::<i64>(&zone.dir.join("temp"));
                let online = raw.is_some_and(|v| v != OFFLINE_MILLIDEGREES);
                let reading = SensorReading {
                    online,
                    temp: raw.filter(|_| online).map(|v| v as f64 / 1000.0),
                    crit: zone.crit,
                };
                (zone.name.clone(), reading)
            })
            .collect();
        TemperatureFragment { sensors }
    }
}

/// Named temperatures reported by the stats stream.
pub struct StreamTemperature {
    reader: Option<StreamReader>,
}

impl StreamTemperature {
    pub fn new(reader: Option<StreamReader>) -> Self {
        Self { reader }
    }
}

impl Source for StreamTemperature {
    type Fragment = TemperatureFragment;

    fn name(&self) -> &'static str {
        "stats-stream"
    }

    fn available(&self) -> bool {
        self.reader.is_some()
    }

    fn get_status(&mut self) -> TemperatureFragment {
        let Some(line) = self.reader.as_ref().and_then(StreamReader::latest) else {
            return TemperatureFragment::default();
        };
        let sensors: BTreeMap<String, SensorReading> = line
            .temperatures
            .iter()
            .map(|(name, value)| {
                let reading = SensorReading {
                    online: value.is_some(),
                    temp: *value,
                    crit: None,
                };
                (name.clone(), reading)
            })
            .collect();
        TemperatureFragment { sensors }
    }
}
