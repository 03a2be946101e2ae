use super::stream::StreamReader;
use super::{read_trimmed, read_value, Source};
use crate::snapshot::{PowerFragment, RailReading};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Rail that measures the whole board input.
const TOTAL_RAIL: &str = "VDD_IN";

struct Channel {
    name: String,
    volt: PathBuf,
    curr: PathBuf,
}

#[derive(Debug, Clone, Copy, Default)]
struct Average {
    sum: u64,
    count: u64,
}

impl Average {
    fn push(&mut self, value: u64) -> u64 {
        self.sum += value;
        self.count += 1;
        self.sum / self.count
    }
}

pub struct Ina3221 {
    channels: Vec<Channel>,
    averages: BTreeMap<String, Average>,
}

impl Ina3221 {
    pub fn new(root: &Path) -> Self {
        let channels = hwmon_dirs(root)
            .into_iter()
            .flat_map(|dir| channels_in(&dir))
            .collect();
        Self {
            channels,
            averages: BTreeMap::new(),
        }
    }
}

fn subdirs(dir: &Path) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = fs::read_dir(dir)
        .map(|entries| entries.flatten().map(|e| e.path()).collect())
        .unwrap_or_default();
    out.sort();
    out
}

fn hwmon_dirs(root: &Path) -> Vec<PathBuf> {
    let starts = |p: &Path, prefix: &str| {
        p.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(prefix))
    };
    subdirs(&root.join("sys/bus/i2c/drivers"))
        .into_iter()
        .filter(|d| starts(d, "ina3221"))
        .flat_map(|driver| subdirs(&driver))
        .flat_map(|device| subdirs(&device.join("hwmon")))
        .filter(|d| starts(d, "hwmon"))
        .collect()
}

fn channels_in(dir: &Path) -> Vec<Channel> {
    (1..=3)
        .filter_map(|n| {
            let name = read_trimmed(&dir.join(format!("in{n}_label")))?;
            if name.is_empty() || name == "NC" {
                return None;
            }
            Some(Channel {
                name,
                volt: dir.join(format!("in{n}_input")),
                curr: dir.join(format!("curr{n}_input")),
            })
        })
        .collect()
}

impl Source for Ina3221 {
    type Fragment = PowerFragment;

    fn name(&self) -> &'static str {
        "ina3221"
    }

    fn available(&self) -> bool {
        !self.channels.is_empty()
    }

    fn get_status(&mut self) -> PowerFragment {
        let mut rails = BTreeMap::new();
        for channel in &self.channels {
            let volt = read_value::<u64>(&channel.volt);
            let curr = read_value::<u64>(&channel.curr);
            let power = volt.zip(curr).map(|(mv, ma)| mv * ma / 1000);
            let avg = power.map(|p| {
                self.averages
                    .entry(channel.name.clone())
                    .or_default()
                    .push(p)
            });
            rails.insert(
                channel.name.clone(),
                RailReading {
                    volt,
                    curr,
                    power,
                    avg,
                },
            );
        }
        let total = total_of(&rails);
        PowerFragment { rails, total }
    }

    fn reset(&mut self) {
        self.averages.clear();
    }
}

/// Board input rail when present, otherwise the sum of all rails.
fn total_of(rails: &BTreeMap<String, RailReading>) -> RailReading {
    if let Some(input) = rails.get(TOTAL_RAIL) {
        return input.clone();
    }
    if rails.is_empty() {
        return RailReading::default();
    }
    let sum = |f: fn(&RailReading) -> Option<u64>| rails.values().map(f).sum::<Option<u64>>();
    RailReading {
        volt: None,
        curr: None,
        power: sum(|r| r.power),
        avg: sum(|r| r.avg),
    }
}

/// Rails reported by the stats stream (`NAME cur/avg`, in mW).
pub struct StreamPower {
    reader: Option<StreamReader>,
}

impl StreamPower {
    pub fn new(reader: Option<StreamReader>) -> Self {
        Self { reader }
    }
}

impl Source for StreamPower {
    type Fragment = PowerFragment;

    fn name(&self) -> &'static str {
        "stats-stream"
    }

    fn available(&self) -> bool {
        self.reader.is_some()
    }

    fn get_status(&mut self) -> PowerFragment {
        let Some(line) = self.reader.as_ref().and_then(StreamReader::latest) else {
            return PowerFragment::default();
        };
        let rails: BTreeMap<String, RailReading> = line
            .power
            .iter()
            .map(|(name, rail)| {
                let reading = RailReading {
                    volt: None,
                    curr: None,
                    power: rail.cur.map(u64::from),
                    avg: rail.avg.map(u64::from),
                };
                (name.clone(), reading)
            })
            .collect();
        let total = total_of(&rails);
        PowerFragment { rails, total }
    }
}
