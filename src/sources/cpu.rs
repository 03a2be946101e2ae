use super::{read_trimmed, read_value, Source};
use crate::snapshot::{CoreFragment, CpuFragment, CpuUtilization, Frequency};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Jiffies from one `/proc/stat` row.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Ticks {
    user: u64,
    nice: u64,
    system: u64,
    idle: u64,
    total: u64,
}

impl Ticks {
    fn parse(fields: &[&str]) -> Option<Self> {
        let values: Vec<u64> = fields.iter().take(8).map(|f| f.parse().ok()).collect::<Option<_>>()?;
        if values.len() < 4 {
            return None;
        }
        let at = |i: usize| values.get(i).copied().unwrap_or(0);
        Some(Self {
            user: at(0),
            nice: at(1),
            system: at(2) + at(5) + at(6),
            idle: at(3) + at(4),
            total: values.iter().sum(),
        })
    }

    fn utilization(&self, prev: &Ticks) -> CpuUtilization {
        let dt = self.total.saturating_sub(prev.total);
        if dt == 0 {
            return CpuUtilization::default();
        }
        let pct = |now: u64, before: u64| now.saturating_sub(before) as f64 * 100.0 / dt as f64;
        CpuUtilization {
            user: pct(self.user, prev.user),
            nice: pct(self.nice, prev.nice),
            system: pct(self.system, prev.system),
            idle: pct(self.idle, prev.idle),
        }
    }
}

/// Per-core utilization from `/proc/stat` deltas plus cpufreq state.
pub struct CpuSource {
    root: PathBuf,
    models: BTreeMap<usize, String>,
    prev: BTreeMap<usize, Ticks>,
    prev_total: Option<Ticks>,
    prev_online: Option<usize>,
}

impl CpuSource {
    pub fn new(root: &Path) -> Self {
        let models = fs::read_to_string(root.join("proc/cpuinfo"))
            .map(|text| parse_models(&text))
            .unwrap_or_default();
        Self {
            root: root.to_path_buf(),
            models,
            prev: BTreeMap::new(),
            prev_total: None,
            prev_online: None,
        }
    }

    fn cpu_dir(&self, index: usize) -> PathBuf {
        self.root
            .join(format!("sys/devices/system/cpu/cpu{index}"))
    }

    fn core_indices(&self, stat: &BTreeMap<usize, Ticks>) -> Vec<usize> {
        let mut indices: Vec<usize> = fs::read_dir(self.root.join("sys/devices/system/cpu"))
            .map(|entries| {
                entries
                    .flatten()
                    .filter_map(|e| {
                        let name = e.file_name();
                        let name = name.to_str()?;
                        name.strip_prefix("cpu")?.parse::<usize>().ok()
                    })
                    .collect()
            })
            .unwrap_or_default();
        if indices.is_empty() {
            indices = stat.keys().copied().collect();
        }
        indices.sort_unstable();
        indices
    }

    fn is_online(&self, index: usize, stat: &BTreeMap<usize, Ticks>) -> bool {
        match read_value::<u8>(&self.cpu_dir(index).join("online")) {
            Some(v) => v == 1,
            // cpu0 usually has no `online` switch; /proc/stat only lists online cores.
            None => stat.contains_key(&index),
        }
    }

    fn frequency(&self, index: usize) -> (Frequency, Option<String>) {
        let dir = self.cpu_dir(index).join("cpufreq");
        let freq = Frequency {
            min: read_value(&dir.join("scaling_min_freq")),
            max: read_value(&dir.join("scaling_max_freq")),
            cur: read_value(&dir.join("scaling_cur_freq")),
        };
        (freq, read_trimmed(&dir.join("scaling_governor")))
    }
}

impl Source for CpuSource {
    type Fragment = CpuFragment;

    fn name(&self) -> &'static str {
        "procfs"
    }

    fn available(&self) -> bool {
        self.root.join("proc/stat").is_file()
    }

    fn get_status(&mut self) -> CpuFragment {
        let text = fs::read_to_string(self.root.join("proc/stat")).unwrap_or_default();
        let (total, per_core) = parse_stat(&text);

        let indices = self.core_indices(&per_core);
        let online: Vec<(usize, bool)> = indices
            .iter()
            .map(|&i| (i, self.is_online(i, &per_core)))
            .collect();
        let online_count = online.iter().filter(|(_, on)| *on).count();
        if self.prev_online.is_some_and(|n| n != online_count) {
            debug!(
                before = self.prev_online.unwrap_or_default(),
                after = online_count,
                "online core count changed, cpu deltas reset"
            );
            self.prev.clear();
            self.prev_total = None;
        }
        self.prev_online = Some(online_count);

        let cores = online
            .into_iter()
            .map(|(index, is_online)| {
                let (freq, governor) = if is_online {
                    self.frequency(index)
                } else {
                    (Frequency::default(), None)
                };
                let utilization = is_online.then(|| {
                    match (per_core.get(&index), self.prev.get(&index)) {
                        (Some(now), Some(before)) => now.utilization(before),
                        _ => CpuUtilization::default(),
                    }
                });
                CoreFragment {
                    online: is_online,
                    model: self.models.get(&index).cloned(),
                    governor,
                    freq,
                    utilization,
                }
            })
            .collect();

        let total_util = match (total, self.prev_total) {
            (Some(now), Some(before)) => now.utilization(&before),
            _ => CpuUtilization::default(),
        };

        self.prev = per_core;
        self.prev_total = total;

        CpuFragment {
            cores,
            total: total_util,
        }
    }

    fn reset(&mut self) {
        self.prev.clear();
        self.prev_total = None;
        self.prev_online = None;
    }
}

fn parse_stat(text: &str) -> (Option<Ticks>, BTreeMap<usize, Ticks>) {
    let mut total = None;
    let mut per_core = BTreeMap::new();
    for line in text.lines() {
        let mut parts = line.split_whitespace();
        let Some(label) = parts.next() else {
            continue;
        };
        let Some(suffix) = label.strip_prefix("cpu") else {
            continue;
        };
        let fields: Vec<&str> = parts.collect();
        let Some(ticks) = Ticks::parse(&fields) else {
            continue;
        };
        if suffix.is_empty() {
            total = Some(ticks);
        } else if let Ok(index) = suffix.parse::<usize>() {
            per_core.insert(index, ticks);
        }
    }
    (total, per_core)
}

fn parse_models(text: &str) -> BTreeMap<usize, String> {
    let mut out = BTreeMap::new();
    let mut current: Option<usize> = None;
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "processor" => current = value.trim().parse().ok(),
            "model name" => {
                if let Some(index) = current {
                    out.insert(index, value.trim().to_string());
                }
            }
            _ => {}
        }
    }
    out
}
