use crate::snapshot::ProcessEntry;
use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};
use sysinfo::{PidExt, ProcessExt, System, SystemExt};

/// Uptime and busiest processes, read through `sysinfo`.
pub struct SystemSource {
    root: PathBuf,
    system: System,
    limit: usize,
}

impl SystemSource {
    pub fn new(root: &Path, limit: usize) -> Self {
        Self {
            root: root.to_path_buf(),
            system: System::new(),
            limit,
        }
    }

    /// Seconds since boot. `/proc/uptime` keeps the fractional part.
    pub fn uptime(&self) -> f64 {
        fs::read_to_string(self.root.join("proc/uptime"))
            .ok()
            .and_then(|text| text.split_whitespace().next()?.parse().ok())
            .unwrap_or_else(|| self.system.uptime() as f64)
    }

    /// Processes ordered by CPU usage, at most `limit` of them. CPU usage
    /// is measured between two calls, so the first call reports zeros.
    pub fn processes(&mut self) -> Vec<ProcessEntry> {
        self.system.refresh_processes();
        let mut entries: Vec<ProcessEntry> = self
            .system
            .processes()
            .iter()
            .map(|(pid, process)| ProcessEntry {
                pid: pid.as_u32(),
                name: process.name().to_string(),
                state: process.status().to_string(),
                cpu_percent: f64::from(process.cpu_usage()),
                memory_kb: process.memory() / 1024,
            })
            .collect();
        entries.sort_by(|a, b| {
            b.cpu_percent
                .partial_cmp(&a.cpu_percent)
                .unwrap_or(Ordering::Equal)
                .then(a.pid.cmp(&b.pid))
        });
        entries.truncate(self.limit);
        entries
    }

    pub fn reset(&mut self) {
        self.system = System::new();
    }
}
