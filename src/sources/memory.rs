use super::stream::StreamReader;
use super::{write_value, Source};
use crate::decoder::StatsLine;
use crate::error::{Error, Result};
use crate::runner;
use crate::snapshot::{
    EngineFragment, IramFragment, MemoryFragment, RamFragment, SwapEntry, SwapFragment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// RAM and swap from `/proc/meminfo` and `/proc/swaps`. When the stats
/// stream runs, the fields only it reports (lfb, IRAM, EMC) are added.
pub struct MeminfoSource {
    root: PathBuf,
    stream: Option<StreamReader>,
}

impl MeminfoSource {
    pub fn new(root: &Path, stream: Option<StreamReader>) -> Self {
        Self {
            root: root.to_path_buf(),
            stream,
        }
    }
}

impl Source for MeminfoSource {
    type Fragment = MemoryFragment;

    fn name(&self) -> &'static str {
        "procfs"
    }

    fn available(&self) -> bool {
        self.root.join("proc/meminfo").is_file()
    }

    fn get_status(&mut self) -> MemoryFragment {
        let info = fs::read_to_string(self.root.join("proc/meminfo"))
            .map(|text| parse_meminfo(&text))
            .unwrap_or_default();
        let table = read_swaps(&self.root);
        let get = |key: &str| info.get(key).copied();

        let cached = match (get("Cached"), get("SReclaimable")) {
            (Some(c), Some(r)) => Some(c + r),
            (c, _) => c,
        };
        let used = match (get("MemTotal"), get("MemFree"), get("Buffers"), cached) {
            (Some(t), Some(f), Some(b), Some(c)) => Some(t.saturating_sub(f + b + c)),
            _ => None,
        };
        let line = self.stream.as_ref().and_then(StreamReader::latest);

        MemoryFragment {
            ram: RamFragment {
                total: get("MemTotal"),
                used,
                free: get("MemFree"),
                buffers: get("Buffers"),
                cached,
                shared: get("Shmem"),
                lfb: line.as_ref().and_then(|l| l.ram.as_ref()?.lfb.clone()),
            },
            swap: SwapFragment {
                total: get("SwapTotal"),
                used: get("SwapTotal")
                    .zip(get("SwapFree"))
                    .map(|(t, f)| t.saturating_sub(f)),
                cached: get("SwapCached"),
                table,
            },
            emc: line.as_deref().and_then(emc_from_stream),
            iram: line.as_deref().and_then(iram_from_stream),
        }
    }
}

/// Memory section built only from the stats stream (sizes converted to kB).
pub struct StreamMemory {
    reader: Option<StreamReader>,
}

impl StreamMemory {
    pub fn new(reader: Option<StreamReader>) -> Self {
        Self { reader }
    }
}

impl Source for StreamMemory {
    type Fragment = MemoryFragment;

    fn name(&self) -> &'static str {
        "stats-stream"
    }

    fn available(&self) -> bool {
        self.reader.is_some()
    }

    fn get_status(&mut self) -> MemoryFragment {
        let Some(line) = self.reader.as_ref().and_then(StreamReader::latest) else {
            return MemoryFragment::default();
        };
        let mb = |v: Option<u64>| v.map(|v| v * 1024);
        let ram = line.ram.clone().unwrap_or_default();
        let swap = line.swap.clone().unwrap_or_default();
        MemoryFragment {
            ram: RamFragment {
                total: mb(ram.total),
                used: mb(ram.used),
                free: mb(ram.total.zip(ram.used).map(|(t, u)| t.saturating_sub(u))),
                lfb: ram.lfb,
                ..RamFragment::default()
            },
            swap: SwapFragment {
                total: mb(swap.total),
                used: mb(swap.used),
                cached: mb(swap.cached),
                table: Vec::new(),
            },
            emc: emc_from_stream(&line),
            iram: iram_from_stream(&line),
        }
    }
}

fn emc_from_stream(line: &StatsLine) -> Option<EngineFragment> {
    line.engines.get("EMC").map(|e| EngineFragment {
        online: e.online,
        util: e.util,
        cur: e.freq.map(|mhz| u64::from(mhz) * 1000),
    })
}

fn iram_from_stream(line: &StatsLine) -> Option<IramFragment> {
    line.iram.as_ref().map(|i| IramFragment {
        total: i.total,
        used: i.used,
        lfb: i.lfb,
    })
}

fn parse_meminfo(text: &str) -> HashMap<String, u64> {
    text.lines()
        .filter_map(|line| {
            let (key, rest) = line.split_once(':')?;
            let value = rest.split_whitespace().next()?.parse().ok()?;
            Some((key.trim().to_string(), value))
        })
        .collect()
}

fn read_swaps(root: &Path) -> Vec<SwapEntry> {
    let Ok(text) = fs::read_to_string(root.join("proc/swaps")) else {
        return Vec::new();
    };
    text.lines()
        .skip(1)
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 5 {
                return None;
            }
            Some(SwapEntry {
                path: parts[0].to_string(),
                kind: parts[1].to_string(),
                size: parts[2].parse().ok()?,
                used: parts[3].parse().ok()?,
                priority: parts[4].parse().ok()?,
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum SwapCommand {
    /// `size` is in GB.
    Create {
        path: PathBuf,
        size: u32,
        #[serde(default)]
        boot: bool,
    },
    Remove { path: PathBuf },
}

/// Memory sizes sent to clients on attach, in kB.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryLayout {
    pub ram_total: Option<u64>,
    pub swap_total: Option<u64>,
    pub swaps: Vec<SwapEntry>,
}

#[derive(Debug, Clone)]
pub struct MemoryControl {
    root: PathBuf,
    timeout: Duration,
    bin_dir: Option<PathBuf>,
}

impl MemoryControl {
    pub fn new(root: &Path, timeout: Duration) -> Self {
        Self {
            root: root.to_path_buf(),
            timeout,
            bin_dir: None,
        }
    }

    #[cfg(test)]
    fn with_bin_dir(mut self, dir: &Path) -> Self {
        self.bin_dir = Some(dir.to_path_buf());
        self
    }

    pub fn layout(&self) -> MemoryLayout {
        let info = fs::read_to_string(self.root.join("proc/meminfo"))
            .map(|text| parse_meminfo(&text))
            .unwrap_or_default();
        MemoryLayout {
            ram_total: info.get("MemTotal").copied(),
            swap_total: info.get("SwapTotal").copied(),
            swaps: read_swaps(&self.root),
        }
    }

    pub async fn apply_swap(&self, command: &SwapCommand) -> Result<()> {
        match command {
            SwapCommand::Create { path, size, boot } => {
                if *size == 0 {
                    return Err(Error::Invalid("swap size must be at least 1 GB".to_string()));
                }
                if path.exists() {
                    return Err(Error::Invalid(format!(
                        "swap file {} already exists",
                        path.display()
                    )));
                }
                let path_arg = path.display().to_string();
                self.step(&["fallocate", "-l", &format!("{size}G"), &path_arg]).await?;

                let mut active = false;
                let outcome = async {
                    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
                    self.step(&["mkswap", &path_arg]).await?;
                    self.step(&["swapon", &path_arg]).await?;
                    active = true;
                    if *boot {
                        self.edit_fstab(path, true)?;
                    }
                    Ok::<(), Error>(())
                }
                .await;
                if let Err(err) = outcome {
                    self.discard_swap(path, active).await;
                    return Err(err);
                }
                info!(path = %path_arg, size_gb = size, boot, "swap file enabled");
                Ok(())
            }
            SwapCommand::Remove { path } => {
                let path_arg = path.display().to_string();
                self.step(&["swapoff", &path_arg]).await?;
                fs::remove_file(path)?;
                self.edit_fstab(path, false)?;
                info!(path = %path_arg, "swap file removed");
                Ok(())
            }
        }
    }

    pub fn clear_cache(&self) -> Result<()> {
        write_value(&self.root.join("proc/sys/vm/drop_caches"), 3)?;
        info!("page cache dropped");
        Ok(())
    }

    fn edit_fstab(&self, path: &Path, present: bool) -> Result<()> {
        let fstab = self.root.join("etc/fstab");
        let text = match fs::read_to_string(&fstab) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound && !present => return Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err.into()),
        };
        let updated = fstab_with_swap(&text, &path.display().to_string(), present);
        if updated != text {
            fs::write(&fstab, updated)?;
        }
        Ok(())
    }

    /// Undoes a partial create so the same path can be tried again.
    async fn discard_swap(&self, path: &Path, active: bool) {
        let path_arg = path.display().to_string();
        if active {
            if let Err(err) = self.step(&["swapoff", &path_arg]).await {
                warn!(path = %path_arg, error = %err, "swapoff after failed create");
            }
        }
        match fs::remove_file(path) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => {
                warn!(path = %path_arg, error = %err, "swap file not removed");
            }
            _ => {}
        }
    }

    async fn step(&self, argv: &[&str]) -> Result<()> {
        let program = match &self.bin_dir {
            Some(dir) => dir.join(argv[0]).display().to_string(),
            None => argv[0].to_string(),
        };
        let command: Vec<&str> = std::iter::once(program.as_str())
            .chain(argv[1..].iter().copied())
            .collect();
        let lines = runner::run(&command, self.timeout).await?;
        if lines.iter().any(|l| l.to_lowercase().contains("failed")) {
            return Err(Error::Invalid(format!("{}: {}", argv[0], lines.join(" "))));
        }
        Ok(())
    }
}

fn fstab_with_swap(text: &str, path: &str, present: bool) -> String {
    let entry = format!("{path} none swap sw 0 0");
    let mut lines: Vec<&str> = text
        .lines()
        .filter(|line| line.split_whitespace().next() != Some(path))
        .collect();
    if present {
        lines.push(&entry);
    }
    let mut out = lines.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder;

    const MEMINFO: &str = "MemTotal:        7620000 kB\nMemFree:         1000000 kB\nBuffers:          100000 kB\nCached:          2000000 kB\nSReclaimable:     100000 kB\nShmem:             50000 kB\nSwapCached:            0 kB\nSwapTotal:       3810000 kB\nSwapFree:        3800000 kB\n";

    fn fake_memory(root: &Path) {
        fs::create_dir_all(root.join("proc/sys/vm")).expect("mkdir");
        fs::write(root.join("proc/meminfo"), MEMINFO).expect("write");
        fs::write(
            root.join("proc/swaps"),
            "Filename\tType\tSize\tUsed\tPriority\n/dev/zram0  partition\t635000\t5000\t5\n",
        )
        .expect("write");
        fs::write(root.join("proc/sys/vm/drop_caches"), "0").expect("write");
    }

    #[test]
    fn reads_meminfo_and_swaps() {
        let dir = tempfile::tempdir().expect("tempdir");
        fake_memory(dir.path());
        let mut source = MeminfoSource::new(dir.path(), None);
        assert!(source.available());
        let memory = source.get_status();
        assert_eq!(memory.ram.total, Some(7_620_000));
        assert_eq!(memory.ram.cached, Some(2_100_000));
        assert_eq!(memory.ram.used, Some(7_620_000 - 1_000_000 - 100_000 - 2_100_000));
        assert_eq!(memory.swap.used, Some(10_000));
        assert_eq!(memory.swap.table.len(), 1);
        assert_eq!(memory.swap.table[0].path, "/dev/zram0");
        assert_eq!(memory.ram.lfb, None);
        assert_eq!(memory.emc, None);
    }

    #[test]
    fn stream_adds_lfb_iram_and_emc() {
        let dir = tempfile::tempdir().expect("tempdir");
        fake_memory(dir.path());
        let reader = StreamReader::fixed(decoder::decode(
            "RAM 1/2MB (lfb 3x4MB) IRAM 0/252kB(lfb 252kB) EMC_FREQ 7%@1600",
        ));
        let memory = MeminfoSource::new(dir.path(), Some(reader)).get_status();
        assert_eq!(memory.ram.lfb.and_then(|l| l.nblock), Some(3));
        assert_eq!(memory.iram.and_then(|i| i.lfb), Some(252));
        let emc = memory.emc.expect("emc");
        assert_eq!(emc.util, Some(7.0));
        assert_eq!(emc.cur, Some(1_600_000));
    }

    #[test]
    fn stream_only_memory() {
        let reader = StreamReader::fixed(decoder::decode("RAM 1234/7851MB SWAP 0/3925MB (cached 0MB)"));
        let mut source = StreamMemory::new(Some(reader));
        let memory = source.get_status();
        assert_eq!(memory.ram.used, Some(1234 * 1024));
        assert_eq!(memory.ram.free, Some((7851 - 1234) * 1024));
        assert_eq!(memory.swap.total, Some(3925 * 1024));
    }

    #[test]
    fn clear_cache_writes_drop_caches() {
        let dir = tempfile::tempdir().expect("tempdir");
        fake_memory(dir.path());
        let control = MemoryControl::new(dir.path(), Duration::from_secs(1));
        control.clear_cache().expect("write");
        let text = fs::read_to_string(dir.path().join("proc/sys/vm/drop_caches")).expect("read");
        assert_eq!(text, "3");
    }

    #[test]
    fn layout_reports_totals_and_swap_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        fake_memory(dir.path());
        let layout = MemoryControl::new(dir.path(), Duration::from_secs(1)).layout();
        assert_eq!(layout.ram_total, Some(7_620_000));
        assert_eq!(layout.swap_total, Some(3_810_000));
        assert_eq!(layout.swaps.len(), 1);
    }

    #[tokio::test]
    async fn swap_create_rejects_zero_size_and_existing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let control = MemoryControl::new(dir.path(), Duration::from_secs(1));
        let zero = SwapCommand::Create {
            path: dir.path().join("swapfile"),
            size: 0,
            boot: false,
        };
        assert!(matches!(control.apply_swap(&zero).await, Err(Error::Invalid(_))));

        let existing = dir.path().join("taken");
        fs::write(&existing, "x").expect("write");
        let taken = SwapCommand::Create {
            path: existing,
            size: 1,
            boot: false,
        };
        assert!(matches!(control.apply_swap(&taken).await, Err(Error::Invalid(_))));
    }

    /// Fake swap tools in `dir/bin`; each script body gets the full argv.
    fn fake_tools(dir: &Path, mkswap: &str) -> PathBuf {
        let bin = dir.join("bin");
        fs::create_dir_all(&bin).expect("mkdir");
        let marker = dir.join("swapoff-ran");
        let tools = [
            ("fallocate", "touch \"$3\"".to_string()),
            ("mkswap", mkswap.to_string()),
            ("swapon", "exit 0".to_string()),
            ("swapoff", format!("touch {}", marker.display())),
        ];
        for (name, body) in tools {
            let script = bin.join(name);
            fs::write(&script, format!("#!/bin/sh\n{body}\n")).expect("write script");
            fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).expect("chmod");
        }
        bin
    }

    #[tokio::test]
    async fn failed_mkswap_removes_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bin = fake_tools(dir.path(), "exit 1");
        let control = MemoryControl::new(dir.path(), Duration::from_secs(5)).with_bin_dir(&bin);
        let swapfile = dir.path().join("swapfile");
        let create = SwapCommand::Create {
            path: swapfile.clone(),
            size: 1,
            boot: false,
        };

        let first = control.apply_swap(&create).await.expect_err("mkswap fails");
        assert!(matches!(first, Error::Timeout { returncode: Some(1), .. }));
        assert!(!swapfile.exists());
        assert!(!dir.path().join("swapoff-ran").exists());

        let second = control.apply_swap(&create).await.expect_err("mkswap fails again");
        assert!(matches!(second, Error::Timeout { .. }), "got {second:?}");
    }

    #[tokio::test]
    async fn failure_after_swapon_turns_swap_off() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bin = fake_tools(dir.path(), "exit 0");
        fs::create_dir_all(dir.path().join("etc/fstab")).expect("fstab as a directory");
        let control = MemoryControl::new(dir.path(), Duration::from_secs(5)).with_bin_dir(&bin);
        let swapfile = dir.path().join("swapfile");
        let create = SwapCommand::Create {
            path: swapfile.clone(),
            size: 1,
            boot: true,
        };

        assert!(matches!(control.apply_swap(&create).await, Err(Error::Io(_))));
        assert!(dir.path().join("swapoff-ran").exists());
        assert!(!swapfile.exists());
    }

    #[tokio::test]
    async fn create_then_remove_with_boot_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bin = fake_tools(dir.path(), "exit 0");
        fs::create_dir_all(dir.path().join("etc")).expect("mkdir");
        let control = MemoryControl::new(dir.path(), Duration::from_secs(5)).with_bin_dir(&bin);
        let swapfile = dir.path().join("swapfile");

        let create = SwapCommand::Create {
            path: swapfile.clone(),
            size: 1,
            boot: true,
        };
        control.apply_swap(&create).await.expect("create");
        assert!(swapfile.exists());
        let fstab = fs::read_to_string(dir.path().join("etc/fstab")).expect("fstab");
        assert!(fstab.contains("none swap sw 0 0"));

        let remove = SwapCommand::Remove { path: swapfile.clone() };
        control.apply_swap(&remove).await.expect("remove");
        assert!(!swapfile.exists());
        assert_eq!(fs::read_to_string(dir.path().join("etc/fstab")).expect("fstab"), "");
    }

    #[test]
    fn fstab_entry_added_once_and_removed() {
        let base = "/dev/root / ext4 defaults 0 1\n";
        let added = fstab_with_swap(base, "/swapfile", true);
        assert_eq!(added, "/dev/root / ext4 defaults 0 1\n/swapfile none swap sw 0 0\n");
        assert_eq!(fstab_with_swap(&added, "/swapfile", true), added);
        assert_eq!(fstab_with_swap(&added, "/swapfile", false), base);
    }

    #[test]
    fn swap_command_wire_shape() {
        let cmd: SwapCommand =
            serde_json::from_str(r#"{"command":"create","path":"/swapfile","size":4,"boot":true}"#)
                .expect("parse");
        assert_eq!(
            cmd,
            SwapCommand::Create {
                path: PathBuf::from("/swapfile"),
                size: 4,
                boot: true
            }
        );
    }
}
