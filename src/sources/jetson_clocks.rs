//! `jetson_clocks`: pins every CPU (and the other DVFS domains) to its
//! maximum frequency. The vendor script saves the previous limits into a
//! store file on `--store` and puts them back on `--restore`.

use super::{read_value, ControlState, RetryPolicy};
use crate::config::{JetsonClocksConfig, SettingsStore};
use crate::error::{Error, Result};
use crate::runner;
use crate::snapshot::JetsonClocksFragment;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JcCommand {
    Enable(bool),
    /// Apply on every daemon start.
    Boot(bool),
    /// Forget the stored clock limits.
    Clear,
}

#[derive(Debug)]
pub struct JetsonClocksService {
    root: PathBuf,
    program: String,
    store: PathBuf,
    settings: Arc<SettingsStore>,
    settle: RetryPolicy,
    timeout: Duration,
    state: Mutex<ControlState<bool>>,
}

impl JetsonClocksService {
    pub fn new(
        root: &Path,
        config: &JetsonClocksConfig,
        settings: Arc<SettingsStore>,
        settle: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            root: root.to_path_buf(),
            program: config.program.clone(),
            store: config.store_path.clone(),
            settings,
            settle,
            timeout,
            state: Mutex::new(ControlState::default()),
        }
    }

    pub fn available(&self) -> bool {
        runner::find_program(&self.program).is_some()
    }

    /// True when every online core has its minimum frequency raised to
    /// its maximum.
    pub fn is_active(&self) -> bool {
        let Ok(entries) = fs::read_dir(self.root.join("sys/devices/system/cpu")) else {
            return false;
        };
        let mut pinned = None;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let is_core = name
                .to_str()
                .and_then(|n| n.strip_prefix("cpu"))
                .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()));
            if !is_core {
                continue;
            }
            let dir = entry.path();
            if read_value::<u8>(&dir.join("online")) == Some(0) {
                continue;
            }
            let freq = dir.join("cpufreq");
            let min = read_value::<u64>(&freq.join("scaling_min_freq"));
            let max = read_value::<u64>(&freq.join("scaling_max_freq"));
            match min.zip(max) {
                Some((min, max)) if min == max => pinned = Some(pinned.unwrap_or(true)),
                Some(_) => return false,
                None => {}
            }
        }
        pinned.unwrap_or(false)
    }

    pub fn boot(&self) -> bool {
        self.settings.get().jetson_clocks_boot
    }

    pub fn status(&self) -> JetsonClocksFragment {
        let state = self.lock();
        JetsonClocksFragment {
            active: self.is_active(),
            boot: self.boot(),
            in_flight: state.in_flight,
            last_error: state.last_error.clone(),
        }
    }

    pub async fn apply(&self, command: JcCommand) -> Result<()> {
        match command {
            JcCommand::Enable(enable) => self.set(enable).await,
            JcCommand::Boot(enable) => self.set_boot(enable),
            JcCommand::Clear => self.clear(),
        }
    }

    pub async fn set(&self, enable: bool) -> Result<()> {
        self.lock().begin("jetson_clocks")?;
        let outcome = self.switch(enable, self.settle).await;
        self.lock().finish(outcome.as_ref().map(|_| enable));
        if outcome.is_ok() {
            info!(enable, "jetson_clocks switched");
        }
        outcome
    }

    /// Marks the clocks in flight until the hold is dropped, so user
    /// commands are refused while `owner` drives them through
    /// [`switch`](Self::switch).
    pub(crate) fn hold(self: &Arc<Self>, owner: &str) -> Result<ClocksHold> {
        self.lock().begin(owner)?;
        Ok(ClocksHold(Arc::clone(self)))
    }

    pub(crate) async fn switch(&self, enable: bool, settle: RetryPolicy) -> Result<()> {
        if enable {
            if !self.store.exists() {
                if let Some(parent) = self.store.parent() {
                    fs::create_dir_all(parent)?;
                }
                self.run(&["--store"]).await?;
            }
            self.run(&[]).await?;
        } else {
            if !self.store.exists() {
                return Err(Error::Invalid(format!(
                    "no stored clocks in {} to restore",
                    self.store.display()
                )));
            }
            self.run(&["--restore"]).await?;
        }
        settle
            .wait_for("jetson_clocks", || self.is_active() == enable)
            .await
    }

    pub fn set_boot(&self, enable: bool) -> Result<()> {
        self.settings.update(|s| s.jetson_clocks_boot = enable)?;
        info!(enable, "jetson_clocks boot flag saved");
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.store) {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(err.into()),
            _ => {
                info!(store = %self.store.display(), "jetson_clocks store cleared");
                Ok(())
            }
        }
    }

    pub async fn restore_on_boot(&self) {
        if !self.boot() || self.is_active() {
            return;
        }
        if let Err(err) = self.set(true).await {
            warn!(error = %err, "failed to apply jetson_clocks on boot");
        }
    }

    async fn run(&self, flag: &[&str]) -> Result<()> {
        let store = self.store.display().to_string();
        let mut argv = vec![self.program.as_str()];
        if let Some(flag) = flag.first() {
            argv.push(flag);
            argv.push(&store);
        }
        runner::run(argv.as_slice(), self.timeout).await.map(|_| ())
    }

    fn lock(&self) -> MutexGuard<'_, ControlState<bool>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub(crate) struct ClocksHold(Arc<JetsonClocksService>);

impl Drop for ClocksHold {
    fn drop(&mut self) {
        self.0.lock().in_flight = false;
    }
}
