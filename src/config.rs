use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    /// Group owning the socket. `None` keeps the daemon's own group.
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default = "default_idle_floor_ms")]
    pub idle_floor_ms: u64,
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_sys_root")]
    pub sys_root: PathBuf,
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    #[serde(default)]
    pub stats_stream: StatsStreamConfig,
    #[serde(default)]
    pub nvpmodel: NvpModelConfig,
    #[serde(default)]
    pub jetson_clocks: JetsonClocksConfig,
    #[serde(default)]
    pub processes: ProcessesConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StatsStreamConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_stats_program")]
    pub program: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NvpModelConfig {
    #[serde(default = "default_nvpmodel_program")]
    pub program: String,
    #[serde(default = "default_nvpmodel_config_path")]
    pub config_path: PathBuf,
    #[serde(default = "default_apply_retries")]
    pub apply_retries: u32,
    #[serde(default = "default_settle_attempts")]
    pub settle_attempts: u32,
    #[serde(default = "default_settle_interval_ms")]
    pub settle_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JetsonClocksConfig {
    #[serde(default = "default_jetson_clocks_program")]
    pub program: String,
    #[serde(default = "default_jetson_clocks_store")]
    pub store_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProcessesConfig {
    #[serde(default = "default_process_limit")]
    pub limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            group: None,
            pid_file: default_pid_file(),
            interval_ms: default_interval_ms(),
            min_interval_ms: default_min_interval_ms(),
            idle_floor_ms: default_idle_floor_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            command_timeout_secs: default_command_timeout_secs(),
            sys_root: default_sys_root(),
            state_path: default_state_path(),
            stats_stream: StatsStreamConfig::default(),
            nvpmodel: NvpModelConfig::default(),
            jetson_clocks: JetsonClocksConfig::default(),
            processes: ProcessesConfig::default(),
        }
    }
}

impl Default for StatsStreamConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            program: default_stats_program(),
        }
    }
}

impl Default for NvpModelConfig {
    fn default() -> Self {
        Self {
            program: default_nvpmodel_program(),
            config_path: default_nvpmodel_config_path(),
            apply_retries: default_apply_retries(),
            settle_attempts: default_settle_attempts(),
            settle_interval_ms: default_settle_interval_ms(),
        }
    }
}

impl Default for JetsonClocksConfig {
    fn default() -> Self {
        Self {
            program: default_jetson_clocks_program(),
            store_path: default_jetson_clocks_store(),
        }
    }
}

impl Default for ProcessesConfig {
    fn default() -> Self {
        Self {
            limit: default_process_limit(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.socket_path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "socket_path is required".to_string(),
            ));
        }
        if let Some(group) = &self.group {
            if group.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "group must not be empty when set".to_string(),
                ));
            }
        }
        if self.min_interval_ms < 10 {
            return Err(ConfigError::Validation(
                "min_interval_ms must be >= 10".to_string(),
            ));
        }
        if self.interval_ms < self.min_interval_ms {
            return Err(ConfigError::Validation(format!(
                "interval_ms must be >= min_interval_ms ({})",
                self.min_interval_ms
            )));
        }
        if self.idle_floor_ms == 0 {
            return Err(ConfigError::Validation(
                "idle_floor_ms must be > 0".to_string(),
            ));
        }
        if self.stop_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "stop_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.command_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "command_timeout_secs must be > 0".to_string(),
            ));
        }
        if self.nvpmodel.apply_retries == 0 || self.nvpmodel.settle_attempts == 0 {
            return Err(ConfigError::Validation(
                "nvpmodel.apply_retries and nvpmodel.settle_attempts must be >= 1".to_string(),
            ));
        }
        if self.processes.limit == 0 {
            return Err(ConfigError::Validation(
                "processes.limit must be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Quiet period after which the poller is stopped: three intervals,
    /// never less than `idle_floor_ms`.
    pub fn idle_after(&self, interval: Duration) -> Duration {
        (interval * 3).max(Duration::from_millis(self.idle_floor_ms))
    }
}

/// Control settings that survive a daemon restart.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub jetson_clocks_boot: bool,
    #[serde(default)]
    pub fan_profiles: BTreeMap<String, String>,
}

impl Settings {
    /// Missing or unreadable files fall back to defaults.
    pub fn load(path: &Path) -> Self {
        fs::read_to_string(path)
            .ok()
            .and_then(|text| serde_yaml::from_str(&text).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let text = serde_yaml::to_string(self)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        fs::write(path, text)
    }

    pub fn clear(path: &Path) -> std::io::Result<()> {
        match fs::remove_file(path) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }
}

#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    current: Mutex<Settings>,
}

impl SettingsStore {
    pub fn open(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            current: Mutex::new(Settings::load(path)),
        }
    }

    pub fn get(&self) -> Settings {
        self.lock().clone()
    }

    pub fn update<F: FnOnce(&mut Settings)>(&self, change: F) -> std::io::Result<()> {
        let mut current = self.lock();
        change(&mut current);
        current.save(&self.path)
    }

    pub fn reset(&self) -> std::io::Result<()> {
        *self.lock() = Settings::default();
        Settings::clear(&self.path)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Settings> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/run/jetsond.sock")
}

fn default_pid_file() -> PathBuf {
    PathBuf::from("/run/jetsond.pid")
}

const fn default_interval_ms() -> u64 {
    1000
}

const fn default_min_interval_ms() -> u64 {
    100
}

const fn default_idle_floor_ms() -> u64 {
    3000
}

const fn default_stop_timeout_ms() -> u64 {
    5000
}

const fn default_command_timeout_secs() -> u64 {
    10
}

fn default_sys_root() -> PathBuf {
    PathBuf::from("/")
}

fn default_state_path() -> PathBuf {
    PathBuf::from("/var/lib/jetsond/settings.yaml")
}

const fn default_true() -> bool {
    true
}

fn default_stats_program() -> String {
    "tegrastats".to_string()
}

fn default_nvpmodel_program() -> String {
    "nvpmodel".to_string()
}

fn default_nvpmodel_config_path() -> PathBuf {
    PathBuf::from("/etc/nvpmodel.conf")
}

const fn default_apply_retries() -> u32 {
    3
}

const fn default_settle_attempts() -> u32 {
    10
}

const fn default_settle_interval_ms() -> u64 {
    500
}

fn default_jetson_clocks_program() -> String {
    "jetson_clocks".to_string()
}

fn default_jetson_clocks_store() -> PathBuf {
    PathBuf::from("/var/lib/jetsond/l4t_dfs.conf")
}

const fn default_process_limit() -> usize {
    30
}
