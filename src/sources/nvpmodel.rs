//! Power mode control through the vendor `nvpmodel` tool.
//!
//! Modes are read from `nvpmodel.conf`. Each mode's `CPU_ONLINE` lines
//! form its compatibility mask; moving between modes with different masks
//! changes which cores exist and is refused unless forced. A change is
//! carried out by a background task: jetson_clocks is paused if it is
//! running, the tool is invoked (with retries), the new mode is confirmed
//! with `nvpmodel -q`, and jetson_clocks is put back. jetson_clocks
//! commands are refused until the task ends.

use super::jetson_clocks::JetsonClocksService;
use super::{ControlState, RetryPolicy};
use crate::config::NvpModelConfig;
use crate::error::{Error, Result};
use crate::runner;
use crate::snapshot::{PowerMode, PowerModeFragment};
use std::collections::BTreeMap;
use std::fs;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

pub type CoreMask = BTreeMap<u32, bool>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NvpConf {
    pub models: Vec<PowerMode>,
    pub masks: BTreeMap<u32, CoreMask>,
    pub default: Option<u32>,
}

/// Parses the `< POWER_MODEL ... >` blocks of `nvpmodel.conf`.
pub fn parse_conf(text: &str) -> NvpConf {
    let mut conf = NvpConf::default();
    let mut current: Option<u32> = None;
    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(header) = line.strip_prefix('<').and_then(|l| l.strip_suffix('>')) {
            let mut words = header.split_whitespace();
            let kind = words.next().unwrap_or_default();
            let attrs: BTreeMap<&str, &str> = words.filter_map(|w| w.split_once('=')).collect();
            current = None;
            match kind {
                "POWER_MODEL" => {
                    let Some(id) = attrs.get("ID").and_then(|v| v.parse().ok()) else {
                        continue;
                    };
                    let name = attrs.get("NAME").copied().unwrap_or_default();
                    conf.models.push(PowerMode::new(id, name));
                    conf.masks.insert(id, CoreMask::new());
                    current = Some(id);
                }
                "PM_CONFIG" => {
                    conf.default = attrs.get("DEFAULT").and_then(|v| v.parse().ok());
                }
                _ => {}
            }
            continue;
        }
        let Some(id) = current else {
            continue;
        };
        let fields: Vec<&str> = line.split_whitespace().collect();
        if let ["CPU_ONLINE", core, value] = fields.as_slice() {
            let core = core.strip_prefix("CORE_").and_then(|c| c.parse().ok());
            if let (Some(core), Some(mask)) = (core, conf.masks.get_mut(&id)) {
                mask.insert(core, *value != "0");
            }
        }
    }
    conf
}

fn parse_query(lines: &[String], models: &[PowerMode]) -> Option<PowerMode> {
    let by_id = lines
        .iter()
        .filter_map(|l| l.trim().parse::<u32>().ok())
        .find_map(|id| models.iter().find(|m| m.id == id));
    let by_name = || {
        lines
            .iter()
            .filter_map(|l| l.split_once("Power Mode:"))
            .find_map(|(_, name)| models.iter().find(|m| m.matches(name)))
    };
    by_id.or_else(by_name).cloned()
}

#[derive(Debug)]
pub struct NvpModelService {
    program: String,
    timeout: Duration,
    retries: u32,
    settle: RetryPolicy,
    conf: NvpConf,
    jetson_clocks: Option<Arc<JetsonClocksService>>,
    state: Mutex<ControlState<PowerMode>>,
}

impl NvpModelService {
    /// Reads the mode table and the current mode. `None` when the board
    /// has no `nvpmodel.conf`.
    pub async fn load(
        config: &NvpModelConfig,
        jetson_clocks: Option<Arc<JetsonClocksService>>,
        timeout: Duration,
    ) -> Option<Self> {
        let text = match fs::read_to_string(&config.config_path) {
            Ok(text) => text,
            Err(err) => {
                debug!(path = %config.config_path.display(), error = %err, "no power mode table");
                return None;
            }
        };
        let conf = parse_conf(&text);
        if conf.models.is_empty() {
            warn!(path = %config.config_path.display(), "power mode table has no modes");
            return None;
        }
        let service = Self {
            program: config.program.clone(),
            timeout,
            retries: config.apply_retries.max(1),
            settle: RetryPolicy::new(
                config.settle_attempts,
                Duration::from_millis(config.settle_interval_ms),
            ),
            conf,
            jetson_clocks,
            state: Mutex::new(ControlState::default()),
        };
        match service.query().await {
            Ok(Some(mode)) => {
                info!(id = mode.id, name = %mode.name, "power mode detected");
                service.lock().value = Some(mode);
            }
            Ok(None) => warn!("current power mode not recognised"),
            Err(err) => warn!(error = %err, "failed to query power mode"),
        }
        Some(service)
    }

    pub fn models(&self) -> &[PowerMode] {
        &self.conf.models
    }

    pub fn default_mode(&self) -> Option<PowerMode> {
        let id = self.conf.default?;
        self.conf.models.iter().find(|m| m.id == id).cloned()
    }

    pub fn current(&self) -> Option<PowerMode> {
        self.lock().value.clone()
    }

    pub fn status(&self) -> PowerModeFragment {
        let state = self.lock();
        PowerModeFragment {
            current: state.value.clone(),
            default: self.default_mode(),
            models: self.conf.models.clone(),
            in_flight: state.in_flight,
            last_error: state.last_error.clone(),
        }
    }

    /// Returns `Ok(None)` when the board is already in that mode and
    /// `force` is not set. Argument and state errors are returned before
    /// anything is touched.
    pub fn apply(
        self: &Arc<Self>,
        id: u32,
        force: bool,
    ) -> Result<Option<JoinHandle<Result<PowerMode>>>> {
        let (target, hold) = {
            let mut state = self.lock();
            if state.in_flight {
                return Err(Error::State("power mode change already in progress".to_string()));
            }
            let target = self
                .conf
                .models
                .iter()
                .find(|m| m.id == id)
                .cloned()
                .ok_or_else(|| Error::Invalid(format!("unknown power mode {id}")))?;
            let current = state.value.clone();
            if !force {
                if current.as_ref().is_some_and(|c| c.id == id) {
                    return Ok(None);
                }
                if let Some(current) = &current {
                    if self.conf.masks.get(&current.id) != self.conf.masks.get(&id) {
                        return Err(Error::Invalid(format!(
                            "power mode {} changes the online cores of {}; use force",
                            target.name, current.name
                        )));
                    }
                }
            }
            let hold = match &self.jetson_clocks {
                Some(jc) => Some(jc.hold("jetson_clocks")?),
                None => None,
            };
            state.begin("power mode")?;
            (target, hold)
        };

        let service = Arc::clone(self);
        Ok(Some(tokio::spawn(async move {
            let outcome = service.change(&target).await;
            service.lock().finish(outcome.as_ref().map(Clone::clone));
            drop(hold);
            match &outcome {
                Ok(mode) => info!(id = mode.id, name = %mode.name, "power mode applied"),
                Err(err) => warn!(id = target.id, error = %err, "power mode change failed"),
            }
            outcome
        })))
    }

    async fn change(&self, target: &PowerMode) -> Result<PowerMode> {
        let paused = match &self.jetson_clocks {
            Some(jc) if jc.is_active() => {
                if let Err(err) = jc.switch(false, self.settle).await {
                    warn!(error = %err, "jetson_clocks did not settle before power mode change");
                }
                Some(jc)
            }
            _ => None,
        };

        let outcome = self.set_mode(target).await;

        if let Some(jc) = paused {
            if let Err(err) = jc.switch(true, self.settle).await {
                warn!(error = %err, "jetson_clocks did not settle after power mode change");
            }
        }
        outcome
    }

    async fn set_mode(&self, target: &PowerMode) -> Result<PowerMode> {
        let id = target.id.to_string();
        let mut last = Error::Invalid(format!("power mode {} was not applied", target.id));
        for attempt in 1..=self.retries {
            match runner::run(&[self.program.as_str(), "-m", id.as_str()], self.timeout).await {
                Ok(lines) => match lines.iter().find(|l| l.contains("ERROR")) {
                    Some(line) => last = Error::Invalid(line.trim().to_string()),
                    None => return self.confirm(target).await,
                },
                Err(err @ Error::NotFound { .. }) => return Err(err),
                Err(err) => last = err,
            }
            debug!(attempt, error = %last, "power mode attempt failed");
        }
        Err(last)
    }

    async fn confirm(&self, target: &PowerMode) -> Result<PowerMode> {
        for attempt in 1..=self.settle.max_attempts {
            if let Ok(Some(mode)) = self.query().await {
                if mode.id == target.id {
                    return Ok(mode);
                }
            }
            if attempt < self.settle.max_attempts {
                time::sleep(self.settle.interval).await;
            }
        }
        Err(Error::timeout(
            format!("power mode {}", target.name),
            self.settle.interval * self.settle.max_attempts,
        ))
    }

    async fn query(&self) -> Result<Option<PowerMode>> {
        let lines = runner::run(&[self.program.as_str(), "-q"], self.timeout).await?;
        Ok(parse_query(&lines, &self.conf.models))
    }

    fn lock(&self) -> MutexGuard<'_, ControlState<PowerMode>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::jetson_clocks::tests as jc_tests;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    const CONF: &str = "\
# power modes
< POWER_MODEL ID=0 NAME=MAXN >
CPU_ONLINE CORE_0 1
CPU_ONLINE CORE_1 1
CPU_ONLINE CORE_2 1
< POWER_MODEL ID=1 NAME=MODE_10W >
CPU_ONLINE CORE_0 1
CPU_ONLINE CORE_1 1
CPU_ONLINE CORE_2 1
< POWER_MODEL ID=2 NAME=MODE_5W >
CPU_ONLINE CORE_0 1
CPU_ONLINE CORE_1 0
CPU_ONLINE CORE_2 0
< PM_CONFIG DEFAULT=1 >
";

    /// Fake tool keeping the mode id in a file next to it.
    fn fake_nvpmodel(root: &Path, apply: &str) -> String {
        let script = root.join("nvpmodel");
        let state = root.join("mode");
        fs::write(&state, "0\n").expect("write");
        let body = format!(
            "#!/bin/sh\n\
             case \"$1\" in\n\
             -q) id=$(cat {state}); echo \"NV Power Mode: MODE_$id\"; echo $id ;;\n\
             -m) {apply} ;;\n\
             esac\n",
            state = state.display(),
        );
        fs::write(&script, body).expect("write script");
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).expect("chmod");
        script.display().to_string()
    }

    async fn service(
        root: &Path,
        apply: &str,
        jc: Option<Arc<JetsonClocksService>>,
    ) -> Arc<NvpModelService> {
        let conf = root.join("nvpmodel.conf");
        fs::write(&conf, CONF).expect("write conf");
        let program = fake_nvpmodel(root, &apply.replace("STATE", &root.join("mode").display().to_string()));
        let config = NvpModelConfig {
            program,
            config_path: conf,
            apply_retries: 2,
            settle_attempts: 5,
            settle_interval_ms: 10,
        };
        Arc::new(
            NvpModelService::load(&config, jc, Duration::from_secs(5))
                .await
                .expect("modes loaded"),
        )
    }

    #[test]
    fn parses_modes_masks_and_default() {
        let conf = parse_conf(CONF);
        assert_eq!(conf.models.len(), 3);
        assert_eq!(conf.models[2], PowerMode::new(2, "MODE_5W"));
        assert_eq!(conf.default, Some(1));
        assert_eq!(conf.masks[&0], conf.masks[&1]);
        assert_ne!(conf.masks[&0], conf.masks[&2]);
        assert_eq!(conf.masks[&2].get(&1), Some(&false));
    }

    #[test]
    fn query_output_by_id_or_name() {
        let models = parse_conf(CONF).models;
        let lines = vec!["NV Power Mode: MODE_10W".to_string(), "1".to_string()];
        assert_eq!(parse_query(&lines, &models), Some(models[1].clone()));
        let lines = vec!["NV Power Mode: MODE_5W".to_string()];
        assert_eq!(parse_query(&lines, &models), Some(models[2].clone()));
        assert_eq!(parse_query(&[], &models), None);
    }

    #[tokio::test]
    async fn missing_table_means_no_service() {
        let config = NvpModelConfig {
            config_path: "/nonexistent/nvpmodel.conf".into(),
            ..NvpModelConfig::default()
        };
        assert!(NvpModelService::load(&config, None, Duration::from_secs(1))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn apply_validates_before_touching_hardware() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nvp = service(dir.path(), "echo $2 > STATE", None).await;
        assert_eq!(nvp.current(), Some(PowerMode::new(0, "MAXN")));
        assert_eq!(nvp.default_mode(), Some(PowerMode::new(1, "MODE_10W")));

        assert!(nvp.apply(0, false).expect("same mode").is_none());
        assert!(matches!(nvp.apply(9, false), Err(Error::Invalid(_))));
        assert!(matches!(nvp.apply(2, false), Err(Error::Invalid(_))));
        let status = nvp.status();
        assert!(!status.in_flight);
        assert_eq!(status.current, Some(PowerMode::new(0, "MAXN")));
    }

    #[tokio::test]
    async fn compatible_and_forced_changes_complete() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nvp = service(dir.path(), "echo $2 > STATE", None).await;

        let task = nvp.apply(1, false).expect("accepted").expect("spawned");
        let mode = task.await.expect("join").expect("applied");
        assert_eq!(mode.id, 1);
        assert_eq!(nvp.current().map(|m| m.id), Some(1));

        let task = nvp.apply(2, true).expect("forced").expect("spawned");
        task.await.expect("join").expect("applied");
        assert_eq!(nvp.current().map(|m| m.id), Some(2));
    }

    #[tokio::test]
    async fn second_change_while_in_flight_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nvp = service(dir.path(), "sleep 0.3; echo $2 > STATE", None).await;

        let task = nvp.apply(1, false).expect("accepted").expect("spawned");
        assert!(nvp.status().in_flight);
        assert!(matches!(nvp.apply(0, true), Err(Error::State(_))));
        task.await.expect("join").expect("applied");
        assert!(!nvp.status().in_flight);
    }

    #[tokio::test]
    async fn tool_errors_are_retried_then_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nvp = service(dir.path(), "echo 'NVPM ERROR: failed to set mode'", None).await;

        let task = nvp.apply(1, false).expect("accepted").expect("spawned");
        assert!(matches!(task.await.expect("join"), Err(Error::Invalid(_))));
        let status = nvp.status();
        assert_eq!(status.current.map(|m| m.id), Some(0));
        assert!(status.last_error.is_some());
    }

    #[tokio::test]
    async fn jetson_clocks_commands_wait_for_the_mode_change() {
        let dir = tempfile::tempdir().expect("tempdir");
        jc_tests::write_cpu(dir.path(), 0, 100, 1_479_000);
        let jc = Arc::new(jc_tests::service(dir.path()));
        jc.set(true).await.expect("enable");

        let nvp = service(dir.path(), "sleep 0.5; echo $2 > STATE", Some(Arc::clone(&jc))).await;
        let task = nvp.apply(1, false).expect("accepted").expect("spawned");
        time::sleep(Duration::from_millis(100)).await;
        assert!(nvp.status().in_flight);
        assert!(jc.status().in_flight);
        assert!(matches!(jc.set(false).await, Err(Error::State(_))));

        task.await.expect("join").expect("applied");
        assert!(jc.is_active());
        assert!(!jc.status().in_flight);
        jc.set(false).await.expect("disable after the change");
        assert!(!jc.is_active());
    }

    #[tokio::test]
    async fn mode_change_refused_while_clocks_are_busy() {
        let dir = tempfile::tempdir().expect("tempdir");
        jc_tests::write_cpu(dir.path(), 0, 100, 1_479_000);
        let jc = Arc::new(jc_tests::service(dir.path()));
        let nvp = service(dir.path(), "echo $2 > STATE", Some(Arc::clone(&jc))).await;

        let hold = jc.hold("jetson_clocks").expect("hold");
        assert!(matches!(nvp.apply(1, false), Err(Error::State(_))));
        assert!(!nvp.status().in_flight);
        drop(hold);

        let task = nvp.apply(1, false).expect("accepted").expect("spawned");
        task.await.expect("join").expect("applied");
    }

    #[tokio::test]
    async fn jetson_clocks_is_paused_and_restored() {
        let dir = tempfile::tempdir().expect("tempdir");
        jc_tests::write_cpu(dir.path(), 0, 100, 1_479_000);
        let jc = Arc::new(jc_tests::service(dir.path()));
        jc.set(true).await.expect("enable");

        let nvp = service(dir.path(), "echo $2 > STATE", Some(Arc::clone(&jc))).await;
        let task = nvp.apply(1, false).expect("accepted").expect("spawned");
        task.await.expect("join").expect("applied");
        assert!(jc.is_active());
        assert!(!jc.status().in_flight);
    }
}
