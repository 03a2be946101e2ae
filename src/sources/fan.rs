use super::{read_trimmed, read_value, write_value, RetryPolicy, Source};
use crate::config::SettingsStore;
use crate::error::{Error, Result};
use crate::snapshot::{FanDevice, FanFragment};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

const FAN_DRIVERS: [&str; 3] = ["pwmfan", "pwm_fan", "pwm-fan"];

/// Profiles understood by the kernel fan driver, with their `pwmN_enable`
/// value.
const PROFILES: [(&str, u8); 2] = [("manual", 1), ("quiet", 2)];

const PWM_MAX: u32 = 255;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum FanCommand {
    Speed { name: String, idx: usize, speed: u8 },
    Profile { name: String, profile: String },
}

/// Fan layout sent to clients on attach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanInfo {
    pub channels: usize,
    pub profiles: Vec<String>,
}

#[derive(Debug)]
struct Fan {
    dir: PathBuf,
    /// `pwmN` channel numbers.
    channels: Vec<u32>,
}

impl Fan {
    fn pwm(&self, channel: u32) -> PathBuf {
        self.dir.join(format!("pwm{channel}"))
    }

    fn enable(&self, channel: u32) -> PathBuf {
        self.dir.join(format!("pwm{channel}_enable"))
    }

    fn rpm(&self, channel: u32) -> Option<u64> {
        read_value(&self.dir.join(format!("fan{channel}_input")))
            .or_else(|| read_value(&self.dir.join("rpm")))
    }

    fn profile(&self) -> String {
        let mode = self
            .channels
            .first()
            .and_then(|c| read_value::<u8>(&self.enable(*c)));
        PROFILES
            .iter()
            .find(|(_, value)| Some(*value) == mode)
            .map(|(name, _)| name.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

#[derive(Debug)]
pub struct FanService {
    fans: BTreeMap<String, Fan>,
    settings: Arc<SettingsStore>,
    confirm: RetryPolicy,
}

impl FanService {
    pub fn new(root: &Path, settings: Arc<SettingsStore>, confirm: RetryPolicy) -> Self {
        Self {
            fans: discover(root),
            settings,
            confirm,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fans.is_empty()
    }

    pub fn layout(&self) -> BTreeMap<String, FanInfo> {
        self.fans
            .iter()
            .map(|(name, fan)| {
                let info = FanInfo {
                    channels: fan.channels.len(),
                    profiles: PROFILES.iter().map(|(p, _)| p.to_string()).collect(),
                };
                (name.clone(), info)
            })
            .collect()
    }

    pub async fn apply(&self, command: &FanCommand) -> Result<()> {
        match command {
            FanCommand::Speed { name, idx, speed } => self.set_speed(name, *idx, *speed).await,
            FanCommand::Profile { name, profile } => self.set_profile(name, profile),
        }
    }

    /// Forces manual mode and writes the duty cycle, then waits until the
    /// driver reports it back.
    pub async fn set_speed(&self, name: &str, idx: usize, percent: u8) -> Result<()> {
        if percent > 100 {
            return Err(Error::Invalid(format!(
                "fan speed {percent} is out of range 0..=100"
            )));
        }
        let fan = self.fan(name)?;
        let channel = *fan
            .channels
            .get(idx)
            .ok_or_else(|| Error::Invalid(format!("fan {name} has no channel {idx}")))?;

        let enable = fan.enable(channel);
        if enable.exists() {
            write_value(&enable, 1)?;
        }
        let pwm = (u32::from(percent) * PWM_MAX + 50) / 100;
        let target = fan.pwm(channel);
        write_value(&target, pwm)?;
        self.confirm
            .wait_for(&format!("fan {name} speed"), || {
                read_value::<u32>(&target) == Some(pwm)
            })
            .await?;
        info!(fan = name, channel = idx, percent, pwm, "fan speed set");
        Ok(())
    }

    pub fn set_profile(&self, name: &str, profile: &str) -> Result<()> {
        let fan = self.fan(name)?;
        let value = profile_value(profile)?;
        for channel in &fan.channels {
            let enable = fan.enable(*channel);
            if enable.exists() {
                write_value(&enable, value)?;
            }
        }
        self.settings.update(|s| {
            s.fan_profiles.insert(name.to_string(), profile.to_string());
        })?;
        info!(fan = name, profile, "fan profile set");
        Ok(())
    }

    pub fn restore(&self) {
        for (name, profile) in self.settings.get().fan_profiles {
            if !self.fans.contains_key(&name) {
                continue;
            }
            if let Err(err) = self.set_profile(&name, &profile) {
                warn!(fan = %name, profile = %profile, error = %err, "failed to restore fan profile");
            }
        }
    }

    fn fan(&self, name: &str) -> Result<&Fan> {
        self.fans
            .get(name)
            .ok_or_else(|| Error::not_found(format!("fan {name}"), "no such fan"))
    }
}

fn profile_value(profile: &str) -> Result<u8> {
    PROFILES
        .iter()
        .find(|(p, _)| *p == profile)
        .map(|(_, v)| *v)
        .ok_or_else(|| Error::Invalid(format!("unknown fan profile {profile}")))
}

impl Source for Arc<FanService> {
    type Fragment = FanFragment;

    fn name(&self) -> &'static str {
        "hwmon"
    }

    fn available(&self) -> bool {
        !self.is_empty()
    }

    fn get_status(&mut self) -> FanFragment {
        let fans = self
            .fans
            .iter()
            .map(|(name, fan)| {
                let device = FanDevice {
                    profile: fan.profile(),
                    speed: fan
                        .channels
                        .iter()
                        .map(|c| {
                            read_value::<u32>(&fan.pwm(*c))
                                .map(|pwm| f64::from(pwm) * 100.0 / f64::from(PWM_MAX))
                        })
                        .collect(),
                    rpm: fan.channels.iter().map(|c| fan.rpm(*c)).collect(),
                };
                (name.clone(), device)
            })
            .collect();
        FanFragment { fans }
    }
}

fn discover(root: &Path) -> BTreeMap<String, Fan> {
    let Ok(entries) = fs::read_dir(root.join("sys/class/hwmon")) else {
        return BTreeMap::new();
    };
    let mut dirs: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
    dirs.sort();

    let mut fans = BTreeMap::new();
    for dir in dirs {
        let Some(driver) = read_trimmed(&dir.join("name")) else {
            continue;
        };
        if !FAN_DRIVERS.contains(&driver.as_str()) {
            continue;
        }
        let channels: Vec<u32> = (1..=8).filter(|n| dir.join(format!("pwm{n}")).is_file()).collect();
        if channels.is_empty() {
            continue;
        }
        let mut name = driver.clone();
        let mut n = 1;
        while fans.contains_key(&name) {
            name = format!("{driver}{n}");
            n += 1;
        }
        fans.insert(name, Fan { dir, channels });
    }
    fans
}
