//! Typed snapshot published once per tick.
//!
//! Every section keeps the same shape from one tick to the next. A value
//! that cannot be read is `None` (serialized as `null`) instead of a
//! missing key, so clients can diff ticks safely.

use crate::decoder::Lfb;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Tick sequence number, starting at 1 after each idle period.
    pub seq: u64,
    pub timestamp_ms: u64,
    pub cpu: CpuFragment,
    pub gpu: GpuFragment,
    pub memory: MemoryFragment,
    pub engines: EnginesFragment,
    pub temperature: TemperatureFragment,
    pub power: PowerFragment,
    pub fan: FanFragment,
    pub jetson_clocks: Option<JetsonClocksFragment>,
    pub power_mode: Option<PowerModeFragment>,
    pub uptime: f64,
    pub processes: Vec<ProcessEntry>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuUtilization {
    pub user: f64,
    pub nice: f64,
    pub system: f64,
    pub idle: f64,
}

/// Frequencies in kHz.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frequency {
    pub min: Option<u64>,
    pub max: Option<u64>,
    pub cur: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoreFragment {
    pub online: bool,
    pub model: Option<String>,
    pub governor: Option<String>,
    pub freq: Frequency,
    pub utilization: Option<CpuUtilization>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuFragment {
    pub cores: Vec<CoreFragment>,
    pub total: CpuUtilization,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuDevice {
    pub load: Option<f64>,
    pub governor: Option<String>,
    pub freq: Frequency,
    pub railgate: Option<bool>,
    pub scaling_3d: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuFragment {
    pub devices: BTreeMap<String, GpuDevice>,
}

/// Sizes in kB.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RamFragment {
    pub total: Option<u64>,
    pub used: Option<u64>,
    pub free: Option<u64>,
    pub buffers: Option<u64>,
    pub cached: Option<u64>,
    pub shared: Option<u64>,
    pub lfb: Option<Lfb>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwapEntry {
    pub path: String,
    pub kind: String,
    pub size: u64,
    pub used: u64,
    pub priority: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwapFragment {
    pub total: Option<u64>,
    pub used: Option<u64>,
    pub cached: Option<u64>,
    pub table: Vec<SwapEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IramFragment {
    pub total: Option<u64>,
    pub used: Option<u64>,
    pub lfb: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryFragment {
    pub ram: RamFragment,
    pub swap: SwapFragment,
    pub emc: Option<EngineFragment>,
    pub iram: Option<IramFragment>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineFragment {
    pub online: bool,
    pub util: Option<f64>,
    /// Current clock in kHz.
    pub cur: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnginesFragment {
    pub engines: BTreeMap<String, EngineFragment>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub online: bool,
    pub temp: Option<f64>,
    pub crit: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemperatureFragment {
    pub sensors: BTreeMap<String, SensorReading>,
}

/// Electrical values in mV, mA and mW.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RailReading {
    pub volt: Option<u64>,
    pub curr: Option<u64>,
    pub power: Option<u64>,
    pub avg: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PowerFragment {
    pub rails: BTreeMap<String, RailReading>,
    pub total: RailReading,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FanDevice {
    pub profile: String,
    /// Per channel duty cycle in percent.
    pub speed: Vec<Option<f64>>,
    pub rpm: Vec<Option<u64>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FanFragment {
    pub fans: BTreeMap<String, FanDevice>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JetsonClocksFragment {
    pub active: bool,
    pub boot: bool,
    pub in_flight: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PowerMode {
    pub id: u32,
    pub name: String,
}

impl PowerMode {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// Matches either the numeric id (`"2"`) or the mode name.
    pub fn matches(&self, key: &str) -> bool {
        match key.trim().parse::<u32>() {
            Ok(id) => id == self.id,
            Err(_) => self.name.eq_ignore_ascii_case(key.trim()),
        }
    }

    pub fn next<'a>(&self, modes: &'a [PowerMode]) -> Option<&'a PowerMode> {
        let pos = modes.iter().position(|m| m.id == self.id)?;
        modes.get(pos + 1)
    }

    pub fn prev<'a>(&self, modes: &'a [PowerMode]) -> Option<&'a PowerMode> {
        let pos = modes.iter().position(|m| m.id == self.id)?;
        pos.checked_sub(1).and_then(|p| modes.get(p))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerModeFragment {
    pub current: Option<PowerMode>,
    pub default: Option<PowerMode>,
    pub models: Vec<PowerMode>,
    pub in_flight: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
    pub state: String,
    pub cpu_percent: f64,
    pub memory_kb: u64,
}
