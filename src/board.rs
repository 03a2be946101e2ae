//! Board identity reported in the client handshake.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardIdentity {
    pub model: String,
    pub module: String,
    pub soc: String,
    pub serial_number: String,
    pub l4t: String,
    pub jetpack: String,
    pub codename: String,
}

impl BoardIdentity {
    /// Reads the `JETSON_*` environment, filling gaps from the device tree
    /// and `/etc/nv_tegra_release` under `root`. Unknown fields stay empty.
    pub fn detect(root: &Path) -> Self {
        Self::from_lookup(root, |key| std::env::var(key).ok())
    }

    pub fn from_lookup<F: Fn(&str) -> Option<String>>(root: &Path, lookup: F) -> Self {
        let env = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let device_tree = |file: &str| {
            fs::read_to_string(root.join("proc/device-tree").join(file))
                .ok()
                .map(|v| v.trim_end_matches('\0').trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let release = fs::read_to_string(root.join("etc/nv_tegra_release"))
            .ok()
            .and_then(|text| parse_l4t(&text));

        Self {
            model: env("JETSON_MODEL")
                .or_else(|| device_tree("model"))
                .unwrap_or_default(),
            module: env("JETSON_MODULE").unwrap_or_default(),
            soc: env("JETSON_SOC").unwrap_or_default(),
            serial_number: env("JETSON_SERIAL_NUMBER")
                .or_else(|| device_tree("serial-number"))
                .unwrap_or_default(),
            l4t: env("JETSON_L4T").or(release).unwrap_or_default(),
            jetpack: env("JETSON_JETPACK").unwrap_or_default(),
            codename: env("JETSON_CODENAME").unwrap_or_default(),
        }
    }
}

/// `# R35 (release), REVISION: 3.1, ...` becomes `35.3.1`.
fn parse_l4t(text: &str) -> Option<String> {
    let line = text.lines().next()?;
    let major = line
        .split_whitespace()
        .find_map(|w| w.strip_prefix('R'))?
        .trim_end_matches(',');
    let revision = line
        .split_once("REVISION:")?
        .1
        .split(',')
        .next()?
        .trim();
    Some(format!("{major}.{revision}"))
}
