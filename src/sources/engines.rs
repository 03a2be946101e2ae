use super::stream::StreamReader;
use super::{read_value, Source};
use crate::snapshot::{EngineFragment, EnginesFragment};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Hardware engines and the debugfs clock that drives each of them.
const ENGINE_CLOCKS: [(&str, &str); 8] = [
    ("APE", "ape"),
    ("NVENC", "nvenc"),
    ("NVDEC", "nvdec"),
    ("NVJPG", "nvjpg"),
    ("VIC", "vic"),
    ("DLA0", "dla0_core"),
    ("DLA1", "dla1_core"),
    ("PVA0", "pva0_vps0"),
];

/// Engines covered by other snapshot sections.
const NOT_ENGINES: [&str; 2] = ["GR3D", "EMC"];

/// Engine clocks from `/sys/kernel/debug/clk`.
pub struct ClkEngines {
    clocks: Vec<(&'static str, PathBuf)>,
}

impl ClkEngines {
    pub fn new(root: &Path) -> Self {
        let base = root.join("sys/kernel/debug/clk");
        let clocks = ENGINE_CLOCKS
            .iter()
            .map(|(name, clk)| (*name, base.join(clk)))
            .filter(|(_, dir)| dir.join("clk_rate").is_file())
            .collect();
        Self { clocks }
    }
}

impl Source for ClkEngines {
    type Fragment = EnginesFragment;

    fn name(&self) -> &'static str {
        "debugfs-clk"
    }

    fn available(&self) -> bool {
        !self.clocks.is_empty()
    }

    fn get_status(&mut self) -> EnginesFragment {
        let engines = self
            .clocks
            .iter()
            .map(|(name, dir)| {
                let enabled = read_value::<u32>(&dir.join("clk_enable_count"));
                let fragment = EngineFragment {
                    online: enabled.is_some_and(|n| n > 0),
                    util: None,
                    cur: read_value::<u64>(&dir.join("clk_rate")).map(|hz| hz / 1000),
                };
                (name.to_string(), fragment)
            })
            .collect();
        EnginesFragment { engines }
    }
}

pub struct StreamEngines {
    reader: Option<StreamReader>,
}

impl StreamEngines {
    pub fn new(reader: Option<StreamReader>) -> Self {
        Self { reader }
    }
}

impl Source for StreamEngines {
    type Fragment = EnginesFragment;

    fn name(&self) -> &'static str {
        "stats-stream"
    }

    fn available(&self) -> bool {
        self.reader.is_some()
    }

    fn get_status(&mut self) -> EnginesFragment {
        let Some(line) = self.reader.as_ref().and_then(StreamReader::latest) else {
            return EnginesFragment::default();
        };
        let engines: BTreeMap<String, EngineFragment> = line
            .engines
            .iter()
            .filter(|(name, _)| !NOT_ENGINES.contains(&name.as_str()))
            .map(|(name, e)| {
                let fragment = EngineFragment {
                    online: e.online,
                    util: e.util,
                    cur: e.freq.map(|mhz| u64::from(mhz) * 1000),
                };
                (name.clone(), fragment)
            })
            .collect();
        EnginesFragment { engines }
    }
}
