//! Decoder for the vendor stats text stream (`tegrastats`).
//!
//! Each line is walked left to right by a small tokenizer. At every
//! position the grammar rules are tried in order; the first rule that
//! matches consumes its text and records a value. When no rule matches
//! a single whitespace separated word is skipped, so fields added by
//! newer firmware never break decoding of the ones we know.
//!
//! Numeric captures that do not parse leave only that value as `None`.
//! The decoder never touches the filesystem and keeps no state.

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::OnceLock;

/// Reported by the firmware for a thermal zone that is switched off.
const OFFLINE_TEMPERATURE: f64 = -256.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsLine {
    pub ram: Option<RamStats>,
    pub swap: Option<SwapStats>,
    pub iram: Option<IramStats>,
    pub cpu: Option<Vec<CoreStats>>,
    pub mts: Option<MtsStats>,
    pub engines: BTreeMap<String, EngineStats>,
    pub temperatures: BTreeMap<String, Option<f64>>,
    pub power: BTreeMap<String, RailStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RamStats {
    #[serde(rename = "use")]
    pub used: Option<u64>,
    #[serde(rename = "tot")]
    pub total: Option<u64>,
    pub lfb: Option<Lfb>,
}

/// Largest free block: `nblock` blocks of `size` MB (or kB for IRAM).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Lfb {
    pub nblock: Option<u64>,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwapStats {
    #[serde(rename = "use")]
    pub used: Option<u64>,
    #[serde(rename = "tot")]
    pub total: Option<u64>,
    pub cached: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IramStats {
    #[serde(rename = "use")]
    pub used: Option<u64>,
    #[serde(rename = "tot")]
    pub total: Option<u64>,
    pub lfb: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CoreStatus {
    On,
    Off,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreStats {
    pub status: CoreStatus,
    pub util: Option<f64>,
    pub freq: Option<u32>,
}

impl CoreStats {
    fn offline() -> Self {
        Self {
            status: CoreStatus::Off,
            util: None,
            freq: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MtsStats {
    pub fg: Option<f64>,
    pub bg: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub online: bool,
    pub util: Option<f64>,
    pub freq: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RailStats {
    pub cur: Option<u32>,
    pub avg: Option<u32>,
}

#[derive(Clone, Copy)]
enum Rule {
    Ram,
    Swap,
    Iram,
    Cpu,
    Mts,
    Temperature,
    EngineLoad,
    EngineOff,
    Power,
    EngineClock,
}

struct Grammar {
    rules: Vec<(Rule, Regex)>,
}

fn grammar() -> &'static Grammar {
    static GRAMMAR: OnceLock<Grammar> = OnceLock::new();
    GRAMMAR.get_or_init(Grammar::new)
}

impl Grammar {
    fn new() -> Self {
        let table = [
            (Rule::Ram, r"^RAM (\S*?)/(\S*?)MB(?: ?\(lfb (\S*?)x(\S*?)MB\))?"),
            (Rule::Swap, r"^SWAP (\S*?)/(\S*?)MB(?: ?\(cached (\S*?)MB\))?"),
            (Rule::Iram, r"^IRAM (\S*?)/(\S*?)kB(?: ?\(lfb (\S*?)kB\))?"),
            (Rule::Cpu, r"^CPU \[([^\]]*)\](?:@(\S+))?"),
            (Rule::Mts, r"^MTS fg (\S*?)% bg (\S*?)%"),
            (Rule::Temperature, r"^([A-Za-z]\w*)@(\S*?)C\b"),
            (Rule::EngineLoad, r"^([A-Za-z]\w*) (\S*?)%@(\[[^\]]*\]|\S+)"),
            (Rule::EngineOff, r"^([A-Za-z]\w*) off\b"),
            (Rule::Power, r"^([A-Za-z]\w*) ([^/\s]*)/(\S*)"),
            (Rule::EngineClock, r"^([A-Z][A-Z0-9_]*) (\d\S*)"),
        ];
        let rules = table
            .into_iter()
            .filter_map(|(rule, pattern)| Regex::new(pattern).ok().map(|re| (rule, re)))
            .collect();
        Self { rules }
    }

    fn apply(&self, input: &str, out: &mut StatsLine) -> Option<usize> {
        for (rule, re) in &self.rules {
            if let Some(caps) = re.captures(input) {
                let end = caps.get(0).map(|m| m.end()).unwrap_or(0);
                if end == 0 {
                    continue;
                }
                record(*rule, &caps, out);
                return Some(end);
            }
        }
        None
    }
}

pub fn decode(line: &str) -> StatsLine {
    let grammar = grammar();
    let mut out = StatsLine::default();
    let mut rest = line.trim_start();
    while !rest.is_empty() {
        let consumed = grammar
            .apply(rest, &mut out)
            .unwrap_or_else(|| next_word_len(rest));
        rest = rest[consumed..].trim_start();
    }
    out
}

fn next_word_len(input: &str) -> usize {
    input
        .find(char::is_whitespace)
        .unwrap_or(input.len())
        .max(1)
        .min(input.len())
}

fn record(rule: Rule, caps: &Captures<'_>, out: &mut StatsLine) {
    let text = |i: usize| caps.get(i).map(|m| m.as_str());
    match rule {
        Rule::Ram => {
            let lfb = text(3).map(|nblock| Lfb {
                nblock: num(nblock),
                size: text(4).and_then(num),
            });
            out.ram = Some(RamStats {
                used: text(1).and_then(num),
                total: text(2).and_then(num),
                lfb,
            });
        }
        Rule::Swap => {
            out.swap = Some(SwapStats {
                used: text(1).and_then(num),
                total: text(2).and_then(num),
                cached: text(3).and_then(num),
            });
        }
        Rule::Iram => {
            out.iram = Some(IramStats {
                used: text(1).and_then(num),
                total: text(2).and_then(num),
                lfb: text(3).and_then(num),
            });
        }
        Rule::Cpu => {
            let cores = text(1)
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(decode_core)
                .collect();
            out.cpu = Some(cores);
        }
        Rule::Mts => {
            out.mts = Some(MtsStats {
                fg: text(1).and_then(num),
                bg: text(2).and_then(num),
            });
        }
        Rule::Temperature => {
            if let Some(name) = text(1) {
                let value = text(2)
                    .and_then(num::<f64>)
                    .filter(|v| *v != OFFLINE_TEMPERATURE);
                out.temperatures.insert(name.to_string(), value);
            }
        }
        Rule::EngineLoad => {
            if let Some(name) = text(1) {
                out.engines.insert(
                    engine_name(name),
                    EngineStats {
                        online: true,
                        util: text(2).and_then(num),
                        freq: text(3).and_then(first_frequency),
                    },
                );
            }
        }
        Rule::EngineOff => {
            if let Some(name) = text(1) {
                out.engines.insert(
                    engine_name(name),
                    EngineStats {
                        online: false,
                        util: None,
                        freq: None,
                    },
                );
            }
        }
        Rule::Power => {
            if let Some(name) = text(1) {
                out.power.insert(
                    name.to_string(),
                    RailStats {
                        cur: text(2).and_then(milliwatts),
                        avg: text(3).and_then(milliwatts),
                    },
                );
            }
        }
        Rule::EngineClock => {
            if let Some(name) = text(1) {
                out.engines.insert(
                    engine_name(name),
                    EngineStats {
                        online: true,
                        util: None,
                        freq: text(2).and_then(num),
                    },
                );
            }
        }
    }
}

fn decode_core(token: &str) -> CoreStats {
    if token.eq_ignore_ascii_case("off") {
        return CoreStats::offline();
    }
    match token.split_once("%@") {
        Some((util, freq)) => CoreStats {
            status: CoreStatus::On,
            util: num(util),
            freq: num(freq),
        },
        None => CoreStats {
            status: CoreStatus::On,
            util: num(token.trim_end_matches('%')),
            freq: None,
        },
    }
}

/// `GR3D_FREQ` and `GR3D` name the same engine across firmware versions.
fn engine_name(raw: &str) -> String {
    raw.strip_suffix("_FREQ").unwrap_or(raw).to_string()
}

fn first_frequency(raw: &str) -> Option<u32> {
    let inner = raw.trim_start_matches('[').trim_end_matches(']');
    inner.split(',').next().and_then(num)
}

fn milliwatts(raw: &str) -> Option<u32> {
    num(raw.trim_end_matches("mW"))
}

fn num<T: FromStr>(raw: &str) -> Option<T> {
    raw.trim().parse::<T>().ok()
}
