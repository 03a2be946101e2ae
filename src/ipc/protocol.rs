//! Newline-delimited JSON frames exchanged over the daemon socket.

use crate::board::BoardIdentity;
use crate::error::{Error, Result};
use crate::snapshot::{PowerMode, Snapshot};
use crate::sources::fan::{FanCommand, FanInfo};
use crate::sources::gpu::GpuCommand;
use crate::sources::jetson_clocks::JcCommand;
use crate::sources::memory::{MemoryLayout, SwapCommand};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tokio::io::{AsyncWrite, AsyncWriteExt};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Request id the client proxy uses for its interval keepalive.
pub const KEEPALIVE_ID: u64 = 0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Swap(SwapCommand),
    Gpu(GpuCommand),
    Fan(FanCommand),
    Jc(JcCommand),
    Nvp {
        id: u32,
        #[serde(default)]
        force: bool,
    },
    /// Requested polling period in milliseconds.
    Interval(u64),
    ClearCache,
    Config(ConfigAction),
    Metrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigAction {
    Reset,
}

impl Command {
    pub fn target(&self) -> &'static str {
        match self {
            Self::Swap(_) => "swap",
            Self::Gpu(_) => "gpu",
            Self::Fan(_) => "fan",
            Self::Jc(_) => "jc",
            Self::Nvp { .. } => "nvp",
            Self::Interval(_) => "interval",
            Self::ClearCache => "clear_cache",
            Self::Config(_) => "config",
            Self::Metrics => "metrics",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientFrame {
    Hello { secret: String, version: String },
    Request { id: u64, command: Command },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerFrame {
    Init(Handshake),
    Tick(Snapshot),
    Reply(Reply),
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub id: u64,
    pub ok: bool,
    pub error: Option<String>,
    pub body: Option<String>,
}

impl Reply {
    pub fn ok(id: u64, body: Option<String>) -> Self {
        Self {
            id,
            ok: true,
            error: None,
            body,
        }
    }

    pub fn failed(id: u64, err: &Error) -> Self {
        Self {
            id,
            ok: false,
            error: Some(err.to_string()),
            body: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    pub version: String,
    pub board: BoardIdentity,
    pub interval_ms: u64,
    pub memory: MemoryLayout,
    pub fan: BTreeMap<String, FanInfo>,
    pub jetson_clocks: bool,
    pub power_modes: Option<PowerModes>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerModes {
    pub models: Vec<String>,
    pub default: Option<PowerMode>,
}

#[derive(Serialize)]
struct TickRef<'a> {
    tick: &'a Snapshot,
}

/// Shared secret both ends derive from the build.
pub fn secret() -> String {
    let salt = option_env!("JETSOND_SECRET").unwrap_or(VERSION);
    let mut hasher = Sha256::new();
    hasher.update(env!("CARGO_PKG_NAME").as_bytes());
    hasher.update(salt.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn encode<T: Serialize>(frame: &T) -> Result<String> {
    let mut line = serde_json::to_string(frame).map_err(|err| Error::Protocol(err.to_string()))?;
    line.push('\n');
    Ok(line)
}

/// Encodes a tick frame without cloning the snapshot.
pub fn encode_tick(snapshot: &Snapshot) -> Result<String> {
    encode(&TickRef { tick: snapshot })
}

pub fn decode<T: DeserializeOwned>(line: &str) -> Result<T> {
    serde_json::from_str(line.trim()).map_err(|err| Error::Protocol(err.to_string()))
}

/// Id of a request frame whose command could not be decoded.
pub fn request_id(line: &str) -> Option<u64> {
    let value: serde_json::Value = serde_json::from_str(line.trim()).ok()?;
    value.pointer("/request/id")?.as_u64()
}

pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    writer.write_all(encode(frame)?.as_bytes()).await?;
    Ok(())
}
