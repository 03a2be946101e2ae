//! Local socket between the daemon and its clients.

pub mod client;
pub mod endpoint;
pub mod protocol;
pub mod server;

pub use client::Client;
pub use endpoint::Endpoint;
pub use protocol::{Command, ConfigAction, Handshake, Reply};
pub use server::Daemon;
