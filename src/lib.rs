//! Hardware telemetry daemon for Jetson boards.

pub mod board;
pub mod builder;
pub mod config;
pub mod decoder;
pub mod error;
pub mod ipc;
pub mod metrics;
pub mod runner;
pub mod snapshot;
pub mod sources;
pub mod timer;

pub use error::{Error, Result};
