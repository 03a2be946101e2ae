use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{what} not found: {detail}")]
    NotFound { what: String, detail: String },
    /// A bounded external operation did not complete, or exited with no
    /// output and a failure code.
    #[error("{}", timeout_message(.what, .timeout, .returncode))]
    Timeout {
        what: String,
        timeout: Duration,
        returncode: Option<i32>,
    },
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Command aimed at a non-reentrant operation already in flight.
    #[error("operation in progress: {0}")]
    State(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    /// The only class allowed to end the daemon.
    #[error("polling loop failed: {0}")]
    Fatal(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn not_found(what: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::NotFound {
            what: what.into(),
            detail: detail.into(),
        }
    }

    pub fn timeout(what: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            timeout,
            returncode: None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::Timeout { .. } => "timeout",
            Self::Protocol(_) => "protocol",
            Self::State(_) => "state",
            Self::Invalid(_) => "invalid",
            Self::Fatal(_) => "fatal",
            Self::Io(_) => "io",
        }
    }
}

fn timeout_message(what: &str, timeout: &Duration, returncode: &Option<i32>) -> String {
    match returncode {
        Some(code) => format!("{what} exited with status {code} and no output"),
        None => format!("{what} did not answer within {timeout:?}"),
    }
}
