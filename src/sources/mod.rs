pub mod cpu;
pub mod engines;
pub mod fan;
pub mod gpu;
pub mod jetson_clocks;
pub mod memory;
pub mod nvpmodel;
pub mod power;
pub mod stream;
pub mod system;
pub mod temperature;

use crate::error::{Error, Result};
use std::fmt::Display;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::time;
use tracing::info;

pub trait Source: Send {
    type Fragment;

    fn name(&self) -> &'static str;

    fn available(&self) -> bool;

    /// Reads the subsystem once. Missing files degrade to absent values;
    /// this never fails.
    fn get_status(&mut self) -> Self::Fragment;

    /// Drops delta and average accumulators.
    fn reset(&mut self) {}
}

pub type Backend<F> = Box<dyn Source<Fragment = F>>;

pub fn select<F>(subsystem: &str, candidates: Vec<Backend<F>>) -> Option<Backend<F>> {
    let chosen = candidates.into_iter().find(|backend| backend.available());
    match &chosen {
        Some(backend) => info!(subsystem, backend = backend.name(), "backend selected"),
        None => info!(subsystem, "no backend available"),
    }
    chosen
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
        }
    }

    /// Polls `done` up to `max_attempts` times, sleeping `interval` between
    /// checks. Returns [`Error::Timeout`] if it never became true.
    pub async fn wait_for<F: FnMut() -> bool>(&self, what: &str, mut done: F) -> Result<()> {
        for attempt in 1..=self.max_attempts {
            if done() {
                return Ok(());
            }
            if attempt < self.max_attempts {
                time::sleep(self.interval).await;
            }
        }
        Err(Error::timeout(what, self.interval * self.max_attempts))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlState<T> {
    pub in_flight: bool,
    pub value: Option<T>,
    pub last_error: Option<String>,
}

impl<T> Default for ControlState<T> {
    fn default() -> Self {
        Self {
            in_flight: false,
            value: None,
            last_error: None,
        }
    }
}

impl<T> ControlState<T> {
    pub fn begin(&mut self, what: &str) -> Result<()> {
        if self.in_flight {
            return Err(Error::State(format!("{what} change already in progress")));
        }
        self.in_flight = true;
        Ok(())
    }

    pub fn finish(&mut self, outcome: std::result::Result<T, &Error>) {
        self.in_flight = false;
        match outcome {
            Ok(value) => {
                self.value = Some(value);
                self.last_error = None;
            }
            Err(err) => self.last_error = Some(err.to_string()),
        }
    }
}

pub(crate) fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

pub(crate) fn read_value<T: FromStr>(path: &Path) -> Option<T> {
    read_trimmed(path)?.parse().ok()
}

pub(crate) fn read_flag(path: &Path) -> Option<bool> {
    read_value::<u8>(path).map(|v| v != 0)
}

pub(crate) fn write_value(path: &Path, value: impl Display) -> Result<()> {
    fs::write(path, value.to_string()).map_err(|err| match err.kind() {
        ErrorKind::NotFound => Error::not_found(path.display().to_string(), err.to_string()),
        _ => Error::Io(err),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct Fixed(bool);

    impl Source for Fixed {
        type Fragment = u32;

        fn name(&self) -> &'static str {
            if self.0 {
                "present"
            } else {
                "absent"
            }
        }

        fn available(&self) -> bool {
            self.0
        }

        fn get_status(&mut self) -> u32 {
            7
        }
    }

    #[test]
    fn select_picks_first_available() {
        let chosen = select::<u32>("test", vec![Box::new(Fixed(false)), Box::new(Fixed(true))])
            .expect("one backend available");
        assert_eq!(chosen.name(), "present");
        assert!(select::<u32>("test", vec![Box::new(Fixed(false))]).is_none());
    }

    #[tokio::test]
    async fn wait_for_is_bounded() {
        let policy = RetryPolicy::new(3, Duration::from_millis(5));
        let calls = Cell::new(0);
        let err = policy
            .wait_for("never", || {
                calls.set(calls.get() + 1);
                false
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(calls.get(), 3);

        let calls = Cell::new(0);
        policy
            .wait_for("second", || {
                calls.set(calls.get() + 1);
                calls.get() == 2
            })
            .await
            .expect("settles");
    }

    #[test]
    fn control_state_is_not_reentrant() {
        let mut state = ControlState::<u32>::default();
        state.begin("mode").expect("first begin");
        assert!(matches!(state.begin("mode"), Err(Error::State(_))));
        state.finish(Ok(3));
        assert_eq!(state.value, Some(3));
        assert!(!state.in_flight);

        state.begin("mode").expect("begin again");
        state.finish(Err(&Error::Invalid("boom".to_string())));
        assert_eq!(state.value, Some(3));
        assert!(state.last_error.is_some());
    }
}
