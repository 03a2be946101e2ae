//! Long-running vendor stats process feeding the text decoder.

use crate::decoder::{self, StatsLine};
use crate::error::{Error, Result};
use std::io::ErrorKind;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct StatsStream {
    latest: watch::Receiver<Option<Arc<StatsLine>>>,
    task: JoinHandle<()>,
}

impl StatsStream {
    /// Starts `program --interval <ms>` and decodes every line it prints.
    pub fn spawn(program: &str, interval: Duration) -> Result<Self> {
        let mut child = Command::new(program)
            .arg("--interval")
            .arg(interval.as_millis().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| match err.kind() {
                ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                    Error::not_found(program, err.to_string())
                }
                _ => Error::Io(err),
            })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::not_found(program, "stdout not captured"))?;

        let (tx, latest) = watch::channel(None);
        let label = program.to_string();
        let task = tokio::spawn(async move {
            // The child lives in this task; aborting the task kills it.
            let _child = child;
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => {
                        debug!(program = %label, "stats stream ended");
                        break;
                    }
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf);
                        tx.send_replace(Some(Arc::new(decoder::decode(line.trim_end()))));
                    }
                    Err(err) => {
                        warn!(program = %label, error = %err, "stats stream read failed");
                        break;
                    }
                }
            }
            tx.send_replace(None);
        });

        Ok(Self { latest, task })
    }

    pub fn reader(&self) -> StreamReader {
        StreamReader {
            latest: self.latest.clone(),
        }
    }
}

impl Drop for StatsStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Cheap handle to the most recent decoded line.
#[derive(Clone)]
pub struct StreamReader {
    latest: watch::Receiver<Option<Arc<StatsLine>>>,
}

impl StreamReader {
    pub fn latest(&self) -> Option<Arc<StatsLine>> {
        self.latest.borrow().clone()
    }

    #[cfg(test)]
    pub(crate) fn fixed(line: StatsLine) -> Self {
        let (_tx, latest) = watch::channel(Some(Arc::new(line)));
        Self { latest }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn fake_stats(dir: &Path, body: &str) -> StatsStream {
        let script = dir.join("fakestats");
        std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).expect("write script");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        StatsStream::spawn(script.to_str().expect("utf8"), Duration::from_millis(50))
            .expect("spawn")
    }

    async fn wait_until<F>(reader: &StreamReader, mut done: F) -> Option<Arc<StatsLine>>
    where
        F: FnMut(Option<&StatsLine>) -> bool,
    {
        for _ in 0..100 {
            let line = reader.latest();
            if done(line.as_deref()) {
                return line;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("stream never reached the expected state");
    }

    fn thermal(line: Option<&StatsLine>) -> Option<f64> {
        line.and_then(|l| l.temperatures.get("thermal").copied().flatten())
    }

    #[tokio::test]
    async fn decodes_lines_from_child() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stream = fake_stats(
            dir.path(),
            "while true; do echo 'RAM 100/200MB (lfb 1x2MB) thermal@30C'; sleep 0.05; done",
        );
        let line = wait_until(&stream.reader(), |l| l.is_some()).await;
        let line = line.expect("a line was decoded");
        assert_eq!(line.temperatures["thermal"], Some(30.0));
    }

    #[tokio::test]
    async fn invalid_bytes_do_not_stop_the_stream() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stream = fake_stats(
            dir.path(),
            "echo 'thermal@30C'\n\
             printf 'junk\\377\\n'\n\
             t=31; while true; do echo \"thermal@${t}C\"; t=$((t + 1)); sleep 0.05; done",
        );
        let reader = stream.reader();
        wait_until(&reader, |l| thermal(l).is_some_and(|t| t > 31.0)).await;
    }

    #[tokio::test]
    async fn ended_stream_clears_the_last_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stream = fake_stats(dir.path(), "echo 'thermal@30C'; sleep 0.3");
        let reader = stream.reader();
        wait_until(&reader, |l| thermal(l) == Some(30.0)).await;
        wait_until(&reader, |l| l.is_none()).await;
    }

    #[tokio::test]
    async fn missing_program_is_not_found() {
        let err = StatsStream::spawn("/nonexistent/tegrastats", Duration::from_secs(1))
            .err()
            .expect("spawn fails");
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn fixed_reader_keeps_value() {
        let reader = StreamReader::fixed(StatsLine::default());
        assert!(reader.latest().is_some());
    }
}
