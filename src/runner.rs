//! Bounded execution of external programs.

use crate::error::{Error, Result};
use std::ffi::OsStr;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time;
use tracing::debug;

/// The child is killed if it outlives `timeout`. A nonzero exit with no
/// output is an [`Error::Timeout`] carrying the exit code; with output,
/// the lines are returned for the caller to inspect.
pub async fn run<S: AsRef<OsStr>>(argv: &[S], timeout: Duration) -> Result<Vec<String>> {
    let Some((program, args)) = argv.split_first() else {
        return Err(Error::Invalid("empty command line".to_string()));
    };
    let label = program.as_ref().to_string_lossy().to_string();

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| match err.kind() {
            ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                Error::not_found(label.clone(), err.to_string())
            }
            _ => Error::Io(err),
        })?;

    // Dropping the pending future drops the child, and kill_on_drop reaps it.
    let output = match time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result?,
        Err(_elapsed) => {
            debug!(program = %label, ?timeout, "command timed out, child killed");
            return Err(Error::timeout(label, timeout));
        }
    };

    let text = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<String> = text.lines().map(str::to_string).collect();

    if !output.status.success() && lines.iter().all(|l| l.trim().is_empty()) {
        return Err(Error::Timeout {
            what: label,
            timeout,
            returncode: output.status.code(),
        });
    }

    Ok(lines)
}

/// Resolves `program` the way a shell would: paths are taken as is,
/// bare names are searched in `PATH`.
pub fn find_program(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let path = Path::new(program);
        return path.is_file().then(|| path.to_path_buf());
    }
    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}
