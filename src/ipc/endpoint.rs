use crate::error::{Error, Result};
use nix::unistd::{chown, Group};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

const SOCKET_MODE: u32 = 0o660;

#[derive(Debug)]
pub struct Endpoint {
    path: PathBuf,
    listener: UnixListener,
}

impl Endpoint {
    /// An existing file is treated as a live or crashed daemon and refused
    /// unless `force` is set.
    pub fn bind(path: &Path, group: Option<&str>, force: bool) -> Result<Self> {
        let gid = match group {
            Some(name) => Some(
                Group::from_name(name)
                    .map_err(io::Error::from)?
                    .ok_or_else(|| Error::not_found("group", name))?
                    .gid,
            ),
            None => None,
        };

        if fs::symlink_metadata(path).is_ok() {
            if !force {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!(
                        "{} already exists, another daemon may be running (use --force)",
                        path.display()
                    ),
                )));
            }
            warn!(path = %path.display(), "removing stale socket");
            fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(path)?;
        let endpoint = Self {
            path: path.to_path_buf(),
            listener,
        };
        fs::set_permissions(path, fs::Permissions::from_mode(SOCKET_MODE))?;
        if let Some(gid) = gid {
            chown(path, None, Some(gid)).map_err(io::Error::from)?;
        }
        info!(path = %path.display(), group = group.unwrap_or("-"), "socket bound");
        Ok(endpoint)
    }

    pub async fn accept(&self) -> io::Result<UnixStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(stream)
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "socket removed"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %self.path.display(), error = %err, "socket not removed"),
        }
    }
}
