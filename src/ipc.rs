//! Unix-socket listener for editor clients.
//!
//! The socket file is replaced on startup (a previous daemon may have died
//! without cleanup) and removed again when the listener drops.

use std::path::{Path, PathBuf};

use anyhow::Result;
use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

pub struct IpcListener {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcListener {
    pub fn bind(path: &Path) -> Result<Self> {
        if path.exists() {
            debug!(path = %path.display(), "replacing stale socket");
            std::fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let listener = UnixListener::bind(path)?;
        Ok(IpcListener {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub async fn accept(&self) -> Result<UnixStream> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(stream)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for IpcListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Client-side connect, used by tests and tooling.
pub async fn connect(path: &Path) -> Result<UnixStream> {
    Ok(UnixStream::connect(path).await?)
}
