use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

enum StoreCommand {
    Write(Vec<u8>),
    Remove,
}

/// File-backed store for the serialized token cache.
///
/// All disk traffic goes through a single writer task fed by a channel, so
/// the on-disk order always matches the mutation order and in-memory readers
/// never wait on IO. Write failures are logged and swallowed: the in-memory
/// cache stays authoritative for the session and the file is only advisory,
/// read back at the next start.
#[derive(Debug)]
pub struct TokenStore {
    path: PathBuf,
    tx: Mutex<Option<mpsc::UnboundedSender<StoreCommand>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl TokenStore {
    pub fn spawn(runtime: &Handle, path: PathBuf) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = runtime.spawn(run_writer(path.clone(), rx));
        Self {
            path,
            tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the persisted blob, if any. Only called while constructing the
    /// coordinator, before the writer has anything queued.
    pub async fn load(&self) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context(format!("reading {}", self.path.display())),
        }
    }

    /// Queues a full-cache snapshot. Never blocks and never fails the caller.
    pub fn persist(&self, snapshot: Vec<u8>) {
        self.send(StoreCommand::Write(snapshot));
    }

    /// Queues deletion of the on-disk store.
    pub fn remove(&self) {
        self.send(StoreCommand::Remove);
    }

    fn send(&self, cmd: StoreCommand) {
        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(tx) => {
                if tx.send(cmd).is_err() {
                    tracing::warn!("Token store writer is gone; dropping persistence request");
                }
            }
            None => {
                tracing::warn!("Token store is closed; dropping persistence request");
            }
        }
    }

    /// Drops the queue and waits for the writer to drain what was already
    /// enqueued. Idempotent.
    pub async fn close(&self) {
        let tx = {
            let mut guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
            guard.take()
        };
        drop(tx);
        let writer = {
            let mut guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
            guard.take()
        };
        if let Some(handle) = writer {
            if let Err(err) = handle.await {
                tracing::warn!("Token store writer ended abnormally: {err}");
            }
        }
    }
}

async fn run_writer(path: PathBuf, mut rx: mpsc::UnboundedReceiver<StoreCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            StoreCommand::Write(bytes) => {
                if let Err(err) = write_snapshot(&path, &bytes).await {
                    tracing::warn!(
                        "Failed to persist token cache to {}: {:#}",
                        path.display(),
                        err
                    );
                }
            }
            StoreCommand::Remove => match tokio::fs::remove_file(&path).await {
                Ok(()) => tracing::debug!("Deleted token store at {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!("Failed to delete token store {}: {}", path.display(), e)
                }
            },
        }
    }
    tracing::debug!("Token store writer for {} stopped", path.display());
}

async fn write_snapshot(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("creating the store directory")?;
    }
    // Write-then-rename so a crash mid-write cannot leave a torn cache file.
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes)
        .await
        .context("writing the snapshot")?;
    tokio::fs::rename(&tmp, path)
        .await
        .context("committing the snapshot")?;
    Ok(())
}
