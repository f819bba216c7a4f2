//! Per-script workspaces on local disk
//!
//! Each script gets its own directory under the workspace root. Writes to one
//! workspace are serialised by a lock owned by that workspace only, so scripts
//! never contend with each other.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::ticket::ScriptTicket;

/// Hands out workspaces and owns their per-script locks.
#[derive(Debug)]
pub struct ScriptWorkspaceFactory {
    root: PathBuf,
    locks: DashMap<ScriptTicket, Arc<Mutex<()>>>,
}

impl ScriptWorkspaceFactory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: DashMap::new(),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Workspace for `ticket`. The directory is created lazily on first write.
    #[must_use]
    pub fn workspace(&self, ticket: &ScriptTicket) -> ScriptWorkspace {
        let lock = self
            .locks
            .entry(ticket.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        ScriptWorkspace {
            dir: self.root.join(ticket.pod_name()),
            lock,
        }
    }

    /// Remove the workspace directory and forget its lock.
    pub async fn delete(&self, ticket: &ScriptTicket) -> Result<()> {
        let workspace = self.workspace(ticket);
        workspace.delete().await?;
        self.locks.remove(ticket);
        Ok(())
    }

    /// Number of workspaces currently holding a lock entry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// One script's private directory.
#[derive(Debug, Clone)]
pub struct ScriptWorkspace {
    dir: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl ScriptWorkspace {
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `contents` to `name`, replacing any previous file.
    pub async fn write_file(&self, name: &str, contents: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.write_locked(name, contents).await
    }

    /// Contents of `name`, or `None` when the file does not exist.
    pub async fn try_read_file(&self, name: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().await;
        self.read_locked(name).await
    }

    /// Read `name` and write back whatever `update` returns, holding the lock
    /// across both. `update` returning `None` leaves the file untouched.
    /// Returns whether the file was written.
    pub async fn update_file<F>(&self, name: &str, update: F) -> Result<bool>
    where
        F: FnOnce(Option<&str>) -> Option<String>,
    {
        let _guard = self.lock.lock().await;
        let current = self.read_locked(name).await?;
        match update(current.as_deref()) {
            Some(contents) => {
                self.write_locked(name, &contents).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn write_locked(&self, name: &str, contents: &str) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;

        // Readers only ever see a complete file.
        let target = self.dir.join(name);
        let staging = self.dir.join(format!(".{name}.tmp"));
        fs::write(&staging, contents).await?;
        fs::rename(&staging, &target).await?;
        Ok(())
    }

    async fn read_locked(&self, name: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.dir.join(name)).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete_file(&self, name: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        match fs::remove_file(self.dir.join(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => {
                debug!(dir = %self.dir.display(), "Deleted script workspace");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
