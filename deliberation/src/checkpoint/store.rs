//! Key-value checkpoint stores.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::CheckpointError;

/// Durable key-value store for serialized session state. Expiry is the
/// owner's concern.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn put(&self, session_id: &str, serialized: String) -> Result<(), CheckpointError>;

    async fn get(&self, session_id: &str) -> Result<Option<String>, CheckpointError>;

    async fn list(&self) -> Result<Vec<String>, CheckpointError>;
}

pub type SharedCheckpointStore = Arc<dyn CheckpointStore>;

/// In-process store, for tests and single-run CLI use.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn put(&self, session_id: &str, serialized: String) -> Result<(), CheckpointError> {
        self.entries
            .write()
            .await
            .insert(session_id.to_string(), serialized);
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<String>, CheckpointError> {
        Ok(self.entries.read().await.get(session_id).cloned())
    }

    async fn list(&self) -> Result<Vec<String>, CheckpointError> {
        let mut ids: Vec<String> = self.entries.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// One JSON file per session under a directory.
///
/// Writes go to a temp file that is then renamed over the target, so a
/// reader sees either the previous checkpoint or the new one.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, session_id: &str) -> Result<PathBuf, CheckpointError> {
        let valid = !session_id.is_empty()
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(CheckpointError::InvalidKey(session_id.to_string()));
        }
        Ok(self.dir.join(format!("{session_id}.json")))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn put(&self, session_id: &str, serialized: String) -> Result<(), CheckpointError> {
        let path = self.path_for(session_id)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| CheckpointError::Store(format!("{}: {e}", self.dir.display())))?;
        tokio::fs::write(&tmp, serialized.as_bytes())
            .await
            .map_err(|e| CheckpointError::Store(format!("{}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| CheckpointError::Store(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), bytes = serialized.len(), "Checkpoint written");
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<String>, CheckpointError> {
        let path = self.path_for(session_id)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CheckpointError::Store(format!("{}: {e}", path.display()))),
        }
    }

    async fn list(&self) -> Result<Vec<String>, CheckpointError> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(CheckpointError::Store(e.to_string())),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CheckpointError::Store(e.to_string()))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}
