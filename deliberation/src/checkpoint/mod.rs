//! Durable session checkpoints.
//!
//! The [`CheckpointManager`] serializes the whole [`SessionState`] at every
//! transition boundary into a versioned envelope and writes it to a
//! [`CheckpointStore`]. Restores validate the envelope before the engine
//! continues from it.
//!
//! [`SessionState`]: crate::state::SessionState

pub mod manager;
pub mod store;

use thiserror::Error;

pub use manager::{validate_checkpoint, CheckpointManager, IntegrityStatus, SessionCheckpoint};
pub use store::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, SharedCheckpointStore};

/// Errors from checkpoint operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckpointError {
    #[error("serialize failed: {0}")]
    Serialize(String),

    #[error("deserialize failed: {0}")]
    Deserialize(String),

    #[error("version mismatch: expected <= {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("no checkpoint for session {0}")]
    NotFound(String),

    #[error("invalid session key '{0}'")]
    InvalidKey(String),

    #[error("store unavailable: {0}")]
    Store(String),
}
