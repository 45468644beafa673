// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Versioned training checkpoints.
//!
//! # Layout
//!
//! ```text
//! <root>/
//! ├── checkpoint_index.json        {checkpoints: [{iteration, path, timestamp}], last_updated}
//! ├── checkpoint_000050/
//! │   ├── trainer_state.bin        opaque driver state
//! │   └── metadata.json            {iteration, timestamp, ...metrics}
//! └── checkpoint_000100/
//!     └── ...
//! ```
//!
//! A checkpoint moves through `state written -> metadata written -> indexed`.
//! Every file is replaced atomically, so a crash leaves either the previous
//! version or a directory without metadata, which all read paths skip. Such
//! orphans are never deleted automatically.

mod index;
mod manager;

use std::path::PathBuf;

use thiserror::Error;

pub use index::{
    CheckpointMetadata, CheckpointRecord, DiskEntry, INDEX_FILE, IndexEntry, METADATA_FILE,
    PersistedIndex, STATE_FILE, checkpoint_dir_name, parse_dir_name, reconcile, scan,
};
pub use manager::{CheckpointConfig, CheckpointManager};

/// Checkpoint I/O and format errors
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("checkpoint iteration must be at least 1, got {0}")]
    InvalidIteration(u64),

    #[error("not a checkpoint path: {}", .0.display())]
    NotACheckpoint(PathBuf),

    #[error("checkpoint has no metadata: {}", .0.display())]
    MissingMetadata(PathBuf),
}

impl CheckpointError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }
}
