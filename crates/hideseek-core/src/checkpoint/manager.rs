// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Checkpoint manager: save, index, prune and restore.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use super::CheckpointError;
use super::index::{
    CheckpointMetadata, CheckpointRecord, INDEX_FILE, METADATA_FILE, PersistedIndex, STATE_FILE,
    checkpoint_dir_name, parse_dir_name, reconcile, scan,
};
use crate::Metrics;

/// Configuration for checkpointing
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// Root directory holding checkpoint directories and the index
    pub root: PathBuf,
    /// Checkpoints to retain after each save (0 = keep all)
    pub keep_last_n: usize,
    /// Save every N iterations (0 = never on cadence)
    pub checkpoint_freq: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./checkpoints"),
            keep_last_n: 5,
            checkpoint_freq: 50,
        }
    }
}

impl CheckpointConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    pub fn with_keep_last_n(mut self, n: usize) -> Self {
        self.keep_last_n = n;
        self
    }

    pub fn with_checkpoint_freq(mut self, freq: u64) -> Self {
        self.checkpoint_freq = freq;
        self
    }

    /// Whether `iteration` falls on the save cadence.
    pub fn should_save(&self, iteration: u64) -> bool {
        self.checkpoint_freq > 0 && iteration > 0 && iteration % self.checkpoint_freq == 0
    }
}

/// Owner of the checkpoint root and its index.
///
/// The process holding a manager is the only writer of its root.
pub struct CheckpointManager {
    config: CheckpointConfig,
    records: Vec<CheckpointRecord>,
}

impl CheckpointManager {
    /// Create the root if needed and load the index.
    pub fn open(config: CheckpointConfig) -> Result<Self, CheckpointError> {
        fs::create_dir_all(&config.root).map_err(|e| CheckpointError::io(&config.root, e))?;
        let mut manager = Self {
            config,
            records: Vec::new(),
        };
        manager.load_index()?;
        Ok(manager)
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Rebuild the in-memory index from the persisted index and a disk scan.
    ///
    /// An unreadable index file is treated as absent. The index file is
    /// rewritten when the reconciled view differs from it.
    #[instrument(skip(self), fields(root = %self.config.root.display()))]
    pub fn load_index(&mut self) -> Result<(), CheckpointError> {
        let persisted = self.read_persisted_index()?;
        let disk = scan(&self.config.root)?;
        let records = reconcile(&disk, persisted.as_ref());

        let in_sync = persisted
            .as_ref()
            .is_some_and(|index| index.matches(&records));
        self.records = records;
        if !in_sync {
            self.write_index()?;
        }

        info!(
            checkpoints = self.records.len(),
            latest = ?self.latest().map(|record| record.iteration),
            rebuilt = !in_sync,
            "Checkpoint index loaded"
        );
        Ok(())
    }

    fn read_persisted_index(&self) -> Result<Option<PersistedIndex>, CheckpointError> {
        let path = self.config.root.join(INDEX_FILE);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CheckpointError::io(path, e)),
        };
        match serde_json::from_slice(&bytes) {
            Ok(index) => Ok(Some(index)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Checkpoint index is corrupt, rebuilding from disk");
                Ok(None)
            }
        }
    }

    fn write_index(&self) -> Result<(), CheckpointError> {
        let path = self.config.root.join(INDEX_FILE);
        let index = PersistedIndex::from_records(&self.records);
        let bytes = serde_json::to_vec_pretty(&index).map_err(|e| CheckpointError::json(&path, e))?;
        atomic_write(&path, &bytes)
    }

    /// Persist `state` as the checkpoint for `iteration` and return its path.
    ///
    /// Writes the state blob, then metadata, then the index, then applies the
    /// retention policy. A failure at any point leaves the directory out of
    /// the index. Saving an iteration that already exists replaces it.
    #[instrument(skip(self, state, metrics), fields(bytes = state.len()))]
    pub fn save(
        &mut self,
        state: &[u8],
        iteration: u64,
        metrics: &Metrics,
    ) -> Result<PathBuf, CheckpointError> {
        if iteration == 0 {
            return Err(CheckpointError::InvalidIteration(iteration));
        }

        let dir = self.config.root.join(checkpoint_dir_name(iteration));
        fs::create_dir_all(&dir).map_err(|e| CheckpointError::io(&dir, e))?;

        atomic_write(&dir.join(STATE_FILE), state)?;

        let metadata = CheckpointMetadata::new(iteration, Utc::now(), metrics);
        let metadata_path = dir.join(METADATA_FILE);
        let bytes = serde_json::to_vec_pretty(&metadata)
            .map_err(|e| CheckpointError::json(&metadata_path, e))?;
        atomic_write(&metadata_path, &bytes)?;

        let record = CheckpointRecord {
            iteration,
            path: dir.clone(),
            timestamp: metadata.timestamp,
            metrics: metadata.metrics,
        };
        let previous = std::mem::take(&mut self.records);
        let mut records: Vec<_> = previous
            .iter()
            .filter(|existing| existing.iteration != iteration)
            .cloned()
            .collect();
        records.push(record);
        records.sort_by_key(|record| record.iteration);
        self.records = records;

        if let Err(e) = self.write_index() {
            self.records = previous;
            return Err(e);
        }
        info!(iteration, path = %dir.display(), "Checkpoint saved");

        self.prune_keeping(self.config.keep_last_n, Some(iteration))?;
        Ok(dir)
    }

    /// Keep only the newest `keep_last_n` checkpoints (0 keeps all).
    ///
    /// The index is rewritten before directories are removed, so an
    /// interrupted prune leaves unindexed orphans rather than dangling
    /// records. Returns the records that were pruned.
    pub fn prune(&mut self, keep_last_n: usize) -> Result<Vec<CheckpointRecord>, CheckpointError> {
        self.prune_keeping(keep_last_n, None)
    }

    /// Drop the oldest records beyond `keep_last_n`, never touching
    /// `protect`. After resuming from an earlier checkpoint, a save below the
    /// highest indexed iteration can evict the higher ones.
    fn prune_keeping(
        &mut self,
        keep_last_n: usize,
        protect: Option<u64>,
    ) -> Result<Vec<CheckpointRecord>, CheckpointError> {
        if keep_last_n == 0 || self.records.len() <= keep_last_n {
            return Ok(Vec::new());
        }

        let mut excess = self.records.len() - keep_last_n;
        let mut removed = Vec::with_capacity(excess);
        let mut kept = Vec::with_capacity(keep_last_n);
        for record in std::mem::take(&mut self.records) {
            if excess > 0 && Some(record.iteration) != protect {
                excess -= 1;
                removed.push(record);
            } else {
                kept.push(record);
            }
        }
        self.records = kept;
        if let Some(iteration) = protect
            && removed.iter().any(|record| record.iteration > iteration)
        {
            warn!(
                iteration,
                "Saved below the latest checkpoint, evicting newer checkpoints to honour retention"
            );
        }
        self.write_index()?;

        for record in &removed {
            match fs::remove_dir_all(&record.path) {
                Ok(()) => debug!(iteration = record.iteration, "Pruned checkpoint"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(CheckpointError::io(&record.path, e)),
            }
        }

        info!(
            pruned = removed.len(),
            kept = self.records.len(),
            "Pruned old checkpoints"
        );
        Ok(removed)
    }

    pub fn latest(&self) -> Option<&CheckpointRecord> {
        self.records.last()
    }

    pub fn by_iteration(&self, iteration: u64) -> Option<&CheckpointRecord> {
        self.records
            .binary_search_by_key(&iteration, |record| record.iteration)
            .ok()
            .map(|i| &self.records[i])
    }

    /// All indexed checkpoints, oldest first.
    pub fn list(&self) -> &[CheckpointRecord] {
        &self.records
    }

    /// Iteration training should continue at after restoring `path`.
    ///
    /// Accepts a checkpoint directory or a file inside one.
    pub fn resume_iteration_for(path: &Path) -> Result<u64, CheckpointError> {
        let iteration = checkpoint_dir_of(path)
            .and_then(|dir| dir.file_name())
            .and_then(|name| name.to_str())
            .and_then(parse_dir_name)
            .ok_or_else(|| CheckpointError::NotACheckpoint(path.to_path_buf()))?;
        Ok(iteration + 1)
    }

    /// Read the state blob and metadata of the checkpoint at `path`.
    ///
    /// A directory without metadata never finished saving and is rejected.
    pub fn load_state(path: &Path) -> Result<(Vec<u8>, CheckpointMetadata), CheckpointError> {
        let dir = checkpoint_dir_of(path)
            .ok_or_else(|| CheckpointError::NotACheckpoint(path.to_path_buf()))?;

        let metadata_path = dir.join(METADATA_FILE);
        let bytes = match fs::read(&metadata_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CheckpointError::MissingMetadata(dir.to_path_buf()));
            }
            Err(e) => return Err(CheckpointError::io(metadata_path, e)),
        };
        let metadata: CheckpointMetadata =
            serde_json::from_slice(&bytes).map_err(|e| CheckpointError::json(&metadata_path, e))?;

        let state_path = dir.join(STATE_FILE);
        let state = fs::read(&state_path).map_err(|e| CheckpointError::io(state_path, e))?;
        Ok((state, metadata))
    }
}

/// The checkpoint directory `path` names, or contains when `path` is a file.
fn checkpoint_dir_of(path: &Path) -> Option<&Path> {
    let named = path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| parse_dir_name(name).is_some());
    if named {
        Some(path)
    } else {
        path.parent()
            .filter(|parent| parent.file_name().and_then(|n| n.to_str()).and_then(parse_dir_name).is_some())
    }
}

/// Write `data` to `path` via a synced temp file and a rename.
///
/// The temp file lives next to the target so the rename stays on one
/// filesystem.
fn atomic_write(path: &Path, data: &[u8]) -> Result<(), CheckpointError> {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(".{}.tmp.{}", name, std::process::id()));

    let mut file = File::create(&temp_path).map_err(|e| CheckpointError::io(&temp_path, e))?;
    file.write_all(data)
        .and_then(|()| file.sync_all())
        .map_err(|e| CheckpointError::io(&temp_path, e))?;
    drop(file);

    fs::rename(&temp_path, path).map_err(|e| CheckpointError::io(path, e))?;

    if let Some(parent) = path.parent()
        && let Ok(dir) = File::open(parent)
    {
        let _ = dir.sync_all();
    }
    Ok(())
}
