// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Checkpoint records, naming and index reconciliation.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::CheckpointError;
use crate::Metrics;

/// Opaque trainer state inside a checkpoint directory.
pub const STATE_FILE: &str = "trainer_state.bin";
/// Metadata record inside a checkpoint directory.
pub const METADATA_FILE: &str = "metadata.json";
/// Persisted index at the checkpoint root.
pub const INDEX_FILE: &str = "checkpoint_index.json";

const DIR_PREFIX: &str = "checkpoint_";

/// Directory name for `iteration`, zero-padded to six digits.
pub fn checkpoint_dir_name(iteration: u64) -> String {
    format!("{DIR_PREFIX}{iteration:06}")
}

/// Iteration encoded in a checkpoint directory name.
///
/// Returns `None` for anything that is not `checkpoint_<digits>` with a
/// positive iteration.
pub fn parse_dir_name(name: &str) -> Option<u64> {
    let digits = name.strip_prefix(DIR_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().filter(|&iteration| iteration >= 1)
}

/// Contents of `metadata.json`.
///
/// Metric keys are flattened next to `iteration` and `timestamp`; metrics
/// that collide with those two names are dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub iteration: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub metrics: Metrics,
}

impl CheckpointMetadata {
    pub fn new(iteration: u64, timestamp: DateTime<Utc>, metrics: &Metrics) -> Self {
        let metrics = metrics
            .iter()
            .filter(|(key, _)| !matches!(key.as_str(), "iteration" | "timestamp"))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Self {
            iteration,
            timestamp,
            metrics,
        }
    }
}

/// One indexed checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointRecord {
    pub iteration: u64,
    pub path: PathBuf,
    pub timestamp: DateTime<Utc>,
    pub metrics: Metrics,
}

impl CheckpointRecord {
    fn from_metadata(path: &Path, metadata: &CheckpointMetadata) -> Self {
        Self {
            iteration: metadata.iteration,
            path: path.to_path_buf(),
            timestamp: metadata.timestamp,
            metrics: metadata.metrics.clone(),
        }
    }

    pub fn index_entry(&self) -> IndexEntry {
        IndexEntry {
            iteration: self.iteration,
            path: self.path.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// One entry of `checkpoint_index.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub iteration: u64,
    pub path: PathBuf,
    pub timestamp: DateTime<Utc>,
}

/// Contents of `checkpoint_index.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedIndex {
    pub checkpoints: Vec<IndexEntry>,
    pub last_updated: DateTime<Utc>,
}

impl PersistedIndex {
    pub fn from_records(records: &[CheckpointRecord]) -> Self {
        Self {
            checkpoints: records.iter().map(CheckpointRecord::index_entry).collect(),
            last_updated: Utc::now(),
        }
    }

    /// Whether this index lists exactly `records`, ignoring `last_updated`.
    pub fn matches(&self, records: &[CheckpointRecord]) -> bool {
        self.checkpoints.len() == records.len()
            && self
                .checkpoints
                .iter()
                .zip(records)
                .all(|(entry, record)| *entry == record.index_entry())
    }
}

/// A checkpoint-named directory found under the root.
#[derive(Debug, Clone, PartialEq)]
pub struct DiskEntry {
    pub iteration: u64,
    pub path: PathBuf,
    /// `None` when metadata is absent, unreadable or disagrees with the name.
    pub metadata: Option<CheckpointMetadata>,
}

/// List checkpoint directories under `root`, reading each one's metadata.
///
/// A missing root yields an empty listing. Directories with broken metadata
/// are reported with `metadata: None` rather than failing the scan.
pub fn scan(root: &Path) -> Result<Vec<DiskEntry>, CheckpointError> {
    let read_dir = match fs::read_dir(root) {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(CheckpointError::io(root, e)),
    };

    let mut entries = Vec::new();
    for entry in read_dir {
        let entry = entry.map_err(|e| CheckpointError::io(root, e))?;
        let Some(iteration) = entry.file_name().to_str().and_then(parse_dir_name) else {
            continue;
        };
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }

        let metadata = read_metadata(&path).filter(|metadata| {
            let consistent = metadata.iteration == iteration;
            if !consistent {
                warn!(
                    path = %path.display(),
                    recorded = metadata.iteration,
                    "Checkpoint metadata disagrees with directory name, skipping"
                );
            }
            consistent
        });
        entries.push(DiskEntry {
            iteration,
            path,
            metadata,
        });
    }

    entries.sort_by_key(|entry| entry.iteration);
    Ok(entries)
}

fn read_metadata(dir: &Path) -> Option<CheckpointMetadata> {
    let path = dir.join(METADATA_FILE);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!(path = %dir.display(), "Checkpoint directory has no metadata, skipping");
            return None;
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read checkpoint metadata, skipping");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(metadata) => Some(metadata),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Malformed checkpoint metadata, skipping");
            None
        }
    }
}

/// Build the canonical index from a disk listing and the persisted index.
///
/// With a persisted index, its entries are kept in iteration order as long as
/// their directory still exists with valid metadata; valid directories the
/// index does not list are orphans and stay excluded. Without one, every
/// valid directory is indexed.
pub fn reconcile(disk: &[DiskEntry], persisted: Option<&PersistedIndex>) -> Vec<CheckpointRecord> {
    let valid: BTreeMap<u64, (&Path, &CheckpointMetadata)> = disk
        .iter()
        .filter_map(|entry| {
            entry
                .metadata
                .as_ref()
                .map(|metadata| (entry.iteration, (entry.path.as_path(), metadata)))
        })
        .collect();

    let to_record =
        |(path, metadata): &(&Path, &CheckpointMetadata)| CheckpointRecord::from_metadata(path, metadata);

    match persisted {
        Some(index) => {
            let listed: BTreeMap<u64, CheckpointRecord> = index
                .checkpoints
                .iter()
                .filter_map(|entry| match valid.get(&entry.iteration) {
                    Some(found) => Some((entry.iteration, to_record(found))),
                    None => {
                        warn!(
                            iteration = entry.iteration,
                            path = %entry.path.display(),
                            "Indexed checkpoint is missing on disk, dropping from index"
                        );
                        None
                    }
                })
                .collect();
            listed.into_values().collect()
        }
        None => valid.values().map(to_record).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn valid(iteration: u64) -> DiskEntry {
        let path = PathBuf::from("/ckpt").join(checkpoint_dir_name(iteration));
        DiskEntry {
            iteration,
            path,
            metadata: Some(CheckpointMetadata::new(
                iteration,
                ts(iteration as i64),
                &Metrics::new(),
            )),
        }
    }

    fn partial(iteration: u64) -> DiskEntry {
        DiskEntry {
            metadata: None,
            ..valid(iteration)
        }
    }

    fn index_of(iterations: &[u64]) -> PersistedIndex {
        PersistedIndex {
            checkpoints: iterations
                .iter()
                .map(|&iteration| IndexEntry {
                    iteration,
                    path: PathBuf::from("/elsewhere").join(checkpoint_dir_name(iteration)),
                    timestamp: ts(iteration as i64),
                })
                .collect(),
            last_updated: ts(0),
        }
    }

    fn iterations(records: &[CheckpointRecord]) -> Vec<u64> {
        records.iter().map(|record| record.iteration).collect()
    }

    #[test]
    fn test_dir_name_round_trip() {
        assert_eq!(checkpoint_dir_name(50), "checkpoint_000050");
        assert_eq!(checkpoint_dir_name(1_234_567), "checkpoint_1234567");
        assert_eq!(parse_dir_name("checkpoint_000050"), Some(50));
        assert_eq!(parse_dir_name("checkpoint_1234567"), Some(1_234_567));
    }

    #[test]
    fn test_parse_dir_name_rejects_foreign_names() {
        assert_eq!(parse_dir_name("checkpoint_"), None);
        assert_eq!(parse_dir_name("checkpoint_000000"), None);
        assert_eq!(parse_dir_name("checkpoint_00a050"), None);
        assert_eq!(parse_dir_name("checkpoint_+50"), None);
        assert_eq!(parse_dir_name("snapshot_000050"), None);
        assert_eq!(parse_dir_name(INDEX_FILE), None);
    }

    #[test]
    fn test_metadata_reserved_keys_win() {
        let mut metrics = Metrics::new();
        metrics.insert("iteration".to_string(), json!(999));
        metrics.insert("timestamp".to_string(), json!("never"));
        metrics.insert("episode_reward_mean".to_string(), json!(1.5));

        let metadata = CheckpointMetadata::new(7, ts(10), &metrics);
        let value = serde_json::to_value(&metadata).unwrap();

        assert_eq!(value["iteration"], json!(7));
        assert_eq!(value["episode_reward_mean"], json!(1.5));
        assert_ne!(value["timestamp"], json!("never"));

        let parsed: CheckpointMetadata = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, metadata);
    }

    #[test]
    fn test_reconcile_without_index_uses_valid_dirs() {
        let disk = vec![valid(1), partial(2), valid(3)];
        let records = reconcile(&disk, None);
        assert_eq!(iterations(&records), vec![1, 3]);
    }

    #[test]
    fn test_reconcile_prefers_persisted_index() {
        // 3 is valid on disk but was never indexed (crash before the index write).
        let disk = vec![valid(1), valid(2), valid(3)];
        let records = reconcile(&disk, Some(&index_of(&[1, 2])));
        assert_eq!(iterations(&records), vec![1, 2]);
        // Paths come from the disk listing, not the stored index.
        assert_eq!(records[0].path, PathBuf::from("/ckpt/checkpoint_000001"));
    }

    #[test]
    fn test_reconcile_drops_entries_missing_on_disk() {
        let disk = vec![valid(2), partial(3)];
        let records = reconcile(&disk, Some(&index_of(&[1, 2, 3])));
        assert_eq!(iterations(&records), vec![2]);
    }

    #[test]
    fn test_reconcile_orders_and_dedups_index() {
        let disk = vec![valid(1), valid(2)];
        let records = reconcile(&disk, Some(&index_of(&[2, 1, 2])));
        assert_eq!(iterations(&records), vec![1, 2]);
    }

    #[test]
    fn test_persisted_index_matches() {
        let disk = vec![valid(1), valid(2)];
        let records = reconcile(&disk, None);
        let index = PersistedIndex::from_records(&records);
        assert!(index.matches(&records));
        assert!(!index.matches(&records[..1]));
        assert!(!index_of(&[1, 2]).matches(&records));
    }
}
