// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hideseek Core - synchronous simulator calls and durable checkpoints
//!
//! This crate lets a training loop drive the browser-hosted hide-and-seek
//! simulator as if it were a blocking environment, and keeps versioned
//! snapshots of trainer state on disk.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────┐      ┌───────────────────────┐
//! │    TrainingRunner     │─────►│  CheckpointManager    │
//! │  (train / demo loop)  │      │  index + retention    │
//! └───────────────────────┘      └───────────────────────┘
//!      │            │
//!      │            ▼
//!      │   ┌───────────────────────┐
//!      │   │    TrainerDriver      │  actions in, metrics out
//!      │   └───────────────────────┘
//!      ▼
//! ┌───────────────────────┐
//! │  EpisodeController    │  reset / step, truncation
//! └───────────────────────┘
//!      │
//!      ▼
//! ┌───────────────────────┐
//! │       Bridge          │  one pending call, deadline
//! └───────────────────────┘
//!      │
//!      ▼
//! ┌───────────────────────┐
//! │  ConnectionManager    │  hideseek-protocol
//! └───────────────────────┘
//! ```
//!
//! # Episode end
//!
//! | Signal | Source | Meaning |
//! |--------|--------|---------|
//! | `terminated` | `episode_done` from the simulator | the task ended |
//! | `truncated` | step counter reached `max_steps` | cut short |
//!
//! A per-actor `done` flag does not end the episode; it is only forwarded to
//! the driver as part of that actor's transition.

pub mod bridge;
pub mod checkpoint;
pub mod config;
pub mod driver;
pub mod episode;
pub mod error;
pub mod runner;

use std::collections::BTreeMap;

/// Scalar training metrics, as written into checkpoint metadata.
pub type Metrics = BTreeMap<String, serde_json::Value>;

pub use bridge::{Bridge, BridgeError, DEFAULT_CALL_TIMEOUT, RequestKind};
pub use checkpoint::{CheckpointConfig, CheckpointError, CheckpointManager, CheckpointRecord};
pub use config::{Config, ConfigError};
pub use driver::{DriverError, RandomDriver, TrainerDriver, Transition};
pub use episode::{EpisodeConfig, EpisodeController, EpisodeError, StepResult};
pub use error::TrainerError;
pub use runner::{DemoSummary, RunnerConfig, TrainSummary, TrainingRunner};
