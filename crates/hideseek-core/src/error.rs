// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Top-level error type for the training runner.

use hideseek_protocol::ServerError;
use thiserror::Error;

use crate::bridge::BridgeError;
use crate::checkpoint::CheckpointError;
use crate::config::ConfigError;
use crate::driver::DriverError;
use crate::episode::EpisodeError;

/// Anything that can end a training or demo run.
#[derive(Debug, Error)]
pub enum TrainerError {
    #[error(transparent)]
    Episode(#[from] EpisodeError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Server(#[from] ServerError),
}

impl From<BridgeError> for TrainerError {
    fn from(e: BridgeError) -> Self {
        Self::Episode(EpisodeError::Bridge(e))
    }
}

impl TrainerError {
    /// Whether the simulator went away (as opposed to being slow or broken).
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::Episode(EpisodeError::Bridge(e)) if e.is_connection_lost())
    }
}
