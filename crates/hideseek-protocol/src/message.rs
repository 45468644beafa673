// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed wire messages exchanged with the simulator.
//!
//! Outbound commands (`reset`, `step`) and the inbound `observation` reply are
//! JSON objects discriminated by a `type` field.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Number of channels in a raw policy action.
pub const ACTION_DIM: usize = 7;

/// Threshold above which a binary action channel is considered pressed.
pub const BUTTON_THRESHOLD: f32 = 0.5;

/// Raw policy output for one actor:
/// `[forward, strafe, rotation, look, jump, place_block, remove_block]`.
pub type RawAction = [f32; ACTION_DIM];

/// Lower bounds of the action box.
pub const ACTION_LOW: RawAction = [-1.0, -1.0, -1.0, -1.0, 0.0, 0.0, 0.0];

/// Upper bounds of the action box.
pub const ACTION_HIGH: RawAction = [1.0; ACTION_DIM];

/// Structured per-actor action as sent in a `step` command.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActionCommand {
    pub movement_forward: f32,
    pub movement_strafe: f32,
    pub rotation: f32,
    pub look: f32,
    pub jump: bool,
    pub place_block: bool,
    pub remove_block: bool,
}

impl ActionCommand {
    /// Build a command from a raw policy vector.
    ///
    /// Continuous channels are clamped into `[-1, 1]` (NaN becomes 0); the
    /// three button channels are pressed when strictly above
    /// [`BUTTON_THRESHOLD`].
    pub fn from_raw(raw: &RawAction) -> Self {
        Self {
            movement_forward: clamp_unit(raw[0]),
            movement_strafe: clamp_unit(raw[1]),
            rotation: clamp_unit(raw[2]),
            look: clamp_unit(raw[3]),
            jump: raw[4] > BUTTON_THRESHOLD,
            place_block: raw[5] > BUTTON_THRESHOLD,
            remove_block: raw[6] > BUTTON_THRESHOLD,
        }
    }

    /// Action that leaves the actor standing still.
    pub fn neutral() -> Self {
        Self {
            movement_forward: 0.0,
            movement_strafe: 0.0,
            rotation: 0.0,
            look: 0.0,
            jump: false,
            place_block: false,
            remove_block: false,
        }
    }
}

impl Default for ActionCommand {
    fn default() -> Self {
        Self::neutral()
    }
}

fn clamp_unit(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(-1.0, 1.0)
    }
}

/// Commands sent to the simulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundMessage {
    /// Start a new episode.
    Reset { episode: u64 },
    /// Advance the simulation by one tick.
    Step {
        actions: BTreeMap<String, ActionCommand>,
    },
}

impl OutboundMessage {
    /// Wire name of the command.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Reset { .. } => "reset",
            Self::Step { .. } => "step",
        }
    }
}

/// Per-actor slice of an observation reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentObservation {
    pub id: String,
    pub observation: Vec<f32>,
    pub reward: f32,
    pub done: bool,
    pub role: String,
}

impl AgentObservation {
    pub fn is_seeker(&self) -> bool {
        self.role == "seeker"
    }
}

/// Reply to both `reset` and `step`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationMessage {
    pub agents: Vec<AgentObservation>,
    pub episode_done: bool,
}

impl ObservationMessage {
    /// Observations keyed by actor id.
    pub fn by_actor(&self) -> BTreeMap<String, AgentObservation> {
        self.agents
            .iter()
            .map(|agent| (agent.id.clone(), agent.clone()))
            .collect()
    }

    /// Sum of rewards across all actors in this reply.
    pub fn total_reward(&self) -> f32 {
        self.agents.iter().map(|agent| agent.reward).sum()
    }
}
