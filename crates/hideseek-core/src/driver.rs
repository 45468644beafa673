// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Boundary to the learning algorithm.
//!
//! The runner never looks inside the policy. It hands observations to a
//! [`TrainerDriver`], gets raw actions back, feeds transitions in, and asks it
//! to train and to (de)serialize itself for checkpoints.

use std::collections::BTreeMap;

use hideseek_protocol::message::{ACTION_HIGH, ACTION_LOW};
use hideseek_protocol::{ACTION_DIM, AgentObservation, RawAction};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::Metrics;

/// Errors raised by a trainer driver
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("invalid driver state: {0}")]
    InvalidState(#[from] serde_json::Error),

    #[error("training failed: {0}")]
    Training(String),
}

/// One actor's experience for a single step.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub episode: u64,
    pub actor: String,
    pub observation: Vec<f32>,
    pub action: RawAction,
    pub reward: f32,
    pub next_observation: Vec<f32>,
    /// The actor is done or the simulation ended the episode.
    pub terminated: bool,
    /// The episode hit the step limit.
    pub truncated: bool,
}

/// The learning algorithm, seen from the training loop.
pub trait TrainerDriver: Send {
    /// Produce one raw action per observed actor.
    fn compute_actions(
        &mut self,
        observations: &BTreeMap<String, AgentObservation>,
        deterministic: bool,
    ) -> BTreeMap<String, RawAction>;

    /// Buffer one transition for the next training iteration.
    fn record(&mut self, transition: Transition);

    /// Consume buffered experience and return scalar metrics.
    fn train_one_iteration(&mut self) -> Result<Metrics, DriverError>;

    /// Serialize everything needed to resume.
    fn save_state(&self) -> Result<Vec<u8>, DriverError>;

    /// Restore from a blob produced by [`TrainerDriver::save_state`].
    fn load_state(&mut self, state: &[u8]) -> Result<(), DriverError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RandomDriverState {
    seed: u64,
    iterations_trained: u64,
    timesteps_total: u64,
}

/// Uniform-random policy that trains nothing.
///
/// Useful for wiring checks against a live simulator and as the default
/// driver of the binary.
pub struct RandomDriver {
    rng: StdRng,
    state: RandomDriverState,
    buffer: Vec<Transition>,
}

impl RandomDriver {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            state: RandomDriverState {
                seed,
                iterations_trained: 0,
                timesteps_total: 0,
            },
            buffer: Vec::new(),
        }
    }

    pub fn iterations_trained(&self) -> u64 {
        self.state.iterations_trained
    }

    pub fn timesteps_total(&self) -> u64 {
        self.state.timesteps_total
    }

    /// Transitions recorded since the last training iteration.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn midpoint() -> RawAction {
        let mut action = [0.0; ACTION_DIM];
        for (i, value) in action.iter_mut().enumerate() {
            *value = (ACTION_LOW[i] + ACTION_HIGH[i]) / 2.0;
        }
        action
    }

    fn sample(&mut self) -> RawAction {
        let mut action = [0.0; ACTION_DIM];
        for (i, value) in action.iter_mut().enumerate() {
            *value = self.rng.gen_range(ACTION_LOW[i]..=ACTION_HIGH[i]);
        }
        action
    }
}

impl TrainerDriver for RandomDriver {
    fn compute_actions(
        &mut self,
        observations: &BTreeMap<String, AgentObservation>,
        deterministic: bool,
    ) -> BTreeMap<String, RawAction> {
        observations
            .keys()
            .map(|actor| {
                let action = if deterministic {
                    Self::midpoint()
                } else {
                    self.sample()
                };
                (actor.clone(), action)
            })
            .collect()
    }

    fn record(&mut self, transition: Transition) {
        self.buffer.push(transition);
    }

    fn train_one_iteration(&mut self) -> Result<Metrics, DriverError> {
        let batch = std::mem::take(&mut self.buffer);
        let reward_sum: f64 = batch.iter().map(|t| f64::from(t.reward)).sum();
        let terminations = batch.iter().filter(|t| t.terminated).count();
        let truncations = batch.iter().filter(|t| t.truncated).count();

        self.state.iterations_trained += 1;
        self.state.timesteps_total += batch.len() as u64;

        let mut metrics = Metrics::new();
        metrics.insert("transitions".to_string(), json!(batch.len()));
        metrics.insert("reward_sum".to_string(), json!(reward_sum));
        metrics.insert("terminations".to_string(), json!(terminations));
        metrics.insert("truncations".to_string(), json!(truncations));
        metrics.insert(
            "iterations_trained".to_string(),
            json!(self.state.iterations_trained),
        );
        Ok(metrics)
    }

    fn save_state(&self) -> Result<Vec<u8>, DriverError> {
        Ok(serde_json::to_vec(&self.state)?)
    }

    fn load_state(&mut self, state: &[u8]) -> Result<(), DriverError> {
        let state: RandomDriverState = serde_json::from_slice(state)?;
        // Advance the stream so a resumed run does not replay old samples.
        self.rng = StdRng::seed_from_u64(state.seed.wrapping_add(state.iterations_trained));
        self.state = state;
        self.buffer.clear();
        Ok(())
    }
}
