// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Episode controller: `reset` and `step` on top of the bridge.
//!
//! Holding the controller by `&mut` is what keeps calls from overlapping, so
//! the bridge's single pending slot is never contended in normal operation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use hideseek_protocol::{ActionCommand, ObservationMessage, OutboundMessage};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::bridge::{Bridge, BridgeError, DEFAULT_CALL_TIMEOUT};

/// Episode controller errors
#[derive(Debug, Error)]
pub enum EpisodeError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("step called with no active episode; reset first")]
    NoActiveEpisode,
}

/// Configuration for the episode controller
#[derive(Debug, Clone)]
pub struct EpisodeConfig {
    /// Steps after which an episode is truncated
    pub max_steps: u64,
    /// Deadline for each reset/step call
    pub call_timeout: Duration,
}

impl Default for EpisodeConfig {
    fn default() -> Self {
        Self {
            max_steps: 500,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

impl EpisodeConfig {
    pub fn new(max_steps: u64) -> Self {
        Self {
            max_steps,
            ..Default::default()
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

/// Outcome of one `step`.
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    pub observation: ObservationMessage,
    /// Step counter after this step (first step is 1).
    pub step: u64,
    /// The simulation reported `episode_done`.
    pub terminated: bool,
    /// The step limit was reached without the simulation ending the episode.
    pub truncated: bool,
}

impl StepResult {
    /// Whether the episode is over, for either reason.
    pub fn is_done(&self) -> bool {
        self.terminated || self.truncated
    }
}

/// Drives one episode at a time through the bridge.
pub struct EpisodeController {
    bridge: Arc<Bridge>,
    config: EpisodeConfig,
    episode: Option<u64>,
    step: u64,
    active: bool,
}

impl EpisodeController {
    pub fn new(bridge: Arc<Bridge>, config: EpisodeConfig) -> Self {
        Self {
            bridge,
            config,
            episode: None,
            step: 0,
            active: false,
        }
    }

    pub fn config(&self) -> &EpisodeConfig {
        &self.config
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    /// Id of the last successfully reset episode.
    pub fn current_episode(&self) -> Option<u64> {
        self.episode
    }

    /// Steps taken in the current episode.
    pub fn step_count(&self) -> u64 {
        self.step
    }

    /// Whether `step` may be called.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Start episode `episode` and return its initial observation.
    ///
    /// The step counter is zeroed only once the simulator has replied.
    #[instrument(skip(self))]
    pub async fn reset(&mut self, episode: u64) -> Result<ObservationMessage, EpisodeError> {
        self.active = false;
        let observation = self
            .bridge
            .call(&OutboundMessage::Reset { episode }, self.config.call_timeout)
            .await?;

        self.episode = Some(episode);
        self.step = 0;
        self.active = true;
        debug!(agents = observation.agents.len(), "Episode started");
        Ok(observation)
    }

    /// Advance the current episode by one tick.
    ///
    /// Errors from the bridge are returned as-is; the step counter only moves
    /// on success, and the episode stays active so the caller can decide what
    /// to do next.
    pub async fn step(
        &mut self,
        actions: BTreeMap<String, ActionCommand>,
    ) -> Result<StepResult, EpisodeError> {
        if !self.active {
            return Err(EpisodeError::NoActiveEpisode);
        }

        let observation = self
            .bridge
            .call(&OutboundMessage::Step { actions }, self.config.call_timeout)
            .await?;

        self.step += 1;
        let terminated = observation.episode_done;
        let truncated = !terminated && self.step >= self.config.max_steps;
        if terminated || truncated {
            self.active = false;
            debug!(
                episode = ?self.episode,
                steps = self.step,
                terminated,
                truncated,
                "Episode finished"
            );
        }

        Ok(StepResult {
            observation,
            step: self.step,
            terminated,
            truncated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hideseek_protocol::{ConnectionManager, InboundHandler, Outgoing};
    use serde_json::json;
    use tokio::sync::mpsc;

    /// Answer every command with an observation; `done_after` sets `episode_done`
    /// on the n-th step reply.
    fn spawn_responder(
        bridge: Arc<Bridge>,
        mut rx: mpsc::UnboundedReceiver<Outgoing>,
        done_after: Option<u64>,
    ) {
        let peer = bridge.connections().current_peer().unwrap();
        tokio::spawn(async move {
            let mut steps = 0;
            while let Some(Outgoing::Text(text)) = rx.recv().await {
                let episode_done = if text.contains(r#""type":"step""#) {
                    steps += 1;
                    done_after == Some(steps)
                } else {
                    steps = 0;
                    false
                };
                let reply = json!({
                    "type": "observation",
                    "agents": [{
                        "id": "seeker_0",
                        "observation": vec![0.0_f32; 4],
                        "reward": 1.0,
                        "done": false,
                        "role": "seeker"
                    }],
                    "episode_done": episode_done
                });
                bridge.on_text(peer, &reply.to_string());
            }
        });
    }

    fn controller(max_steps: u64, done_after: Option<u64>) -> EpisodeController {
        let connections = Arc::new(ConnectionManager::new());
        let (tx, rx) = mpsc::unbounded_channel();
        connections.accept(tx, None);
        let bridge = Arc::new(Bridge::new(connections));
        spawn_responder(bridge.clone(), rx, done_after);
        EpisodeController::new(bridge, EpisodeConfig::new(max_steps))
    }

    #[test]
    fn test_default_config() {
        let config = EpisodeConfig::default();
        assert_eq!(config.max_steps, 500);
        assert_eq!(config.call_timeout, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_before_reset() {
        let mut episodes = controller(10, None);
        let err = episodes.step(BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, EpisodeError::NoActiveEpisode));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_zeroes_step_counter() {
        let mut episodes = controller(10, None);
        episodes.reset(1).await.unwrap();
        episodes.step(BTreeMap::new()).await.unwrap();
        assert_eq!(episodes.step_count(), 1);

        episodes.reset(2).await.unwrap();
        assert_eq!(episodes.step_count(), 0);
        assert_eq!(episodes.current_episode(), Some(2));
        assert!(episodes.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_truncation_at_max_steps() {
        let mut episodes = controller(3, None);
        episodes.reset(1).await.unwrap();

        for expected in 1..=2 {
            let result = episodes.step(BTreeMap::new()).await.unwrap();
            assert_eq!(result.step, expected);
            assert!(!result.is_done());
        }

        let last = episodes.step(BTreeMap::new()).await.unwrap();
        assert!(last.truncated);
        assert!(!last.terminated);
        assert!(!episodes.is_active());

        let err = episodes.step(BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, EpisodeError::NoActiveEpisode));
    }

    #[tokio::test(start_paused = true)]
    async fn test_termination_wins_over_truncation() {
        let mut episodes = controller(2, Some(2));
        episodes.reset(1).await.unwrap();
        episodes.step(BTreeMap::new()).await.unwrap();

        let last = episodes.step(BTreeMap::new()).await.unwrap();
        assert!(last.terminated);
        assert!(!last.truncated);
        assert!(last.is_done());
    }
}
