// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Training and demo loops.
//!
//! The runner owns the episode controller, the checkpoint manager and a
//! [`TrainerDriver`]. It pulls observations through the controller, asks the
//! driver for actions, feeds the resulting transitions back, and checkpoints
//! on the configured cadence.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hideseek_protocol::{ActionCommand, AgentObservation, RawAction};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::Metrics;
use crate::checkpoint::CheckpointManager;
use crate::driver::{TrainerDriver, Transition};
use crate::episode::EpisodeController;
use crate::error::TrainerError;

/// Configuration for the training and demo loops
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Last iteration of the run; a resumed run stops here too
    pub total_iterations: u64,
    /// Environment steps collected per iteration
    pub steps_per_iteration: u64,
    /// Log a summary every N iterations
    pub log_frequency: u64,
    /// Expected observation vector length
    pub observation_size: usize,
    /// Pause between demo episodes
    pub demo_pause: Duration,
    /// Wait before retrying a failed demo reset
    pub reset_retry_delay: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            total_iterations: 1000,
            steps_per_iteration: 4000,
            log_frequency: 1,
            observation_size: 91,
            demo_pause: Duration::from_secs(1),
            reset_retry_delay: Duration::from_secs(1),
        }
    }
}

impl RunnerConfig {
    pub fn with_total_iterations(mut self, n: u64) -> Self {
        self.total_iterations = n;
        self
    }

    pub fn with_steps_per_iteration(mut self, n: u64) -> Self {
        self.steps_per_iteration = n.max(1);
        self
    }

    pub fn with_log_frequency(mut self, n: u64) -> Self {
        self.log_frequency = n.max(1);
        self
    }

    pub fn with_observation_size(mut self, n: usize) -> Self {
        self.observation_size = n;
        self
    }

    pub fn with_demo_pause(mut self, pause: Duration) -> Self {
        self.demo_pause = pause;
        self
    }

    pub fn with_reset_retry_delay(mut self, delay: Duration) -> Self {
        self.reset_retry_delay = delay;
        self
    }
}

/// Result of a `train` call.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainSummary {
    pub iterations_completed: u64,
    pub last_iteration: Option<u64>,
    pub last_checkpoint: Option<PathBuf>,
    pub interrupted: bool,
}

/// Result of a `demo` call.
#[derive(Debug, Clone, PartialEq)]
pub struct DemoSummary {
    pub episodes_completed: u64,
    pub mean_reward: Option<f64>,
}

/// An episode that ended on the last step.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedEpisode {
    pub episode: u64,
    pub reward: f64,
    pub length: u64,
    pub terminated: bool,
}

struct EpisodeProgress {
    episode: u64,
    observations: BTreeMap<String, AgentObservation>,
    reward: f64,
    length: u64,
}

#[derive(Default)]
struct IterationStats {
    steps: u64,
    episodes: u64,
    reward_sum: f64,
    length_sum: u64,
}

impl IterationStats {
    fn finish(&mut self, episode: &FinishedEpisode) {
        self.episodes += 1;
        self.reward_sum += episode.reward;
        self.length_sum += episode.length;
    }

    fn reward_mean(&self) -> Value {
        if self.episodes == 0 {
            Value::Null
        } else {
            json!(self.reward_sum / self.episodes as f64)
        }
    }

    fn length_mean(&self) -> Value {
        if self.episodes == 0 {
            Value::Null
        } else {
            json!(self.length_sum as f64 / self.episodes as f64)
        }
    }
}

/// Connects the episode controller, a driver and the checkpoint manager.
pub struct TrainingRunner<D> {
    episodes: EpisodeController,
    checkpoints: CheckpointManager,
    driver: D,
    config: RunnerConfig,
    next_episode: u64,
    current: Option<EpisodeProgress>,
    timesteps_total: u64,
}

impl<D: TrainerDriver> TrainingRunner<D> {
    pub fn new(
        episodes: EpisodeController,
        checkpoints: CheckpointManager,
        driver: D,
        config: RunnerConfig,
    ) -> Self {
        Self {
            episodes,
            checkpoints,
            driver,
            config,
            next_episode: 0,
            current: None,
            timesteps_total: 0,
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn episodes(&self) -> &EpisodeController {
        &self.episodes
    }

    /// Restore the driver from a checkpoint and return the iteration to
    /// continue at.
    pub fn restore(&mut self, path: &Path) -> Result<u64, TrainerError> {
        let next_iteration = CheckpointManager::resume_iteration_for(path)?;
        let (state, metadata) = CheckpointManager::load_state(path)?;
        self.driver.load_state(&state)?;
        info!(
            path = %path.display(),
            iteration = metadata.iteration,
            next_iteration,
            "Restored trainer state"
        );
        Ok(next_iteration)
    }

    /// Train iterations `start_iteration..=total_iterations`.
    ///
    /// A resumed run only trains the remaining iterations, and nothing at
    /// all when `start_iteration` is already past the end.
    ///
    /// Simulator errors end the run. Cancellation stops at the next step
    /// boundary; the last completed iteration is checkpointed either way.
    #[instrument(skip(self, cancel))]
    pub async fn train(
        &mut self,
        start_iteration: u64,
        cancel: &CancellationToken,
    ) -> Result<TrainSummary, TrainerError> {
        let start_iteration = start_iteration.max(1);
        let end = self.config.total_iterations;
        let mut summary = TrainSummary {
            iterations_completed: 0,
            last_iteration: None,
            last_checkpoint: None,
            interrupted: false,
        };
        let mut last_saved = None;
        let mut last_metrics = Metrics::new();

        if start_iteration > end {
            info!(
                start_iteration,
                total_iterations = end,
                "All iterations already trained, nothing to do"
            );
            return Ok(summary);
        }

        info!(
            start_iteration,
            total_iterations = end,
            steps_per_iteration = self.config.steps_per_iteration,
            "Training started"
        );

        for iteration in start_iteration..=end {
            let Some(stats) = until_cancelled(cancel, self.collect()).await else {
                summary.interrupted = true;
                break;
            };
            let stats = stats?;

            let mut metrics = self.driver.train_one_iteration()?;
            self.timesteps_total += stats.steps;
            merge_runner_metrics(&mut metrics, iteration, &stats, self.timesteps_total);

            summary.iterations_completed += 1;
            summary.last_iteration = Some(iteration);

            if summary.iterations_completed % self.config.log_frequency == 0 {
                info!(
                    iteration,
                    episodes = stats.episodes,
                    reward_mean = %stats.reward_mean(),
                    len_mean = %stats.length_mean(),
                    timesteps_total = self.timesteps_total,
                    "Iteration complete"
                );
            }

            if self.checkpoints.config().should_save(iteration) {
                summary.last_checkpoint = Some(self.save(iteration, &metrics)?);
                last_saved = Some(iteration);
            }
            last_metrics = metrics;

            if cancel.is_cancelled() {
                summary.interrupted = true;
                break;
            }
        }

        if let Some(iteration) = summary.last_iteration
            && last_saved != Some(iteration)
        {
            last_metrics.insert("final".to_string(), json!(!summary.interrupted));
            last_metrics.insert("interrupted".to_string(), json!(summary.interrupted));
            summary.last_checkpoint = Some(self.save(iteration, &last_metrics)?);
        }

        info!(
            iterations = summary.iterations_completed,
            interrupted = summary.interrupted,
            "Training finished"
        );
        Ok(summary)
    }

    fn save(&mut self, iteration: u64, metrics: &Metrics) -> Result<PathBuf, TrainerError> {
        let state = self.driver.save_state()?;
        Ok(self.checkpoints.save(&state, iteration, metrics)?)
    }

    async fn collect(&mut self) -> Result<IterationStats, TrainerError> {
        let mut stats = IterationStats::default();
        while stats.steps < self.config.steps_per_iteration {
            let finished = self.step_once(false, true).await?;
            stats.steps += 1;
            if let Some(episode) = finished {
                stats.finish(&episode);
            }
        }
        Ok(stats)
    }

    /// Watch the policy play without training.
    ///
    /// Runs `episodes` episodes (forever when `None`) with deterministic
    /// actions. A failed reset is retried; a failed step abandons only the
    /// current episode.
    #[instrument(skip(self, cancel))]
    pub async fn demo(
        &mut self,
        episodes: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<DemoSummary, TrainerError> {
        let mut completed = 0;
        let mut reward_sum = 0.0;

        while episodes.is_none_or(|n| completed < n) && !cancel.is_cancelled() {
            let progress = match until_cancelled(cancel, self.start_episode()).await {
                None => break,
                Some(Ok(progress)) => progress,
                Some(Err(e)) => {
                    warn!("Reset failed: {}", e);
                    if e.is_connection_lost() {
                        info!("Waiting for simulator to reconnect");
                        let connections = self.episodes.bridge().connections().clone();
                        if until_cancelled(cancel, connections.wait_for_peer())
                            .await
                            .is_none()
                        {
                            break;
                        }
                    } else if until_cancelled(cancel, tokio::time::sleep(self.config.reset_retry_delay))
                        .await
                        .is_none()
                    {
                        break;
                    }
                    continue;
                }
            };
            self.current = Some(progress);

            loop {
                match until_cancelled(cancel, self.step_once(true, false)).await {
                    None => break,
                    Some(Ok(Some(finished))) => {
                        completed += 1;
                        reward_sum += finished.reward;
                        info!(
                            episode = finished.episode,
                            reward = finished.reward,
                            length = finished.length,
                            terminated = finished.terminated,
                            "Demo episode finished"
                        );
                        break;
                    }
                    Some(Ok(None)) => {
                        if let Some(progress) = &self.current
                            && progress.length % 10 == 0
                        {
                            debug!(
                                episode = progress.episode,
                                step = progress.length,
                                reward = progress.reward,
                                "Demo progress"
                            );
                        }
                    }
                    Some(Err(e)) => {
                        warn!("Step failed, ending episode: {}", e);
                        self.current = None;
                        break;
                    }
                }
            }

            if episodes.is_none_or(|n| completed < n)
                && until_cancelled(cancel, tokio::time::sleep(self.config.demo_pause))
                    .await
                    .is_none()
            {
                break;
            }
        }

        Ok(DemoSummary {
            episodes_completed: completed,
            mean_reward: (completed > 0).then(|| reward_sum / completed as f64),
        })
    }

    async fn start_episode(&mut self) -> Result<EpisodeProgress, TrainerError> {
        self.next_episode += 1;
        let episode = self.next_episode;
        let observation = self.episodes.reset(episode).await?;

        for agent in &observation.agents {
            if agent.observation.len() != self.config.observation_size {
                warn!(
                    episode,
                    actor = %agent.id,
                    expected = self.config.observation_size,
                    actual = agent.observation.len(),
                    "Unexpected observation size"
                );
            }
        }

        Ok(EpisodeProgress {
            episode,
            observations: observation.by_actor(),
            reward: 0.0,
            length: 0,
        })
    }

    /// Advance one step, resetting first when no episode is running.
    async fn step_once(
        &mut self,
        deterministic: bool,
        record: bool,
    ) -> Result<Option<FinishedEpisode>, TrainerError> {
        let mut progress = match self.current.take() {
            Some(progress) if self.episodes.is_active() => progress,
            _ => self.start_episode().await?,
        };

        let raw = self
            .driver
            .compute_actions(&progress.observations, deterministic);
        let mut commands: BTreeMap<String, ActionCommand> = raw
            .iter()
            .map(|(actor, action)| (actor.clone(), ActionCommand::from_raw(action)))
            .collect();
        for actor in progress.observations.keys() {
            commands
                .entry(actor.clone())
                .or_insert_with(ActionCommand::neutral);
        }

        let result = self.episodes.step(commands).await?;
        let next = result.observation.by_actor();

        if record {
            for (actor, agent) in &next {
                let Some(previous) = progress.observations.get(actor) else {
                    continue;
                };
                let action: RawAction = raw.get(actor).copied().unwrap_or_default();
                self.driver.record(Transition {
                    episode: progress.episode,
                    actor: actor.clone(),
                    observation: previous.observation.clone(),
                    action,
                    reward: agent.reward,
                    next_observation: agent.observation.clone(),
                    terminated: agent.done || result.terminated,
                    truncated: result.truncated,
                });
            }
        }

        progress.reward += f64::from(result.observation.total_reward());
        progress.length = result.step;
        progress.observations = next;

        if result.is_done() {
            return Ok(Some(FinishedEpisode {
                episode: progress.episode,
                reward: progress.reward,
                length: progress.length,
                terminated: result.terminated,
            }));
        }
        self.current = Some(progress);
        Ok(None)
    }
}

fn merge_runner_metrics(
    metrics: &mut Metrics,
    iteration: u64,
    stats: &IterationStats,
    timesteps_total: u64,
) {
    metrics.insert("iteration".to_string(), json!(iteration));
    metrics.insert("episodes_this_iter".to_string(), json!(stats.episodes));
    metrics.insert("episode_reward_mean".to_string(), stats.reward_mean());
    metrics.insert("episode_len_mean".to_string(), stats.length_mean());
    metrics.insert("timesteps_total".to_string(), json!(timesteps_total));
}

/// Run `future` unless `cancel` fires first.
async fn until_cancelled<F: Future>(cancel: &CancellationToken, future: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        output = future => Some(output),
    }
}
