// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hideseek Trainer
//!
//! Listens for the simulator on a WebSocket, then trains or replays a policy
//! through it, checkpointing to disk.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use hideseek_core::{
    Bridge, CheckpointManager, Config, EpisodeController, RandomDriver, TrainingRunner,
};
use hideseek_protocol::{ConnectionManager, InboundHandler, SimServer};

#[derive(Parser)]
#[command(name = "hideseek-trainer")]
#[command(version, about = "Train hide-and-seek agents against the browser simulator", long_about = None)]
struct Cli {
    /// Seed for the built-in random driver
    #[arg(long, global = true, default_value_t = 0)]
    seed: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train, optionally resuming from a checkpoint
    Train {
        /// Checkpoint directory to resume from
        #[arg(long)]
        resume: Option<PathBuf>,
        /// Resume without asking for confirmation
        #[arg(long, short = 'y')]
        yes: bool,
    },
    /// Watch a policy play without training
    Demo {
        /// Checkpoint to load (defaults to the latest)
        #[arg(long)]
        checkpoint: Option<PathBuf>,
        /// Stop after this many episodes
        #[arg(long)]
        episodes: Option<u64>,
    },
    /// List indexed checkpoints
    Checkpoints,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hideseek_core=info".parse()?)
                .add_directive("hideseek_protocol=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        ws_endpoint = %config.ws_endpoint(),
        checkpoint_dir = %config.checkpoint_dir.display(),
        keep_last_n = config.keep_last_n,
        max_steps = config.max_steps,
        "Configuration loaded"
    );

    let checkpoints = CheckpointManager::open(config.checkpoint_config())?;

    match cli.command {
        Command::Checkpoints => {
            print_checkpoints(&checkpoints);
            Ok(())
        }
        Command::Train { resume, yes } => {
            if let Some(path) = &resume
                && !yes
                && !confirm_resume(path).await?
            {
                info!("Resume cancelled");
                return Ok(());
            }
            train(config, checkpoints, cli.seed, resume).await
        }
        Command::Demo {
            checkpoint,
            episodes,
        } => demo(config, checkpoints, cli.seed, checkpoint, episodes).await,
    }
}

struct Session {
    runner: TrainingRunner<RandomDriver>,
    connections: Arc<ConnectionManager>,
    server: tokio::task::JoinHandle<()>,
    cancel: CancellationToken,
}

/// Bind the simulator server and wire the runner to it.
async fn start_session(
    config: &Config,
    checkpoints: CheckpointManager,
    seed: u64,
) -> Result<Session> {
    let connections = Arc::new(ConnectionManager::new());
    let bridge = Arc::new(Bridge::new(connections.clone()));
    let episodes = EpisodeController::new(bridge.clone(), config.episode_config());
    let runner = TrainingRunner::new(
        episodes,
        checkpoints,
        RandomDriver::new(seed),
        config.runner_config(),
    );

    let server = SimServer::bind(config.server_config().await?)
        .await
        .with_context(|| format!("failed to bind {}", config.ws_endpoint()))?;
    let handler: Arc<dyn InboundHandler> = bridge;
    let server_connections = connections.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = server.run(server_connections, handler).await {
            error!("WebSocket server error: {}", e);
        }
    });

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping after the current step");
            interrupt.cancel();
        }
    });

    Ok(Session {
        runner,
        connections,
        server,
        cancel,
    })
}

impl Session {
    /// Wait for the simulator to connect; `false` when interrupted first.
    async fn wait_for_simulator(&self) -> Result<bool> {
        info!("Waiting for simulator to connect...");
        tokio::select! {
            _ = self.cancel.cancelled() => Ok(false),
            peer = self.connections.wait_for_peer() => {
                let peer = peer?;
                info!(%peer, "Simulator ready");
                Ok(true)
            }
        }
    }

    fn shutdown(self) {
        self.connections.close();
        self.server.abort();
        info!("Shutdown complete");
    }
}

async fn train(
    config: Config,
    checkpoints: CheckpointManager,
    seed: u64,
    resume: Option<PathBuf>,
) -> Result<()> {
    let mut session = start_session(&config, checkpoints, seed).await?;

    let start_iteration = match &resume {
        Some(path) => session.runner.restore(path)?,
        None => 1,
    };

    if !session.wait_for_simulator().await? {
        session.shutdown();
        return Ok(());
    }

    let result = session.runner.train(start_iteration, &session.cancel).await;
    session.shutdown();

    let summary = result?;
    match &summary.last_checkpoint {
        Some(path) => info!(
            iterations = summary.iterations_completed,
            checkpoint = %path.display(),
            "Training complete"
        ),
        None => info!(iterations = summary.iterations_completed, "Training complete"),
    }
    Ok(())
}

async fn demo(
    config: Config,
    checkpoints: CheckpointManager,
    seed: u64,
    checkpoint: Option<PathBuf>,
    episodes: Option<u64>,
) -> Result<()> {
    let checkpoint = checkpoint.or_else(|| checkpoints.latest().map(|record| record.path.clone()));
    let mut session = start_session(&config, checkpoints, seed).await?;

    match &checkpoint {
        Some(path) => {
            session.runner.restore(path)?;
        }
        None => warn!("No checkpoint found, running an untrained policy"),
    }

    if !session.wait_for_simulator().await? {
        session.shutdown();
        return Ok(());
    }

    let result = session.runner.demo(episodes, &session.cancel).await;
    session.shutdown();

    let summary = result?;
    info!(
        episodes = summary.episodes_completed,
        mean_reward = ?summary.mean_reward,
        "Demo finished"
    );
    Ok(())
}

fn print_checkpoints(checkpoints: &CheckpointManager) {
    let records = checkpoints.list();
    if records.is_empty() {
        println!("No checkpoints in {}", checkpoints.root().display());
        return;
    }
    println!("{:>10}  {:<32}  PATH", "ITERATION", "TIMESTAMP");
    for record in records {
        println!(
            "{:>10}  {:<32}  {}",
            record.iteration,
            record.timestamp.to_rfc3339(),
            record.path.display()
        );
    }
}

async fn confirm_resume(path: &Path) -> Result<bool> {
    let next_iteration = CheckpointManager::resume_iteration_for(path)?;
    let (_, metadata) = CheckpointManager::load_state(path)?;

    print!(
        "Resume from {} (iteration {}, saved {}) and continue at iteration {}? [y/N] ",
        path.display(),
        metadata.iteration,
        metadata.timestamp.to_rfc3339(),
        next_iteration
    );
    std::io::stdout().flush()?;

    let answer = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).map(|_| line)
    })
    .await??;

    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Ok(true),
        "" | "n" | "no" => Ok(false),
        other => bail!("unrecognised answer: {other}"),
    }
}
