// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for hideseek-core integration tests.
//!
//! Provides an in-process fake simulator that sits on the outbound side of a
//! [`ConnectionManager`] and answers through the [`Bridge`].

#![allow(dead_code)]

use std::sync::Arc;

use hideseek_core::Bridge;
use hideseek_protocol::{ConnectionManager, InboundHandler, Outgoing, PeerId};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const OBSERVATION_SIZE: usize = 91;

/// Build an `observation` frame body.
pub fn observation(agents: &[(&str, &str, f32, bool)], episode_done: bool) -> Value {
    let agents: Vec<Value> = agents
        .iter()
        .map(|(id, role, reward, done)| {
            json!({
                "id": id,
                "observation": vec![0.0_f32; OBSERVATION_SIZE],
                "reward": reward,
                "done": done,
                "role": role,
            })
        })
        .collect();
    json!({
        "type": "observation",
        "agents": agents,
        "episode_done": episode_done,
    })
}

/// The initial scenario payload: one seeker, zero reward.
pub fn seeker_observation() -> Value {
    observation(&[("seeker_0", "seeker", 0.0, false)], false)
}

/// A fake simulator attached as the current peer.
pub struct FakeSimulator {
    pub connections: Arc<ConnectionManager>,
    pub bridge: Arc<Bridge>,
    pub peer: PeerId,
    outbound: mpsc::UnboundedReceiver<Outgoing>,
}

impl FakeSimulator {
    pub fn connect() -> Self {
        let connections = Arc::new(ConnectionManager::new());
        let bridge = Arc::new(Bridge::new(connections.clone()));
        let (tx, outbound) = mpsc::unbounded_channel();
        let peer = connections.accept(tx, None);
        Self {
            connections,
            bridge,
            peer,
            outbound,
        }
    }

    /// Next command the trainer sent, parsed.
    pub async fn next_command(&mut self) -> Value {
        match self.outbound.recv().await {
            Some(Outgoing::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a text command, got {other:?}"),
        }
    }

    /// Deliver a frame from this peer.
    pub fn reply(&self, frame: &Value) {
        self.bridge.on_text(self.peer, &frame.to_string());
    }

    pub fn reply_raw(&self, text: &str) {
        self.bridge.on_text(self.peer, text);
    }

    pub fn disconnect(&self) {
        self.connections.on_disconnect(self.peer);
    }

    /// Answer every command automatically; see [`spawn_responder`].
    pub fn spawn_responder(self, episode_len: Option<u64>) -> Responder {
        let FakeSimulator {
            connections,
            bridge,
            peer,
            outbound,
        } = self;
        spawn_responder(connections, bridge, peer, outbound, episode_len)
    }
}

/// Answer every command from `outbound` as `peer`.
///
/// Two actors are reported; `episode_done` is set on the `episode_len`-th
/// step after each reset (never when `None`). Every step pays the seeker 1.0
/// and the hider -1.0.
pub fn spawn_responder(
    connections: Arc<ConnectionManager>,
    bridge: Arc<Bridge>,
    peer: PeerId,
    mut outbound: mpsc::UnboundedReceiver<Outgoing>,
    episode_len: Option<u64>,
) -> Responder {
    let (log_tx, log) = mpsc::unbounded_channel();

    let task = {
        let bridge = bridge.clone();
        tokio::spawn(async move {
            let mut steps = 0;
            while let Some(outgoing) = outbound.recv().await {
                let Outgoing::Text(text) = outgoing else {
                    break;
                };
                let command: Value = serde_json::from_str(&text).unwrap();
                let episode_done = match command["type"].as_str() {
                    Some("reset") => {
                        steps = 0;
                        false
                    }
                    Some("step") => {
                        steps += 1;
                        episode_len == Some(steps)
                    }
                    _ => continue,
                };
                let _ = log_tx.send(command);
                let frame = observation(
                    &[
                        ("seeker_0", "seeker", 1.0, false),
                        ("hider_0", "hider", -1.0, false),
                    ],
                    episode_done,
                );
                bridge.on_text(peer, &frame.to_string());
            }
        })
    };

    Responder {
        connections,
        bridge,
        peer,
        log,
        task,
    }
}

/// Handle to an automatic responder.
pub struct Responder {
    pub connections: Arc<ConnectionManager>,
    pub bridge: Arc<Bridge>,
    pub peer: PeerId,
    log: mpsc::UnboundedReceiver<Value>,
    task: JoinHandle<()>,
}

impl Responder {
    /// Commands answered so far.
    pub fn drain_commands(&mut self) -> Vec<Value> {
        let mut commands = Vec::new();
        while let Ok(command) = self.log.try_recv() {
            commands.push(command);
        }
        commands
    }

    pub fn disconnect(&self) {
        self.connections.on_disconnect(self.peer);
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.task.abort();
    }
}
