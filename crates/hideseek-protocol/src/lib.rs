// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hideseek Protocol - WebSocket + JSON communication layer
//!
//! This crate provides the wire protocol between the trainer and the
//! browser-hosted hide-and-seek simulator.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    hideseek-protocol                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Connection Manager: exactly one live peer                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serialization: JSON text frames (serde_json)               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: WebSocket (tokio-tungstenite)                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Messages
//!
//! | Direction | `type` | Payload |
//! |-----------|--------|---------|
//! | out | `reset` | `episode` |
//! | out | `step` | `actions` keyed by actor id |
//! | in | `observation` | `agents[]`, `episode_done` |
//!
//! Any other inbound `type` decodes as [`InboundFrame::Other`] and is ignored
//! by consumers.
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use hideseek_protocol::{ConnectionManager, SimServer, SimServerConfig};
//!
//! let connections = Arc::new(ConnectionManager::new());
//! let server = SimServer::bind(SimServerConfig::default()).await?;
//! tokio::spawn(server.run(connections.clone(), handler));
//! connections.wait_for_peer().await?;
//! ```

pub mod connection;
pub mod frame;
pub mod message;
pub mod server;

pub use connection::{ConnectionError, ConnectionManager, ConnectionState, Outgoing, PeerId};
pub use frame::{FrameError, InboundFrame, MAX_FRAME_SIZE};
pub use message::{
    ACTION_DIM, ActionCommand, AgentObservation, ObservationMessage, OutboundMessage, RawAction,
};
pub use server::{InboundHandler, ServerError, SimServer, SimServerConfig};
