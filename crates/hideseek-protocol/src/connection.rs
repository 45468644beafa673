// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Single-peer connection manager.
//!
//! Tracks the one live simulator connection. A new handshake supersedes the
//! previous peer: its outbound channel is dropped, which makes its socket task
//! close the stale socket, and every later send goes to the new peer only.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Identity of one accepted connection. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected(PeerId),
}

/// Item queued for a peer's socket task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// A text frame.
    Text(String),
    /// Close the socket.
    Close,
}

/// Errors returned by the connection manager
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("no simulator connected")]
    NotConnected,

    #[error("connection manager closed")]
    Closed,
}

struct Peer {
    id: PeerId,
    remote: Option<SocketAddr>,
    outbound: mpsc::UnboundedSender<Outgoing>,
}

/// Owner of the sole live transport handle.
pub struct ConnectionManager {
    current: Mutex<Option<Peer>>,
    next_id: AtomicU64,
    state: watch::Sender<ConnectionState>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            current: Mutex::new(None),
            next_id: AtomicU64::new(1),
            state,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Peer>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install a new connection, superseding any previous one.
    pub fn accept(
        &self,
        outbound: mpsc::UnboundedSender<Outgoing>,
        remote: Option<SocketAddr>,
    ) -> PeerId {
        let id = PeerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let previous = self.lock().replace(Peer {
            id,
            remote,
            outbound,
        });

        if let Some(old) = previous {
            info!(old = %old.id, new = %id, "Simulator reconnected, superseding previous connection");
        }
        match remote {
            Some(addr) => info!(peer = %id, remote = %addr, "Simulator connected"),
            None => info!(peer = %id, "Simulator connected"),
        }

        self.state.send_replace(ConnectionState::Connected(id));
        id
    }

    /// Whether a peer is currently attached.
    pub fn is_connected(&self) -> bool {
        self.lock().is_some()
    }

    /// The current peer, if any.
    pub fn current_peer(&self) -> Option<PeerId> {
        self.lock().as_ref().map(|peer| peer.id)
    }

    /// Remote address of the current peer, if known.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.lock().as_ref().and_then(|peer| peer.remote)
    }

    /// Queue a text frame for the current peer.
    ///
    /// Returns the peer the frame was queued for. Fails immediately with
    /// [`ConnectionError::NotConnected`] when nobody is attached or the peer's
    /// socket task has already gone away.
    pub fn send(&self, text: String) -> Result<PeerId, ConnectionError> {
        let guard = self.lock();
        let peer = guard.as_ref().ok_or(ConnectionError::NotConnected)?;
        peer.outbound
            .send(Outgoing::Text(text))
            .map_err(|_| ConnectionError::NotConnected)?;
        Ok(peer.id)
    }

    /// Mark `peer` as gone.
    ///
    /// Returns `false` when `peer` was already superseded; the current
    /// connection is left untouched in that case.
    pub fn on_disconnect(&self, peer: PeerId) -> bool {
        let mut guard = self.lock();
        match guard.as_ref() {
            Some(current) if current.id == peer => {
                guard.take();
                drop(guard);
                info!(%peer, "Simulator disconnected");
                self.state.send_replace(ConnectionState::Disconnected);
                true
            }
            _ => {
                debug!(%peer, "Ignoring disconnect of superseded connection");
                false
            }
        }
    }

    /// Close the current connection, if any.
    pub fn close(&self) {
        if let Some(peer) = self.lock().take() {
            let _ = peer.outbound.send(Outgoing::Close);
            info!(peer = %peer.id, "Closing simulator connection");
            self.state.send_replace(ConnectionState::Disconnected);
        }
    }

    /// Subscribe to connection state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Wait until a peer is attached and return it.
    pub async fn wait_for_peer(&self) -> Result<PeerId, ConnectionError> {
        let mut state = self.subscribe();
        let connected = state
            .wait_for(|s| matches!(s, ConnectionState::Connected(_)))
            .await
            .map_err(|_| ConnectionError::Closed)?;
        match *connected {
            ConnectionState::Connected(peer) => Ok(peer),
            ConnectionState::Disconnected => Err(ConnectionError::NotConnected),
        }
    }
}
