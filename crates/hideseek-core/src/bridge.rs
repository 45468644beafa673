// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request/response bridge over the push-based simulator channel.
//!
//! The simulator only ever pushes `observation` frames, with no request ids.
//! The bridge turns that into a blocking call by keeping a single pending slot:
//! a command is sent, and the first observation that arrives while the slot is
//! occupied resolves it.
//!
//! This correlation is sound only because callers never overlap calls. The
//! episode controller guarantees that by taking `&mut self`; the bridge rejects
//! a second concurrent call with [`BridgeError::CallInProgress`] rather than
//! queueing it.
//!
//! A call that expires (or is cancelled) after its command went out leaves a
//! reply owed by that peer. The next observation from the same peer pays that
//! debt and is discarded, so a late reply never resolves a later call. A new
//! peer starts with a clean slate.
//!
//! A call that absorbed an owed reply and then expires does not add a new
//! debt. Otherwise a peer that silently dropped one command would have every
//! later reply discarded.
//!
//! Only the peer a command was sent to can answer it. Frames still trickling
//! in from a superseded connection are dropped.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use hideseek_protocol::frame::{self, FrameError, InboundFrame};
use hideseek_protocol::{
    ConnectionManager, ConnectionState, InboundHandler, ObservationMessage, OutboundMessage, PeerId,
};
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Default deadline for a `reset` or `step` call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// The two commands that expect an `observation` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Reset,
    Step,
}

impl RequestKind {
    pub fn of(message: &OutboundMessage) -> Self {
        match message {
            OutboundMessage::Reset { .. } => Self::Reset,
            OutboundMessage::Step { .. } => Self::Step,
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reset => f.write_str("reset"),
            Self::Step => f.write_str("step"),
        }
    }
}

/// Errors surfaced by [`Bridge::call`].
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("cannot send {kind}: no simulator connected")]
    NotConnected { kind: RequestKind },

    #[error("{kind} timed out after {timeout_ms}ms")]
    Timeout { kind: RequestKind, timeout_ms: u64 },

    #[error("simulator disconnected while waiting for {kind} reply")]
    Disconnected { kind: RequestKind },

    #[error("{kind} issued while a {pending} call is still outstanding")]
    CallInProgress {
        kind: RequestKind,
        pending: RequestKind,
    },

    #[error("failed to encode {kind} command: {source}")]
    Encode {
        kind: RequestKind,
        #[source]
        source: FrameError,
    },
}

impl BridgeError {
    /// Whether the error means the peer is gone (as opposed to slow).
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::NotConnected { .. } | Self::Disconnected { .. })
    }
}

struct PendingRequest {
    seq: u64,
    kind: RequestKind,
    peer: PeerId,
    deadline: Instant,
    reply: oneshot::Sender<ObservationMessage>,
    absorbed_late_reply: bool,
}

struct OwedReplies {
    peer: PeerId,
    count: u32,
}

#[derive(Default)]
struct Slot {
    pending: Option<PendingRequest>,
    next_seq: u64,
    owed: Option<OwedReplies>,
}

/// Synchronous-call facade over the current simulator connection.
pub struct Bridge {
    connections: Arc<ConnectionManager>,
    slot: Mutex<Slot>,
}

impl Bridge {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self {
            connections,
            slot: Mutex::new(Slot::default()),
        }
    }

    /// The connection manager this bridge sends through.
    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Kind of the call currently waiting for a reply, if any.
    pub fn pending_kind(&self) -> Option<RequestKind> {
        self.lock().pending.as_ref().map(|pending| pending.kind)
    }

    /// Send `message` and wait for the matching observation.
    ///
    /// Fails fast with [`BridgeError::NotConnected`] when no peer is attached.
    /// Otherwise resolves with the first observation to arrive before
    /// `timeout` elapses, or with `Timeout` / `Disconnected`.
    pub async fn call(
        &self,
        message: &OutboundMessage,
        timeout: Duration,
    ) -> Result<ObservationMessage, BridgeError> {
        let kind = RequestKind::of(message);
        let text = frame::encode(message).map_err(|source| BridgeError::Encode { kind, source })?;

        // Subscribe before sending so a drop right after the send is not missed.
        let mut state = self.connections.subscribe();
        let deadline = Instant::now() + timeout;
        let (reply_tx, mut reply_rx) = oneshot::channel();

        // Send under the slot lock so a fast reply always finds the pending
        // request with its peer already recorded.
        let (seq, peer) = {
            let mut slot = self.lock();
            if let Some(pending) = &slot.pending {
                return Err(BridgeError::CallInProgress {
                    kind,
                    pending: pending.kind,
                });
            }
            let peer = self
                .connections
                .send(text)
                .map_err(|_| BridgeError::NotConnected { kind })?;
            slot.next_seq += 1;
            let seq = slot.next_seq;
            slot.pending = Some(PendingRequest {
                seq,
                kind,
                peer,
                deadline,
                reply: reply_tx,
                absorbed_late_reply: false,
            });
            (seq, peer)
        };
        let _guard = PendingGuard { bridge: self, seq };
        debug!(%peer, %kind, "Command sent, waiting for observation");

        let wait = async {
            tokio::select! {
                biased;
                reply = &mut reply_rx => reply.map_err(|_| BridgeError::Disconnected { kind }),
                _ = peer_lost(&mut state, peer) => Err(BridgeError::Disconnected { kind }),
            }
        };

        let outcome = tokio::time::timeout_at(deadline, wait).await;
        match outcome {
            Ok(result) => {
                if let Err(e) = &result {
                    warn!(%peer, %kind, "Call failed: {}", e);
                }
                result
            }
            // A reply that won the race against the deadline still counts.
            Err(_) => reply_rx.try_recv().map_err(|_| {
                let timeout_ms = timeout.as_millis() as u64;
                warn!(%peer, %kind, timeout_ms, "No observation before deadline");
                BridgeError::Timeout { kind, timeout_ms }
            }),
        }
    }

    fn resolve(&self, peer: PeerId, observation: ObservationMessage) {
        let mut slot = self.lock();

        if let Some(owed) = slot.owed.as_mut()
            && owed.peer == peer
        {
            owed.count = owed.count.saturating_sub(1);
            let remaining = owed.count;
            if remaining == 0 {
                slot.owed = None;
            }
            if let Some(pending) = slot.pending.as_mut()
                && pending.peer == peer
            {
                pending.absorbed_late_reply = true;
            }
            warn!(%peer, remaining, "Discarding late observation owed to an expired call");
            return;
        }

        match &slot.pending {
            None => {
                warn!(%peer, "Discarding observation with no pending request");
                return;
            }
            Some(pending) if pending.peer != peer => {
                warn!(
                    %peer,
                    expected = %pending.peer,
                    kind = %pending.kind,
                    "Discarding observation from a superseded connection"
                );
                return;
            }
            Some(_) => {}
        }
        let Some(pending) = slot.pending.take() else {
            return;
        };

        if Instant::now() > pending.deadline {
            warn!(%peer, kind = %pending.kind, "Discarding observation that arrived after the deadline");
            return;
        }

        if pending.reply.send(observation).is_err() {
            warn!(%peer, kind = %pending.kind, "Caller stopped waiting, discarding observation");
        }
    }
}

impl InboundHandler for Bridge {
    fn on_text(&self, peer: PeerId, text: &str) {
        match frame::decode(text) {
            Ok(InboundFrame::Observation(observation)) => self.resolve(peer, observation),
            Ok(InboundFrame::Other(kind)) => debug!(%peer, kind = %kind, "Ignoring message"),
            Err(e) => warn!(%peer, error = %e, "Dropping malformed frame"),
        }
    }
}

/// Clears the pending slot when a call finishes, times out or is cancelled.
struct PendingGuard<'a> {
    bridge: &'a Bridge,
    seq: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.bridge.lock();
        let Some(pending) = slot.pending.take_if(|p| p.seq == self.seq) else {
            return;
        };

        // The command went out but its reply was never consumed.
        if !pending.absorbed_late_reply {
            let peer = pending.peer;
            match &mut slot.owed {
                Some(owed) if owed.peer == peer => owed.count = owed.count.saturating_add(1),
                owed => *owed = Some(OwedReplies { peer, count: 1 }),
            }
        }
    }
}

async fn peer_lost(state: &mut watch::Receiver<ConnectionState>, peer: PeerId) {
    let _ = state
        .wait_for(|s| *s != ConnectionState::Connected(peer))
        .await;
}
