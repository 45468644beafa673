// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! WebSocket server the simulator connects to.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::accept_async_with_config;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, info, instrument, warn};

use crate::connection::{ConnectionManager, Outgoing, PeerId};
use crate::frame::{FrameError, MAX_FRAME_SIZE};

/// Errors that can occur in the WebSocket server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind error: {0}")]
    Bind(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Receives every inbound text frame from the current peer.
pub trait InboundHandler: Send + Sync + 'static {
    fn on_text(&self, peer: PeerId, text: &str);
}

/// Configuration for the WebSocket server
#[derive(Debug, Clone)]
pub struct SimServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Keep-alive ping interval in milliseconds (0 to disable)
    pub ping_interval_ms: u64,
    /// How long to wait for a pong after a ping, in milliseconds
    pub ping_timeout_ms: u64,
    /// Largest accepted inbound message in bytes
    pub max_message_size: usize,
}

impl Default for SimServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8765)),
            ping_interval_ms: 20_000,
            ping_timeout_ms: 20_000,
            max_message_size: MAX_FRAME_SIZE,
        }
    }
}

impl SimServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Set the keep-alive ping interval and pong timeout.
    pub fn with_keep_alive(mut self, interval_ms: u64, timeout_ms: u64) -> Self {
        self.ping_interval_ms = interval_ms;
        self.ping_timeout_ms = timeout_ms;
        self
    }

    fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_message_size);
        config.max_frame_size = Some(self.max_message_size);
        config
    }
}

/// Listener for simulator connections.
pub struct SimServer {
    listener: TcpListener,
    config: SimServerConfig,
}

impl SimServer {
    /// Bind the listener.
    pub async fn bind(config: SimServerConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        info!(
            addr = %listener.local_addr()?,
            ping_interval_ms = config.ping_interval_ms,
            ping_timeout_ms = config.ping_timeout_ms,
            "WebSocket server bound"
        );
        Ok(Self { listener, config })
    }

    /// Get the server configuration
    pub fn config(&self) -> &SimServerConfig {
        &self.config
    }

    /// Get the local address the server is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever.
    ///
    /// Every accepted socket is installed as the current peer in
    /// `connections`, superseding the previous one.
    #[instrument(skip_all)]
    pub async fn run(
        self,
        connections: Arc<ConnectionManager>,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<(), ServerError> {
        info!("WebSocket server running");

        loop {
            let (stream, remote) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("failed to accept connection: {}", e);
                    continue;
                }
            };

            let connections = connections.clone();
            let handler = handler.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, remote, connections, handler, config).await
                {
                    warn!(%remote, "Connection ended with error: {}", e);
                }
            });
        }
    }
}

/// Handle one simulator socket from handshake to close.
#[instrument(skip(stream, connections, handler, config))]
async fn serve_connection(
    stream: TcpStream,
    remote: SocketAddr,
    connections: Arc<ConnectionManager>,
    handler: Arc<dyn InboundHandler>,
    config: SimServerConfig,
) -> Result<(), ServerError> {
    let ws = accept_async_with_config(stream, Some(config.websocket_config())).await?;
    let (tx, rx) = mpsc::unbounded_channel();
    let peer = connections.accept(tx, Some(remote));

    let result = pump(ws, peer, rx, handler.as_ref(), &config).await;
    connections.on_disconnect(peer);
    result
}

async fn pump(
    ws: tokio_tungstenite::WebSocketStream<TcpStream>,
    peer: PeerId,
    mut outbound: mpsc::UnboundedReceiver<Outgoing>,
    handler: &dyn InboundHandler,
    config: &SimServerConfig,
) -> Result<(), ServerError> {
    let (mut writer, mut reader) = ws.split();
    let mut keep_alive = keep_alive_interval(config.ping_interval_ms);
    let ping_timeout = Duration::from_millis(config.ping_timeout_ms);
    let mut awaiting_pong: Option<Instant> = None;

    loop {
        tokio::select! {
            outgoing = outbound.recv() => match outgoing {
                Some(Outgoing::Text(text)) => writer.send(Message::Text(text)).await?,
                Some(Outgoing::Close) => {
                    let _ = writer.send(Message::Close(None)).await;
                    break;
                }
                None => {
                    debug!(%peer, "Connection superseded, closing socket");
                    let _ = writer.send(Message::Close(None)).await;
                    break;
                }
            },
            inbound = reader.next() => match inbound {
                Some(Ok(Message::Text(text))) => handler.on_text(peer, &text),
                Some(Ok(Message::Binary(data))) => {
                    warn!(%peer, error = %FrameError::Binary(data.len()), "Dropping malformed frame");
                }
                Some(Ok(Message::Pong(_))) => awaiting_pong = None,
                // tungstenite answers pings itself on the next write
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => return Err(e.into()),
            },
            _ = next_tick(&mut keep_alive) => {
                match awaiting_pong {
                    Some(sent) if sent.elapsed() >= ping_timeout => {
                        warn!(%peer, timeout_ms = config.ping_timeout_ms, "Keep-alive pong not received, dropping connection");
                        break;
                    }
                    Some(_) => {}
                    None => {
                        writer.send(Message::Ping(Vec::new())).await?;
                        awaiting_pong = Some(Instant::now());
                    }
                }
            }
        }
    }

    Ok(())
}

fn keep_alive_interval(interval_ms: u64) -> Option<Interval> {
    if interval_ms == 0 {
        return None;
    }
    let period = Duration::from_millis(interval_ms);
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(interval)
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SimServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:8765".parse().unwrap());
        assert_eq!(config.ping_interval_ms, 20_000);
        assert_eq!(config.ping_timeout_ms, 20_000);
        assert_eq!(config.max_message_size, MAX_FRAME_SIZE);
    }

    #[test]
    fn test_config_builder() {
        let config = SimServerConfig::new("0.0.0.0:9000".parse().unwrap()).with_keep_alive(0, 5);
        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.ping_interval_ms, 0);
        assert_eq!(config.ping_timeout_ms, 5);
    }

    #[test]
    fn test_keep_alive_disabled() {
        assert!(keep_alive_interval(0).is_none());
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = SimServer::bind(SimServerConfig::new("127.0.0.1:0".parse().unwrap()))
            .await
            .unwrap();
        assert!(server.local_addr().unwrap().port() > 0);
    }

    #[test]
    fn test_server_error_display() {
        let err = ServerError::Bind(std::io::Error::other("address in use"));
        assert_eq!(err.to_string(), "bind error: address in use");
    }
}
