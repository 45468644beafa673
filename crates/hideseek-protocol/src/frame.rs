// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Text frame codec.
//!
//! Every WebSocket text frame carries exactly one JSON object with a string
//! `type` field. Frames are newline-free: `serde_json::to_string` never emits
//! a raw newline.

use serde_json::Value;
use thiserror::Error;

use crate::message::{ObservationMessage, OutboundMessage};

/// Maximum accepted frame size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Errors that can occur during frame encoding/decoding.
///
/// On the inbound path these are never surfaced to callers: the offending
/// frame is logged and dropped.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame has no string `type` field")]
    MissingType,

    #[error("binary frames are not part of the protocol ({0} bytes)")]
    Binary(usize),
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Reply to a `reset` or `step` command.
    Observation(ObservationMessage),
    /// Any other message type; logged and ignored by consumers.
    Other(String),
}

impl InboundFrame {
    /// Wire name of the frame type.
    pub fn kind(&self) -> &str {
        match self {
            Self::Observation(_) => "observation",
            Self::Other(kind) => kind,
        }
    }
}

/// Encode an outbound command as a single text frame.
pub fn encode(message: &OutboundMessage) -> Result<String, FrameError> {
    let text = serde_json::to_string(message)?;
    if text.len() > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge(text.len()));
    }
    Ok(text)
}

/// Decode an inbound text frame.
///
/// Unknown `type` values decode successfully as [`InboundFrame::Other`];
/// an `observation` frame with missing or mistyped fields is an error.
pub fn decode(text: &str) -> Result<InboundFrame, FrameError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge(text.len()));
    }

    let mut value: Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingType)?
        .to_string();

    if kind == "observation" {
        if let Some(object) = value.as_object_mut() {
            object.remove("type");
        }
        let observation: ObservationMessage = serde_json::from_value(value)?;
        Ok(InboundFrame::Observation(observation))
    } else {
        Ok(InboundFrame::Other(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_other_type() {
        let frame = decode(r#"{"type":"hello","version":2}"#).unwrap();
        assert_eq!(frame, InboundFrame::Other("hello".to_string()));
        assert_eq!(frame.kind(), "hello");
    }

    #[test]
    fn test_decode_missing_type() {
        let err = decode(r#"{"agents":[],"episode_done":false}"#).unwrap_err();
        assert!(matches!(err, FrameError::MissingType));

        let err = decode(r#"{"type":7}"#).unwrap_err();
        assert!(matches!(err, FrameError::MissingType));
    }

    #[test]
    fn test_decode_not_json() {
        let err = decode("definitely not json").unwrap_err();
        assert!(matches!(err, FrameError::Json(_)));
    }

    #[test]
    fn test_decode_observation_missing_field() {
        // `episode_done` missing
        let err = decode(r#"{"type":"observation","agents":[]}"#).unwrap_err();
        assert!(matches!(err, FrameError::Json(_)));
    }

    #[test]
    fn test_frame_error_display() {
        assert_eq!(
            FrameError::MissingType.to_string(),
            "frame has no string `type` field"
        );
        assert!(FrameError::FrameTooLarge(1).to_string().contains("max"));
    }

    #[test]
    fn test_encode_has_no_newlines() {
        let text = encode(&OutboundMessage::Reset { episode: 3 }).unwrap();
        assert!(!text.contains('\n'));
    }
}
