use crate::{ApprovalRequest, HistoryRecord, StreamEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

const KNOWN_KINDS: [&str; 4] = ["event", "history", "approval", "approval_decided"];

/// Frames pushed by the gateway over `/ws`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Event { event: StreamEvent },
    History { event: HistoryRecord },
    Approval { approval: ApprovalRequest },
    ApprovalDecided { approval: ApprovalRequest },
}

impl InboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::Event { .. } => "event",
            InboundMessage::History { .. } => "history",
            InboundMessage::Approval { .. } => "approval",
            InboundMessage::ApprovalDecided { .. } => "approval_decided",
        }
    }
}

/// A frame that parsed as JSON with a `type` tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Message(InboundMessage),
    /// Well-formed frame whose `type` this client does not handle.
    Unrecognized { kind: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame exceeds max size ({size} > {max})")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame has no string `type` field")]
    MissingType,
    #[error("decode error: {0}")]
    Decode(String),
}

pub fn decode_frame(frame: &[u8], max_frame_bytes: usize) -> Result<Decoded, FrameError> {
    if frame.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: frame.len(),
            max: max_frame_bytes,
        });
    }
    let value: Value =
        serde_json::from_slice(frame).map_err(|err| FrameError::Decode(err.to_string()))?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingType)?;
    if !KNOWN_KINDS.contains(&kind) {
        return Ok(Decoded::Unrecognized {
            kind: kind.to_string(),
        });
    }
    serde_json::from_value(value)
        .map(Decoded::Message)
        .map_err(|err| FrameError::Decode(err.to_string()))
}

pub fn encode_frame(message: &InboundMessage) -> Result<String, FrameError> {
    serde_json::to_string(message).map_err(|err| FrameError::Decode(err.to_string()))
}
