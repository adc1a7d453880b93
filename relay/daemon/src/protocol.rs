//! Wire protocol
//!
//! Every WebSocket text frame carries one JSON object tagged by `type`.
//! Outbound frames are serialized [`EgressMessage`]s.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use relay_core::{AckOutcome, EgressMessage, Priority};

/// Largest inbound frame the daemon will parse
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Frames a client may send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    /// Submit a prompt
    Chat {
        /// Prompt text
        prompt: String,
        /// Scheduling priority, higher first
        #[serde(default)]
        priority: Option<u8>,
    },
    /// Acknowledge an action request
    Ack {
        /// Correlation id from the action request
        correlation_id: String,
        /// Whether the command succeeded
        success: bool,
        /// Result or error text
        #[serde(default)]
        message: String,
    },
    /// Toggle conversation context
    Context {
        /// New setting
        enabled: bool,
    },
    /// Select the backend for later prompts; `null` restores the default
    Backend {
        /// Backend name
        #[serde(default)]
        name: Option<String>,
    },
}

impl InboundFrame {
    /// Priority of a chat frame, defaulting to normal
    #[must_use]
    pub fn priority(&self) -> Priority {
        match self {
            Self::Chat {
                priority: Some(p), ..
            } => Priority(*p),
            _ => Priority::NORMAL,
        }
    }
}

/// Why an inbound frame was rejected
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds [`MAX_FRAME_BYTES`]
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_BYTES} byte limit")]
    TooLarge(usize),

    /// Not a valid frame
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Chat frame without text
    #[error("chat prompt is empty")]
    EmptyPrompt,
}

/// Parse one inbound text frame
pub fn decode(text: &str) -> Result<InboundFrame, ProtocolError> {
    if text.len() > MAX_FRAME_BYTES {
        return Err(ProtocolError::TooLarge(text.len()));
    }
    let frame: InboundFrame = serde_json::from_str(text)?;
    if let InboundFrame::Chat { ref prompt, .. } = frame {
        if prompt.trim().is_empty() {
            return Err(ProtocolError::EmptyPrompt);
        }
    }
    Ok(frame)
}

/// Serialize one outbound message
pub fn encode(message: &EgressMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

/// Outcome carried by an ack frame
pub fn ack_outcome(success: bool, message: String) -> AckOutcome {
    if success {
        AckOutcome::Success(message)
    } else {
        AckOutcome::Failure(message)
    }
}
