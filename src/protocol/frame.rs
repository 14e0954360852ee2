//! Terminal session frame definitions
//!
//! Defines the frames exchanged between a terminal client and the relay.
//! Every frame is one JSON object tagged by its `type` field and travels as
//! a single WebSocket text message.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum terminal dimensions
pub const MAX_TERMINAL_COLS: u16 = 500;
pub const MAX_TERMINAL_ROWS: u16 = 200;

/// Default terminal dimensions
pub const DEFAULT_TERMINAL_COLS: u16 = 80;
pub const DEFAULT_TERMINAL_ROWS: u16 = 24;

/// Maximum input length (1MB)
pub const MAX_INPUT_LENGTH: usize = 1024 * 1024;

/// Exit code reported when the process could not be spawned at all
pub const SPAWN_FAILED_EXIT_CODE: i32 = -1;

/// Type tags understood by this version of the protocol
const KNOWN_TYPES: &[&str] = &[
    "input",
    "resize",
    "restart",
    "output",
    "connected",
    "exit",
    "error",
];

// ============================================================================
// Error Types
// ============================================================================

/// Frame decoding and encoding errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("Frame has no type tag")]
    MissingType,

    #[error("Unknown frame type: {0}")]
    UnknownType(String),

    #[error("Invalid {frame_type} frame: {source}")]
    InvalidFields {
        frame_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("JSON serialization error: {0}")]
    SerializationError(#[source] serde_json::Error),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Frames
// ============================================================================

/// Which way a frame travels over the socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Sent by the terminal client, consumed by the relay
    ClientToRelay,
    /// Sent by the relay, consumed by the terminal client
    RelayToClient,
}

/// One message on the terminal session socket
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    /// Raw keystrokes, including control sequences
    Input { data: String },

    /// New terminal dimensions
    Resize { cols: u16, rows: u16 },

    /// Ask the relay to replace the running process
    Restart,

    /// Raw process output (terminal-escaped text)
    Output { data: String },

    /// The process is running and the socket is attached to it
    #[serde(rename_all = "camelCase")]
    Connected {
        project_name: String,
        project_path: String,
        /// Set when announcing an already-running process to a reconnecting client
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        reattached: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
    },

    /// The process exited
    #[serde(rename_all = "camelCase")]
    Exit { exit_code: i32 },

    /// Human-readable failure report
    Error { message: String },
}

impl Frame {
    /// Create an Input frame
    pub fn input(data: impl Into<String>) -> Self {
        Frame::Input { data: data.into() }
    }

    /// Create a Resize frame
    pub fn resize(cols: u16, rows: u16) -> Self {
        Frame::Resize { cols, rows }
    }

    /// Create an Output frame
    pub fn output(data: impl Into<String>) -> Self {
        Frame::Output { data: data.into() }
    }

    /// Create a Connected frame for a freshly spawned process
    pub fn connected(project_name: impl Into<String>, project_path: impl Into<String>) -> Self {
        Frame::Connected {
            project_name: project_name.into(),
            project_path: project_path.into(),
            reattached: false,
            pid: None,
        }
    }

    /// Create an Exit frame
    pub fn exit(exit_code: i32) -> Self {
        Frame::Exit { exit_code }
    }

    /// Create an Error frame
    pub fn error(message: impl Into<String>) -> Self {
        Frame::Error {
            message: message.into(),
        }
    }

    /// The wire tag of this frame
    pub fn type_name(&self) -> &'static str {
        match self {
            Frame::Input { .. } => "input",
            Frame::Resize { .. } => "resize",
            Frame::Restart => "restart",
            Frame::Output { .. } => "output",
            Frame::Connected { .. } => "connected",
            Frame::Exit { .. } => "exit",
            Frame::Error { .. } => "error",
        }
    }

    /// Which side of the socket is allowed to send this frame
    pub fn direction(&self) -> Direction {
        match self {
            Frame::Input { .. } | Frame::Resize { .. } | Frame::Restart => Direction::ClientToRelay,
            Frame::Output { .. }
            | Frame::Connected { .. }
            | Frame::Exit { .. }
            | Frame::Error { .. } => Direction::RelayToClient,
        }
    }

    /// Validate payload ranges
    pub fn validate(&self) -> ProtocolResult<()> {
        match self {
            Frame::Input { data } => {
                if data.len() > MAX_INPUT_LENGTH {
                    return Err(ProtocolError::ValidationError(format!(
                        "input exceeds maximum length of {} bytes",
                        MAX_INPUT_LENGTH
                    )));
                }
                Ok(())
            }

            Frame::Resize { cols, rows } => {
                if *cols == 0 || *cols > MAX_TERMINAL_COLS {
                    return Err(ProtocolError::ValidationError(format!(
                        "cols must be between 1 and {}",
                        MAX_TERMINAL_COLS
                    )));
                }
                if *rows == 0 || *rows > MAX_TERMINAL_ROWS {
                    return Err(ProtocolError::ValidationError(format!(
                        "rows must be between 1 and {}",
                        MAX_TERMINAL_ROWS
                    )));
                }
                Ok(())
            }

            _ => Ok(()),
        }
    }

    /// Serialize the frame to its wire text
    pub fn encode(&self) -> ProtocolResult<String> {
        serde_json::to_string(self).map_err(ProtocolError::SerializationError)
    }

    /// Parse and validate a frame from its wire text
    ///
    /// Fields this version does not know about are ignored so that newer
    /// peers can add them without breaking older ones.
    pub fn decode(text: &str) -> ProtocolResult<Self> {
        let value: serde_json::Value = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;

        let frame_type = match value.get("type").and_then(|t| t.as_str()) {
            Some(t) => t.to_string(),
            None => return Err(ProtocolError::MissingType),
        };
        if !KNOWN_TYPES.contains(&frame_type.as_str()) {
            return Err(ProtocolError::UnknownType(frame_type));
        }

        let frame: Frame = serde_json::from_value(value)
            .map_err(|source| ProtocolError::InvalidFields { frame_type, source })?;
        frame.validate()?;
        Ok(frame)
    }
}

// ============================================================================
// Tests
// ============================================================================
