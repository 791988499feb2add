use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Largest accepted `data` field of an input frame, in encoded bytes
pub const MAX_INPUT_ENCODED_LEN: usize = 64 * 1024;

/// Size used for a resize frame that omits a dimension
pub const DEFAULT_COLS: i64 = 80;
pub const DEFAULT_ROWS: i64 = 24;

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Keyboard input, base64 encoded
    Input { data: String },
    Resize { cols: i64, rows: i64 },
    Ping,
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// PTY output, base64 encoded
    Output { data: String },
    /// The shell exited; `-1` when the exit status is unknown
    Exit { code: i32 },
    Pong,
    Error { message: String },
}

/// Failures reported to the client as `error` frames.
///
/// The display text is exactly what the client sees.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Invalid JSON")]
    InvalidJson,

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Invalid resize dimensions")]
    InvalidResize,

    #[error("Terminal not ready - send resize first")]
    NotReady,

    #[error("Input too large")]
    InputTooLarge,

    #[error("Invalid base64 data")]
    InvalidBase64,

    #[error("Failed to write to terminal")]
    WriteFailed,

    #[error("Failed to start terminal session")]
    StartFailed,
}

impl ClientMessage {
    /// Build an input frame carrying raw bytes
    pub fn input(bytes: &[u8]) -> Self {
        ClientMessage::Input {
            data: BASE64.encode(bytes),
        }
    }

    /// Parse one text frame.
    ///
    /// Lenient where clients commonly are: a missing `data` is empty input and
    /// missing dimensions fall back to 80x24. Dimensions that are present
    /// must be integers.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text).map_err(|_| ProtocolError::InvalidJson)?;
        let Value::Object(fields) = value else {
            return Err(ProtocolError::InvalidJson);
        };

        let kind = match fields.get("type") {
            Some(Value::String(kind)) => kind.as_str(),
            Some(Value::Null) | None => "None",
            Some(_) => return Err(ProtocolError::UnknownType(fields["type"].to_string())),
        };

        match kind {
            "ping" => Ok(ClientMessage::Ping),
            "input" => {
                let data = fields
                    .get("data")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Ok(ClientMessage::Input { data })
            }
            "resize" => {
                let cols = dimension(fields.get("cols"), DEFAULT_COLS)?;
                let rows = dimension(fields.get("rows"), DEFAULT_ROWS)?;
                Ok(ClientMessage::Resize { cols, rows })
            }
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

fn dimension(value: Option<&Value>, default: i64) -> Result<i64, ProtocolError> {
    match value {
        None => Ok(default),
        Some(value) => value.as_i64().ok_or(ProtocolError::InvalidResize),
    }
}

/// Check the size limit and decode an input payload
pub fn decode_input(data: &str) -> Result<Vec<u8>, ProtocolError> {
    if data.len() > MAX_INPUT_ENCODED_LEN {
        return Err(ProtocolError::InputTooLarge);
    }
    BASE64.decode(data).map_err(|_| ProtocolError::InvalidBase64)
}

impl ServerMessage {
    pub fn output(bytes: &[u8]) -> Self {
        ServerMessage::Output {
            data: BASE64.encode(bytes),
        }
    }

    pub fn exit(code: Option<i32>) -> Self {
        ServerMessage::Exit {
            code: code.unwrap_or(-1),
        }
    }

    pub fn error(err: &ProtocolError) -> Self {
        ServerMessage::Error {
            message: err.to_string(),
        }
    }

    /// Raw bytes of an output frame
    pub fn output_bytes(&self) -> Option<Vec<u8>> {
        match self {
            ServerMessage::Output { data } => BASE64.decode(data).ok(),
            _ => None,
        }
    }

    pub fn to_json(&self) -> String {
        // Serializing these variants cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}
