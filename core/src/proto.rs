//! Framing & Codec.
//!
//! One JSON document per TCP message. The canonical reader accumulates bytes
//! in ≥64 KiB chunks and attempts a parse once the document looks
//! self-delimited (balanced `{`/`}`, non-zero). Total bytes per message are
//! capped at 10 MiB.

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;

/// Minimum chunk size requested per read.
pub const READ_CHUNK_BYTES: usize = 64 * 1024;
/// Hard cap on accumulated bytes for a single message.
pub const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;
/// Default per-operation I/O timeout.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(60);

/// A command request as it appears on the wire.
///
/// Both keys are optional; an absent `type` means "no operation" and an
/// absent `params` means empty params. Unknown top-level keys are ignored
/// (serde's default behavior for a struct without `deny_unknown_fields`).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CommandRequest {
    #[serde(rename = "type", default)]
    pub command_type: Option<String>,
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// Tagged success/error response.
#[derive(Debug, Clone)]
pub enum CommandResponse {
    Success {
        result: Value,
    },
    Error {
        message: String,
        result: Option<Value>,
        source: Option<String>,
    },
}

impl CommandResponse {
    pub fn success(result: Value) -> Self {
        CommandResponse::Success { result }
    }

    pub fn error(message: impl Into<String>, source: impl Into<String>) -> Self {
        CommandResponse::Error {
            message: message.into(),
            result: None,
            source: Some(source.into()),
        }
    }

    pub fn error_with_partial(
        message: impl Into<String>,
        source: impl Into<String>,
        result: Value,
    ) -> Self {
        CommandResponse::Error {
            message: message.into(),
            result: Some(result),
            source: Some(source.into()),
        }
    }

    pub fn from_core_error(err: &CoreError) -> Self {
        CommandResponse::error(err.to_string(), err.wire_kind())
    }
}

impl Serialize for CommandResponse {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;
        match self {
            CommandResponse::Success { result } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("status", "success")?;
                map.serialize_entry("result", result)?;
                map.end()
            }
            CommandResponse::Error {
                message,
                result,
                source,
            } => {
                let len = 2 + result.is_some() as usize + source.is_some() as usize;
                let mut map = serializer.serialize_map(Some(len))?;
                map.serialize_entry("status", "error")?;
                map.serialize_entry("message", message)?;
                if let Some(result) = result {
                    map.serialize_entry("result", result)?;
                }
                if let Some(source) = source {
                    map.serialize_entry("source", source)?;
                }
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for CommandResponse {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            status: String,
            #[serde(default)]
            result: Option<Value>,
            #[serde(default)]
            message: Option<String>,
            #[serde(default)]
            source: Option<String>,
        }
        let raw = Raw::deserialize(deserializer)?;
        match raw.status.as_str() {
            "success" => Ok(CommandResponse::Success {
                result: raw.result.unwrap_or(Value::Null),
            }),
            "error" => Ok(CommandResponse::Error {
                message: raw.message.unwrap_or_default(),
                result: raw.result,
                source: raw.source,
            }),
            other => Err(serde::de::Error::custom(format!(
                "unknown status discriminant: {other}"
            ))),
        }
    }
}

/// base64-encode an arbitrary UTF-8 string (the `code_is_base64`/
/// `return_as_base64` wire encoding).
pub fn encode_base64(s: &str) -> String {
    BASE64.encode(s.as_bytes())
}

/// Decode a base64 string back into UTF-8, failing with `DecodeError` on
/// invalid base64 or non-UTF-8 bytes.
pub fn decode_base64(s: &str) -> Result<String, CoreError> {
    let bytes = BASE64
        .decode(s.as_bytes())
        .map_err(|e| CoreError::DecodeError(format!("invalid base64: {e}")))?;
    String::from_utf8(bytes).map_err(|e| CoreError::DecodeError(format!("invalid utf-8: {e}")))
}

/// Read one self-delimited JSON document from `reader`.
///
/// Accumulates in ≥64 KiB chunks, attempting a parse once the buffer's brace
/// count balances at a non-zero depth. A clean EOF with an empty buffer
/// yields `Ok(None)` (the peer closed without sending another request); EOF
/// mid-message is `ConnectionClosed`.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<CommandRequest>, CoreError> {
    let mut buf: Vec<u8> = Vec::with_capacity(READ_CHUNK_BYTES);
    let mut chunk = [0u8; READ_CHUNK_BYTES];

    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => {
                if buf.is_empty() {
                    return Ok(None);
                }
                return Err(CoreError::ConnectionClosed);
            }
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                return Err(CoreError::Timeout);
            }
            Err(e) => return Err(CoreError::Io(e)),
        };

        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_FRAME_BYTES {
            return Err(CoreError::PayloadTooLarge);
        }

        if let Some(text) = std::str::from_utf8(&buf).ok() {
            let opens = text.matches('{').count();
            let closes = text.matches('}').count();
            if opens != 0 && opens == closes {
                match serde_json::from_str::<CommandRequest>(text) {
                    Ok(req) => return Ok(Some(req)),
                    Err(_) => continue, // not yet a complete/valid document; keep reading
                }
            }
        }
    }
}

/// Write one JSON document as the full reply (the sender then closes its
/// write half, or the connection is closed by the connection server after a
/// single request/response).
pub fn write_frame<W: Write>(writer: &mut W, response: &CommandResponse) -> Result<(), CoreError> {
    let json = serde_json::to_vec(response)
        .map_err(|e| CoreError::DecodeError(format!("failed to serialize response: {e}")))?;
    writer.write_all(&json).map_err(CoreError::Io)?;
    writer.flush().map_err(CoreError::Io)
}
