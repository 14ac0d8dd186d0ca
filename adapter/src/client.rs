//! A fresh TCP connection to blender-mcp-core per tool call.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::error::{AdapterError, AdapterResult};

const IO_TIMEOUT: Duration = Duration::from_secs(60);

pub struct CoreClient {
    addr: String,
}

impl CoreClient {
    pub fn new(host: &str, port: u16) -> Self {
        CoreClient {
            addr: format!("{host}:{port}"),
        }
    }

    /// Open one connection, send `{type, params}`, read the single JSON
    /// reply, and unwrap it into `Ok(result)` or `Err(AdapterError::Core)`.
    pub fn call(&self, command_type: &str, params: Map<String, Value>) -> AdapterResult<Value> {
        let mut stream = TcpStream::connect(&self.addr).map_err(|e| AdapterError::Transport {
            addr: self.addr.clone(),
            source: e,
        })?;
        stream
            .set_read_timeout(Some(IO_TIMEOUT))
            .map_err(|e| AdapterError::Transport {
                addr: self.addr.clone(),
                source: e,
            })?;
        stream
            .set_write_timeout(Some(IO_TIMEOUT))
            .map_err(|e| AdapterError::Transport {
                addr: self.addr.clone(),
                source: e,
            })?;

        let request = serde_json::json!({ "type": command_type, "params": Value::Object(params) });
        let body = serde_json::to_vec(&request)
            .map_err(|e| AdapterError::Protocol(format!("failed to encode request: {e}")))?;
        stream.write_all(&body).map_err(|e| AdapterError::Transport {
            addr: self.addr.clone(),
            source: e,
        })?;
        stream
            .shutdown(std::net::Shutdown::Write)
            .map_err(|e| AdapterError::Transport {
                addr: self.addr.clone(),
                source: e,
            })?;

        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).map_err(|e| AdapterError::Transport {
            addr: self.addr.clone(),
            source: e,
        })?;

        let response: Value = serde_json::from_slice(&raw)
            .map_err(|e| AdapterError::Protocol(format!("invalid JSON from core: {e}")))?;

        match response.get("status").and_then(Value::as_str) {
            Some("success") => Ok(response.get("result").cloned().unwrap_or(Value::Null)),
            Some("error") => {
                let message = response
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string();
                let source = response
                    .get("source")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown")
                    .to_string();
                Err(AdapterError::Core { source, message })
            }
            _ => Err(AdapterError::Protocol(
                "response is missing a recognized 'status' field".to_string(),
            )),
        }
    }
}
