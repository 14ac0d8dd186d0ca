//! `BlenderClient` — a thin wire-protocol client. Every call opens a fresh
//! connection by default, matching the connection server's one-request-per-
//! connection contract; see [`BlenderSession`] for the explicit
//! persistent-session form.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{Map, Value};

use crate::error::{SdkError, SdkResult};

const IO_TIMEOUT: Duration = Duration::from_secs(60);

/// Result of an `execute_code` call. `result` is the wire's canonical return
/// value (captured stdout, by convention); `stdout`/`stderr` are the raw
/// captured streams. `error` is `Some` whenever the script wrote to stderr
/// (a raised exception's traceback lands there).
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub result: String,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BlenderClient {
    host: String,
    port: u16,
}

impl BlenderClient {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        BlenderClient {
            host: host.into(),
            port,
        }
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Send a raw `{type, params}` command and return its `result` on
    /// success, or `SdkError::Remote` if the server replied with an error.
    pub fn send_command(&self, command_type: &str, params: Value) -> SdkResult<Value> {
        let addr = self.addr();
        let mut stream = TcpStream::connect(&addr).map_err(|e| SdkError::Transport {
            addr: addr.clone(),
            source: e,
        })?;
        stream.set_read_timeout(Some(IO_TIMEOUT)).ok();
        stream.set_write_timeout(Some(IO_TIMEOUT)).ok();

        let request = serde_json::json!({ "type": command_type, "params": params });
        let body = serde_json::to_vec(&request)
            .map_err(|e| SdkError::Protocol(format!("failed to encode request: {e}")))?;
        stream.write_all(&body).map_err(|e| SdkError::Transport {
            addr: addr.clone(),
            source: e,
        })?;
        stream.shutdown(std::net::Shutdown::Write).map_err(|e| SdkError::Transport {
            addr: addr.clone(),
            source: e,
        })?;

        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).map_err(|e| SdkError::Transport {
            addr: addr.clone(),
            source: e,
        })?;
        let response: Value = serde_json::from_slice(&raw)
            .map_err(|e| SdkError::Protocol(format!("invalid JSON from server: {e}")))?;

        match response.get("status").and_then(Value::as_str) {
            Some("success") => Ok(response.get("result").cloned().unwrap_or(Value::Null)),
            Some("error") => Err(SdkError::Remote {
                kind: response
                    .get("source")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown")
                    .to_string(),
                message: response
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            }),
            _ => Err(SdkError::Protocol("missing recognized 'status' field".to_string())),
        }
    }

    /// Run `source` against the host's scripting runtime. Transparently
    /// base64-wraps the request and unwraps the reply (the
    /// `code_is_base64`/`return_as_base64` pair) so callers can pass source
    /// containing embedded quotes or non-ASCII without worrying about JSON
    /// escaping, and get back plain text.
    pub fn execute_python(&self, source: &str) -> SdkResult<ExecutionResult> {
        let mut params = Map::new();
        params.insert("code".to_string(), Value::String(BASE64.encode(source)));
        params.insert("code_is_base64".to_string(), Value::Bool(true));
        params.insert("return_as_base64".to_string(), Value::Bool(true));
        let reply = self.send_command("execute_code", Value::Object(params))?;

        let output = reply.get("output");
        let stdout = output
            .and_then(|o| o.get("stdout"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let stderr = output
            .and_then(|o| o.get("stderr"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let encoded_result = reply.get("result").and_then(Value::as_str).unwrap_or_default();
        let result_bytes = BASE64
            .decode(encoded_result)
            .map_err(|e| SdkError::Protocol(format!("invalid base64 result: {e}")))?;
        let result = String::from_utf8(result_bytes)
            .map_err(|e| SdkError::Protocol(format!("result is not valid UTF-8: {e}")))?;

        let error = if stderr.is_empty() { None } else { Some(stderr.clone()) };

        Ok(ExecutionResult {
            result,
            stdout,
            stderr,
            error,
        })
    }

    pub fn get_scene_info(&self) -> SdkResult<Value> {
        self.send_command("get_scene_info", Value::Object(Map::new()))
    }

    pub fn get_object_info(&self, name: &str) -> SdkResult<Value> {
        let mut params = Map::new();
        params.insert("name".to_string(), Value::String(name.to_string()));
        self.send_command("get_object_info", Value::Object(params))
    }
}

/// An explicit persistent-session form: a `BlenderClient` remembered across
/// a longer-lived caller (e.g. a REPL), as opposed to constructing one per
/// call. The wire protocol itself is still one connection per command — the
/// connection server closes every connection after its single reply — so
/// "persistent" here means session-level state (the target host/port plus
/// any caller-attached context), not a kept-alive socket.
#[derive(Debug, Clone)]
pub struct BlenderSession {
    client: BlenderClient,
}

impl BlenderSession {
    pub fn connect(host: impl Into<String>, port: u16) -> Self {
        BlenderSession {
            client: BlenderClient::new(host, port),
        }
    }

    pub fn client(&self) -> &BlenderClient {
        &self.client
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blender_mcp_core::dispatcher::ExternallyDrivenStepper;
    use blender_mcp_core::host::NativeHost;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::Arc;

    fn test_server() -> (blender_mcp_core::Server, u16) {
        let registry = blender_mcp_core::handlers::build_registry();
        let host = Arc::new(NativeHost::headless());
        let server = blender_mcp_core::Server::new(registry, host, Arc::new(ExternallyDrivenStepper::new()));
        let addr = server
            .start(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
            .unwrap();
        (server, addr.port())
    }

    #[test]
    fn get_scene_info_round_trips() {
        let (server, port) = test_server();
        let client = BlenderClient::new("127.0.0.1", port);
        let info = client.get_scene_info().unwrap();
        assert_eq!(info["object_count"], 1);
        server.stop();
    }

    #[test]
    fn unknown_object_surfaces_as_remote_not_found() {
        let (server, port) = test_server();
        let client = BlenderClient::new("127.0.0.1", port);
        let err = client.get_object_info("DoesNotExist").unwrap_err();
        assert!(matches!(err, SdkError::Remote { kind, .. } if kind == "NotFound"));
        server.stop();
    }

    #[test]
    fn execute_python_returns_captured_stdout() {
        let (server, port) = test_server();
        let client = BlenderClient::new("127.0.0.1", port);
        let result = client.execute_python("print('hello from sdk')").unwrap();
        assert_eq!(result.stdout.trim(), "hello from sdk");
        assert!(result.error.is_none());
        server.stop();
    }

    #[test]
    fn transport_error_when_nothing_is_listening() {
        let client = BlenderClient::new("127.0.0.1", 1);
        let err = client.get_scene_info().unwrap_err();
        assert!(matches!(err, SdkError::Transport { .. }));
    }
}
