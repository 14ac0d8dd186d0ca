//! Model-context adapter: reads JSON-RPC 2.0 requests from stdin, writes
//! responses to stdout, and fulfills each tool call with a fresh TCP
//! connection to a blender-mcp-core connection server.

mod cli;
mod client;
mod error;
mod rpc;
mod tools;

use std::io::{BufRead, Write};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use blender_mcp_core::registry::CommandSchema;
use clap::Parser;
use serde_json::{json, Map, Value};
use tracing_subscriber::EnvFilter;

use cli::Cli;
use client::CoreClient;
use rpc::{JsonRpcRequest, JsonRpcResponse, INVALID_PARAMS, METHOD_NOT_FOUND, PARSE_ERROR};

struct Adapter {
    client: CoreClient,
    schemas: Vec<CommandSchema>,
}

impl Adapter {
    fn schema_refs(&self) -> Vec<&CommandSchema> {
        self.schemas.iter().collect()
    }

    fn handle(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        match request.method.as_str() {
            "initialize" => Some(JsonRpcResponse::success(
                request.id,
                json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": "blender-mcp-adapter", "version": env!("CARGO_PKG_VERSION") },
                }),
            )),
            "notifications/initialized" => None,
            "tools/list" => {
                let tools = tools::all_tool_descriptors(&self.schema_refs());
                Some(JsonRpcResponse::success(request.id, json!({ "tools": tools })))
            }
            "tools/call" => Some(self.handle_call(request)),
            other => Some(JsonRpcResponse::error(
                request.id,
                METHOD_NOT_FOUND,
                format!("method not found: {other}"),
            )),
        }
    }

    fn handle_call(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let id = request.id.clone();
        let params = match request.params {
            Some(p) => p,
            None => return JsonRpcResponse::error(id, INVALID_PARAMS, "missing params"),
        };
        let name = match params.get("name").and_then(Value::as_str) {
            Some(n) => n.to_string(),
            None => return JsonRpcResponse::error(id, INVALID_PARAMS, "missing tool name"),
        };
        let arguments = params
            .get("arguments")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        match name.as_str() {
            "mcp_search_tools" => {
                let query = arguments.get("query").and_then(Value::as_str).unwrap_or("");
                let hits = tools::search_tools(&self.schema_refs(), query);
                text_result(id, &json!({ "tools": hits }))
            }
            "mcp_tool_help" => {
                let tool_name = arguments.get("name").and_then(Value::as_str).unwrap_or("");
                match tools::tool_help(&self.schema_refs(), tool_name) {
                    Some(descriptor) => text_result(id, &descriptor),
                    None => error_result(id, format!("no such tool '{tool_name}'")),
                }
            }
            "execute_code" => self.call_execute_code(id, arguments),
            "get_viewport_screenshot" => self.call_viewport_screenshot(id, arguments),
            _ => self.call_passthrough(id, &name, arguments),
        }
    }

    fn call_passthrough(&self, id: Option<Value>, command: &str, arguments: Map<String, Value>) -> JsonRpcResponse {
        match self.client.call(command, arguments) {
            Ok(result) => text_result(id, &result),
            Err(err) => error_result(id, err.to_string()),
        }
    }

    /// Defaults `code_is_base64`/`return_as_base64` to true unless the
    /// caller set them explicitly, then decodes the stdout/stderr back to
    /// plain text for the MCP tool result.
    fn call_execute_code(&self, id: Option<Value>, mut arguments: Map<String, Value>) -> JsonRpcResponse {
        let code = match arguments.get("code").and_then(Value::as_str) {
            Some(c) => c.to_string(),
            None => return JsonRpcResponse::error(id, INVALID_PARAMS, "missing 'code' argument"),
        };

        let wants_base64_in = arguments
            .get("code_is_base64")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let wants_base64_out = arguments
            .get("return_as_base64")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        arguments.insert(
            "code".to_string(),
            json!(if wants_base64_in { BASE64.encode(code.as_bytes()) } else { code }),
        );
        arguments.insert("code_is_base64".to_string(), json!(wants_base64_in));
        arguments.insert("return_as_base64".to_string(), json!(wants_base64_out));

        match self.client.call("execute_code", arguments) {
            Ok(mut result) => {
                // `output.stdout`/`output.stderr` are always raw text; only
                // `result` is ever base64-wrapped, so that's the one field
                // the adapter unwraps before handing the tool-call reply
                // back to the model.
                if wants_base64_out {
                    if let Some(encoded) = result.get("result").and_then(Value::as_str) {
                        if let Ok(bytes) = BASE64.decode(encoded) {
                            if let Ok(decoded) = String::from_utf8(bytes) {
                                result["result"] = json!(decoded);
                                result["result_is_base64"] = json!(false);
                            }
                        }
                    }
                }
                text_result(id, &result)
            }
            Err(err) => error_result(id, err.to_string()),
        }
    }

    /// Reads the temp file blender-mcp-core wrote, base64-encodes it as the
    /// tool's binary content, and deletes the file — the adapter owns
    /// artifact cleanup for the viewport-screenshot hand-off.
    fn call_viewport_screenshot(&self, id: Option<Value>, arguments: Map<String, Value>) -> JsonRpcResponse {
        let outcome = match self.client.call("get_viewport_screenshot", arguments) {
            Ok(result) => result,
            Err(err) => return error_result(id, err.to_string()),
        };

        let path = match outcome.get("filepath").and_then(Value::as_str) {
            Some(p) => p.to_string(),
            None => return error_result(id, "core response is missing 'filepath'"),
        };

        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) => return error_result(id, format!("failed to read viewport frame: {e}")),
        };
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::warn!(path, error = %e, "failed to delete viewport artifact after reading it");
        }

        let mime_type = if path.ends_with(".jpeg") || path.ends_with(".jpg") {
            "image/jpeg"
        } else {
            "image/png"
        };

        JsonRpcResponse::success(
            id,
            json!({
                "content": [{
                    "type": "image",
                    "data": BASE64.encode(&bytes),
                    "mimeType": mime_type,
                }],
            }),
        )
    }
}

fn text_result(id: Option<Value>, value: &Value) -> JsonRpcResponse {
    let text = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    JsonRpcResponse::success(
        id,
        json!({ "content": [{ "type": "text", "text": text }] }),
    )
}

fn error_result(id: Option<Value>, message: impl Into<String>) -> JsonRpcResponse {
    JsonRpcResponse::success(
        id,
        json!({ "content": [{ "type": "text", "text": message.into() }], "isError": true }),
    )
}

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    tracing::debug!(
        mcp_host = cli.mcp_host.as_str(),
        mcp_port = cli.mcp_port,
        "non-stdio MCP transport is not implemented; --mcp-host/--mcp-port are accepted for forward compatibility but unused"
    );

    tracing::info!(
        blender_host = cli.blender_host.as_str(),
        blender_port = cli.blender_port,
        "blender-mcp-adapter starting"
    );

    let schemas: Vec<CommandSchema> = blender_mcp_core::handlers::build_registry()
        .list_commands()
        .into_iter()
        .cloned()
        .collect();
    let adapter = Adapter {
        client: CoreClient::new(&cli.blender_host, cli.blender_port),
        schemas,
    };

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, "failed to read stdin");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<JsonRpcRequest>(&line) {
            Ok(request) => {
                tracing::debug!(method = request.method.as_str(), "handling request");
                adapter.handle(request)
            }
            Err(e) => Some(JsonRpcResponse::error(None, PARSE_ERROR, format!("parse error: {e}"))),
        };

        if let Some(response) = response {
            if let Ok(text) = serde_json::to_string(&response) {
                let _ = writeln!(out, "{text}");
                let _ = out.flush();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tools_list_includes_meta_tools() {
        let schemas: Vec<CommandSchema> = blender_mcp_core::handlers::build_registry()
            .list_commands()
            .into_iter()
            .cloned()
            .collect();
        let adapter = Adapter {
            client: CoreClient::new("127.0.0.1", 1),
            schemas,
        };
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Some(json!(1)),
            method: "tools/list".to_string(),
            params: None,
        };
        let response = adapter.handle(request).unwrap();
        let json_text = serde_json::to_string(&response).unwrap();
        assert!(json_text.contains("mcp_search_tools"));
        assert!(json_text.contains("get_scene_info"));
    }

    #[test]
    fn unknown_method_is_method_not_found() {
        let adapter = Adapter {
            client: CoreClient::new("127.0.0.1", 1),
            schemas: Vec::new(),
        };
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: "not/a/method".to_string(),
            params: None,
        };
        let response = adapter.handle(request).unwrap();
        let json_text = serde_json::to_string(&response).unwrap();
        assert!(json_text.contains("-32601"));
    }
}
