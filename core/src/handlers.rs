//! Host-Side Handlers.
//!
//! One [`Handler`] impl per wire command. Handlers never touch sockets or
//! the dispatcher queue directly — they receive validated params and a
//! `&dyn HostRuntime` and return a JSON result or a [`CoreError`].

use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::error::CoreError;
use crate::host::{object_to_json, HostRuntime};
use crate::proto::{decode_base64, encode_base64};
use crate::registry::{CommandSchema, Handler, ParamSchema, ParamType};

fn bool_param(params: &Map<String, Value>, name: &str, default: bool) -> bool {
    params.get(name).and_then(Value::as_bool).unwrap_or(default)
}

/// `get_scene_info` — summarizes the active scene: name and every object in
/// it.
pub struct GetSceneInfo {
    schema: CommandSchema,
}

impl GetSceneInfo {
    pub fn new() -> Arc<dyn Handler> {
        Arc::new(GetSceneInfo {
            schema: CommandSchema {
                name: "get_scene_info",
                description: "Summarize the active scene: its name and every object in it.",
                params: vec![],
            },
        })
    }
}

impl Handler for GetSceneInfo {
    fn schema(&self) -> &CommandSchema {
        &self.schema
    }

    fn call(&self, host: &dyn HostRuntime, _params: &Map<String, Value>) -> Result<Value, CoreError> {
        let objects: Vec<Value> = host
            .list_objects()
            .iter()
            .map(|object| {
                json!({
                    "name": object.name,
                    "type": object.object_type,
                    "location": object.location,
                })
            })
            .collect();
        let summary = host.scene_summary();
        Ok(json!({
            "name": host.scene_name(),
            "object_count": objects.len(),
            "objects": objects,
            "materials_count": summary.materials_count,
            "frame_current": summary.frame_current,
            "frame_start": summary.frame_start,
            "frame_end": summary.frame_end,
        }))
    }
}

/// `get_object_info` — details for one named object.
pub struct GetObjectInfo {
    schema: CommandSchema,
}

impl GetObjectInfo {
    pub fn new() -> Arc<dyn Handler> {
        Arc::new(GetObjectInfo {
            schema: CommandSchema {
                name: "get_object_info",
                description: "Look up one object in the active scene by name.",
                params: vec![ParamSchema::required("name", ParamType::String, "object name")],
            },
        })
    }
}

impl Handler for GetObjectInfo {
    fn schema(&self) -> &CommandSchema {
        &self.schema
    }

    fn call(&self, host: &dyn HostRuntime, params: &Map<String, Value>) -> Result<Value, CoreError> {
        let name = params["name"].as_str().unwrap();
        let object = host
            .get_object(name)
            .ok_or_else(|| CoreError::NotFound(format!("no object named '{name}'")))?;
        Ok(object_to_json(&object))
    }
}

/// `execute_code` — runs a script against the host's scripting runtime.
/// `code_is_base64` / `return_as_base64` control wire encoding of the source
/// and of stdout/stderr respectively.
pub struct ExecuteCode {
    schema: CommandSchema,
}

impl ExecuteCode {
    pub fn new() -> Arc<dyn Handler> {
        Arc::new(ExecuteCode {
            schema: CommandSchema {
                name: "execute_code",
                description: "Run a script against the host scripting runtime and capture stdout/stderr.",
                params: vec![
                    ParamSchema::required("code", ParamType::String, "source to execute"),
                    ParamSchema::optional("code_is_base64", ParamType::Bool, "code is base64-encoded"),
                    ParamSchema::optional(
                        "return_as_base64",
                        ParamType::Bool,
                        "base64-encode stdout/stderr in the result",
                    ),
                ],
            },
        })
    }
}

impl Handler for ExecuteCode {
    fn schema(&self) -> &CommandSchema {
        &self.schema
    }

    fn call(&self, host: &dyn HostRuntime, params: &Map<String, Value>) -> Result<Value, CoreError> {
        let raw_code = params["code"].as_str().unwrap();
        let code_is_base64 = bool_param(params, "code_is_base64", false);
        let return_as_base64 = bool_param(params, "return_as_base64", false);

        let source = if code_is_base64 {
            decode_base64(raw_code)?
        } else {
            raw_code.to_string()
        };

        let outcome = host.execute_code(&source)?;

        // `result` is, by convention, the captured stdout.
        // A raised exception's text is appended to captured stderr rather
        // than surfaced as a separate field — the script still ran and
        // produced whatever output it produced before failing.
        let stderr = match &outcome.error {
            Some(err) if outcome.stderr.is_empty() => err.clone(),
            Some(err) => format!("{}\n{}", outcome.stderr, err),
            None => outcome.stderr,
        };

        let result = if return_as_base64 {
            encode_base64(&outcome.stdout)
        } else {
            outcome.stdout.clone()
        };

        Ok(json!({
            "executed": true,
            "result": result,
            "output": { "stdout": outcome.stdout, "stderr": stderr },
            "duration": outcome.duration.as_secs_f64(),
            "result_is_base64": return_as_base64,
        }))
    }
}

/// `get_viewport_screenshot` — GUI-only. Writes a downscaled frame to a
/// UUID-named temp file and returns its path; the binary is never inlined in
/// the JSON response.
pub struct GetViewportScreenshot {
    schema: CommandSchema,
}

impl GetViewportScreenshot {
    pub fn new() -> Arc<dyn Handler> {
        Arc::new(GetViewportScreenshot {
            schema: CommandSchema {
                name: "get_viewport_screenshot",
                description: "Capture the active viewport and write it to a temp file (GUI mode only).",
                params: vec![
                    ParamSchema::optional(
                        "max_size",
                        ParamType::Number,
                        "maximum width/height in pixels, aspect ratio preserved",
                    ),
                    ParamSchema::optional("format", ParamType::String, "'png' (default) or 'jpeg'"),
                    ParamSchema::optional(
                        "filepath",
                        ParamType::String,
                        "destination path; a UUID-named temp file is used if omitted",
                    ),
                ],
            },
        })
    }
}

impl Handler for GetViewportScreenshot {
    fn schema(&self) -> &CommandSchema {
        &self.schema
    }

    fn call(&self, host: &dyn HostRuntime, params: &Map<String, Value>) -> Result<Value, CoreError> {
        let max_size = params
            .get("max_size")
            .and_then(Value::as_u64)
            .unwrap_or(800) as u32;
        let format = match params.get("format").and_then(Value::as_str) {
            Some(tag) => crate::host::ImageFormat::parse(tag)
                .ok_or_else(|| CoreError::InvalidParams(format!("unsupported image format '{tag}'")))?,
            None => crate::host::ImageFormat::default(),
        };
        let filepath = params.get("filepath").and_then(Value::as_str).map(std::path::Path::new);

        let frame = host.capture_viewport(max_size, format, filepath)?;
        Ok(json!({
            "filepath": frame.path.to_string_lossy(),
            "width": frame.width,
            "height": frame.height,
        }))
    }
}

/// `server_shutdown` — requests that the connection server begin a
/// graceful drain. The response is sent before the drain completes.
pub struct ServerShutdown {
    schema: CommandSchema,
}

impl ServerShutdown {
    pub fn new() -> Arc<dyn Handler> {
        Arc::new(ServerShutdown {
            schema: CommandSchema {
                name: "server_shutdown",
                description: "Request a graceful shutdown of the connection server.",
                params: vec![],
            },
        })
    }
}

impl Handler for ServerShutdown {
    fn schema(&self) -> &CommandSchema {
        &self.schema
    }

    fn call(&self, host: &dyn HostRuntime, _params: &Map<String, Value>) -> Result<Value, CoreError> {
        host.request_shutdown();
        Ok(json!({ "accepted": true }))
    }
}

/// Build a registry with every handler registered.
pub fn build_registry() -> crate::registry::CommandRegistry {
    let mut registry = crate::registry::CommandRegistry::new();
    for handler in [
        GetSceneInfo::new(),
        GetObjectInfo::new(),
        ExecuteCode::new(),
        GetViewportScreenshot::new(),
        ServerShutdown::new(),
    ] {
        registry.register(handler);
    }
    registry
}
