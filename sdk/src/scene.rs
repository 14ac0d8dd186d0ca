//! `SceneManager` — a convenience layer composing `execute_code` programs
//! against the host's injected scene-scripting functions (`mcp_add_object`,
//! `mcp_list_objects`, …) and parsing their sentinel-tagged stdout lines,
//! since the wire protocol itself exposes no dedicated "create object" /
//! "list objects" commands — the handler set is fixed and small by design.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;

use crate::client::BlenderClient;
use crate::error::{SdkError, SdkResult};

const OBJECTS_JSON_PREFIX: &str = "OBJECTS_JSON:";
const OBJECT_NAME_PREFIX: &str = "OBJECT_NAME:";
const OBJECT_ERROR_PREFIX: &str = "OBJECT_ERROR:";
const OBJECT_EXPORT_PREFIX: &str = "OBJECT_EXPORT_BASE64:";

pub struct SceneManager<'a> {
    client: &'a BlenderClient,
}

impl<'a> SceneManager<'a> {
    pub fn new(client: &'a BlenderClient) -> Self {
        SceneManager { client }
    }

    fn run_and_find_sentinel(&self, code: &str, prefix: &str) -> SdkResult<String> {
        let outcome = self.client.execute_python(code)?;
        if let Some(message) = outcome.error {
            return Err(SdkError::Protocol(format!("script execution failed: {message}")));
        }
        for line in outcome.stdout.lines() {
            if let Some(rest) = line.strip_prefix(OBJECT_ERROR_PREFIX) {
                return Err(SdkError::Remote {
                    kind: "SceneManagerError".to_string(),
                    message: rest.to_string(),
                });
            }
            if let Some(rest) = line.strip_prefix(prefix) {
                return Ok(rest.to_string());
            }
        }
        Err(SdkError::Protocol(format!(
            "script stdout did not contain a '{prefix}' line"
        )))
    }

    /// Every object currently in the scene, as parsed JSON.
    pub fn list_objects(&self) -> SdkResult<Vec<Value>> {
        let payload = self.run_and_find_sentinel(
            &format!("print('{OBJECTS_JSON_PREFIX}' + mcp_list_objects())"),
            OBJECTS_JSON_PREFIX,
        )?;
        let parsed: Value = serde_json::from_str(&payload)
            .map_err(|e| SdkError::Protocol(format!("invalid OBJECTS_JSON payload: {e}")))?;
        Ok(parsed.as_array().cloned().unwrap_or_default())
    }

    pub fn create_object(&self, name: &str, object_type: &str) -> SdkResult<String> {
        let code = format!(
            "mcp_add_object({name:?}, {object_type:?})\nprint('{OBJECT_NAME_PREFIX}' + {name:?})\n",
        );
        self.run_and_find_sentinel(&code, OBJECT_NAME_PREFIX)
    }

    pub fn delete_object(&self, name: &str) -> SdkResult<()> {
        let code = format!(
            "if mcp_delete_object({name:?}):\n    print('{OBJECT_NAME_PREFIX}' + {name:?})\nelse:\n    print('{OBJECT_ERROR_PREFIX}no such object: ' + {name:?})\n",
        );
        self.run_and_find_sentinel(&code, OBJECT_NAME_PREFIX).map(|_| ())
    }

    pub fn rename_object(&self, name: &str, new_name: &str) -> SdkResult<()> {
        let code = format!(
            "if mcp_rename_object({name:?}, {new_name:?}):\n    print('{OBJECT_NAME_PREFIX}' + {new_name:?})\nelse:\n    print('{OBJECT_ERROR_PREFIX}no such object: ' + {name:?})\n",
        );
        self.run_and_find_sentinel(&code, OBJECT_NAME_PREFIX).map(|_| ())
    }

    pub fn move_object(&self, name: &str, x: f64, y: f64, z: f64) -> SdkResult<()> {
        let code = format!(
            "if mcp_move_object({name:?}, {x}, {y}, {z}):\n    print('{OBJECT_NAME_PREFIX}' + {name:?})\nelse:\n    print('{OBJECT_ERROR_PREFIX}no such object: ' + {name:?})\n",
        );
        self.run_and_find_sentinel(&code, OBJECT_NAME_PREFIX).map(|_| ())
    }

    /// Export one object as opaque bytes (a stand-in for a real mesh
    /// export), base64-encoded on the wire and decoded back here.
    pub fn export_object(&self, name: &str) -> SdkResult<Vec<u8>> {
        let code = format!(
            "import base64\nresult = mcp_export_object({name:?})\nif result is None:\n    print('{OBJECT_ERROR_PREFIX}no such object: ' + {name:?})\nelse:\n    print('{OBJECT_EXPORT_PREFIX}' + base64.b64encode(result.encode('utf-8')).decode('ascii'))\n",
        );
        let payload = self.run_and_find_sentinel(&code, OBJECT_EXPORT_PREFIX)?;
        BASE64
            .decode(payload)
            .map_err(|e| SdkError::Protocol(format!("invalid export payload: {e}")))
    }
}
