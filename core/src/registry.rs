//! Command Registry.
//!
//! A static `type` → handler table with declarative parameter validation run
//! before the handler ever sees a request. Each handler also publishes a
//! [`CommandSchema`] so the registry's tool surface can be introspected (used
//! by the adapter to build its MCP tool list, and by tests) without drifting
//! from the handler table itself.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::host::HostRuntime;

/// The expected JSON type of a single parameter, for declarative validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Number,
    Bool,
    Object,
    Array,
    Any,
}

impl ParamType {
    fn matches(self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Number => value.is_number(),
            ParamType::Bool => value.is_boolean(),
            ParamType::Object => value.is_object(),
            ParamType::Array => value.is_array(),
            ParamType::Any => true,
        }
    }

    fn name(self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Number => "number",
            ParamType::Bool => "bool",
            ParamType::Object => "object",
            ParamType::Array => "array",
            ParamType::Any => "any",
        }
    }
}

/// Declares one expected parameter: its JSON type, and whether it must be
/// present.
#[derive(Debug, Clone)]
pub struct ParamSchema {
    pub name: &'static str,
    pub param_type: ParamType,
    pub required: bool,
    pub description: &'static str,
}

impl ParamSchema {
    pub const fn required(name: &'static str, param_type: ParamType, description: &'static str) -> Self {
        ParamSchema {
            name,
            param_type,
            required: true,
            description,
        }
    }

    pub const fn optional(name: &'static str, param_type: ParamType, description: &'static str) -> Self {
        ParamSchema {
            name,
            param_type,
            required: false,
            description,
        }
    }
}

/// Introspectable description of a registered command, independent of its
/// handler implementation. This is what the adapter process turns into an
/// MCP tool entry.
#[derive(Debug, Clone)]
pub struct CommandSchema {
    pub name: &'static str,
    pub description: &'static str,
    pub params: Vec<ParamSchema>,
}

impl CommandSchema {
    /// Validate `params` against this schema's required fields and types.
    pub fn validate(&self, params: &Map<String, Value>) -> Result<(), CoreError> {
        for field in &self.params {
            match params.get(field.name) {
                Some(value) if !field.param_type.matches(value) => {
                    return Err(CoreError::InvalidParams(format!(
                        "'{}' must be of type {}",
                        field.name,
                        field.param_type.name()
                    )));
                }
                Some(_) => {}
                None if field.required => {
                    return Err(CoreError::InvalidParams(format!(
                        "missing required field '{}'",
                        field.name
                    )));
                }
                None => {}
            }
        }
        Ok(())
    }
}

/// A command implementation. Runs synchronously on the dispatcher's single
/// worker thread; handlers must not block indefinitely or spawn work
/// that outlives the call.
pub trait Handler: Send + Sync {
    fn schema(&self) -> &CommandSchema;

    fn call(&self, host: &dyn HostRuntime, params: &Map<String, Value>) -> Result<Value, CoreError>;
}

/// Flat `type` → handler map. Built once at startup and never mutated after
/// (no hot-reloading of commands), so reads need no locking.
#[derive(Default)]
pub struct CommandRegistry {
    handlers: BTreeMap<&'static str, Arc<dyn Handler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        CommandRegistry {
            handlers: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn Handler>) {
        let name = handler.schema().name;
        self.handlers.insert(name, handler);
    }

    /// Validate then invoke the handler for `command_type`. `UnknownCommand`
    /// and `InvalidParams` are both raised here, before the dispatcher ever
    /// queues a job for the handler.
    pub fn dispatch(
        &self,
        host: &dyn HostRuntime,
        command_type: &str,
        params: &Map<String, Value>,
    ) -> Result<Value, CoreError> {
        let handler = self
            .handlers
            .get(command_type)
            .ok_or_else(|| CoreError::UnknownCommand(command_type.to_string()))?;
        handler.schema().validate(params)?;
        handler.call(host, params)
    }

    pub fn get(&self, command_type: &str) -> Option<&Arc<dyn Handler>> {
        self.handlers.get(command_type)
    }

    /// Introspection used by the adapter (tool list) and tests — never a wire
    /// command in its own right.
    pub fn list_commands(&self) -> Vec<&CommandSchema> {
        self.handlers.values().map(|h| h.schema()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::NativeHost;

    struct EchoHandler {
        schema: CommandSchema,
    }

    impl Handler for EchoHandler {
        fn schema(&self) -> &CommandSchema {
            &self.schema
        }

        fn call(&self, _host: &dyn HostRuntime, params: &Map<String, Value>) -> Result<Value, CoreError> {
            Ok(Value::Object(params.clone()))
        }
    }

    fn registry_with_echo() -> CommandRegistry {
        let mut registry = CommandRegistry::new();
        registry.register(Arc::new(EchoHandler {
            schema: CommandSchema {
                name: "echo",
                description: "echoes params back",
                params: vec![ParamSchema::required("value", ParamType::String, "value to echo")],
            },
        }));
        registry
    }

    #[test]
    fn unknown_command_is_rejected() {
        let registry = registry_with_echo();
        let host = NativeHost::headless();
        let err = registry
            .dispatch(&host, "does_not_exist", &Map::new())
            .unwrap_err();
        assert!(matches!(err, CoreError::UnknownCommand(name) if name == "does_not_exist"));
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let registry = registry_with_echo();
        let host = NativeHost::headless();
        let err = registry.dispatch(&host, "echo", &Map::new()).unwrap_err();
        assert!(matches!(err, CoreError::InvalidParams(_)));
    }

    #[test]
    fn wrong_type_is_rejected() {
        let registry = registry_with_echo();
        let host = NativeHost::headless();
        let mut params = Map::new();
        params.insert("value".into(), Value::Number(1.into()));
        let err = registry.dispatch(&host, "echo", &params).unwrap_err();
        assert!(matches!(err, CoreError::InvalidParams(_)));
    }

    #[test]
    fn valid_call_dispatches() {
        let registry = registry_with_echo();
        let host = NativeHost::headless();
        let mut params = Map::new();
        params.insert("value".into(), Value::String("hi".into()));
        let result = registry.dispatch(&host, "echo", &params).unwrap();
        assert_eq!(result["value"], "hi");
    }

    #[test]
    fn list_commands_reflects_registered_handlers() {
        let registry = registry_with_echo();
        let names: Vec<_> = registry.list_commands().iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["echo"]);
    }
}
