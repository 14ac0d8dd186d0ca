//! Translates the core's [`CommandSchema`] list into MCP tool descriptors,
//! and implements the `mcp_search_tools` / `mcp_tool_help` meta-tools over
//! that same list, so the adapter's tool surface can never drift from the
//! core's handler table.

use blender_mcp_core::registry::{CommandSchema, ParamType};
use serde_json::{json, Map, Value};

fn json_type_name(param_type: ParamType) -> &'static str {
    match param_type {
        ParamType::String => "string",
        ParamType::Number => "number",
        ParamType::Bool => "boolean",
        ParamType::Object => "object",
        ParamType::Array => "array",
        ParamType::Any => "string",
    }
}

pub fn tool_descriptor(schema: &CommandSchema) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for param in &schema.params {
        properties.insert(
            param.name.to_string(),
            json!({
                "type": json_type_name(param.param_type),
                "description": param.description,
            }),
        );
        if param.required {
            required.push(Value::String(param.name.to_string()));
        }
    }

    json!({
        "name": schema.name,
        "description": schema.description,
        "inputSchema": {
            "type": "object",
            "properties": Value::Object(properties),
            "required": required,
        }
    })
}

pub fn meta_tool_descriptors() -> Vec<Value> {
    vec![
        json!({
            "name": "mcp_search_tools",
            "description": "Search the available tools by keyword match against their name and description.",
            "inputSchema": {
                "type": "object",
                "properties": { "query": { "type": "string", "description": "keyword to search for" } },
                "required": ["query"],
            }
        }),
        json!({
            "name": "mcp_tool_help",
            "description": "Return the full parameter schema for one named tool.",
            "inputSchema": {
                "type": "object",
                "properties": { "name": { "type": "string", "description": "tool name" } },
                "required": ["name"],
            }
        }),
    ]
}

pub fn all_tool_descriptors(schemas: &[&CommandSchema]) -> Vec<Value> {
    let mut tools: Vec<Value> = schemas.iter().map(|s| tool_descriptor(s)).collect();
    tools.extend(meta_tool_descriptors());
    tools
}

pub fn search_tools(schemas: &[&CommandSchema], query: &str) -> Vec<Value> {
    let needle = query.to_ascii_lowercase();
    schemas
        .iter()
        .filter(|s| {
            s.name.to_ascii_lowercase().contains(&needle)
                || s.description.to_ascii_lowercase().contains(&needle)
        })
        .map(|s| tool_descriptor(s))
        .collect()
}

pub fn tool_help(schemas: &[&CommandSchema], name: &str) -> Option<Value> {
    schemas
        .iter()
        .find(|s| s.name == name)
        .map(|s| tool_descriptor(s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_descriptor_marks_required_fields() {
        let registry = blender_mcp_core::handlers::build_registry();
        let schemas = registry.list_commands();
        let execute_code = schemas.iter().find(|s| s.name == "execute_code").unwrap();
        let descriptor = tool_descriptor(execute_code);
        let required = descriptor["inputSchema"]["required"].as_array().unwrap();
        assert!(required.iter().any(|v| v == "code"));
    }

    #[test]
    fn search_tools_matches_by_description() {
        let registry = blender_mcp_core::handlers::build_registry();
        let schemas = registry.list_commands();
        let hits = search_tools(&schemas, "viewport");
        assert!(hits.iter().any(|t| t["name"] == "get_viewport_screenshot"));
    }

    #[test]
    fn tool_help_returns_none_for_unknown_name() {
        let registry = blender_mcp_core::handlers::build_registry();
        let schemas = registry.list_commands();
        assert!(tool_help(&schemas, "does_not_exist").is_none());
    }
}
