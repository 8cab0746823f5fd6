use serde_json::{json, Value};

use trellis_core::types::{ToolDefinition, ToolSpec};

/// Convert tool specs into the function declarations presented to the LLM.
///
/// Every declared parameter is string-typed and required; richer parameter
/// schemas live with the remote API, not here.
pub fn tool_definitions(specs: &[ToolSpec]) -> Vec<ToolDefinition> {
    specs.iter().map(tool_definition).collect()
}

fn tool_definition(spec: &ToolSpec) -> ToolDefinition {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();
    for param in &spec.parameters {
        properties.insert(
            param.name.clone(),
            json!({
                "type": "string",
                "description": param.description,
            }),
        );
        required.push(Value::String(param.name.clone()));
    }

    ToolDefinition {
        name: spec.name.clone(),
        description: spec.description.clone(),
        parameters: json!({
            "type": "object",
            "properties": properties,
            "required": required,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::types::ToolParam;

    #[test]
    fn builds_function_declaration() {
        let spec = ToolSpec {
            id: "t1".into(),
            name: "weather".into(),
            description: "Current weather".into(),
            parameters: vec![
                ToolParam {
                    name: "city".into(),
                    description: "City name".into(),
                },
                ToolParam {
                    name: "units".into(),
                    description: String::new(),
                },
            ],
            api_url: "https://api.example.com".into(),
            method: "GET".into(),
            headers: Default::default(),
        };

        let defs = tool_definitions(&[spec]);
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "weather");
        assert_eq!(defs[0].parameters["type"], "object");
        assert_eq!(defs[0].parameters["properties"]["city"]["type"], "string");
        assert_eq!(
            defs[0].parameters["required"],
            serde_json::json!(["city", "units"])
        );
    }

    #[test]
    fn empty_parameters_yield_empty_schema() {
        let spec = ToolSpec {
            id: "t2".into(),
            name: "ping".into(),
            description: String::new(),
            parameters: vec![],
            api_url: "https://api.example.com".into(),
            method: "GET".into(),
            headers: Default::default(),
        };
        let def = tool_definition(&spec);
        assert_eq!(def.parameters["required"], serde_json::json!([]));
    }
}
