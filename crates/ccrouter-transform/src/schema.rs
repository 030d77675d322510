//! JSON-Schema normalization for tool parameter definitions.
//!
//! Upstream Gemini accepts either its own typed schema dialect
//! (`parameters`) or raw JSON Schema (`parametersJsonSchema`); both paths
//! must arrive without fields the API rejects.

use serde_json::{Map, Value, json};

use ccrouter_protocol::gemini::types::Tool;

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("schema node carries both `type` and `anyOf`")]
    TypeWithAnyOf,
    #[error("schema node has a lone `null` type")]
    LoneNullType,
}

const ALLOWED_KEYS: &[&str] = &[
    "type",
    "format",
    "title",
    "description",
    "nullable",
    "enum",
    "maxItems",
    "minItems",
    "properties",
    "required",
    "minProperties",
    "maxProperties",
    "minLength",
    "maxLength",
    "pattern",
    "example",
    "anyOf",
    "propertyOrdering",
    "default",
    "items",
    "minimum",
    "maximum",
];

const GEMINI_TYPES: &[&str] = &[
    "TYPE_UNSPECIFIED",
    "STRING",
    "NUMBER",
    "INTEGER",
    "BOOLEAN",
    "ARRAY",
    "OBJECT",
    "NULL",
];

/// Recursively enforce the key whitelist on a schema fragment.
///
/// User-chosen property names under a `properties` object are preserved;
/// everything else outside the whitelist is dropped. Applying this to an
/// already-clean fragment is a no-op.
pub fn cleanup_parameters(node: &mut Value) {
    cleanup_node(node, false);
}

fn cleanup_node(node: &mut Value, inside_properties: bool) {
    match node {
        Value::Object(map) => {
            if !inside_properties {
                map.retain(|key, _| ALLOWED_KEYS.contains(&key.as_str()));

                let type_is_string = map
                    .get("type")
                    .and_then(Value::as_str)
                    .is_some_and(|value| value.eq_ignore_ascii_case("string"));
                if !type_is_string {
                    map.remove("enum");
                } else {
                    let format_allowed = map
                        .get("format")
                        .and_then(Value::as_str)
                        .is_none_or(|format| format == "enum" || format == "date-time");
                    if !format_allowed {
                        map.remove("format");
                    }
                }
            }
            for (key, child) in map.iter_mut() {
                let child_is_properties = !inside_properties && key == "properties";
                cleanup_node(child, child_is_properties);
            }
        }
        Value::Array(items) => {
            for item in items {
                cleanup_node(item, false);
            }
        }
        _ => {}
    }
}

/// Convert a JSON-Schema fragment into the Gemini schema dialect.
///
/// Idempotent for whitelisted-only input: re-processing the output yields
/// a structurally equal value.
pub fn process_json_schema(mut node: Value) -> Result<Value, SchemaError> {
    cleanup_parameters(&mut node);
    process_node(node)
}

fn process_node(node: Value) -> Result<Value, SchemaError> {
    let Value::Object(mut map) = node else {
        return Ok(node);
    };

    map.remove("additionalProperties");

    if map.contains_key("type") && map.contains_key("anyOf") {
        return Err(SchemaError::TypeWithAnyOf);
    }

    if let Some(Value::Array(entries)) = map.get("type").cloned() {
        flatten_type_array_to_any_of(&mut map, entries)?;
    }

    if let Some(type_name) = map.get("type").and_then(Value::as_str) {
        let mapped = gemini_type(type_name);
        if mapped == "NULL" {
            return Err(SchemaError::LoneNullType);
        }
        map.insert("type".to_string(), Value::String(mapped.to_string()));
    }

    if let Some(Value::Array(branches)) = map.remove("anyOf") {
        if let Some(other) = nullable_pair_branch(&branches) {
            // anyOf of [X, {type:"null"}] collapses to X + nullable.
            let mut collapsed = process_node(other)?;
            if let Some(out) = collapsed.as_object_mut() {
                out.insert("nullable".to_string(), Value::Bool(true));
                for (key, value) in map {
                    out.entry(key).or_insert(value);
                }
            }
            return Ok(collapsed);
        }
        let branches = branches
            .into_iter()
            .map(process_node)
            .collect::<Result<Vec<_>, _>>()?;
        map.insert("anyOf".to_string(), Value::Array(branches));
    }

    if let Some(items) = map.remove("items") {
        let items = match items {
            Value::Array(entries) => Value::Array(
                entries
                    .into_iter()
                    .map(process_node)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            other => process_node(other)?,
        };
        map.insert("items".to_string(), items);
    }

    if let Some(Value::Object(properties)) = map.remove("properties") {
        let mut out = Map::new();
        for (name, schema) in properties {
            out.insert(name, process_node(schema)?);
        }
        map.insert("properties".to_string(), Value::Object(out));
    }

    Ok(Value::Object(map))
}

/// `type: ["string","null"]` style arrays become `nullable` plus either a
/// scalar type or an `anyOf` over the remaining branches.
fn flatten_type_array_to_any_of(
    map: &mut Map<String, Value>,
    entries: Vec<Value>,
) -> Result<(), SchemaError> {
    let names: Vec<String> = entries
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect();
    let has_null = names.iter().any(|name| name.eq_ignore_ascii_case("null"));
    let non_null: Vec<String> = names
        .into_iter()
        .filter(|name| !name.eq_ignore_ascii_case("null"))
        .collect();

    if non_null.is_empty() {
        return Err(SchemaError::LoneNullType);
    }

    if has_null {
        map.insert("nullable".to_string(), Value::Bool(true));
    }

    match non_null.as_slice() {
        [single] => {
            map.insert("type".to_string(), Value::String(single.clone()));
        }
        many => {
            map.remove("type");
            let branches: Vec<Value> = many.iter().map(|name| json!({ "type": name })).collect();
            map.insert("anyOf".to_string(), Value::Array(branches));
        }
    }
    Ok(())
}

fn nullable_pair_branch(branches: &[Value]) -> Option<Value> {
    if branches.len() != 2 {
        return None;
    }
    let null_at = branches.iter().position(is_null_branch)?;
    branches.get(1 - null_at).cloned()
}

fn is_null_branch(branch: &Value) -> bool {
    branch
        .get("type")
        .and_then(Value::as_str)
        .is_some_and(|name| name.eq_ignore_ascii_case("null"))
}

fn gemini_type(value: &str) -> &'static str {
    let upper = value.to_ascii_uppercase();
    GEMINI_TYPES
        .iter()
        .find(|name| **name == upper)
        .copied()
        .unwrap_or("TYPE_UNSPECIFIED")
}

/// Normalize the parameter schema of every function declaration.
///
/// Declarations whose schema never carried `$schema` are converted to the
/// Gemini dialect in place; declarations with a `$schema` marker keep raw
/// JSON Schema and move to `parametersJsonSchema` (the marker itself is
/// never forwarded upstream). The same rule applies to `response`.
pub fn t_tool(tool: &mut Tool) -> Result<(), SchemaError> {
    let Some(declarations) = tool.function_declarations.as_mut() else {
        return Ok(());
    };

    for declaration in declarations {
        if let Some(parameters) = declaration.parameters.take() {
            match route_schema(parameters)? {
                RoutedSchema::Dialect(schema) => declaration.parameters = Some(schema),
                RoutedSchema::JsonSchema(schema) => {
                    declaration.parameters_json_schema = Some(schema)
                }
            }
        }
        if let Some(response) = declaration.response.take() {
            match route_schema(response)? {
                RoutedSchema::Dialect(schema) => declaration.response = Some(schema),
                RoutedSchema::JsonSchema(schema) => declaration.response_json_schema = Some(schema),
            }
        }
    }
    Ok(())
}

enum RoutedSchema {
    Dialect(Value),
    JsonSchema(Value),
}

fn route_schema(mut schema: Value) -> Result<RoutedSchema, SchemaError> {
    if schema.get("$schema").is_some() {
        strip_schema_markers(&mut schema, false);
        Ok(RoutedSchema::JsonSchema(schema))
    } else {
        Ok(RoutedSchema::Dialect(process_json_schema(schema)?))
    }
}

fn strip_schema_markers(node: &mut Value, inside_properties: bool) {
    match node {
        Value::Object(map) => {
            if !inside_properties {
                map.remove("$schema");
            }
            for (key, child) in map.iter_mut() {
                let child_is_properties = !inside_properties && key == "properties";
                strip_schema_markers(child, child_is_properties);
            }
        }
        Value::Array(items) => {
            for item in items {
                strip_schema_markers(item, false);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccrouter_protocol::gemini::types::FunctionDeclaration;

    #[test]
    fn cleanup_drops_unknown_keys_but_keeps_property_names() {
        let mut schema = json!({
            "type": "object",
            "$schema": "http://json-schema.org/draft-07/schema#",
            "additionalProperties": false,
            "properties": {
                "additionalProperties": { "type": "string", "x-custom": 1 },
                "path": { "type": "string" }
            }
        });
        cleanup_parameters(&mut schema);
        assert_eq!(
            schema,
            json!({
                "type": "object",
                "properties": {
                    "additionalProperties": { "type": "string" },
                    "path": { "type": "string" }
                }
            })
        );
    }

    #[test]
    fn cleanup_enum_and_format_rules() {
        let mut schema = json!({
            "type": "integer",
            "enum": [1, 2],
            "format": "int32"
        });
        cleanup_parameters(&mut schema);
        assert_eq!(schema, json!({ "type": "integer", "format": "int32" }));

        let mut schema = json!({ "type": "string", "format": "uuid" });
        cleanup_parameters(&mut schema);
        assert_eq!(schema, json!({ "type": "string" }));

        let mut schema = json!({ "type": "string", "format": "date-time" });
        cleanup_parameters(&mut schema);
        assert_eq!(schema, json!({ "type": "string", "format": "date-time" }));
    }

    #[test]
    fn cleanup_is_noop_on_clean_input() {
        let clean = json!({
            "type": "object",
            "description": "args",
            "properties": { "name": { "type": "string", "enum": ["a", "b"] } },
            "required": ["name"]
        });
        let mut schema = clean.clone();
        cleanup_parameters(&mut schema);
        assert_eq!(schema, clean);
    }

    #[test]
    fn process_uppercases_types_recursively() {
        let out = process_json_schema(json!({
            "type": "object",
            "properties": {
                "count": { "type": "integer", "minimum": 0.0 },
                "tags": { "type": "array", "items": { "type": "string" } }
            }
        }))
        .unwrap();
        assert_eq!(out["type"], "OBJECT");
        assert_eq!(out["properties"]["count"]["type"], "INTEGER");
        assert_eq!(out["properties"]["tags"]["type"], "ARRAY");
        assert_eq!(out["properties"]["tags"]["items"]["type"], "STRING");
    }

    #[test]
    fn process_unknown_type_becomes_unspecified() {
        let out = process_json_schema(json!({ "type": "decimal" })).unwrap();
        assert_eq!(out["type"], "TYPE_UNSPECIFIED");
    }

    #[test]
    fn type_array_with_null_collapses_to_nullable_scalar() {
        let out = process_json_schema(json!({ "type": ["string", "null"] })).unwrap();
        assert_eq!(out, json!({ "type": "STRING", "nullable": true }));
    }

    #[test]
    fn type_array_without_null_becomes_any_of() {
        let out = process_json_schema(json!({ "type": ["string", "integer"] })).unwrap();
        assert_eq!(
            out["anyOf"],
            json!([{ "type": "STRING" }, { "type": "INTEGER" }])
        );
        assert!(out.get("type").is_none());
    }

    #[test]
    fn nullable_any_of_pair_collapses() {
        let out = process_json_schema(json!({
            "description": "maybe a name",
            "anyOf": [{ "type": "null" }, { "type": "string", "maxLength": 10 }]
        }))
        .unwrap();
        assert_eq!(out["type"], "STRING");
        assert_eq!(out["nullable"], true);
        assert_eq!(out["maxLength"], 10);
        assert_eq!(out["description"], "maybe a name");
    }

    #[test]
    fn type_with_any_of_is_an_error() {
        let err = process_json_schema(json!({
            "type": "object",
            "anyOf": [{ "type": "string" }]
        }))
        .unwrap_err();
        assert!(matches!(err, SchemaError::TypeWithAnyOf));
    }

    #[test]
    fn lone_null_type_is_an_error() {
        assert!(matches!(
            process_json_schema(json!({ "type": "null" })),
            Err(SchemaError::LoneNullType)
        ));
        assert!(matches!(
            process_json_schema(json!({ "type": ["null"] })),
            Err(SchemaError::LoneNullType)
        ));
    }

    #[test]
    fn process_is_idempotent_on_whitelisted_input() {
        let input = json!({
            "type": "object",
            "properties": {
                "mode": { "type": "string", "enum": ["fast", "slow"] },
                "limit": { "type": ["integer", "null"] },
                "filter": {
                    "anyOf": [{ "type": "null" }, { "type": "string" }]
                }
            },
            "required": ["mode"]
        });
        let once = process_json_schema(input).unwrap();
        let twice = process_json_schema(once.clone()).unwrap();
        assert_eq!(once, twice);
    }

    fn declaration(parameters: Value) -> FunctionDeclaration {
        FunctionDeclaration {
            name: "edit".to_string(),
            description: "edit a file".to_string(),
            parameters: Some(parameters),
            parameters_json_schema: None,
            response: None,
            response_json_schema: None,
        }
    }

    #[test]
    fn t_tool_converts_plain_schema_in_place() {
        let mut tool = Tool {
            function_declarations: Some(vec![declaration(json!({ "type": "object" }))]),
            google_search: None,
        };
        t_tool(&mut tool).unwrap();
        let declaration = &tool.function_declarations.as_ref().unwrap()[0];
        assert_eq!(declaration.parameters, Some(json!({ "type": "OBJECT" })));
        assert!(declaration.parameters_json_schema.is_none());
    }

    #[test]
    fn t_tool_moves_marked_schema_and_strips_marker() {
        let mut tool = Tool {
            function_declarations: Some(vec![declaration(json!({
                "$schema": "http://json-schema.org/draft-07/schema#",
                "type": "object",
                "properties": { "old_string": { "type": "string" } }
            }))]),
            google_search: None,
        };
        t_tool(&mut tool).unwrap();
        let declaration = &tool.function_declarations.as_ref().unwrap()[0];
        assert!(declaration.parameters.is_none());
        let moved = declaration.parameters_json_schema.as_ref().unwrap();
        assert!(moved.get("$schema").is_none());
        // Raw JSON Schema keeps lowercase types.
        assert_eq!(moved["type"], "object");
        assert_eq!(moved["properties"]["old_string"]["type"], "string");
    }
}
