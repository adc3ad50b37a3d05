//! JSON-schema repair for tool definitions
//!
//! Some clients send tool input schemas with `null` where strings or
//! arrays are expected, which the upstream rejects. This pass coerces
//! the fields the upstream cares about into well-formed shapes.

use serde_json::{json, Map, Value};

/// Normalize a tool input schema.
///
/// - `type` defaults to `"object"` when missing or empty
/// - `properties` defaults to `{}`
/// - `required` keeps only string items
/// - `additionalProperties` becomes `true` unless already a bool or object
/// - non-object input is replaced wholesale with an empty object schema
pub fn normalize_tool_schema(schema: &Value) -> Value {
    let obj = match schema.as_object() {
        Some(obj) => obj,
        None => return empty_object_schema(),
    };

    let mut out = Map::new();

    let schema_type = obj
        .get("type")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("object");
    out.insert("type".to_string(), json!(schema_type));

    let properties = obj
        .get("properties")
        .filter(|v| v.is_object())
        .cloned()
        .unwrap_or_else(|| json!({}));
    out.insert("properties".to_string(), properties);

    let required: Vec<Value> = obj
        .get("required")
        .and_then(|v| v.as_array())
        .map(|items| items.iter().filter(|v| v.is_string()).cloned().collect())
        .unwrap_or_default();
    out.insert("required".to_string(), Value::Array(required));

    let additional = match obj.get("additionalProperties") {
        Some(v @ Value::Bool(_)) | Some(v @ Value::Object(_)) => v.clone(),
        _ => json!(true),
    };
    out.insert("additionalProperties".to_string(), additional);

    // Preserve any remaining standard keywords untouched
    for (key, value) in obj {
        if !out.contains_key(key) {
            out.insert(key.clone(), value.clone());
        }
    }

    Value::Object(out)
}

fn empty_object_schema() -> Value {
    json!({
        "type": "object",
        "properties": {},
        "required": [],
        "additionalProperties": true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_schema_roundtrips() {
        let schema = json!({
            "type": "object",
            "properties": {"city": {"type": "string"}},
            "required": ["city"],
            "additionalProperties": false,
        });
        let normalized = normalize_tool_schema(&schema);
        assert_eq!(normalized, schema);
    }

    #[test]
    fn test_missing_type_defaults_to_object() {
        let normalized = normalize_tool_schema(&json!({"properties": {}}));
        assert_eq!(normalized["type"], "object");
    }

    #[test]
    fn test_empty_type_defaults_to_object() {
        let normalized = normalize_tool_schema(&json!({"type": ""}));
        assert_eq!(normalized["type"], "object");
    }

    #[test]
    fn test_null_properties_replaced() {
        let normalized = normalize_tool_schema(&json!({"type": "object", "properties": null}));
        assert_eq!(normalized["properties"], json!({}));
    }

    #[test]
    fn test_required_filters_non_strings() {
        let normalized = normalize_tool_schema(&json!({
            "required": ["city", null, 3, "units"]
        }));
        assert_eq!(normalized["required"], json!(["city", "units"]));
    }

    #[test]
    fn test_null_required_becomes_empty_list() {
        let normalized = normalize_tool_schema(&json!({"required": null}));
        assert_eq!(normalized["required"], json!([]));
    }

    #[test]
    fn test_bad_additional_properties_coerced() {
        let normalized = normalize_tool_schema(&json!({"additionalProperties": null}));
        assert_eq!(normalized["additionalProperties"], json!(true));

        let kept = normalize_tool_schema(&json!({"additionalProperties": {"type": "string"}}));
        assert_eq!(kept["additionalProperties"], json!({"type": "string"}));
    }

    #[test]
    fn test_non_object_replaced_wholesale() {
        let normalized = normalize_tool_schema(&json!("not a schema"));
        assert_eq!(
            normalized,
            json!({
                "type": "object",
                "properties": {},
                "required": [],
                "additionalProperties": true,
            })
        );
    }

    #[test]
    fn test_extra_keywords_preserved() {
        let normalized = normalize_tool_schema(&json!({
            "type": "object",
            "description": "a schema",
        }));
        assert_eq!(normalized["description"], "a schema");
    }
}
