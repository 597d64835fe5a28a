//! JSON schemas sent with structured-output inference requests.
//!
//! Strict structured output requires every object node to list all of its
//! properties in `required` and to forbid additional properties. The
//! builders below normalize nodes that way and the validator reports the
//! first offending path.

use serde_json::{json, Map, Value};
use thiserror::Error;

pub(crate) const ANSWER_KEY_SCHEMA_NAME: &str = "answer_key_parse";
pub(crate) const NAME_DETECTION_SCHEMA_NAME: &str = "bulk_name_detection";

#[derive(Debug, Clone, Error, PartialEq)]
#[error("invalid response schema at {path}: {message}")]
pub(crate) struct SchemaBuildError {
    pub(crate) path: String,
    pub(crate) message: String,
}

impl SchemaBuildError {
    fn at(path: &str, message: impl Into<String>) -> Self {
        Self { path: path.to_string(), message: message.into() }
    }
}

/// Recursively sets `required` to the full property list and disables
/// additional properties on every object node.
pub(crate) fn ensure_strict_schema_node(node: &mut Value) {
    let Some(object) = node.as_object_mut() else {
        return;
    };

    if is_object_type(object) {
        let keys: Vec<Value> = object
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| props.keys().cloned().map(Value::String).collect())
            .unwrap_or_default();
        object.insert("required".to_string(), Value::Array(keys));
        object.insert("additionalProperties".to_string(), Value::Bool(false));
        if !object.contains_key("properties") {
            object.insert("properties".to_string(), Value::Object(Map::new()));
        }
    }

    if let Some(props) = object.get_mut("properties").and_then(Value::as_object_mut) {
        for child in props.values_mut() {
            ensure_strict_schema_node(child);
        }
    }
    if let Some(items) = object.get_mut("items") {
        ensure_strict_schema_node(items);
    }
}

pub(crate) fn validate_schema_strictness(schema: &Value) -> Result<(), SchemaBuildError> {
    validate_node(schema, "$")
}

fn validate_node(node: &Value, path: &str) -> Result<(), SchemaBuildError> {
    let Some(object) = node.as_object() else {
        return Err(SchemaBuildError::at(path, "schema node must be an object"));
    };

    if is_object_type(object) {
        let props = match object.get("properties") {
            Some(Value::Object(props)) => props,
            _ => return Err(SchemaBuildError::at(path, "object node is missing properties")),
        };

        if object.get("additionalProperties") != Some(&Value::Bool(false)) {
            return Err(SchemaBuildError::at(path, "additionalProperties must be false"));
        }

        let Some(required) = object.get("required").and_then(Value::as_array) else {
            return Err(SchemaBuildError::at(path, "required must be an array"));
        };

        let mut required_keys = Vec::with_capacity(required.len());
        for item in required {
            let Some(key) = item.as_str() else {
                return Err(SchemaBuildError::at(path, "required entries must be strings"));
            };
            if required_keys.contains(&key) {
                return Err(SchemaBuildError::at(path, format!("duplicate required key {key}")));
            }
            if !props.contains_key(key) {
                return Err(SchemaBuildError::at(path, format!("required key {key} is not a property")));
            }
            required_keys.push(key);
        }

        for key in props.keys() {
            if !required_keys.contains(&key.as_str()) {
                return Err(SchemaBuildError::at(path, format!("property {key} is not required")));
            }
        }

        for (key, child) in props {
            validate_node(child, &format!("{path}.properties.{key}"))?;
        }
    }

    if let Some(items) = object.get("items") {
        validate_node(items, &format!("{path}.items"))?;
    }

    Ok(())
}

fn is_object_type(object: &Map<String, Value>) -> bool {
    match object.get("type") {
        Some(Value::String(kind)) => kind == "object",
        Some(Value::Array(kinds)) => kinds.iter().any(|kind| kind == "object"),
        _ => false,
    }
}

fn finish(mut schema: Value) -> Result<Value, SchemaBuildError> {
    ensure_strict_schema_node(&mut schema);
    validate_schema_strictness(&schema)?;
    Ok(schema)
}

pub(crate) fn build_answer_key_response_schema() -> Result<Value, SchemaBuildError> {
    let criterion = json!({
        "type": "object",
        "properties": {
            "desc": {"type": "string"},
            "marks": {"type": "number"}
        }
    });

    let evidence = json!({
        "type": "object",
        "properties": {
            "page_number": {"type": "integer"},
            "x": {"type": "number"},
            "y": {"type": "number"},
            "w": {"type": "number"},
            "h": {"type": "number"},
            "kind": {"type": "string", "enum": ["question_box", "answer_box", "marks_box"]},
            "confidence": {"type": "number"}
        }
    });

    let question = json!({
        "type": "object",
        "properties": {
            "label": {"type": "string"},
            "max_marks": {"type": "number"},
            "marks_source": {"type": "string", "enum": ["explicit", "inferred", "unknown"]},
            "marks_confidence": {"type": "number"},
            "marks_reason": {"type": "string"},
            "question_text": {"type": "string"},
            "answer_key": {"type": "string"},
            "model_solution": {"type": "string"},
            "warnings": {"type": "array", "items": {"type": "string"}},
            "criteria": {"type": "array", "items": criterion},
            "evidence": {"type": "array", "items": evidence}
        }
    });

    finish(json!({
        "type": "object",
        "properties": {
            "confidence_score": {"type": "number"},
            "warnings": {"type": "array", "items": {"type": "string"}},
            "questions": {"type": "array", "items": question}
        }
    }))
}

pub(crate) fn build_name_detection_schema() -> Result<Value, SchemaBuildError> {
    finish(json!({
        "type": "object",
        "properties": {
            "student_name": {"type": ["string", "null"]},
            "confidence": {"type": "number"},
            "evidence": {
                "type": ["object", "null"],
                "properties": {
                    "x": {"type": "number"},
                    "y": {"type": "number"},
                    "w": {"type": "number"},
                    "h": {"type": "number"}
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answer_key_schema_is_strict_at_every_level() {
        let schema = build_answer_key_response_schema().expect("schema");
        assert_eq!(schema["additionalProperties"], false);
        assert_eq!(schema["required"], json!(["confidence_score", "questions", "warnings"]));

        let question = &schema["properties"]["questions"]["items"];
        let required = question["required"].as_array().unwrap();
        assert_eq!(required.len(), 11);
        assert_eq!(question["properties"]["evidence"]["items"]["additionalProperties"], false);
        assert!(validate_schema_strictness(&schema).is_ok());
    }

    #[test]
    fn name_detection_schema_accepts_nullable_object() {
        let schema = build_name_detection_schema().expect("schema");
        assert_eq!(schema["properties"]["evidence"]["additionalProperties"], false);
        assert_eq!(schema["properties"]["evidence"]["required"], json!(["h", "w", "x", "y"]));
    }

    #[test]
    fn validator_reports_path_of_missing_required_key() {
        let mut schema = build_answer_key_response_schema().expect("schema");
        schema["properties"]["questions"]["items"]["required"] = json!(["label"]);

        let err = validate_schema_strictness(&schema).expect_err("must fail");
        assert_eq!(err.path, "$.properties.questions.items");
        assert!(err.message.contains("is not required"), "{}", err.message);
    }

    #[test]
    fn validator_rejects_open_objects_and_non_object_nodes() {
        let open = json!({"type": "object", "properties": {}, "required": []});
        let err = validate_schema_strictness(&open).unwrap_err();
        assert!(err.message.contains("additionalProperties"));

        let bad_child = json!({
            "type": "object",
            "properties": {"a": 5},
            "required": ["a"],
            "additionalProperties": false
        });
        let err = validate_schema_strictness(&bad_child).unwrap_err();
        assert_eq!(err.path, "$.properties.a");
    }
}
