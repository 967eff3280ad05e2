//! Expected-output descriptors for oracle calls.
//!
//! Every request carries an [`OutputShape`]. The shape is rendered into the prompt as
//! a JSON-schema-like document and the parsed response is checked against it before
//! any stage trusts it.

use serde_json::{Map, Value, json};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum OutputShape {
    String,
    Number,
    Integer,
    Boolean,
    /// Any JSON value, including objects with free-form keys
    Any,
    Array(Box<OutputShape>),
    Object(Vec<Field>),
    /// One of a fixed set of strings
    Enum(Vec<&'static str>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: &'static str,
    pub shape: OutputShape,
    pub required: bool,
}

impl Field {
    pub fn required(name: &'static str, shape: OutputShape) -> Self {
        Self { name, shape, required: true }
    }

    pub fn optional(name: &'static str, shape: OutputShape) -> Self {
        Self { name, shape, required: false }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("response does not match expected shape at `{path}`: expected {expected}")]
pub struct ShapeError {
    pub path: String,
    pub expected: String,
}

impl OutputShape {
    pub fn array_of(shape: OutputShape) -> Self {
        OutputShape::Array(Box::new(shape))
    }

    pub fn object(fields: Vec<Field>) -> Self {
        OutputShape::Object(fields)
    }

    /// JSON-schema-like rendering, used both in prompts and as the `format` of
    /// structured-output requests.
    pub fn to_json_schema(&self) -> Value {
        match self {
            OutputShape::String => json!({"type": "string"}),
            OutputShape::Number => json!({"type": "number"}),
            OutputShape::Integer => json!({"type": "integer"}),
            OutputShape::Boolean => json!({"type": "boolean"}),
            OutputShape::Any => json!({}),
            OutputShape::Array(item) => json!({"type": "array", "items": item.to_json_schema()}),
            OutputShape::Enum(values) => json!({"type": "string", "enum": values}),
            OutputShape::Object(fields) => {
                let mut properties = Map::new();
                let mut required = Vec::new();
                for field in fields {
                    properties.insert(field.name.to_string(), field.shape.to_json_schema());
                    if field.required {
                        required.push(Value::String(field.name.to_string()));
                    }
                }
                json!({"type": "object", "properties": properties, "required": required})
            }
        }
    }

    pub fn validate(&self, value: &Value) -> Result<(), ShapeError> {
        self.validate_at(value, "$")
    }

    fn validate_at(&self, value: &Value, path: &str) -> Result<(), ShapeError> {
        let mismatch = |expected: &str| ShapeError {
            path: path.to_string(),
            expected: expected.to_string(),
        };

        match self {
            OutputShape::Any => Ok(()),
            OutputShape::String => value.is_string().then_some(()).ok_or_else(|| mismatch("string")),
            OutputShape::Number => value.is_number().then_some(()).ok_or_else(|| mismatch("number")),
            OutputShape::Integer => {
                // Models frequently emit 12.0 for integers
                let ok = value.is_i64()
                    || value.is_u64()
                    || value.as_f64().is_some_and(|f| f.fract() == 0.0);
                ok.then_some(()).ok_or_else(|| mismatch("integer"))
            }
            OutputShape::Boolean => value.is_boolean().then_some(()).ok_or_else(|| mismatch("boolean")),
            OutputShape::Enum(values) => match value.as_str() {
                Some(s) if values.iter().any(|v| v.eq_ignore_ascii_case(s)) => Ok(()),
                _ => Err(mismatch(&format!("one of {:?}", values))),
            },
            OutputShape::Array(item) => {
                let items = value.as_array().ok_or_else(|| mismatch("array"))?;
                for (i, element) in items.iter().enumerate() {
                    item.validate_at(element, &format!("{}[{}]", path, i))?;
                }
                Ok(())
            }
            OutputShape::Object(fields) => {
                let object = value.as_object().ok_or_else(|| mismatch("object"))?;
                for field in fields {
                    let field_path = format!("{}.{}", path, field.name);
                    match object.get(field.name) {
                        None | Some(Value::Null) if field.required => {
                            return Err(ShapeError {
                                path: field_path,
                                expected: "required field".to_string(),
                            });
                        }
                        None | Some(Value::Null) => {}
                        Some(inner) => field.shape.validate_at(inner, &field_path)?,
                    }
                }
                Ok(())
            }
        }
    }
}

/// Pull the JSON payload out of a raw completion. Tolerates markdown code fences
/// and prose around a single top-level object.
pub fn parse_json_payload(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    let unfenced = trimmed
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    if let Ok(value) = serde_json::from_str::<Value>(unfenced) {
        return Some(value);
    }

    let start = unfenced.find('{')?;
    let end = unfenced.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&unfenced[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote_shape() -> OutputShape {
        OutputShape::object(vec![Field::required(
            "quotes",
            OutputShape::array_of(OutputShape::object(vec![
                Field::required("text", OutputShape::String),
                Field::required("line_start", OutputShape::Integer),
                Field::optional("speaker_name", OutputShape::String),
                Field::required("kind", OutputShape::Enum(vec!["a", "b"])),
            ])),
        )])
    }

    #[test]
    fn test_valid_payload() {
        let value = json!({"quotes": [
            {"text": "hi", "line_start": 3, "kind": "A"},
            {"text": "yo", "line_start": 4.0, "speaker_name": null, "kind": "b"}
        ]});
        assert!(quote_shape().validate(&value).is_ok());
    }

    #[test]
    fn test_reports_path_of_mismatch() {
        let value = json!({"quotes": [{"text": "hi", "line_start": "three", "kind": "a"}]});
        let err = quote_shape().validate(&value).unwrap_err();
        assert_eq!(err.path, "$.quotes[0].line_start");
        assert_eq!(err.expected, "integer");

        let missing = json!({"quotes": [{"line_start": 1, "kind": "a"}]});
        let err = quote_shape().validate(&missing).unwrap_err();
        assert_eq!(err.path, "$.quotes[0].text");
    }

    #[test]
    fn test_schema_rendering_lists_required() {
        let schema = quote_shape().to_json_schema();
        let item = &schema["properties"]["quotes"]["items"];
        assert_eq!(item["required"], json!(["text", "line_start", "kind"]));
        assert_eq!(item["properties"]["kind"]["enum"], json!(["a", "b"]));
    }

    #[test]
    fn test_parse_json_payload_variants() {
        assert_eq!(parse_json_payload("{\"a\": 1}"), Some(json!({"a": 1})));
        assert_eq!(
            parse_json_payload("```json\n{\"a\": 1}\n```"),
            Some(json!({"a": 1}))
        );
        assert_eq!(
            parse_json_payload("Sure! Here it is: {\"a\": [1, 2]} hope this helps"),
            Some(json!({"a": [1, 2]}))
        );
        assert_eq!(parse_json_payload("no json here"), None);
    }
}
