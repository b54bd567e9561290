use profetch_core::error::ExtractError;
use profetch_core::models::Record;
use profetch_core::traits::Extractor;
use serde_json::Value;

/// Extracts a record from a JSON document.
///
/// The record is the top-level object, or the object found at a JSON pointer
/// (RFC 6901, e.g. `/data/profile`) when one is configured.
#[derive(Debug, Clone, Default)]
pub struct JsonExtractor {
    pointer: Option<String>,
}

impl JsonExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at_pointer(pointer: impl Into<String>) -> Self {
        Self {
            pointer: Some(pointer.into()),
        }
    }
}

impl Extractor for JsonExtractor {
    fn extract(&self, raw: &str) -> Result<Record, ExtractError> {
        let document: Value = serde_json::from_str(raw.trim_start_matches('\u{feff}'))
            .map_err(|e| ExtractError::Malformed(format!("invalid JSON: {e}")))?;

        let value = match &self.pointer {
            Some(pointer) => document.pointer(pointer).ok_or_else(|| {
                ExtractError::UnexpectedShape(format!("nothing at pointer '{pointer}'"))
            })?,
            None => &document,
        };

        match value {
            Value::Object(record) => Ok(record.clone()),
            other => Err(ExtractError::UnexpectedShape(format!(
                "expected a JSON object, got {}",
                type_name(other)
            ))),
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
