//! Message validation against the contract table

use serde_json::Value;

use super::contract::{self, MessageShape};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    MalformedJson(String),
    #[error("Message must be a JSON object")]
    NotAnObject,
    #[error("Message is missing a string 'type' field")]
    MissingType,
    #[error("Unknown message type: {0}")]
    UnknownType(String),
    #[error("Message '{message_type}' is missing required field '{field}'")]
    MissingField { message_type: String, field: String },
    #[error("Field '{field}' of '{message_type}' must be {expected}")]
    WrongFieldType {
        message_type: String,
        field: String,
        expected: &'static str,
    },
}

/// Parse a text frame into a JSON value.
pub fn parse_frame(text: &str) -> Result<Value, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::MalformedJson(e.to_string()))
}

/// Object with a string `type`; returns the type.
pub fn validate_minimal(payload: &Value) -> Result<&str, ProtocolError> {
    let object = payload.as_object().ok_or(ProtocolError::NotAnObject)?;
    object
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)
}

/// Check a payload against its declared shape.
///
/// Undeclared fields are accepted. A declared field that is present with
/// `null` counts as absent.
pub fn validate(payload: &Value) -> Result<&'static MessageShape, ProtocolError> {
    let message_type = validate_minimal(payload)?;
    let shape = contract::shape(message_type)
        .ok_or_else(|| ProtocolError::UnknownType(message_type.to_string()))?;

    for (field, expected) in shape.required {
        match payload.get(*field) {
            None | Some(Value::Null) => {
                return Err(ProtocolError::MissingField {
                    message_type: shape.name.to_string(),
                    field: (*field).to_string(),
                });
            }
            Some(value) if !expected.matches(value) => {
                return Err(wrong_type(shape, field, *expected));
            }
            Some(_) => {}
        }
    }

    for (field, expected) in shape.optional {
        if let Some(value) = payload.get(*field)
            && !value.is_null()
            && !expected.matches(value)
        {
            return Err(wrong_type(shape, field, *expected));
        }
    }

    Ok(shape)
}

fn wrong_type(shape: &MessageShape, field: &str, expected: contract::FieldType) -> ProtocolError {
    ProtocolError::WrongFieldType {
        message_type: shape.name.to_string(),
        field: field.to_string(),
        expected: expected.json_name().unwrap_or("any value"),
    }
}
