//! Protocol contract
//!
//! The wire protocol is described once, as a table of message shapes keyed by
//! `type`. The JSON-Schema-shaped contract document, the validator and the
//! `contract export` command are all derived from [`MESSAGE_SHAPES`].

use std::path::Path;

use serde_json::{Map, Value, json};

/// Wire protocol version reported in status and the contract document
pub const PROTOCOL_VERSION: &str = "1.0";

/// Which side sends a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to server
    Inbound,
    /// Server to client
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// JSON type of a declared field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
    /// Any JSON value
    Any,
}

impl FieldType {
    /// JSON Schema type name; `None` for [`FieldType::Any`].
    pub fn json_name(&self) -> Option<&'static str> {
        match self {
            FieldType::String => Some("string"),
            FieldType::Integer => Some("integer"),
            FieldType::Number => Some("number"),
            FieldType::Boolean => Some("boolean"),
            FieldType::Object => Some("object"),
            FieldType::Array => Some("array"),
            FieldType::Any => None,
        }
    }

    pub fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
            FieldType::Any => true,
        }
    }
}

/// Shape of one message type
#[derive(Debug)]
pub struct MessageShape {
    pub name: &'static str,
    pub direction: Direction,
    pub required: &'static [(&'static str, FieldType)],
    pub optional: &'static [(&'static str, FieldType)],
}

impl MessageShape {
    pub fn fields(&self) -> impl Iterator<Item = &(&'static str, FieldType)> {
        self.required.iter().chain(self.optional.iter())
    }
}

use FieldType::{Any, Array, Boolean, Integer, Object, String as Str};

const NONE: &[(&str, FieldType)] = &[];

/// Every message type of the protocol
pub const MESSAGE_SHAPES: &[MessageShape] = &[
    // Inbound
    MessageShape {
        name: "auth",
        direction: Direction::Inbound,
        required: NONE,
        optional: &[("auth_token", Str), ("token", Str)],
    },
    MessageShape {
        name: "set_mode",
        direction: Direction::Inbound,
        required: &[("mode", Str)],
        optional: &[("call_id", Str)],
    },
    MessageShape {
        name: "audio",
        direction: Direction::Inbound,
        required: NONE,
        optional: &[("data", Str), ("sample_rate", Integer), ("call_id", Str)],
    },
    MessageShape {
        name: "tts_request",
        direction: Direction::Inbound,
        required: &[("text", Str)],
        optional: &[("voice", Str), ("call_id", Str)],
    },
    MessageShape {
        name: "llm_request",
        direction: Direction::Inbound,
        required: NONE,
        optional: &[
            ("prompt", Str),
            ("text", Str),
            ("stream", Boolean),
            ("call_id", Str),
        ],
    },
    MessageShape {
        name: "reload_models",
        direction: Direction::Inbound,
        required: NONE,
        optional: NONE,
    },
    MessageShape {
        name: "reload_llm",
        direction: Direction::Inbound,
        required: NONE,
        optional: &[("model_path", Str), ("llm_model_path", Str)],
    },
    MessageShape {
        name: "switch_model",
        direction: Direction::Inbound,
        required: NONE,
        optional: &[
            ("dry_run", Any),
            ("stt_backend", Str),
            ("tts_backend", Str),
            ("stt_model_path", Str),
            ("tts_model_path", Str),
            ("stt_config", Object),
            ("tts_config", Object),
            ("llm_config", Object),
        ],
    },
    MessageShape {
        name: "status",
        direction: Direction::Inbound,
        required: NONE,
        optional: NONE,
    },
    MessageShape {
        name: "capabilities",
        direction: Direction::Inbound,
        required: NONE,
        optional: NONE,
    },
    MessageShape {
        name: "backends",
        direction: Direction::Inbound,
        required: NONE,
        optional: NONE,
    },
    MessageShape {
        name: "backend_schema",
        direction: Direction::Inbound,
        required: &[("backend_type", Str), ("name", Str)],
        optional: NONE,
    },
    // Outbound
    MessageShape {
        name: "auth_response",
        direction: Direction::Outbound,
        required: &[("status", Str)],
        optional: &[("message", Str)],
    },
    MessageShape {
        name: "mode_ready",
        direction: Direction::Outbound,
        required: &[("mode", Str), ("call_id", Str)],
        optional: NONE,
    },
    MessageShape {
        name: "stt_result",
        direction: Direction::Outbound,
        required: &[("call_id", Str), ("text", Str), ("is_final", Boolean)],
        optional: NONE,
    },
    MessageShape {
        name: "tts_audio",
        direction: Direction::Outbound,
        required: &[
            ("call_id", Str),
            ("sample_rate", Integer),
            ("format", Str),
            ("bytes", Integer),
        ],
        optional: NONE,
    },
    MessageShape {
        name: "llm_response",
        direction: Direction::Outbound,
        required: &[("call_id", Str), ("text", Str), ("done", Boolean)],
        optional: &[("delta", Str)],
    },
    MessageShape {
        name: "reload_response",
        direction: Direction::Outbound,
        required: &[("status", Str), ("message", Str)],
        optional: &[("llm_params", Object)],
    },
    MessageShape {
        name: "switch_response",
        direction: Direction::Outbound,
        required: &[("status", Str)],
        optional: &[("message", Str), ("changed", Array)],
    },
    MessageShape {
        name: "status_response",
        direction: Direction::Outbound,
        required: &[
            ("status", Str),
            ("stt_backend", Str),
            ("tts_backend", Str),
            ("models", Object),
            ("config", Object),
        ],
        optional: &[
            ("protocol_version", Str),
            ("kroko", Object),
            ("kokoro", Object),
            ("derived", Object),
        ],
    },
    MessageShape {
        name: "capabilities_response",
        direction: Direction::Outbound,
        required: &[("status", Str), ("capabilities", Object)],
        optional: NONE,
    },
    MessageShape {
        name: "backends_response",
        direction: Direction::Outbound,
        required: &[("status", Str), ("stt", Array), ("tts", Array), ("llm", Array)],
        optional: NONE,
    },
    MessageShape {
        name: "backend_schema_response",
        direction: Direction::Outbound,
        required: &[("status", Str), ("backend_type", Str), ("name", Str)],
        optional: &[
            ("available", Boolean),
            ("display_name", Str),
            ("schema", Object),
            ("error", Object),
        ],
    },
    MessageShape {
        name: "error",
        direction: Direction::Outbound,
        required: &[("message", Str)],
        optional: &[("code", Str), ("call_id", Str)],
    },
];

/// Look up a message shape by `type`.
pub fn shape(message_type: &str) -> Option<&'static MessageShape> {
    MESSAGE_SHAPES.iter().find(|s| s.name == message_type)
}

fn field_schema(field: FieldType) -> Value {
    match field.json_name() {
        Some(name) => json!({ "type": name }),
        None => json!({}),
    }
}

fn definition(shape: &MessageShape) -> Value {
    let mut properties = Map::new();
    properties.insert("type".to_string(), json!({ "const": shape.name }));
    for (name, field) in shape.fields() {
        properties.insert((*name).to_string(), field_schema(*field));
    }

    let mut required = vec![Value::from("type")];
    required.extend(shape.required.iter().map(|(name, _)| Value::from(*name)));

    json!({
        "type": "object",
        "description": shape.direction.as_str(),
        "required": required,
        "properties": properties,
        "additionalProperties": true,
    })
}

/// The full contract document.
pub fn contract_document() -> Value {
    let mut definitions = Map::new();
    let mut one_of = Vec::with_capacity(MESSAGE_SHAPES.len());
    for shape in MESSAGE_SHAPES {
        definitions.insert(shape.name.to_string(), definition(shape));
        one_of.push(json!({ "$ref": format!("#/definitions/{}", shape.name) }));
    }

    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "title": "voxhost realtime protocol",
        "version": PROTOCOL_VERSION,
        "oneOf": one_of,
        "definitions": definitions,
    })
}

/// Write the contract document as pretty JSON.
pub fn export_contract(path: &Path) -> std::io::Result<()> {
    let document = serde_json::to_string_pretty(&contract_document())?;
    std::fs::write(path, document + "\n")
}
