//! Realtime WebSocket protocol: contract, validation and message types

pub mod check;
pub mod contract;
pub mod messages;
pub mod validate;

pub use check::{CheckError, check_file};
pub use contract::{
    Direction, FieldType, MESSAGE_SHAPES, MessageShape, PROTOCOL_VERSION, contract_document,
    export_contract,
};
pub use messages::{ErrorObject, IncomingMessage, MessageRoute, OutgoingMessage, StatusSnapshot};
pub use validate::{ProtocolError, parse_frame, validate, validate_minimal};
