//! Standalone contract checks for sample payload files

use std::path::{Path, PathBuf};

use serde_json::Value;

use super::validate::{ProtocolError, parse_frame, validate};

#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: ProtocolError,
    },
    #[error("{path}: message #{index}: {source}")]
    Invalid {
        path: PathBuf,
        index: usize,
        #[source]
        source: ProtocolError,
    },
}

/// Validate a file holding one message or a JSON array of messages.
///
/// Returns the number of messages checked.
pub fn check_file(path: &Path) -> Result<usize, CheckError> {
    let text = std::fs::read_to_string(path).map_err(|source| CheckError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let payload = parse_frame(&text).map_err(|source| CheckError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let messages = match payload {
        Value::Array(items) => items,
        single => vec![single],
    };
    for (index, message) in messages.iter().enumerate() {
        validate(message).map_err(|source| CheckError::Invalid {
            path: path.to_path_buf(),
            index,
            source,
        })?;
    }
    Ok(messages.len())
}
