// Typed views over the opaque `input_data` / `context` task columns

use crate::error::{AppError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Current schema version of every serialized task payload
pub const SCHEMA_VERSION: u32 = 1;

/// A payload persisted inside a task record.
///
/// Payload structs use `deny_unknown_fields`, so legacy or foreign shapes
/// fail closed instead of being half-read.
pub trait Versioned: Serialize + DeserializeOwned {
    /// Human-readable payload name for error messages
    const KIND: &'static str;

    fn schema_version(&self) -> u32;
}

/// Deserialize a payload and check its schema version
pub fn decode<T: Versioned>(raw: &str) -> Result<T> {
    let value: T = serde_json::from_str(raw)
        .map_err(|e| AppError::Deserialization(format!("{}: {}", T::KIND, e)))?;

    if value.schema_version() != SCHEMA_VERSION {
        return Err(AppError::Deserialization(format!(
            "{}: unsupported schema version {} (expected {})",
            T::KIND,
            value.schema_version(),
            SCHEMA_VERSION
        )));
    }
    Ok(value)
}

/// Deserialize a checkpoint, falling back to a fresh one on first run
pub fn decode_or_default<T: Versioned + Default>(raw: Option<&str>) -> Result<T> {
    match raw {
        Some(raw) if !raw.trim().is_empty() => decode(raw),
        _ => Ok(T::default()),
    }
}

pub fn encode<T: Versioned>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}
