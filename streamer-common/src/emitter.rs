//! The producer side: appending payloads to a stream.

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::entry::{EntryId, Payload};
use crate::store::{LogStore, StoreError};

#[derive(Error, Debug)]
pub enum EmitError {
    #[error("payload must be a JSON object, got {0}")]
    NotAnObject(&'static str),
    #[error("field {field} has a value of unsupported type {kind}")]
    UnsupportedValue { field: String, kind: &'static str },
    #[error("refusing to emit an empty payload")]
    EmptyPayload,
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Build a payload from a flat JSON object.
///
/// Strings are stored as their UTF-8 bytes; numbers and booleans as their JSON text.
/// Anything nested has to be serialized by the caller first.
pub fn payload_from_json(value: &Value) -> Result<Payload, EmitError> {
    let object = match value {
        Value::Object(object) => object,
        other => return Err(EmitError::NotAnObject(kind_of(other))),
    };

    let mut payload = Payload::new();
    for (field, value) in object {
        let bytes = match value {
            Value::String(s) => s.clone().into_bytes(),
            Value::Number(n) => n.to_string().into_bytes(),
            Value::Bool(b) => b.to_string().into_bytes(),
            other => {
                return Err(EmitError::UnsupportedValue {
                    field: field.clone(),
                    kind: kind_of(other),
                })
            }
        };
        payload.insert(field.clone(), bytes);
    }

    Ok(payload)
}

/// Append `payload` to `stream`. With a `limit` the stream is trimmed to approximately that
/// many entries, so old history does not grow without bound.
pub async fn emit(
    store: &dyn LogStore,
    stream: &str,
    payload: &Payload,
    limit: Option<usize>,
) -> Result<EntryId, EmitError> {
    if payload.is_empty() {
        return Err(EmitError::EmptyPayload);
    }

    let id = store.append(stream, payload, limit).await?;

    metrics::counter!("streamer_entries_emitted_total", "stream" => stream.to_owned())
        .increment(1);
    debug!(stream, id = %id, fields = payload.len(), "emitted entry");

    Ok(id)
}
