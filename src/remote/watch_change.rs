use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::error::{
    deadline_exceeded, internal_error, invalid_argument, not_found, permission_denied,
    resource_exhausted, unauthenticated, unavailable, SyncError, SyncResult,
};
use crate::model::{DocumentKey, MutableDocument, Timestamp};
use crate::remote::serializer::WireSerializer;

/// A single decoded message from the watch stream. Raw wire payloads are
/// parsed into this closed sum immediately so nothing downstream inspects
/// JSON shapes.
#[derive(Debug, Clone)]
pub enum WatchChange {
    TargetChange(WatchTargetChange),
    DocumentChange(DocumentChange),
    DocumentDelete(DocumentDelete),
    DocumentRemove(DocumentRemove),
    ExistenceFilter(ExistenceFilterChange),
}

#[derive(Debug, Clone)]
pub struct WatchTargetChange {
    pub state: TargetChangeState,
    /// Affected targets; empty means "all currently tracked targets".
    pub target_ids: Vec<i32>,
    pub resume_token: Option<Vec<u8>>,
    pub read_time: Option<Timestamp>,
    pub cause: Option<SyncError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetChangeState {
    NoChange,
    Add,
    Remove,
    Current,
    Reset,
}

#[derive(Debug, Clone)]
pub struct DocumentChange {
    pub updated_target_ids: Vec<i32>,
    pub removed_target_ids: Vec<i32>,
    pub document: MutableDocument,
}

#[derive(Debug, Clone)]
pub struct DocumentDelete {
    pub key: DocumentKey,
    pub read_time: Option<Timestamp>,
    pub removed_target_ids: Vec<i32>,
}

#[derive(Debug, Clone)]
pub struct DocumentRemove {
    pub key: DocumentKey,
    pub read_time: Option<Timestamp>,
    pub removed_target_ids: Vec<i32>,
}

#[derive(Debug, Clone)]
pub struct ExistenceFilterChange {
    pub target_id: i32,
    /// Number of documents the server believes match the target.
    pub count: i32,
    pub unchanged_names: Option<BloomFilterSpec>,
}

/// Wire form of the optional bloom filter attached to an existence filter.
#[derive(Debug, Clone)]
pub struct BloomFilterSpec {
    pub bitmap: Vec<u8>,
    pub padding: u32,
    pub hash_count: u32,
}

#[derive(Debug, Deserialize)]
struct StatusCause {
    code: i32,
    #[serde(default)]
    message: Option<String>,
}

pub fn decode_watch_change(
    serializer: &WireSerializer,
    value: &JsonValue,
) -> SyncResult<Option<WatchChange>> {
    if let Some(target_change) = value.get("targetChange") {
        return decode_target_change(serializer, target_change).map(Some);
    }
    if let Some(document_change) = value.get("documentChange") {
        return decode_document_change(serializer, document_change).map(Some);
    }
    if let Some(document_delete) = value.get("documentDelete") {
        return decode_document_removal(serializer, document_delete)
            .map(|(key, read_time, targets)| {
                Some(WatchChange::DocumentDelete(DocumentDelete {
                    key,
                    read_time,
                    removed_target_ids: targets,
                }))
            });
    }
    if let Some(document_remove) = value.get("documentRemove") {
        return decode_document_removal(serializer, document_remove)
            .map(|(key, read_time, targets)| {
                Some(WatchChange::DocumentRemove(DocumentRemove {
                    key,
                    read_time,
                    removed_target_ids: targets,
                }))
            });
    }
    if let Some(filter) = value.get("filter") {
        return decode_existence_filter(filter).map(Some);
    }
    Ok(None)
}

fn decode_target_change(
    serializer: &WireSerializer,
    value: &JsonValue,
) -> SyncResult<WatchChange> {
    let target_ids = numeric_array(value.get("targetIds"));
    let resume_token = value
        .get("resumeToken")
        .and_then(JsonValue::as_str)
        .and_then(|token| BASE64_STANDARD.decode(token).ok());
    let read_time = value
        .get("readTime")
        .and_then(JsonValue::as_str)
        .map(|timestamp| serializer.decode_timestamp(timestamp))
        .transpose()?;
    let state = value
        .get("targetChangeType")
        .and_then(JsonValue::as_str)
        .map(target_state_from_str)
        .unwrap_or(TargetChangeState::NoChange);
    let cause = value
        .get("cause")
        .map(|cause| serde_json::from_value::<StatusCause>(cause.clone()))
        .transpose()
        .map_err(|err| internal_error(format!("failed to decode watch cause: {err}")))?
        .map(|cause| map_rpc_status(cause.code, cause.message));

    Ok(WatchChange::TargetChange(WatchTargetChange {
        state,
        target_ids,
        resume_token,
        read_time,
        cause,
    }))
}

fn decode_document_change(
    serializer: &WireSerializer,
    value: &JsonValue,
) -> SyncResult<WatchChange> {
    let document = value
        .get("document")
        .ok_or_else(|| invalid_argument("documentChange missing document"))?;
    let name = document
        .get("name")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("watch document missing name"))?;
    let key = serializer.document_key_from_name(name)?;
    let fields = serializer.decode_fields(document)?;
    let version = document
        .get("updateTime")
        .and_then(JsonValue::as_str)
        .map(|timestamp| serializer.decode_timestamp(timestamp))
        .transpose()?
        .unwrap_or(Timestamp::ZERO);

    Ok(WatchChange::DocumentChange(DocumentChange {
        updated_target_ids: numeric_array(value.get("targetIds")),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        document: MutableDocument::new_found(key, version, fields),
    }))
}

fn decode_document_removal(
    serializer: &WireSerializer,
    value: &JsonValue,
) -> SyncResult<(DocumentKey, Option<Timestamp>, Vec<i32>)> {
    let name = value
        .get("document")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("document removal missing document name"))?;
    let key = serializer.document_key_from_name(name)?;
    let read_time = value
        .get("readTime")
        .and_then(JsonValue::as_str)
        .map(|timestamp| serializer.decode_timestamp(timestamp))
        .transpose()?;
    Ok((key, read_time, numeric_array(value.get("removedTargetIds"))))
}

fn decode_existence_filter(value: &JsonValue) -> SyncResult<WatchChange> {
    let target_id = value
        .get("targetId")
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| invalid_argument("filter missing targetId"))? as i32;
    let count = value
        .get("count")
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| invalid_argument("filter missing count"))? as i32;

    let unchanged_names = match value.get("unchangedNames") {
        Some(spec) => {
            let bitmap = spec
                .get("bits")
                .and_then(|bits| bits.get("bitmap"))
                .and_then(JsonValue::as_str)
                .map(|encoded| {
                    BASE64_STANDARD
                        .decode(encoded)
                        .map_err(|err| invalid_argument(format!("invalid bloom bitmap: {err}")))
                })
                .transpose()?
                .unwrap_or_default();
            let padding = spec
                .get("bits")
                .and_then(|bits| bits.get("padding"))
                .and_then(JsonValue::as_u64)
                .unwrap_or(0) as u32;
            let hash_count = spec
                .get("hashCount")
                .and_then(JsonValue::as_u64)
                .unwrap_or(0) as u32;
            Some(BloomFilterSpec {
                bitmap,
                padding,
                hash_count,
            })
        }
        None => None,
    };

    Ok(WatchChange::ExistenceFilter(ExistenceFilterChange {
        target_id,
        count,
        unchanged_names,
    }))
}

fn numeric_array(value: Option<&JsonValue>) -> Vec<i32> {
    value
        .and_then(JsonValue::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.as_i64().map(|value| value as i32))
                .collect()
        })
        .unwrap_or_default()
}

fn target_state_from_str(value: &str) -> TargetChangeState {
    match value {
        "ADD" => TargetChangeState::Add,
        "REMOVE" => TargetChangeState::Remove,
        "CURRENT" => TargetChangeState::Current,
        "RESET" => TargetChangeState::Reset,
        _ => TargetChangeState::NoChange,
    }
}

pub fn map_rpc_status(code: i32, message: Option<String>) -> SyncError {
    let message = message.unwrap_or_else(|| "watch stream error".to_string());
    match code {
        3 => invalid_argument(message),
        4 => deadline_exceeded(message),
        5 => not_found(message),
        7 => permission_denied(message),
        8 => resource_exhausted(message),
        14 => unavailable(message),
        16 => unauthenticated(message),
        _ => internal_error(message),
    }
}
