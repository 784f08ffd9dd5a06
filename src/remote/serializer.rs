use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{json, Value as JsonValue};

use crate::error::{internal_error, invalid_argument, SyncResult};
use crate::model::{
    DatabaseId, DocumentKey, FieldTransform, Mutation, Precondition, Timestamp,
    TransformOperation,
};
use crate::query::{Direction, FieldFilter, FilterOperator, Query};
use crate::value::{FieldValue, MapValue, ValueKind};

/// Translates between the in-memory model and the JSON-tagged wire format
/// spoken on the listen and write streams.
#[derive(Clone, Debug)]
pub struct WireSerializer {
    database_id: DatabaseId,
}

impl WireSerializer {
    pub fn new(database_id: DatabaseId) -> Self {
        Self { database_id }
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    pub fn database_name(&self) -> String {
        format!(
            "projects/{}/databases/{}",
            self.database_id.project_id(),
            self.database_id.database()
        )
    }

    pub fn document_name(&self, key: &DocumentKey) -> String {
        format!(
            "{}/documents/{}",
            self.database_name(),
            key.path().canonical_string()
        )
    }

    pub fn document_key_from_name(&self, name: &str) -> SyncResult<DocumentKey> {
        let prefix = format!("{}/documents/", self.database_name());
        let relative = name.strip_prefix(&prefix).ok_or_else(|| {
            invalid_argument(format!("document name {name} is outside this database"))
        })?;
        DocumentKey::from_string(relative)
    }

    pub fn encode_timestamp(&self, timestamp: Timestamp) -> SyncResult<String> {
        Utc.timestamp_opt(timestamp.seconds, timestamp.nanos as u32)
            .single()
            .map(|datetime| datetime.to_rfc3339_opts(SecondsFormat::Nanos, true))
            .ok_or_else(|| internal_error("timestamp out of range for wire encoding"))
    }

    pub fn decode_timestamp(&self, value: &str) -> SyncResult<Timestamp> {
        let parsed = DateTime::parse_from_rfc3339(value)
            .map_err(|err| invalid_argument(format!("invalid wire timestamp {value}: {err}")))?;
        Ok(Timestamp::new(
            parsed.timestamp(),
            parsed.timestamp_subsec_nanos() as i32,
        ))
    }

    pub fn encode_value(&self, value: &FieldValue) -> SyncResult<JsonValue> {
        Ok(match value.kind() {
            ValueKind::Null => json!({ "nullValue": JsonValue::Null }),
            ValueKind::Boolean(b) => json!({ "booleanValue": b }),
            ValueKind::Integer(i) => json!({ "integerValue": i.to_string() }),
            ValueKind::Double(d) => json!({ "doubleValue": d }),
            ValueKind::Timestamp(ts) => json!({ "timestampValue": self.encode_timestamp(*ts)? }),
            ValueKind::String(s) => json!({ "stringValue": s }),
            ValueKind::Bytes(bytes) => json!({ "bytesValue": BASE64_STANDARD.encode(bytes) }),
            ValueKind::Array(array) => {
                let values = array
                    .values()
                    .iter()
                    .map(|v| self.encode_value(v))
                    .collect::<SyncResult<Vec<_>>>()?;
                json!({ "arrayValue": { "values": values } })
            }
            ValueKind::Map(map) => json!({ "mapValue": { "fields": self.encode_fields(map)? } }),
        })
    }

    pub fn decode_value(&self, value: &JsonValue) -> SyncResult<FieldValue> {
        let object = value
            .as_object()
            .ok_or_else(|| invalid_argument("wire values must be objects"))?;

        if object.contains_key("nullValue") {
            return Ok(FieldValue::null());
        }
        if let Some(b) = object.get("booleanValue").and_then(JsonValue::as_bool) {
            return Ok(FieldValue::from_bool(b));
        }
        if let Some(raw) = object.get("integerValue") {
            let parsed = match raw {
                JsonValue::String(s) => s.parse::<i64>().ok(),
                JsonValue::Number(n) => n.as_i64(),
                _ => None,
            };
            return parsed
                .map(FieldValue::from_integer)
                .ok_or_else(|| invalid_argument("invalid integerValue"));
        }
        if let Some(d) = object.get("doubleValue").and_then(JsonValue::as_f64) {
            return Ok(FieldValue::from_double(d));
        }
        if let Some(ts) = object.get("timestampValue").and_then(JsonValue::as_str) {
            return Ok(FieldValue::from_timestamp(self.decode_timestamp(ts)?));
        }
        if let Some(s) = object.get("stringValue").and_then(JsonValue::as_str) {
            return Ok(FieldValue::from_string(s));
        }
        if let Some(b) = object.get("bytesValue").and_then(JsonValue::as_str) {
            let bytes = BASE64_STANDARD
                .decode(b)
                .map_err(|err| invalid_argument(format!("invalid bytesValue: {err}")))?;
            return Ok(FieldValue::from_bytes(bytes));
        }
        if let Some(array) = object.get("arrayValue") {
            let values = array
                .get("values")
                .and_then(JsonValue::as_array)
                .map(|entries| {
                    entries
                        .iter()
                        .map(|entry| self.decode_value(entry))
                        .collect::<SyncResult<Vec<_>>>()
                })
                .transpose()?
                .unwrap_or_default();
            return Ok(FieldValue::from_array(values));
        }
        if let Some(map) = object.get("mapValue") {
            return Ok(FieldValue::from_map_value(self.decode_fields(map)?));
        }
        Err(invalid_argument("unrecognized wire value tag"))
    }

    pub fn encode_fields(&self, map: &MapValue) -> SyncResult<JsonValue> {
        let mut fields = serde_json::Map::new();
        for (name, value) in map.fields() {
            fields.insert(name.clone(), self.encode_value(value)?);
        }
        Ok(JsonValue::Object(fields))
    }

    /// Decodes the `fields` member of a wire document (or map value).
    pub fn decode_fields(&self, value: &JsonValue) -> SyncResult<MapValue> {
        let fields = match value.get("fields") {
            Some(JsonValue::Object(fields)) => fields,
            Some(_) => return Err(invalid_argument("document fields must be an object")),
            None => return Ok(MapValue::empty()),
        };
        let mut decoded = BTreeMap::new();
        for (name, value) in fields {
            decoded.insert(name.clone(), self.decode_value(value)?);
        }
        Ok(MapValue::new(decoded))
    }

    pub fn encode_mutation(&self, mutation: &Mutation) -> SyncResult<JsonValue> {
        let mut write = serde_json::Map::new();
        match mutation {
            Mutation::Set { key, value, .. } => {
                write.insert(
                    "update".to_string(),
                    json!({
                        "name": self.document_name(key),
                        "fields": self.encode_fields(value)?,
                    }),
                );
            }
            Mutation::Patch {
                key, data, mask, ..
            } => {
                write.insert(
                    "update".to_string(),
                    json!({
                        "name": self.document_name(key),
                        "fields": self.encode_fields(data)?,
                    }),
                );
                let paths: Vec<String> = mask
                    .fields()
                    .iter()
                    .map(|path| path.canonical_string())
                    .collect();
                write.insert("updateMask".to_string(), json!({ "fieldPaths": paths }));
            }
            Mutation::Delete { key, .. } => {
                write.insert("delete".to_string(), json!(self.document_name(key)));
            }
            Mutation::Verify { key, .. } => {
                write.insert("verify".to_string(), json!(self.document_name(key)));
            }
        }

        if let Some(transforms) = self.encode_field_transforms(mutation.field_transforms())? {
            write.insert("updateTransforms".to_string(), JsonValue::Array(transforms));
        }
        if let Some(precondition) = self.encode_precondition(mutation.precondition())? {
            write.insert("currentDocument".to_string(), precondition);
        }
        Ok(JsonValue::Object(write))
    }

    fn encode_precondition(&self, precondition: &Precondition) -> SyncResult<Option<JsonValue>> {
        Ok(match precondition {
            Precondition::None => None,
            Precondition::Exists(exists) => Some(json!({ "exists": exists })),
            Precondition::UpdateTime(version) => {
                Some(json!({ "updateTime": self.encode_timestamp(*version)? }))
            }
        })
    }

    fn encode_field_transforms(
        &self,
        transforms: &[FieldTransform],
    ) -> SyncResult<Option<Vec<JsonValue>>> {
        if transforms.is_empty() {
            return Ok(None);
        }
        let mut encoded = Vec::with_capacity(transforms.len());
        for transform in transforms {
            let field_path = transform.field().canonical_string();
            let value = match transform.operation() {
                TransformOperation::ServerTimestamp => json!({
                    "fieldPath": field_path,
                    "setToServerValue": "REQUEST_TIME",
                }),
                TransformOperation::Increment(operand) => json!({
                    "fieldPath": field_path,
                    "increment": self.encode_value(operand)?,
                }),
                TransformOperation::ArrayUnion(elements) => json!({
                    "fieldPath": field_path,
                    "appendMissingElements": {
                        "values": elements
                            .iter()
                            .map(|value| self.encode_value(value))
                            .collect::<SyncResult<Vec<_>>>()?,
                    },
                }),
                TransformOperation::ArrayRemove(elements) => json!({
                    "fieldPath": field_path,
                    "removeAllFromArray": {
                        "values": elements
                            .iter()
                            .map(|value| self.encode_value(value))
                            .collect::<SyncResult<Vec<_>>>()?,
                    },
                }),
            };
            encoded.push(value);
        }
        Ok(Some(encoded))
    }

    /// The `parent` resource the structured query runs under.
    pub fn query_parent(&self, query: &Query) -> String {
        let parent_path = match query.collection_group_id() {
            Some(_) => query.path().clone(),
            None => query.path().without_last(),
        };
        if parent_path.is_empty() {
            format!("{}/documents", self.database_name())
        } else {
            format!(
                "{}/documents/{}",
                self.database_name(),
                parent_path.canonical_string()
            )
        }
    }

    pub fn encode_structured_query(&self, query: &Query) -> SyncResult<JsonValue> {
        let query = query.as_limit_to_first_for_server();
        let mut structured = serde_json::Map::new();

        let from = match query.collection_group_id() {
            Some(group) => json!([{ "collectionId": group, "allDescendants": true }]),
            None => json!([{
                "collectionId": query
                    .path()
                    .last_segment()
                    .ok_or_else(|| invalid_argument("queries must name a collection"))?,
            }]),
        };
        structured.insert("from".to_string(), from);

        if !query.filters().is_empty() {
            let filters = query
                .filters()
                .iter()
                .map(|filter| self.encode_field_filter(filter))
                .collect::<SyncResult<Vec<_>>>()?;
            let where_clause = if filters.len() == 1 {
                filters.into_iter().next().expect("one filter")
            } else {
                json!({ "compositeFilter": { "op": "AND", "filters": filters } })
            };
            structured.insert("where".to_string(), where_clause);
        }

        let order_by: Vec<JsonValue> = query
            .normalized_order_by()
            .iter()
            .map(|order| {
                json!({
                    "field": { "fieldPath": order.field().canonical_string() },
                    "direction": match order.direction() {
                        Direction::Ascending => "ASCENDING",
                        Direction::Descending => "DESCENDING",
                    },
                })
            })
            .collect();
        structured.insert("orderBy".to_string(), JsonValue::Array(order_by));

        if let Some(limit) = query.limit() {
            structured.insert("limit".to_string(), json!(limit));
        }
        if let Some(bound) = query.start_at() {
            structured.insert(
                "startAt".to_string(),
                json!({
                    "values": bound
                        .position()
                        .iter()
                        .map(|value| self.encode_value(value))
                        .collect::<SyncResult<Vec<_>>>()?,
                    "before": bound.inclusive(),
                }),
            );
        }
        if let Some(bound) = query.end_at() {
            structured.insert(
                "endAt".to_string(),
                json!({
                    "values": bound
                        .position()
                        .iter()
                        .map(|value| self.encode_value(value))
                        .collect::<SyncResult<Vec<_>>>()?,
                    "before": !bound.inclusive(),
                }),
            );
        }
        Ok(JsonValue::Object(structured))
    }

    fn encode_field_filter(&self, filter: &FieldFilter) -> SyncResult<JsonValue> {
        let op = match filter.op() {
            FilterOperator::Equal => "EQUAL",
            FilterOperator::NotEqual => "NOT_EQUAL",
            FilterOperator::LessThan => "LESS_THAN",
            FilterOperator::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
            FilterOperator::GreaterThan => "GREATER_THAN",
            FilterOperator::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
            FilterOperator::ArrayContains => "ARRAY_CONTAINS",
            FilterOperator::ArrayContainsAny => "ARRAY_CONTAINS_ANY",
            FilterOperator::In => "IN",
            FilterOperator::NotIn => "NOT_IN",
        };
        Ok(json!({
            "fieldFilter": {
                "field": { "fieldPath": filter.field().canonical_string() },
                "op": op,
                "value": self.encode_value(filter.value())?,
            }
        }))
    }
}
