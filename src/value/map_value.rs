use std::collections::BTreeMap;

use crate::model::FieldPath;
use crate::value::{FieldValue, ValueKind};

/// Nested field map carried by every found document.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct MapValue {
    fields: BTreeMap<String, FieldValue>,
}

impl MapValue {
    pub fn new(fields: BTreeMap<String, FieldValue>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Resolves the value at a (possibly nested) field path.
    pub fn field(&self, path: &FieldPath) -> Option<&FieldValue> {
        let mut current = &self.fields;
        let segments = path.segments();
        for segment in &segments[..segments.len() - 1] {
            match current.get(segment).map(FieldValue::kind) {
                Some(ValueKind::Map(map)) => current = map.fields(),
                _ => return None,
            }
        }
        current.get(segments.last().map(String::as_str)?)
    }

    /// Writes `value` at the field path, creating intermediate maps.
    pub fn set(&mut self, path: &FieldPath, value: FieldValue) {
        set_at_segments(&mut self.fields, path.segments(), value);
    }

    /// Removes the value at the field path, pruning empty intermediate maps.
    pub fn delete(&mut self, path: &FieldPath) {
        delete_at_segments(&mut self.fields, path.segments());
    }
}

fn set_at_segments(fields: &mut BTreeMap<String, FieldValue>, segments: &[String], value: FieldValue) {
    if segments.len() == 1 {
        fields.insert(segments[0].clone(), value);
        return;
    }

    let child_fields = match fields.get(&segments[0]).map(FieldValue::kind) {
        Some(ValueKind::Map(map)) => map.fields().clone(),
        _ => BTreeMap::new(),
    };
    let mut child_fields = child_fields;
    set_at_segments(&mut child_fields, &segments[1..], value);
    fields.insert(segments[0].clone(), FieldValue::from_map(child_fields));
}

fn delete_at_segments(fields: &mut BTreeMap<String, FieldValue>, segments: &[String]) {
    if segments.is_empty() {
        return;
    }
    if segments.len() == 1 {
        fields.remove(&segments[0]);
        return;
    }

    if let Some(ValueKind::Map(child)) = fields.get(&segments[0]).map(FieldValue::kind) {
        let mut child_fields = child.fields().clone();
        delete_at_segments(&mut child_fields, &segments[1..]);
        if child_fields.is_empty() {
            fields.remove(&segments[0]);
        } else {
            fields.insert(segments[0].clone(), FieldValue::from_map(child_fields));
        }
    }
}
