use std::collections::BTreeSet;

use crate::model::{DocumentKey, FieldPath, MutableDocument, Timestamp};
use crate::value::{FieldValue, MapValue, ValueKind};

/// Guard a mutation carries against the target document's current state.
#[derive(Clone, Debug, PartialEq)]
pub enum Precondition {
    None,
    Exists(bool),
    UpdateTime(Timestamp),
}

impl Precondition {
    pub fn is_validated_by(&self, doc: &MutableDocument) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => doc.is_found_document() == *exists,
            Precondition::UpdateTime(version) => {
                doc.is_found_document() && doc.version() == *version
            }
        }
    }
}

/// Server-evaluated transformation of a single field.
#[derive(Clone, Debug, PartialEq)]
pub enum TransformOperation {
    ServerTimestamp,
    Increment(FieldValue),
    ArrayUnion(Vec<FieldValue>),
    ArrayRemove(Vec<FieldValue>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldTransform {
    field: FieldPath,
    operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field: FieldPath, operation: TransformOperation) -> Self {
        Self { field, operation }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn operation(&self) -> &TransformOperation {
        &self.operation
    }

    /// Optimistic local evaluation used while the write is still pending.
    fn apply_to_local_view(
        &self,
        previous: Option<&FieldValue>,
        local_write_time: Timestamp,
    ) -> FieldValue {
        match &self.operation {
            TransformOperation::ServerTimestamp => FieldValue::from_timestamp(local_write_time),
            TransformOperation::Increment(operand) => numeric_increment(previous, operand),
            TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
            TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
        }
    }
}

fn numeric_increment(existing: Option<&FieldValue>, operand: &FieldValue) -> FieldValue {
    let delta_int = match operand.kind() {
        ValueKind::Integer(delta) => Some(*delta),
        _ => None,
    };
    let delta_double = match operand.kind() {
        ValueKind::Double(delta) => Some(*delta),
        _ => None,
    };

    match existing.map(FieldValue::kind) {
        Some(ValueKind::Integer(current)) => {
            if let Some(delta) = delta_int {
                match current.checked_add(delta) {
                    Some(sum) => FieldValue::from_integer(sum),
                    None => FieldValue::from_double(*current as f64 + delta as f64),
                }
            } else {
                FieldValue::from_double(*current as f64 + delta_double.unwrap_or(0.0))
            }
        }
        Some(ValueKind::Double(current)) => FieldValue::from_double(
            current + delta_int.map(|d| d as f64).or(delta_double).unwrap_or(0.0),
        ),
        _ => match (delta_int, delta_double) {
            (Some(delta), _) => FieldValue::from_integer(delta),
            (_, Some(delta)) => FieldValue::from_double(delta),
            _ => FieldValue::from_integer(0),
        },
    }
}

fn array_union(existing: Option<&FieldValue>, additions: &[FieldValue]) -> FieldValue {
    let mut values = match existing.map(FieldValue::kind) {
        Some(ValueKind::Array(array)) => array.values().to_vec(),
        _ => Vec::new(),
    };
    for element in additions {
        if !values.iter().any(|candidate| candidate == element) {
            values.push(element.clone());
        }
    }
    FieldValue::from_array(values)
}

fn array_remove(existing: Option<&FieldValue>, removals: &[FieldValue]) -> FieldValue {
    let values = match existing.map(FieldValue::kind) {
        Some(ValueKind::Array(array)) => array.values().to_vec(),
        _ => Vec::new(),
    };
    FieldValue::from_array(
        values
            .into_iter()
            .filter(|candidate| !removals.iter().any(|needle| needle == candidate))
            .collect(),
    )
}

/// Sorted, deduplicated set of field paths named by a patch.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct FieldMask {
    fields: Vec<FieldPath>,
}

impl FieldMask {
    pub fn new(mut fields: Vec<FieldPath>) -> Self {
        fields.sort();
        fields.dedup();
        Self { fields }
    }

    pub fn fields(&self) -> &[FieldPath] {
        &self.fields
    }

    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|field| {
            field == path
                || (field.segments().len() < path.segments().len()
                    && path.segments()[..field.segments().len()] == *field.segments())
        })
    }

    pub fn union_with(&self, paths: impl IntoIterator<Item = FieldPath>) -> Self {
        let mut fields = self.fields.clone();
        fields.extend(paths);
        Self::new(fields)
    }
}

/// Result the server reports for one mutation inside an acknowledged batch.
#[derive(Clone, Debug)]
pub struct MutationResult {
    pub version: Timestamp,
    pub transform_results: Vec<FieldValue>,
}

/// An atomic intent to change one document.
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    Set {
        key: DocumentKey,
        value: MapValue,
        transforms: Vec<FieldTransform>,
        precondition: Precondition,
    },
    Patch {
        key: DocumentKey,
        data: MapValue,
        mask: FieldMask,
        transforms: Vec<FieldTransform>,
        precondition: Precondition,
    },
    Delete {
        key: DocumentKey,
        precondition: Precondition,
    },
    Verify {
        key: DocumentKey,
        precondition: Precondition,
    },
}

impl Mutation {
    pub fn set(key: DocumentKey, value: MapValue) -> Self {
        Mutation::Set {
            key,
            value,
            transforms: Vec::new(),
            precondition: Precondition::None,
        }
    }

    pub fn patch(key: DocumentKey, data: MapValue, mask: FieldMask) -> Self {
        Mutation::Patch {
            key,
            data,
            mask,
            transforms: Vec::new(),
            precondition: Precondition::Exists(true),
        }
    }

    pub fn delete(key: DocumentKey) -> Self {
        Mutation::Delete {
            key,
            precondition: Precondition::None,
        }
    }

    pub fn verify(key: DocumentKey, precondition: Precondition) -> Self {
        Mutation::Verify { key, precondition }
    }

    pub fn with_precondition(mut self, new_precondition: Precondition) -> Self {
        match &mut self {
            Mutation::Set { precondition, .. }
            | Mutation::Patch { precondition, .. }
            | Mutation::Delete { precondition, .. }
            | Mutation::Verify { precondition, .. } => *precondition = new_precondition,
        }
        self
    }

    pub fn with_transforms(mut self, new_transforms: Vec<FieldTransform>) -> Self {
        match &mut self {
            Mutation::Set { transforms, .. } | Mutation::Patch { transforms, .. } => {
                *transforms = new_transforms;
            }
            Mutation::Delete { .. } | Mutation::Verify { .. } => {}
        }
        self
    }

    pub fn key(&self) -> &DocumentKey {
        match self {
            Mutation::Set { key, .. }
            | Mutation::Patch { key, .. }
            | Mutation::Delete { key, .. }
            | Mutation::Verify { key, .. } => key,
        }
    }

    pub fn precondition(&self) -> &Precondition {
        match self {
            Mutation::Set { precondition, .. }
            | Mutation::Patch { precondition, .. }
            | Mutation::Delete { precondition, .. }
            | Mutation::Verify { precondition, .. } => precondition,
        }
    }

    pub fn field_transforms(&self) -> &[FieldTransform] {
        match self {
            Mutation::Set { transforms, .. } | Mutation::Patch { transforms, .. } => transforms,
            Mutation::Delete { .. } | Mutation::Verify { .. } => &[],
        }
    }

    /// Applies this mutation to the latency-compensated local view of `doc`.
    ///
    /// `previous_mask` tracks which fields earlier overlays mutated: `Some`
    /// accumulates patched paths, `None` means the document was already
    /// replaced wholesale. The returned mask follows the same convention and
    /// feeds [`calculate_overlay_mutation`].
    pub fn apply_to_local_view(
        &self,
        doc: &mut MutableDocument,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> Option<FieldMask> {
        if !self.precondition().is_validated_by(doc) {
            return previous_mask;
        }

        match self {
            Mutation::Set {
                value, transforms, ..
            } => {
                let mut data = value.clone();
                apply_transforms_to_local_view(&mut data, transforms, local_write_time);
                doc.convert_to_found(doc.version(), data);
                doc.set_has_local_mutations();
                None
            }
            Mutation::Patch {
                data,
                mask,
                transforms,
                ..
            } => {
                let mut new_data = doc.data().clone();
                for path in mask.fields() {
                    match data.field(path) {
                        Some(value) => new_data.set(path, value.clone()),
                        None => new_data.delete(path),
                    }
                }
                apply_transforms_to_local_view(&mut new_data, transforms, local_write_time);
                doc.convert_to_found(doc.version(), new_data);
                doc.set_has_local_mutations();
                previous_mask.map(|previous| {
                    previous.union_with(
                        mask.fields()
                            .iter()
                            .cloned()
                            .chain(transforms.iter().map(|t| t.field().clone())),
                    )
                })
            }
            Mutation::Delete { .. } => {
                doc.convert_to_no_document(Timestamp::ZERO);
                doc.set_has_local_mutations();
                None
            }
            Mutation::Verify { .. } => previous_mask,
        }
    }

    /// Applies the server-acknowledged outcome of this mutation to the
    /// cached remote document.
    pub fn apply_to_remote_document(&self, doc: &mut MutableDocument, result: &MutationResult) {
        if !self.precondition().is_validated_by(doc) {
            // The server applied the write against state we never saw; the
            // contents are unknown until the watch stream catches up.
            doc.convert_to_unknown(result.version);
            return;
        }

        match self {
            Mutation::Set {
                value, transforms, ..
            } => {
                let mut data = value.clone();
                apply_server_transform_results(&mut data, transforms, &result.transform_results);
                doc.convert_to_found(result.version, data);
                doc.set_has_committed_mutations();
            }
            Mutation::Patch {
                data,
                mask,
                transforms,
                ..
            } => {
                let mut new_data = doc.data().clone();
                for path in mask.fields() {
                    match data.field(path) {
                        Some(value) => new_data.set(path, value.clone()),
                        None => new_data.delete(path),
                    }
                }
                apply_server_transform_results(&mut new_data, transforms, &result.transform_results);
                doc.convert_to_found(result.version, new_data);
                doc.set_has_committed_mutations();
            }
            Mutation::Delete { .. } => {
                doc.convert_to_no_document(result.version);
                doc.set_has_committed_mutations();
            }
            Mutation::Verify { .. } => {}
        }
    }
}

fn apply_transforms_to_local_view(
    data: &mut MapValue,
    transforms: &[FieldTransform],
    local_write_time: Timestamp,
) {
    for transform in transforms {
        let previous = data.field(transform.field()).cloned();
        let new_value = transform.apply_to_local_view(previous.as_ref(), local_write_time);
        data.set(transform.field(), new_value);
    }
}

fn apply_server_transform_results(
    data: &mut MapValue,
    transforms: &[FieldTransform],
    results: &[FieldValue],
) {
    for (transform, result) in transforms.iter().zip(results.iter()) {
        data.set(transform.field(), result.clone());
    }
}

/// Folds a fully-overlaid local document back into the single mutation that
/// reproduces it from the server state.
///
/// Recomputing the fold over the same batch range always yields the same
/// overlay, so the computation may be repeated at any time.
pub fn calculate_overlay_mutation(
    doc: &MutableDocument,
    mask: Option<&FieldMask>,
) -> Option<Mutation> {
    if !doc.has_local_mutations() {
        return None;
    }

    match mask {
        None => {
            if doc.is_no_document() {
                Some(Mutation::delete(doc.key().clone()))
            } else {
                Some(Mutation::set(doc.key().clone(), doc.data().clone()))
            }
        }
        Some(mask) => {
            if mask.fields().is_empty() {
                return None;
            }
            let mut data = MapValue::empty();
            for path in mask.fields() {
                if let Some(value) = doc.field(path) {
                    data.set(path, value.clone());
                }
            }
            Some(
                Mutation::patch(doc.key().clone(), data, mask.clone())
                    .with_precondition(Precondition::None),
            )
        }
    }
}

/// Ordered, durable unit of one local write call.
#[derive(Clone, Debug)]
pub struct MutationBatch {
    pub batch_id: i32,
    pub local_write_time: Timestamp,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(batch_id: i32, local_write_time: Timestamp, mutations: Vec<Mutation>) -> Self {
        Self {
            batch_id,
            local_write_time,
            mutations,
        }
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.mutations
            .iter()
            .map(|mutation| mutation.key().clone())
            .collect()
    }

    pub fn affects_key(&self, key: &DocumentKey) -> bool {
        self.mutations.iter().any(|mutation| mutation.key() == key)
    }

    /// Applies every mutation in this batch that targets `doc` to its local
    /// view, threading the accumulated field mask through.
    pub fn apply_to_local_view(
        &self,
        doc: &mut MutableDocument,
        mut mask: Option<FieldMask>,
    ) -> Option<FieldMask> {
        for mutation in &self.mutations {
            if mutation.key() == doc.key() {
                mask = mutation.apply_to_local_view(doc, mask, self.local_write_time);
            }
        }
        mask
    }

    /// Applies the server results for this batch to the remote document.
    pub fn apply_to_remote_document(
        &self,
        doc: &mut MutableDocument,
        results: &[MutationResult],
    ) {
        for (mutation, result) in self.mutations.iter().zip(results.iter()) {
            if mutation.key() == doc.key() {
                mutation.apply_to_remote_document(doc, result);
            }
        }
    }
}

/// Acknowledgement payload for one batch.
#[derive(Clone, Debug)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: Timestamp,
    pub mutation_results: Vec<MutationResult>,
}

impl MutationBatchResult {
    pub fn new(
        batch: MutationBatch,
        commit_version: Timestamp,
        mutation_results: Vec<MutationResult>,
    ) -> Self {
        Self {
            batch,
            commit_version,
            mutation_results,
        }
    }

    pub fn batch_id(&self) -> i32 {
        self.batch.batch_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn key() -> DocumentKey {
        DocumentKey::from_string("bookings/b1").unwrap()
    }

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    fn map(entries: &[(&str, FieldValue)]) -> MapValue {
        let mut fields = BTreeMap::new();
        for (name, value) in entries {
            fields.insert((*name).to_string(), value.clone());
        }
        MapValue::new(fields)
    }

    #[test]
    fn set_replaces_document_and_clears_mask() {
        let mut doc = MutableDocument::new_no_document(key(), Timestamp::new(1, 0));
        let mutation = Mutation::set(key(), map(&[("kwh", FieldValue::from_integer(30))]));
        let mask = mutation.apply_to_local_view(
            &mut doc,
            Some(FieldMask::default()),
            Timestamp::new(2, 0),
        );
        assert!(mask.is_none());
        assert!(doc.is_found_document());
        assert!(doc.has_local_mutations());
        assert_eq!(doc.field(&field("kwh")), Some(&FieldValue::from_integer(30)));
    }

    #[test]
    fn patch_respects_exists_precondition() {
        let mut missing = MutableDocument::new_no_document(key(), Timestamp::new(1, 0));
        let mutation = Mutation::patch(
            key(),
            map(&[("kwh", FieldValue::from_integer(40))]),
            FieldMask::new(vec![field("kwh")]),
        );
        let mask = mutation.apply_to_local_view(
            &mut missing,
            Some(FieldMask::default()),
            Timestamp::new(2, 0),
        );
        assert_eq!(mask, Some(FieldMask::default()));
        assert!(missing.is_no_document());
    }

    #[test]
    fn patch_accumulates_mask() {
        let mut doc = MutableDocument::new_found(
            key(),
            Timestamp::new(1, 0),
            map(&[("kwh", FieldValue::from_integer(10))]),
        );
        let mutation = Mutation::patch(
            key(),
            map(&[("status", FieldValue::from_string("confirmed"))]),
            FieldMask::new(vec![field("status")]),
        );
        let mask = mutation
            .apply_to_local_view(&mut doc, Some(FieldMask::default()), Timestamp::new(2, 0))
            .unwrap();
        assert!(mask.covers(&field("status")));
        assert!(!mask.covers(&field("kwh")));
    }

    #[test]
    fn server_timestamp_transform_uses_local_write_time() {
        let mut doc = MutableDocument::new_found(key(), Timestamp::new(1, 0), MapValue::empty());
        let write_time = Timestamp::new(77, 0);
        let mutation = Mutation::set(key(), MapValue::empty()).with_transforms(vec![
            FieldTransform::new(field("updatedAt"), TransformOperation::ServerTimestamp),
        ]);
        mutation.apply_to_local_view(&mut doc, None, write_time);
        assert_eq!(
            doc.field(&field("updatedAt")),
            Some(&FieldValue::from_timestamp(write_time))
        );
    }

    #[test]
    fn increment_transform_folds_numerically() {
        let mut doc = MutableDocument::new_found(
            key(),
            Timestamp::new(1, 0),
            map(&[("visits", FieldValue::from_integer(2))]),
        );
        let mutation = Mutation::patch(key(), MapValue::empty(), FieldMask::default())
            .with_transforms(vec![FieldTransform::new(
                field("visits"),
                TransformOperation::Increment(FieldValue::from_integer(3)),
            )]);
        mutation.apply_to_local_view(&mut doc, Some(FieldMask::default()), Timestamp::new(2, 0));
        assert_eq!(
            doc.field(&field("visits")),
            Some(&FieldValue::from_integer(5))
        );
    }

    #[test]
    fn overlay_fold_is_idempotent() {
        let base = MutableDocument::new_found(
            key(),
            Timestamp::new(1, 0),
            map(&[("kwh", FieldValue::from_integer(10))]),
        );
        let batch = MutationBatch::new(
            1,
            Timestamp::new(2, 0),
            vec![Mutation::patch(
                key(),
                map(&[("kwh", FieldValue::from_integer(20))]),
                FieldMask::new(vec![field("kwh")]),
            )],
        );

        let run = || {
            let mut doc = base.clone();
            let mask = batch.apply_to_local_view(&mut doc, Some(FieldMask::default()));
            calculate_overlay_mutation(&doc, mask.as_ref())
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn overlay_of_delete_is_delete() {
        let mut doc = MutableDocument::new_found(key(), Timestamp::new(1, 0), MapValue::empty());
        let mask =
            Mutation::delete(key()).apply_to_local_view(&mut doc, None, Timestamp::new(2, 0));
        let overlay = calculate_overlay_mutation(&doc, mask.as_ref()).unwrap();
        assert!(matches!(overlay, Mutation::Delete { .. }));
    }

    #[test]
    fn remote_ack_marks_committed() {
        let mut doc = MutableDocument::new_found(key(), Timestamp::new(1, 0), MapValue::empty());
        let mutation = Mutation::set(key(), map(&[("kwh", FieldValue::from_integer(9))]));
        mutation.apply_to_remote_document(
            &mut doc,
            &MutationResult {
                version: Timestamp::new(8, 0),
                transform_results: Vec::new(),
            },
        );
        assert!(doc.has_committed_mutations());
        assert_eq!(doc.version(), Timestamp::new(8, 0));
    }

    #[test]
    fn failed_remote_precondition_yields_unknown() {
        let mut doc = MutableDocument::new_no_document(key(), Timestamp::new(1, 0));
        let mutation = Mutation::patch(key(), MapValue::empty(), FieldMask::default());
        mutation.apply_to_remote_document(
            &mut doc,
            &MutationResult {
                version: Timestamp::new(9, 0),
                transform_results: Vec::new(),
            },
        );
        assert!(doc.is_unknown_document());
        assert_eq!(doc.version(), Timestamp::new(9, 0));
    }
}
