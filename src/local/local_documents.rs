use std::collections::{BTreeMap, BTreeSet};

use crate::local::mutation_queue::MutationQueue;
use crate::local::overlay_cache::DocumentOverlayCache;
use crate::local::remote_document_cache::RemoteDocumentCache;
use crate::model::{
    calculate_overlay_mutation, DocumentKey, FieldMask, MutableDocument, Mutation, Timestamp,
};
use crate::query::Query;

/// A document materialized for local consumption: server state with the
/// pending overlay raised on top, plus the fields that overlay mutated.
pub(crate) struct OverlaidDocument {
    pub doc: MutableDocument,
    pub mutated_fields: Option<FieldMask>,
}

/// Materializes the local view of one document.
pub(crate) fn get_document(
    remote: &RemoteDocumentCache,
    overlays: &DocumentOverlayCache,
    key: &DocumentKey,
) -> MutableDocument {
    get_overlaid_document(remote, overlays, key).doc
}

pub(crate) fn get_overlaid_document(
    remote: &RemoteDocumentCache,
    overlays: &DocumentOverlayCache,
    key: &DocumentKey,
) -> OverlaidDocument {
    let mut doc = remote.get(key);
    match overlays.overlay_for(key) {
        Some(overlay) => {
            let mutated_fields = mask_of(overlay.mutation());
            overlay
                .mutation()
                .apply_to_local_view(&mut doc, mutated_fields.clone(), Timestamp::now());
            OverlaidDocument {
                doc,
                mutated_fields,
            }
        }
        None => OverlaidDocument {
            doc,
            mutated_fields: Some(FieldMask::default()),
        },
    }
}

fn mask_of(mutation: &Mutation) -> Option<FieldMask> {
    match mutation {
        Mutation::Patch { mask, .. } => Some(mask.clone()),
        _ => None,
    }
}

/// Local documents created or replaced purely by pending overlays for the
/// scope of `query` (keys the remote cache may not track at all).
pub(crate) fn overlay_documents_for_query(
    remote: &RemoteDocumentCache,
    overlays: &DocumentOverlayCache,
    query: &Query,
) -> BTreeMap<DocumentKey, MutableDocument> {
    overlays
        .keys()
        .filter(|key| match query.collection_group_id() {
            Some(group) => key.collection_id() == group,
            None => key.collection_path() == *query.path(),
        })
        .map(|key| (key.clone(), get_document(remote, overlays, key)))
        .collect()
}

/// Re-derives the overlays for `keys` by folding every remaining queued
/// batch, oldest to newest, over the server-confirmed base. Returns the new
/// local view of each key.
pub(crate) fn recalculate_overlays(
    remote: &RemoteDocumentCache,
    queue: &MutationQueue,
    overlays: &mut DocumentOverlayCache,
    keys: &BTreeSet<DocumentKey>,
) -> BTreeMap<DocumentKey, MutableDocument> {
    let mut recalculated = BTreeMap::new();
    for key in keys {
        let mut doc = remote.get(key);
        let mut mask = Some(FieldMask::default());
        let mut largest_batch_id = None;

        for batch in queue.batches() {
            if batch.affects_key(key) {
                mask = batch.apply_to_local_view(&mut doc, mask);
                largest_batch_id = Some(batch.batch_id);
            }
        }

        match largest_batch_id {
            Some(batch_id) => match calculate_overlay_mutation(&doc, mask.as_ref()) {
                Some(mutation) => {
                    overlays.save_overlays(batch_id, [(key.clone(), mutation)].into());
                }
                None => {
                    overlays.remove_overlay(key);
                }
            },
            None => {
                overlays.remove_overlay(key);
            }
        }
        recalculated.insert(key.clone(), doc);
    }
    recalculated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FieldPath;
    use crate::value::{FieldValue, MapValue};
    use std::collections::BTreeMap as Map;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn fields(entries: &[(&str, i64)]) -> MapValue {
        let mut map = Map::new();
        for (name, value) in entries {
            map.insert((*name).to_string(), FieldValue::from_integer(*value));
        }
        MapValue::new(map)
    }

    #[test]
    fn overlay_is_raised_over_remote_state() {
        let mut remote = RemoteDocumentCache::new();
        remote.add(
            MutableDocument::new_found(key("bookings/a"), Timestamp::new(1, 0), fields(&[("kwh", 1)])),
            Timestamp::new(1, 0),
        );
        let mut overlays = DocumentOverlayCache::new();
        overlays.save_overlays(
            1,
            [(key("bookings/a"), Mutation::set(key("bookings/a"), fields(&[("kwh", 9)])))].into(),
        );

        let doc = get_document(&remote, &overlays, &key("bookings/a"));
        assert!(doc.has_local_mutations());
        assert_eq!(
            doc.field(&FieldPath::from_dot_separated("kwh").unwrap()),
            Some(&FieldValue::from_integer(9))
        );
    }

    #[test]
    fn recalculate_drops_overlay_when_queue_is_empty() {
        let mut remote = RemoteDocumentCache::new();
        remote.add(
            MutableDocument::new_found(key("bookings/a"), Timestamp::new(1, 0), fields(&[("kwh", 1)])),
            Timestamp::new(1, 0),
        );
        let queue = MutationQueue::new();
        let mut overlays = DocumentOverlayCache::new();
        overlays.save_overlays(
            1,
            [(key("bookings/a"), Mutation::set(key("bookings/a"), fields(&[("kwh", 9)])))].into(),
        );

        let keys: BTreeSet<_> = [key("bookings/a")].into();
        let docs = recalculate_overlays(&remote, &queue, &mut overlays, &keys);
        assert!(overlays.overlay_for(&key("bookings/a")).is_none());
        assert!(!docs.get(&key("bookings/a")).unwrap().has_local_mutations());
    }

    #[test]
    fn recalculate_folds_remaining_batches() {
        let mut remote = RemoteDocumentCache::new();
        remote.add(
            MutableDocument::new_found(key("bookings/a"), Timestamp::new(1, 0), fields(&[("kwh", 1)])),
            Timestamp::new(1, 0),
        );
        let mut queue = MutationQueue::new();
        queue.add_batch(
            Timestamp::new(2, 0),
            vec![Mutation::set(key("bookings/a"), fields(&[("kwh", 5)]))],
        );
        let mut overlays = DocumentOverlayCache::new();

        let keys: BTreeSet<_> = [key("bookings/a")].into();
        let docs = recalculate_overlays(&remote, &queue, &mut overlays, &keys);
        let overlay = overlays.overlay_for(&key("bookings/a")).unwrap();
        assert_eq!(overlay.largest_batch_id(), 1);
        assert!(docs.get(&key("bookings/a")).unwrap().has_local_mutations());
    }
}
