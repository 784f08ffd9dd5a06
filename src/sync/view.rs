use std::collections::BTreeSet;

use crate::model::{DocumentKey, MutableDocument};
use crate::query::Query;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentChangeType {
    Added,
    Modified,
    Removed,
}

#[derive(Clone, Debug)]
pub struct DocumentViewChange {
    pub change_type: DocumentChangeType,
    pub doc: MutableDocument,
}

/// One application-facing snapshot of a query's results.
#[derive(Clone, Debug)]
pub struct ViewSnapshot {
    pub query: Query,
    pub documents: Vec<MutableDocument>,
    pub changes: Vec<DocumentViewChange>,
    pub from_cache: bool,
    pub has_pending_writes: bool,
    pub sync_state_changed: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

/// Outcome of feeding a recomputed result set through a view.
pub struct ViewChange {
    /// `None` when nothing observable changed.
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

/// Per-target in-memory result set. Diffs each recomputed set against the
/// last emitted one and tracks which documents are in limbo (present in the
/// view's accounting but absent from the target's server-confirmed keys).
pub struct View {
    query: Query,
    documents: Vec<MutableDocument>,
    keys: BTreeSet<DocumentKey>,
    limbo_documents: BTreeSet<DocumentKey>,
    current: bool,
    from_cache: bool,
    has_emitted: bool,
}

impl View {
    pub fn new(query: Query) -> Self {
        Self {
            query,
            documents: Vec::new(),
            keys: BTreeSet::new(),
            limbo_documents: BTreeSet::new(),
            current: false,
            from_cache: true,
            has_emitted: false,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn limbo_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.limbo_documents
    }

    pub fn is_current(&self) -> bool {
        self.current
    }

    /// Diffs the previous document set against `new_docs`.
    pub fn compute_changes(&self, new_docs: &[MutableDocument]) -> Vec<DocumentViewChange> {
        let new_keys: BTreeSet<DocumentKey> =
            new_docs.iter().map(|doc| doc.key().clone()).collect();

        let mut changes = Vec::new();
        for doc in &self.documents {
            if !new_keys.contains(doc.key()) {
                changes.push(DocumentViewChange {
                    change_type: DocumentChangeType::Removed,
                    doc: doc.clone(),
                });
            }
        }
        for doc in new_docs {
            if !self.keys.contains(doc.key()) {
                changes.push(DocumentViewChange {
                    change_type: DocumentChangeType::Added,
                    doc: doc.clone(),
                });
            } else if self
                .documents
                .iter()
                .find(|old| old.key() == doc.key())
                .map_or(false, |old| old != doc)
            {
                changes.push(DocumentViewChange {
                    change_type: DocumentChangeType::Modified,
                    doc: doc.clone(),
                });
            }
        }
        changes
    }

    /// Installs a recomputed result set. `current` carries the target's
    /// caught-up flag when a remote event reported one; `remote_keys` is the
    /// target's server-confirmed key set; `online` reflects the network
    /// toggle.
    pub fn apply(
        &mut self,
        new_docs: Vec<MutableDocument>,
        current: Option<bool>,
        remote_keys: &BTreeSet<DocumentKey>,
        online: bool,
    ) -> ViewChange {
        let changes = self.compute_changes(&new_docs);
        self.documents = new_docs;
        self.keys = self.documents.iter().map(|doc| doc.key().clone()).collect();
        if let Some(current) = current {
            self.current = current;
        }

        let limbo_changes = self.update_limbo_documents(remote_keys);

        let synced = self.current && self.limbo_documents.is_empty() && online;
        let from_cache = !synced;
        let sync_state_changed = from_cache != self.from_cache || !self.has_emitted;
        self.from_cache = from_cache;

        let snapshot = if !changes.is_empty() || sync_state_changed {
            self.has_emitted = true;
            Some(ViewSnapshot {
                query: self.query.clone(),
                documents: self.documents.clone(),
                changes,
                from_cache,
                has_pending_writes: self.documents.iter().any(MutableDocument::has_pending_writes),
                sync_state_changed,
            })
        } else {
            None
        };

        ViewChange {
            snapshot,
            limbo_changes,
        }
    }

    /// A full snapshot of the current state, used to seed late-joining
    /// listeners of an already-established query.
    pub fn initial_snapshot(&self) -> ViewSnapshot {
        ViewSnapshot {
            query: self.query.clone(),
            documents: self.documents.clone(),
            changes: self
                .documents
                .iter()
                .map(|doc| DocumentViewChange {
                    change_type: DocumentChangeType::Added,
                    doc: doc.clone(),
                })
                .collect(),
            from_cache: self.from_cache,
            has_pending_writes: self.documents.iter().any(MutableDocument::has_pending_writes),
            sync_state_changed: true,
        }
    }

    /// Limbo tracking only starts once the target reported itself current:
    /// before that, missing remote keys just mean the sync is incomplete.
    fn update_limbo_documents(
        &mut self,
        remote_keys: &BTreeSet<DocumentKey>,
    ) -> Vec<LimboDocumentChange> {
        if !self.current {
            return Vec::new();
        }

        let mut limbo = BTreeSet::new();
        for doc in &self.documents {
            if doc.has_local_mutations() {
                continue;
            }
            if !remote_keys.contains(doc.key()) {
                limbo.insert(doc.key().clone());
            }
        }

        let mut changes = Vec::new();
        for key in limbo.difference(&self.limbo_documents) {
            changes.push(LimboDocumentChange::Added(key.clone()));
        }
        for key in self.limbo_documents.difference(&limbo) {
            changes.push(LimboDocumentChange::Removed(key.clone()));
        }
        self.limbo_documents = limbo;
        changes
    }
}

/// Replays a diff over a previous document set; used to validate that
/// emitted changes exactly reproduce the next set.
pub fn apply_changes(
    query: &Query,
    previous: &[MutableDocument],
    changes: &[DocumentViewChange],
) -> Vec<MutableDocument> {
    let mut docs: Vec<MutableDocument> = previous.to_vec();
    for change in changes {
        match change.change_type {
            DocumentChangeType::Removed => {
                docs.retain(|doc| doc.key() != change.doc.key());
            }
            DocumentChangeType::Added | DocumentChangeType::Modified => {
                docs.retain(|doc| doc.key() != change.doc.key());
                docs.push(change.doc.clone());
            }
        }
    }
    docs.sort_by(|a, b| query.comparator(a, b));
    docs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DocumentKey, ResourcePath, Timestamp};
    use crate::value::{FieldValue, MapValue};
    use std::collections::BTreeMap;

    fn doc(path: &str, kwh: i64) -> MutableDocument {
        let mut fields = BTreeMap::new();
        fields.insert("kwh".to_string(), FieldValue::from_integer(kwh));
        MutableDocument::new_found(
            DocumentKey::from_string(path).unwrap(),
            Timestamp::new(1, 0),
            MapValue::new(fields),
        )
    }

    fn query() -> Query {
        Query::collection(ResourcePath::from_string("stations").unwrap())
    }

    fn keys(paths: &[&str]) -> BTreeSet<DocumentKey> {
        paths
            .iter()
            .map(|path| DocumentKey::from_string(path).unwrap())
            .collect()
    }

    #[test]
    fn first_apply_emits_everything_as_added() {
        let mut view = View::new(query());
        let change = view.apply(
            vec![doc("stations/a", 1), doc("stations/b", 2)],
            None,
            &BTreeSet::new(),
            true,
        );
        let snapshot = change.snapshot.unwrap();
        assert_eq!(snapshot.changes.len(), 2);
        assert!(snapshot
            .changes
            .iter()
            .all(|c| c.change_type == DocumentChangeType::Added));
        assert!(snapshot.from_cache);
    }

    #[test]
    fn diff_round_trip_reproduces_next_set() {
        let mut view = View::new(query());
        let first = vec![doc("stations/a", 1), doc("stations/b", 2)];
        view.apply(first.clone(), None, &BTreeSet::new(), true);

        let next = vec![doc("stations/b", 20), doc("stations/c", 3)];
        let changes = view.compute_changes(&next);
        let replayed = apply_changes(&query(), &first, &changes);
        assert_eq!(replayed, next);
    }

    #[test]
    fn unchanged_set_emits_nothing() {
        let mut view = View::new(query());
        let docs = vec![doc("stations/a", 1)];
        view.apply(docs.clone(), None, &BTreeSet::new(), true);
        let change = view.apply(docs, None, &BTreeSet::new(), true);
        assert!(change.snapshot.is_none());
    }

    #[test]
    fn becoming_current_clears_from_cache() {
        let mut view = View::new(query());
        view.apply(vec![doc("stations/a", 1)], None, &keys(&["stations/a"]), true);

        let change = view.apply(
            vec![doc("stations/a", 1)],
            Some(true),
            &keys(&["stations/a"]),
            true,
        );
        let snapshot = change.snapshot.unwrap();
        assert!(!snapshot.from_cache);
        assert!(snapshot.sync_state_changed);
    }

    #[test]
    fn going_offline_raises_from_cache_again() {
        let mut view = View::new(query());
        view.apply(
            vec![doc("stations/a", 1)],
            Some(true),
            &keys(&["stations/a"]),
            true,
        );
        let change = view.apply(
            vec![doc("stations/a", 1)],
            None,
            &keys(&["stations/a"]),
            false,
        );
        assert!(change.snapshot.unwrap().from_cache);
    }

    #[test]
    fn documents_missing_from_remote_keys_enter_limbo() {
        let mut view = View::new(query());
        let change = view.apply(
            vec![doc("stations/a", 1), doc("stations/b", 2)],
            Some(true),
            &keys(&["stations/a"]),
            true,
        );
        assert_eq!(
            change.limbo_changes,
            vec![LimboDocumentChange::Added(
                DocumentKey::from_string("stations/b").unwrap()
            )]
        );
        // Limbo documents keep the snapshot marked from-cache.
        assert!(change.snapshot.unwrap().from_cache);

        let change = view.apply(
            vec![doc("stations/a", 1), doc("stations/b", 2)],
            None,
            &keys(&["stations/a", "stations/b"]),
            true,
        );
        assert_eq!(
            change.limbo_changes,
            vec![LimboDocumentChange::Removed(
                DocumentKey::from_string("stations/b").unwrap()
            )]
        );
    }

    #[test]
    fn locally_mutated_documents_never_enter_limbo() {
        let mut view = View::new(query());
        let mut pending = doc("stations/b", 2);
        pending.set_has_local_mutations();
        let change = view.apply(
            vec![doc("stations/a", 1), pending],
            Some(true),
            &keys(&["stations/a"]),
            true,
        );
        assert!(change.limbo_changes.is_empty());
    }
}
