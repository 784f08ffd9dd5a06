use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::SyncError;
use crate::query::Query;
use crate::sync::view::ViewSnapshot;

/// Per-listener delivery options.
#[derive(Clone, Copy, Debug, Default)]
pub struct ListenOptions {
    /// Raise snapshots whose only change is metadata (`from_cache`,
    /// pending-writes state).
    pub include_metadata_changes: bool,
}

/// Callbacks one `listen` call registers.
#[derive(Clone)]
pub struct SnapshotListener {
    pub on_snapshot: Arc<dyn Fn(ViewSnapshot) + Send + Sync>,
    pub on_error: Arc<dyn Fn(SyncError) + Send + Sync>,
}

impl SnapshotListener {
    pub fn new<F>(on_snapshot: F) -> Self
    where
        F: Fn(ViewSnapshot) + Send + Sync + 'static,
    {
        Self {
            on_snapshot: Arc::new(on_snapshot),
            on_error: Arc::new(|err| log::warn!("unhandled listen error: {err}")),
        }
    }

    pub fn with_error<F>(mut self, on_error: F) -> Self
    where
        F: Fn(SyncError) + Send + Sync + 'static,
    {
        self.on_error = Arc::new(on_error);
        self
    }
}

struct ListenerEntry {
    id: u64,
    options: ListenOptions,
    listener: SnapshotListener,
    has_raised: bool,
}

struct QueryListeners {
    entries: Vec<ListenerEntry>,
}

/// Registry of snapshot listeners keyed by canonical query id. Many
/// listeners can share one query (and therefore one target); the sync
/// engine only tears the target down when the last listener detaches.
#[derive(Default)]
pub struct EventManager {
    next_listener_id: u64,
    queries: BTreeMap<String, QueryListeners>,
}

impl EventManager {
    /// Returns the listener id and whether this was the first listener for
    /// the query.
    pub fn add_listener(
        &mut self,
        query: &Query,
        options: ListenOptions,
        listener: SnapshotListener,
    ) -> (u64, bool) {
        self.next_listener_id += 1;
        let id = self.next_listener_id;
        let entry = ListenerEntry {
            id,
            options,
            listener,
            has_raised: false,
        };
        let listeners = self
            .queries
            .entry(query.canonical_id())
            .or_insert_with(|| QueryListeners {
                entries: Vec::new(),
            });
        let first = listeners.entries.is_empty();
        listeners.entries.push(entry);
        (id, first)
    }

    /// Returns `true` when the removed listener was the query's last one.
    pub fn remove_listener(&mut self, query_id: &str, listener_id: u64) -> bool {
        let Some(listeners) = self.queries.get_mut(query_id) else {
            return false;
        };
        listeners.entries.retain(|entry| entry.id != listener_id);
        if listeners.entries.is_empty() {
            self.queries.remove(query_id);
            true
        } else {
            false
        }
    }

    pub fn has_listeners(&self, query_id: &str) -> bool {
        self.queries.contains_key(query_id)
    }

    /// Fans a snapshot out to every listener of the query. Listeners that
    /// have already seen a snapshot only receive non-empty diffs, unless
    /// they opted into metadata-only changes.
    pub fn dispatch_snapshot(&mut self, query_id: &str, snapshot: &ViewSnapshot) {
        let Some(listeners) = self.queries.get_mut(query_id) else {
            return;
        };
        for entry in &mut listeners.entries {
            let should_raise = !entry.has_raised
                || !snapshot.changes.is_empty()
                || (entry.options.include_metadata_changes && snapshot.sync_state_changed);
            if should_raise {
                entry.has_raised = true;
                (entry.listener.on_snapshot)(snapshot.clone());
            }
        }
    }

    /// Raises an initial snapshot to one specific (late-joining) listener.
    pub fn raise_initial(&mut self, query_id: &str, listener_id: u64, snapshot: ViewSnapshot) {
        let Some(listeners) = self.queries.get_mut(query_id) else {
            return;
        };
        if let Some(entry) = listeners
            .entries
            .iter_mut()
            .find(|entry| entry.id == listener_id)
        {
            entry.has_raised = true;
            (entry.listener.on_snapshot)(snapshot);
        }
    }

    /// Delivers a terminal error to every listener of the query and drops
    /// them; a failed target delivers nothing further.
    pub fn dispatch_error(&mut self, query_id: &str, error: &SyncError) {
        if let Some(listeners) = self.queries.remove(query_id) {
            for entry in listeners.entries {
                (entry.listener.on_error)(error.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourcePath;
    use crate::sync::view::ViewSnapshot;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn query() -> Query {
        Query::collection(ResourcePath::from_string("stations").unwrap())
    }

    fn empty_snapshot(sync_state_changed: bool) -> ViewSnapshot {
        ViewSnapshot {
            query: query(),
            documents: Vec::new(),
            changes: Vec::new(),
            from_cache: true,
            has_pending_writes: false,
            sync_state_changed,
        }
    }

    fn counting_listener() -> (SnapshotListener, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        (
            SnapshotListener::new(move |_snapshot| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
            count,
        )
    }

    #[test]
    fn first_and_last_listener_are_flagged() {
        let mut manager = EventManager::default();
        let (listener_a, _) = counting_listener();
        let (listener_b, _) = counting_listener();
        let (id_a, first_a) =
            manager.add_listener(&query(), ListenOptions::default(), listener_a);
        let (id_b, first_b) =
            manager.add_listener(&query(), ListenOptions::default(), listener_b);
        assert!(first_a);
        assert!(!first_b);

        let query_id = query().canonical_id();
        assert!(!manager.remove_listener(&query_id, id_a));
        assert!(manager.remove_listener(&query_id, id_b));
    }

    #[test]
    fn metadata_only_changes_respect_options() {
        let mut manager = EventManager::default();
        let (plain, plain_count) = counting_listener();
        let (with_metadata, metadata_count) = counting_listener();
        manager.add_listener(&query(), ListenOptions::default(), plain);
        manager.add_listener(
            &query(),
            ListenOptions {
                include_metadata_changes: true,
            },
            with_metadata,
        );

        let query_id = query().canonical_id();
        // Initial snapshot goes to everyone.
        manager.dispatch_snapshot(&query_id, &empty_snapshot(true));
        // Metadata-only update goes to the opted-in listener only.
        manager.dispatch_snapshot(&query_id, &empty_snapshot(true));

        assert_eq!(plain_count.load(Ordering::SeqCst), 1);
        assert_eq!(metadata_count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn errors_consume_listeners() {
        let mut manager = EventManager::default();
        let errors = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&errors);
        let listener = SnapshotListener::new(|_snapshot| {}).with_error(move |_err| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        manager.add_listener(&query(), ListenOptions::default(), listener);

        let query_id = query().canonical_id();
        manager.dispatch_error(&query_id, &crate::error::permission_denied("denied"));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(!manager.has_listeners(&query_id));
    }
}
