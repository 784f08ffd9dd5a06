use std::collections::{BTreeMap, BTreeSet};

use crate::model::{DocumentKey, Timestamp};

/// Durable per-target subscription state.
#[derive(Clone, Debug, Default)]
pub struct TargetState {
    pub target_id: i32,
    pub resume_token: Vec<u8>,
    pub snapshot_version: Timestamp,
    pub last_limbo_free_snapshot_version: Timestamp,
    pub remote_keys: BTreeSet<DocumentKey>,
    pub current: bool,
}

impl TargetState {
    pub fn new(target_id: i32) -> Self {
        Self {
            target_id,
            resume_token: Vec::new(),
            snapshot_version: Timestamp::ZERO,
            last_limbo_free_snapshot_version: Timestamp::ZERO,
            remote_keys: BTreeSet::new(),
            current: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct TargetCache {
    targets: BTreeMap<i32, TargetState>,
    last_remote_snapshot_version: Timestamp,
}

impl TargetCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restore(targets: Vec<TargetState>) -> Self {
        let last_remote_snapshot_version = targets
            .iter()
            .map(|t| t.snapshot_version)
            .max()
            .unwrap_or(Timestamp::ZERO);
        Self {
            targets: targets.into_iter().map(|t| (t.target_id, t)).collect(),
            last_remote_snapshot_version,
        }
    }

    pub fn get(&self, target_id: i32) -> Option<&TargetState> {
        self.targets.get(&target_id)
    }

    pub fn get_or_insert(&mut self, target_id: i32) -> &mut TargetState {
        self.targets
            .entry(target_id)
            .or_insert_with(|| TargetState::new(target_id))
    }

    pub fn remove(&mut self, target_id: i32) -> Option<TargetState> {
        self.targets.remove(&target_id)
    }

    pub fn targets(&self) -> impl Iterator<Item = &TargetState> {
        self.targets.values()
    }

    /// Clears a target back to its initial state (dropping resume token,
    /// snapshot version and tracked keys) after an existence-filter reset.
    pub fn reset(&mut self, target_id: i32) -> BTreeSet<DocumentKey> {
        let state = self.get_or_insert(target_id);
        let prior_keys = std::mem::take(&mut state.remote_keys);
        state.resume_token = Vec::new();
        state.snapshot_version = Timestamp::ZERO;
        state.last_limbo_free_snapshot_version = Timestamp::ZERO;
        state.current = false;
        prior_keys
    }

    /// Keys tracked by any target other than `target_id`.
    pub fn keys_tracked_elsewhere(&self, target_id: i32) -> BTreeSet<DocumentKey> {
        self.targets
            .iter()
            .filter(|(id, _)| **id != target_id)
            .flat_map(|(_, state)| state.remote_keys.iter().cloned())
            .collect()
    }

    pub fn is_key_tracked(&self, key: &DocumentKey) -> bool {
        self.targets
            .values()
            .any(|state| state.remote_keys.contains(key))
    }

    pub fn last_remote_snapshot_version(&self) -> Timestamp {
        self.last_remote_snapshot_version
    }

    pub fn set_last_remote_snapshot_version(&mut self, version: Timestamp) {
        if version > self.last_remote_snapshot_version {
            self.last_remote_snapshot_version = version;
        }
    }
}

/// Allocates target ids; query targets use the even half of the id space,
/// limbo-resolution targets the odd half, so the two allocators never
/// collide.
#[derive(Debug)]
pub struct TargetIdGenerator {
    next_id: i32,
}

impl TargetIdGenerator {
    pub fn for_queries() -> Self {
        Self { next_id: 2 }
    }

    pub fn for_limbo_resolutions() -> Self {
        Self { next_id: 1 }
    }

    pub fn next(&mut self) -> i32 {
        let id = self.next_id;
        self.next_id += 2;
        id
    }
}
