use std::collections::{BTreeSet, VecDeque};

use crate::error::{internal_error, SyncResult};
use crate::model::{DocumentKey, Mutation, MutationBatch, Timestamp};

/// Durable FIFO log of not-yet-acknowledged write batches for one user.
///
/// Batch ids are assigned in strictly increasing order and never reused
/// within a user's local history; callers always observe batches in id
/// order.
#[derive(Debug)]
pub struct MutationQueue {
    next_batch_id: i32,
    batches: VecDeque<MutationBatch>,
}

impl Default for MutationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MutationQueue {
    pub fn new() -> Self {
        Self {
            next_batch_id: 1,
            batches: VecDeque::new(),
        }
    }

    /// Restores a queue from its persisted batches.
    pub fn restore(batches: Vec<MutationBatch>) -> Self {
        let next_batch_id = batches.iter().map(|b| b.batch_id).max().unwrap_or(0) + 1;
        Self {
            next_batch_id,
            batches: batches.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn add_batch(
        &mut self,
        local_write_time: Timestamp,
        mutations: Vec<Mutation>,
    ) -> &MutationBatch {
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;
        self.batches
            .push_back(MutationBatch::new(batch_id, local_write_time, mutations));
        self.batches.back().expect("batch was just pushed")
    }

    pub fn batch_by_id(&self, batch_id: i32) -> Option<&MutationBatch> {
        self.batches.iter().find(|batch| batch.batch_id == batch_id)
    }

    /// The next batch to send after `batch_id` (or the oldest batch when
    /// `None`), in id order.
    pub fn next_batch_after(&self, batch_id: Option<i32>) -> Option<&MutationBatch> {
        match batch_id {
            None => self.batches.front(),
            Some(id) => self.batches.iter().find(|batch| batch.batch_id > id),
        }
    }

    /// All batches touching any of `keys`, oldest first.
    pub fn batches_affecting_keys(&self, keys: &BTreeSet<DocumentKey>) -> Vec<&MutationBatch> {
        self.batches
            .iter()
            .filter(|batch| keys.iter().any(|key| batch.affects_key(key)))
            .collect()
    }

    pub fn batches(&self) -> impl Iterator<Item = &MutationBatch> {
        self.batches.iter()
    }

    pub fn highest_batch_id(&self) -> Option<i32> {
        self.batches.back().map(|batch| batch.batch_id)
    }

    /// Removes the acknowledged or rejected batch. Batches leave the queue
    /// strictly in order; removing anything but the oldest batch means the
    /// in-memory model diverged from the durable log, which is fatal.
    pub fn remove_batch(&mut self, batch_id: i32) -> SyncResult<MutationBatch> {
        match self.batches.front() {
            Some(front) if front.batch_id == batch_id => {
                Ok(self.batches.pop_front().expect("front batch exists"))
            }
            Some(front) => Err(internal_error(format!(
                "attempted to remove batch {batch_id} before batch {}",
                front.batch_id
            ))),
            None => Err(internal_error(format!(
                "attempted to remove batch {batch_id} from an empty queue"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Mutation;
    use crate::value::MapValue;

    fn set_mutation(path: &str) -> Mutation {
        Mutation::set(DocumentKey::from_string(path).unwrap(), MapValue::empty())
    }

    #[test]
    fn assigns_strictly_increasing_ids() {
        let mut queue = MutationQueue::new();
        let first = queue
            .add_batch(Timestamp::new(1, 0), vec![set_mutation("bookings/a")])
            .batch_id;
        let second = queue
            .add_batch(Timestamp::new(2, 0), vec![set_mutation("bookings/b")])
            .batch_id;
        assert!(second > first);
    }

    #[test]
    fn restore_continues_id_sequence() {
        let mut queue = MutationQueue::new();
        queue.add_batch(Timestamp::new(1, 0), vec![set_mutation("bookings/a")]);
        queue.add_batch(Timestamp::new(2, 0), vec![set_mutation("bookings/b")]);
        let persisted: Vec<_> = queue.batches().cloned().collect();

        let mut restored = MutationQueue::restore(persisted);
        let next = restored
            .add_batch(Timestamp::new(3, 0), vec![set_mutation("bookings/c")])
            .batch_id;
        assert_eq!(next, 3);
    }

    #[test]
    fn next_batch_after_walks_in_order() {
        let mut queue = MutationQueue::new();
        queue.add_batch(Timestamp::new(1, 0), vec![set_mutation("bookings/a")]);
        queue.add_batch(Timestamp::new(2, 0), vec![set_mutation("bookings/b")]);

        let first = queue.next_batch_after(None).unwrap().batch_id;
        let second = queue.next_batch_after(Some(first)).unwrap().batch_id;
        assert_eq!((first, second), (1, 2));
        assert!(queue.next_batch_after(Some(second)).is_none());
    }

    #[test]
    fn removing_non_oldest_batch_is_fatal() {
        let mut queue = MutationQueue::new();
        queue.add_batch(Timestamp::new(1, 0), vec![set_mutation("bookings/a")]);
        queue.add_batch(Timestamp::new(2, 0), vec![set_mutation("bookings/b")]);

        let err = queue.remove_batch(2).unwrap_err();
        assert_eq!(err.code_str(), "gridbase/internal");

        queue.remove_batch(1).unwrap();
        queue.remove_batch(2).unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn batches_affecting_keys_filters() {
        let mut queue = MutationQueue::new();
        queue.add_batch(Timestamp::new(1, 0), vec![set_mutation("bookings/a")]);
        queue.add_batch(Timestamp::new(2, 0), vec![set_mutation("bookings/b")]);

        let keys: BTreeSet<_> = [DocumentKey::from_string("bookings/b").unwrap()].into();
        let affecting = queue.batches_affecting_keys(&keys);
        assert_eq!(affecting.len(), 1);
        assert_eq!(affecting[0].batch_id, 2);
    }
}
