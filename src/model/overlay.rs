use crate::model::{DocumentKey, Mutation};

/// The single effective pending mutation for one document, folded from every
/// queued batch that touches it.
#[derive(Clone, Debug, PartialEq)]
pub struct Overlay {
    largest_batch_id: i32,
    mutation: Mutation,
}

impl Overlay {
    pub fn new(largest_batch_id: i32, mutation: Mutation) -> Self {
        Self {
            largest_batch_id,
            mutation,
        }
    }

    /// Id of the newest batch that contributed to this overlay; the overlay
    /// is dropped once that batch is acknowledged or rejected.
    pub fn largest_batch_id(&self) -> i32 {
        self.largest_batch_id
    }

    pub fn mutation(&self) -> &Mutation {
        &self.mutation
    }

    pub fn key(&self) -> &DocumentKey {
        self.mutation.key()
    }
}
