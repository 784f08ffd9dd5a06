pub mod async_queue;
pub mod runtime;

pub use async_queue::{AsyncQueue, DelayedOperation};
