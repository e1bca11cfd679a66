//! Shared state between gateways and the processing loop: the work queue and
//! the result store, each behind a trait with an in-process and a Redis
//! implementation.

#![warn(clippy::unwrap_used)]

pub mod client;
pub mod local;
pub mod traits;

pub use client::{RedisResultStore, RedisWorkQueue};
pub use local::{MemoryResultStore, MemoryWorkQueue};
pub use traits::{ResultStore, WorkQueue};
