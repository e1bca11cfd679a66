//! Batching broker: gateways enqueue work, a single processing loop drains it
//! in bounded batches for the processor, and results meet their requests
//! again in the result store.

#![warn(clippy::unwrap_used)]

pub mod collector;
pub mod gateway;
pub mod manager;
pub mod worker;

pub use collector::{BatchCollector, CollectedBatch, DecodeFailure};
pub use gateway::Gateway;
pub use manager::BrokerManager;
pub use worker::{IterationOutcome, LoopState, ProcessingLoop};
