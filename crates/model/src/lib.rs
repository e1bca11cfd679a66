//! Reference batch processor: a deterministic dense classifier that stands
//! in for a trained model behind the broker.

pub mod engine;
pub mod model;

pub use engine::ClassifierEngine;
pub use model::DenseClassifier;
