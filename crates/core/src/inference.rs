//! Batch processor abstraction.
//!
//! The expensive computation behind the broker (a loaded model, typically)
//! implements [`BatchProcessor`]. The processing loop calls it once per
//! non-empty batch and never concurrently with itself.

use crate::types::Prediction;
use ndarray::ArrayD;
use std::fmt;

/// A batch-capable function with a fixed per-item input shape.
pub trait BatchProcessor: Send + Sync {
    /// Process a stacked batch whose leading axis is the batch axis.
    ///
    /// `result[i]` must correspond to `batch[i]`, in the same order.
    fn process(&self, batch: ArrayD<f32>) -> Result<Vec<Vec<Prediction>>, ProcessorError>;

    /// Provider name for metrics/logging.
    fn provider_name(&self) -> &str;

    /// Per-item input shape this processor accepts.
    fn input_shape(&self) -> &[usize];

    /// Warm up the provider (load model, allocate buffers).
    fn warm_up(&self) -> Result<(), ProcessorError> {
        Ok(())
    }
}

/// Errors that can occur while processing a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessorError {
    /// The model has not been loaded yet.
    ModelNotLoaded(String),
    /// The batch does not have the shape the processor expects.
    InvalidInput(String),
    /// Execution failed.
    ExecutionFailure(String),
}

impl fmt::Display for ProcessorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessorError::ModelNotLoaded(msg) => write!(f, "model not loaded: {msg}"),
            ProcessorError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            ProcessorError::ExecutionFailure(msg) => write!(f, "execution failure: {msg}"),
        }
    }
}

impl std::error::Error for ProcessorError {}

impl From<ProcessorError> for crate::error::BrokerError {
    fn from(e: ProcessorError) -> Self {
        crate::error::BrokerError::ProcessorFailure(e.to_string())
    }
}
