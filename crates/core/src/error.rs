use crate::types::RequestId;
use thiserror::Error;

pub type BrokerResult<T> = Result<T, BrokerError>;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Decode failure for {id}: {reason}")]
    DecodeFailure { id: RequestId, reason: String },

    #[error("Processor failure: {0}")]
    ProcessorFailure(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Timed out after {waited_ms}ms waiting for {id}")]
    Timeout { id: RequestId, waited_ms: u64 },

    #[error("Queue full: depth={depth}, capacity={capacity}")]
    QueueFull { depth: usize, capacity: usize },

    #[error("Request {id} cancelled")]
    Cancelled { id: RequestId },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl BrokerError {
    /// Infrastructure failures abort the current iteration and are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BrokerError::StoreUnavailable(_))
    }
}

/// Why a single payload could not be turned into an array.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("invalid base64: {0}")]
    Base64(String),

    #[error("payload is {actual} bytes, shape {shape:?} of {dtype} needs {expected}")]
    LengthMismatch {
        shape: Vec<usize>,
        dtype: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("shape {actual:?} does not match expected {expected:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("empty shape")]
    EmptyShape,

    #[error("malformed record: {0}")]
    Record(String),
}

impl DecodeError {
    pub fn into_broker(self, id: RequestId) -> BrokerError {
        BrokerError::DecodeFailure {
            id,
            reason: self.to_string(),
        }
    }
}
