//! Wire codec for work item payloads.
//!
//! Payloads are the raw little-endian element bytes of a fixed-shape array,
//! base64 encoded so they can live inside a JSON queue record.

use crate::error::DecodeError;
use crate::types::DType;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ndarray::{ArrayD, IxDyn};

/// An encoded array ready to be placed in a [`crate::types::WorkItem`].
#[derive(Debug, Clone, PartialEq)]
pub struct WirePayload {
    pub payload: String,
    pub payload_type: DType,
    pub payload_shape: Vec<usize>,
}

/// Encode an `f32` array as a base64 `float32` payload.
pub fn encode_array(array: &ArrayD<f32>) -> WirePayload {
    let mut bytes = Vec::with_capacity(array.len() * DType::Float32.width());
    // Iteration is in logical (row-major) order regardless of memory layout.
    for value in array.iter() {
        bytes.extend_from_slice(&value.to_le_bytes());
    }

    WirePayload {
        payload: STANDARD.encode(bytes),
        payload_type: DType::Float32,
        payload_shape: array.shape().to_vec(),
    }
}

/// Decode a base64 payload of `dtype` elements into an `f32` array of `shape`.
pub fn decode_payload(
    payload: &str,
    dtype: DType,
    shape: &[usize],
) -> Result<ArrayD<f32>, DecodeError> {
    if shape.is_empty() {
        return Err(DecodeError::EmptyShape);
    }

    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|e| DecodeError::Base64(e.to_string()))?;

    let elements: usize = shape.iter().product();
    let expected = elements * dtype.width();
    if bytes.len() != expected {
        return Err(DecodeError::LengthMismatch {
            shape: shape.to_vec(),
            dtype: dtype.as_str(),
            expected,
            actual: bytes.len(),
        });
    }

    let values = widen(&bytes, dtype);
    ArrayD::from_shape_vec(IxDyn(shape), values).map_err(|e| DecodeError::Record(e.to_string()))
}

fn widen(bytes: &[u8], dtype: DType) -> Vec<f32> {
    match dtype {
        DType::Float32 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        DType::Float64 => bytes
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32)
            .collect(),
        DType::Int32 => bytes
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f32)
            .collect(),
        DType::Uint8 => bytes.iter().map(|&b| b as f32).collect(),
    }
}
