//! Batch collector: turns the raw head of the work queue into one stacked
//! tensor plus the ids it belongs to.
//!
//! A malformed record only affects itself. It is reported as a decode
//! failure and the rest of the batch goes ahead.

use batchline_core::codec::decode_payload;
use batchline_core::error::DecodeError;
use batchline_core::types::{RequestId, WorkItem};
use ndarray::{ArrayD, ArrayViewD, Axis};
use std::collections::HashSet;
use tracing::warn;

/// One record that could not join the batch.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeFailure {
    /// `None` when the record is unreadable or repeats an id already in the
    /// batch; no error result can be written for it.
    pub id: Option<RequestId>,
    pub error: DecodeError,
}

/// Output of one collection pass.
#[derive(Debug)]
pub struct CollectedBatch {
    /// Ids of the decoded items, in queue order.
    pub ids: Vec<RequestId>,
    /// `ids.len() x item_shape`, `None` when nothing decoded.
    pub tensor: Option<ArrayD<f32>>,
    pub failures: Vec<DecodeFailure>,
    /// Number of raw records consumed, decoded or not.
    pub consumed: usize,
}

impl CollectedBatch {
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }
}

pub struct BatchCollector {
    item_shape: Vec<usize>,
}

impl BatchCollector {
    pub fn new(item_shape: Vec<usize>) -> Self {
        Self { item_shape }
    }

    pub fn item_shape(&self) -> &[usize] {
        &self.item_shape
    }

    /// Decode every record and stack the survivors along a new leading axis,
    /// preserving queue order.
    pub fn collect(&self, records: &[String]) -> CollectedBatch {
        let mut ids = Vec::with_capacity(records.len());
        let mut arrays = Vec::with_capacity(records.len());
        let mut failures = Vec::new();
        let mut seen = HashSet::with_capacity(records.len());

        for record in records {
            let item = match WorkItem::from_record(record) {
                Ok(item) => item,
                Err(e) => {
                    warn!(error = %e, "Dropping unreadable work item");
                    failures.push(DecodeFailure {
                        id: None,
                        error: DecodeError::Record(e.to_string()),
                    });
                    continue;
                }
            };

            if !seen.insert(item.id.clone()) {
                warn!(id = %item.id, "Dropping work item with an id already in this batch");
                failures.push(DecodeFailure {
                    id: None,
                    error: DecodeError::Record(format!("duplicate id {} in batch", item.id)),
                });
                continue;
            }

            match self.decode(&item) {
                Ok(array) => {
                    ids.push(item.id);
                    arrays.push(array);
                }
                Err(error) => {
                    warn!(id = %item.id, error = %error, "Work item failed to decode");
                    failures.push(DecodeFailure {
                        id: Some(item.id),
                        error,
                    });
                }
            }
        }

        let tensor = if arrays.is_empty() {
            None
        } else {
            let views: Vec<ArrayViewD<f32>> = arrays.iter().map(|a| a.view()).collect();
            match ndarray::stack(Axis(0), &views) {
                Ok(tensor) => Some(tensor),
                Err(e) => {
                    // Shapes are checked per item, so this only fires on a broken invariant.
                    warn!(error = %e, "Failed to stack batch");
                    failures.extend(ids.drain(..).map(|id| DecodeFailure {
                        id: Some(id),
                        error: DecodeError::Record(e.to_string()),
                    }));
                    None
                }
            }
        };

        CollectedBatch {
            ids,
            tensor,
            failures,
            consumed: records.len(),
        }
    }

    fn decode(&self, item: &WorkItem) -> Result<ArrayD<f32>, DecodeError> {
        if item.payload_shape != self.item_shape {
            return Err(DecodeError::ShapeMismatch {
                expected: self.item_shape.clone(),
                actual: item.payload_shape.clone(),
            });
        }
        decode_payload(&item.payload, item.payload_type, &item.payload_shape)
    }
}
