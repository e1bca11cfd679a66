//! Classifier engine: owns the model and exposes it to the broker as a
//! [`BatchProcessor`].

use crate::model::DenseClassifier;
use batchline_core::config::ModelConfig;
use batchline_core::inference::{BatchProcessor, ProcessorError};
use batchline_core::types::Prediction;
use ndarray::{Array2, ArrayD, Axis};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info};

/// Thread-safe inference engine wrapping the dense classifier.
pub struct ClassifierEngine {
    model: Arc<RwLock<DenseClassifier>>,
    input_shape: Vec<usize>,
    labels: Vec<String>,
    top_k: usize,
}

impl ClassifierEngine {
    /// Initialize the engine for items of `input_shape`.
    pub fn new(config: &ModelConfig, input_shape: &[usize]) -> anyhow::Result<Self> {
        if input_shape.is_empty() {
            anyhow::bail!("input shape must not be empty");
        }
        if config.num_classes == 0 {
            anyhow::bail!("model needs at least one class");
        }

        let labels = match &config.labels {
            Some(labels) if labels.len() == config.num_classes => labels.clone(),
            Some(labels) => anyhow::bail!(
                "{} labels configured for {} classes",
                labels.len(),
                config.num_classes
            ),
            None => (0..config.num_classes).map(|i| format!("class_{i:04}")).collect(),
        };

        let input_dim = input_shape.iter().product();
        let model = DenseClassifier::synthetic(input_dim, config.hidden_dim, config.num_classes);

        info!(
            input_shape = ?input_shape,
            classes = config.num_classes,
            top_k = config.top_k,
            "Classifier engine initialized"
        );

        Ok(Self {
            model: Arc::new(RwLock::new(model)),
            input_shape: input_shape.to_vec(),
            labels,
            top_k: config.top_k.min(config.num_classes),
        })
    }

    /// Flatten a stacked batch into `batch x input_dim` rows.
    fn flatten(&self, batch: &ArrayD<f32>) -> Result<Array2<f32>, ProcessorError> {
        let shape = batch.shape();
        if shape.len() != self.input_shape.len() + 1 || shape[1..] != self.input_shape[..] {
            return Err(ProcessorError::InvalidInput(format!(
                "expected [n, {:?}], got {:?}",
                self.input_shape, shape
            )));
        }

        let rows = shape[0];
        let dim = self.model.read().input_dim();
        Array2::from_shape_vec((rows, dim), batch.iter().copied().collect())
            .map_err(|e| ProcessorError::InvalidInput(e.to_string()))
    }

    /// Highest-probability labels for one output row, best first.
    fn top_predictions(&self, probs: ndarray::ArrayView1<f32>) -> Vec<Prediction> {
        let mut ranked: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        ranked
            .into_iter()
            .take(self.top_k)
            .map(|(idx, probability)| Prediction {
                label: self.labels[idx].clone(),
                probability,
            })
            .collect()
    }
}

impl BatchProcessor for ClassifierEngine {
    fn process(&self, batch: ArrayD<f32>) -> Result<Vec<Vec<Prediction>>, ProcessorError> {
        let features = self.flatten(&batch)?;
        debug!(batch_size = features.nrows(), "Running classifier forward pass");

        let start = std::time::Instant::now();
        let probs = self.model.read().forward(&features);
        debug!(latency_us = start.elapsed().as_micros() as u64, "Forward pass complete");

        Ok(probs
            .axis_iter(Axis(0))
            .map(|row| self.top_predictions(row))
            .collect())
    }

    fn provider_name(&self) -> &str {
        "dense_synthetic"
    }

    fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    fn warm_up(&self) -> Result<(), ProcessorError> {
        let zeros = ArrayD::<f32>::zeros(
            std::iter::once(1)
                .chain(self.input_shape.iter().copied())
                .collect::<Vec<_>>(),
        );
        self.process(zeros).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    fn small_config() -> ModelConfig {
        ModelConfig {
            num_classes: 6,
            hidden_dim: 8,
            top_k: 3,
            labels: None,
        }
    }

    #[test]
    fn test_one_result_per_item_in_order() {
        let engine = ClassifierEngine::new(&small_config(), &[2, 2]).unwrap();
        let batch = ArrayD::from_shape_fn(IxDyn(&[4, 2, 2]), |ix| (ix[0] * 4 + ix[1] * 2 + ix[2]) as f32);

        let results = engine.process(batch.clone()).unwrap();
        assert_eq!(results.len(), 4);
        for preds in &results {
            assert_eq!(preds.len(), 3);
            assert!(preds.windows(2).all(|w| w[0].probability >= w[1].probability));
        }

        // Item 2 alone gives the same ranking as item 2 inside the batch.
        let single = batch.index_axis(Axis(0), 2).to_owned().insert_axis(Axis(0));
        let alone = engine.process(single).unwrap();
        assert_eq!(alone[0][0].label, results[2][0].label);
    }

    #[test]
    fn test_rejects_wrong_item_shape() {
        let engine = ClassifierEngine::new(&small_config(), &[2, 2]).unwrap();
        let batch = ArrayD::<f32>::zeros(IxDyn(&[1, 3, 2]));
        assert!(matches!(
            engine.process(batch),
            Err(ProcessorError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_custom_labels_and_warm_up() {
        let mut config = small_config();
        config.num_classes = 2;
        config.labels = Some(vec!["cat".into(), "dog".into()]);

        let engine = ClassifierEngine::new(&config, &[3]).unwrap();
        engine.warm_up().unwrap();

        let preds = engine.process(ArrayD::zeros(IxDyn(&[1, 3]))).unwrap();
        assert_eq!(preds[0].len(), 2, "top_k is capped at the class count");
        let mut labels: Vec<_> = preds[0].iter().map(|p| p.label.as_str()).collect();
        labels.sort();
        assert_eq!(labels, vec!["cat", "dog"]);
    }
}
