//! Two-layer dense classifier with synthetic weights.
//!
//! In production this would be a trained network loaded from disk. The
//! synthetic weights are deterministic, so the same input always yields the
//! same ranking, which is all the broker needs for development and tests.

use ndarray::{Array1, Array2, Axis};
use tracing::info;

/// A loaded classifier ready for batched inference.
pub struct DenseClassifier {
    weights: ModelWeights,
    input_dim: usize,
    num_classes: usize,
}

struct ModelWeights {
    layer1: Array2<f32>,
    layer2: Array2<f32>,
    bias1: Array1<f32>,
    bias2: Array1<f32>,
}

impl DenseClassifier {
    /// Build a classifier with deterministic synthetic weights.
    pub fn synthetic(input_dim: usize, hidden_dim: usize, num_classes: usize) -> Self {
        info!(
            input_dim = input_dim,
            hidden_dim = hidden_dim,
            num_classes = num_classes,
            "Initializing synthetic classifier weights"
        );

        Self {
            weights: ModelWeights::synthetic(input_dim, hidden_dim, num_classes),
            input_dim,
            num_classes,
        }
    }

    /// Class probabilities for each row of `features` (`batch x input_dim`).
    /// Every output row sums to 1.
    pub fn forward(&self, features: &Array2<f32>) -> Array2<f32> {
        let hidden = (features.dot(&self.weights.layer1) + &self.weights.bias1).mapv(f32::tanh);
        let mut logits = hidden.dot(&self.weights.layer2) + &self.weights.bias2;

        for mut row in logits.axis_iter_mut(Axis(0)) {
            let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
            row.mapv_inplace(|v| (v - max).exp());
            let sum = row.sum();
            if sum > 0.0 {
                row.mapv_inplace(|v| v / sum);
            }
        }

        logits
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }
}

impl ModelWeights {
    fn synthetic(input_dim: usize, hidden_dim: usize, num_classes: usize) -> Self {
        // Scale by fan-in so large image inputs do not saturate tanh.
        let scale1 = 1.0 / (input_dim.max(1) as f32).sqrt();
        let layer1 = Array2::from_shape_fn((input_dim, hidden_dim), |(i, j)| {
            (((i * 7 + j * 13) % 100) as f32 - 50.0) / 50.0 * scale1
        });

        let layer2 = Array2::from_shape_fn((hidden_dim, num_classes), |(i, j)| {
            (((i * 11 + j * 3) % 100) as f32 - 50.0) / 25.0
        });

        Self {
            layer1,
            layer2,
            bias1: Array1::from_elem(hidden_dim, 0.01),
            bias2: Array1::from_shape_fn(num_classes, |j| (j % 7) as f32 * 0.01),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_produces_distribution_per_row() {
        let model = DenseClassifier::synthetic(12, 8, 5);
        let features = Array2::from_shape_fn((3, 12), |(i, j)| (i + j) as f32 / 10.0);

        let probs = model.forward(&features);
        assert_eq!(probs.dim(), (3, 5));
        for row in probs.axis_iter(Axis(0)) {
            let sum: f32 = row.sum();
            assert!((sum - 1.0).abs() < 1e-4, "row sums to {sum}");
            assert!(row.iter().all(|&p| (0.0..=1.0).contains(&p)));
        }
    }

    #[test]
    fn test_forward_is_deterministic_and_row_independent() {
        let model = DenseClassifier::synthetic(4, 8, 3);
        let single = Array2::from_shape_vec((1, 4), vec![0.1, 0.2, 0.3, 0.4]).unwrap();
        let batch = Array2::from_shape_vec(
            (2, 4),
            vec![0.9, 0.1, 0.0, 0.5, 0.1, 0.2, 0.3, 0.4],
        )
        .unwrap();

        let alone = model.forward(&single);
        let batched = model.forward(&batch);
        for c in 0..3 {
            assert!((alone[[0, c]] - batched[[1, c]]).abs() < 1e-6);
        }
    }
}
