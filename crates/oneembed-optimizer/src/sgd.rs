//! Stochastic Gradient Descent (SGD) optimizer.
//!
//! SGD is a simple optimizer that updates parameters by subtracting
//! the gradient scaled by the learning rate. It keeps no per-key state.

use oneembed_core::OptimizerKind;

use crate::{decay_weights, OptimizerState, UpdateRule};

/// Stochastic Gradient Descent optimizer.
///
/// Updates embeddings using the formula:
/// `embedding = embedding - learning_rate * gradient`
#[derive(Debug, Clone, PartialEq)]
pub struct Sgd {
    /// Decoupled weight decay coefficient.
    weight_decay: f32,
}

impl Sgd {
    /// Creates a new SGD rule.
    pub fn new(weight_decay: f32) -> Self {
        Self { weight_decay }
    }
}

impl Default for Sgd {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl UpdateRule for Sgd {
    fn kind(&self) -> OptimizerKind {
        OptimizerKind::Sgd
    }

    fn apply(
        &self,
        embedding: &mut [f32],
        state: &mut OptimizerState,
        gradients: &[f32],
        learning_rate: f32,
    ) {
        *state = OptimizerState::None;
        decay_weights(embedding, learning_rate, self.weight_decay);
        for (e, g) in embedding.iter_mut().zip(gradients.iter()) {
            *e -= learning_rate * g;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sgd_basic_update() {
        let sgd = Sgd::default();
        let mut embedding = vec![1.0, 2.0, 3.0];
        let mut state = OptimizerState::None;

        sgd.apply(&mut embedding, &mut state, &[1.0, 1.0, 1.0], 0.1);

        assert!((embedding[0] - 0.9).abs() < 1e-6);
        assert!((embedding[1] - 1.9).abs() < 1e-6);
        assert!((embedding[2] - 2.9).abs() < 1e-6);
        assert_eq!(state, OptimizerState::None);
    }

    #[test]
    fn test_sgd_zero_learning_rate() {
        let sgd = Sgd::default();
        let mut embedding = vec![1.0, 2.0];
        let mut state = OptimizerState::None;

        sgd.apply(&mut embedding, &mut state, &[5.0, -5.0], 0.0);

        assert_eq!(embedding, vec![1.0, 2.0]);
    }

    #[test]
    fn test_sgd_with_weight_decay() {
        let sgd = Sgd::new(0.5);
        let mut embedding = vec![1.0];
        let mut state = OptimizerState::None;

        // 1.0 * (1 - 0.1 * 0.5) - 0.1 * 0.0
        sgd.apply(&mut embedding, &mut state, &[0.0], 0.1);

        assert!((embedding[0] - 0.95).abs() < 1e-6);
    }
}
