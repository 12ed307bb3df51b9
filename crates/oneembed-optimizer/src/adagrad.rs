//! Adagrad optimizer.
//!
//! Scales each coordinate by the inverse root of its accumulated squared
//! gradients, so frequently updated coordinates take smaller steps.

use oneembed_core::OptimizerKind;

use crate::{decay_weights, ensure_state, OptimizerState, UpdateRule};

/// Adagrad optimizer.
///
/// Updates embeddings using the formula:
/// ```text
/// accumulator = accumulator + gradient^2
/// embedding = embedding - learning_rate * gradient / (sqrt(accumulator) + epsilon)
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Adagrad {
    /// Small constant for numerical stability.
    epsilon: f32,
    /// Decoupled weight decay coefficient.
    weight_decay: f32,
}

impl Adagrad {
    /// Creates a new Adagrad rule.
    pub fn new(epsilon: f32, weight_decay: f32) -> Self {
        Self {
            epsilon,
            weight_decay,
        }
    }
}

impl UpdateRule for Adagrad {
    fn kind(&self) -> OptimizerKind {
        OptimizerKind::Adagrad
    }

    fn apply(
        &self,
        embedding: &mut [f32],
        state: &mut OptimizerState,
        gradients: &[f32],
        learning_rate: f32,
    ) {
        ensure_state(state, OptimizerKind::Adagrad, embedding.len());
        let OptimizerState::Adagrad { accumulator } = state else {
            return;
        };

        decay_weights(embedding, learning_rate, self.weight_decay);
        for ((e, g), acc) in embedding
            .iter_mut()
            .zip(gradients.iter())
            .zip(accumulator.iter_mut())
        {
            *acc += g * g;
            *e -= learning_rate * g / (acc.sqrt() + self.epsilon);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adagrad_basic_update() {
        let adagrad = Adagrad::new(1e-8, 0.0);
        let mut embedding = vec![1.0, 2.0];
        let mut state = OptimizerState::zeroed(OptimizerKind::Adagrad, 2);

        adagrad.apply(&mut embedding, &mut state, &[0.5, -0.5], 0.1);

        // First step: g / sqrt(g^2) = sign(g)
        assert!((embedding[0] - 0.9).abs() < 1e-5);
        assert!((embedding[1] - 2.1).abs() < 1e-5);
    }

    #[test]
    fn test_adagrad_accumulator_growth() {
        let adagrad = Adagrad::new(1e-8, 0.0);
        let mut embedding = vec![1.0];
        let mut state = OptimizerState::zeroed(OptimizerKind::Adagrad, 1);

        adagrad.apply(&mut embedding, &mut state, &[1.0], 0.1);
        let first_update = 1.0 - embedding[0];
        let before = embedding[0];
        adagrad.apply(&mut embedding, &mut state, &[1.0], 0.1);
        let second_update = before - embedding[0];

        assert!(second_update < first_update);
        assert_eq!(
            state,
            OptimizerState::Adagrad {
                accumulator: vec![2.0]
            }
        );
    }
}
