//! Momentum optimizer.
//!
//! Accumulates a per-key velocity so consistent gradient directions take
//! progressively larger steps.

use oneembed_core::OptimizerKind;

use crate::{decay_weights, ensure_state, OptimizerState, UpdateRule};

/// SGD with momentum.
///
/// Updates embeddings using the formula:
/// ```text
/// velocity = beta * velocity + gradient
/// embedding = embedding - learning_rate * velocity
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Momentum {
    /// Momentum coefficient.
    beta: f32,
    /// Decoupled weight decay coefficient.
    weight_decay: f32,
}

impl Momentum {
    /// Creates a new momentum rule.
    pub fn new(beta: f32, weight_decay: f32) -> Self {
        Self { beta, weight_decay }
    }

    /// Returns the momentum coefficient.
    pub fn beta(&self) -> f32 {
        self.beta
    }
}

impl UpdateRule for Momentum {
    fn kind(&self) -> OptimizerKind {
        OptimizerKind::Momentum
    }

    fn apply(
        &self,
        embedding: &mut [f32],
        state: &mut OptimizerState,
        gradients: &[f32],
        learning_rate: f32,
    ) {
        ensure_state(state, OptimizerKind::Momentum, embedding.len());
        let OptimizerState::Momentum { velocity } = state else {
            return;
        };

        decay_weights(embedding, learning_rate, self.weight_decay);
        for ((e, g), v) in embedding
            .iter_mut()
            .zip(gradients.iter())
            .zip(velocity.iter_mut())
        {
            *v = self.beta * *v + g;
            *e -= learning_rate * *v;
        }
    }
}
