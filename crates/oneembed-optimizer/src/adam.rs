//! Adam optimizer.
//!
//! Adam (Adaptive Moment Estimation) keeps exponential moving averages of
//! both the gradients (first moment) and squared gradients (second moment)
//! per key. The bias-correction step count is per key as well, so a key
//! first touched late in training is corrected from its own first update.

use oneembed_core::OptimizerKind;

use crate::{decay_weights, ensure_state, OptimizerState, UpdateRule};

/// Adam optimizer with adaptive learning rates and momentum.
///
/// Updates embeddings using the formula:
/// ```text
/// m = beta1 * m + (1 - beta1) * gradient
/// v = beta2 * v + (1 - beta2) * gradient^2
/// m_hat = m / (1 - beta1^t)
/// v_hat = v / (1 - beta2^t)
/// embedding = embedding - learning_rate * m_hat / (sqrt(v_hat) + epsilon)
/// ```
///
/// With bias correction disabled, `m_hat = m` and `v_hat = v`.
#[derive(Debug, Clone, PartialEq)]
pub struct Adam {
    /// Exponential decay rate for first moment estimates.
    beta1: f32,
    /// Exponential decay rate for second moment estimates.
    beta2: f32,
    /// Small constant for numerical stability.
    epsilon: f32,
    /// Whether moment estimates are bias corrected.
    do_bias_correction: bool,
    /// Decoupled weight decay coefficient.
    weight_decay: f32,
}

impl Adam {
    /// Creates a new Adam rule.
    pub fn new(
        beta1: f32,
        beta2: f32,
        epsilon: f32,
        do_bias_correction: bool,
        weight_decay: f32,
    ) -> Self {
        Self {
            beta1,
            beta2,
            epsilon,
            do_bias_correction,
            weight_decay,
        }
    }

    /// Returns the first-moment decay rate.
    pub fn beta1(&self) -> f32 {
        self.beta1
    }

    /// Returns the second-moment decay rate.
    pub fn beta2(&self) -> f32 {
        self.beta2
    }

    /// Returns whether bias correction is applied.
    pub fn bias_correction(&self) -> bool {
        self.do_bias_correction
    }
}

impl UpdateRule for Adam {
    fn kind(&self) -> OptimizerKind {
        OptimizerKind::Adam
    }

    fn apply(
        &self,
        embedding: &mut [f32],
        state: &mut OptimizerState,
        gradients: &[f32],
        learning_rate: f32,
    ) {
        ensure_state(state, OptimizerKind::Adam, embedding.len());
        let OptimizerState::Adam { m, v, t } = state else {
            return;
        };

        *t += 1;
        let (bias_correction1, bias_correction2) = if self.do_bias_correction {
            let step = i32::try_from(*t).unwrap_or(i32::MAX);
            (1.0 - self.beta1.powi(step), 1.0 - self.beta2.powi(step))
        } else {
            (1.0, 1.0)
        };

        decay_weights(embedding, learning_rate, self.weight_decay);
        for (i, (e, g)) in embedding.iter_mut().zip(gradients.iter()).enumerate() {
            m[i] = self.beta1 * m[i] + (1.0 - self.beta1) * g;
            v[i] = self.beta2 * v[i] + (1.0 - self.beta2) * g * g;

            let m_hat = m[i] / bias_correction1;
            let v_hat = v[i] / bias_correction2;
            *e -= learning_rate * m_hat / (v_hat.sqrt() + self.epsilon);
        }
    }
}
