//! Per-key embedding optimizers and learning-rate schedules.
//!
//! Update rules are stateless: every piece of per-key state lives in an
//! [`OptimizerState`] carried by the embedding record, so one rule instance
//! serves every key in the table. Each rule implements [`UpdateRule`];
//! [`Optimizer`] is the tagged variant resolved once from the options blob.
//!
//! # Available Optimizers
//!
//! - [`Sgd`] - Stochastic Gradient Descent
//! - [`Momentum`] - SGD with a velocity term
//! - [`Adam`] - Adaptive Moment Estimation
//! - [`Adagrad`] - Adaptive Gradient Algorithm
//!
//! # Example
//!
//! ```
//! use oneembed_core::{OptimizerKind, OptimizerOptions};
//! use oneembed_optimizer::{Optimizer, OptimizerState, UpdateRule};
//!
//! let optimizer = Optimizer::from_options(&OptimizerOptions::of(OptimizerKind::Sgd));
//! let mut embedding = vec![1.0, 2.0, 3.0];
//! let mut state = OptimizerState::zeroed(OptimizerKind::Sgd, 3);
//!
//! optimizer.apply(&mut embedding, &mut state, &[0.1, 0.2, 0.3], 0.5);
//! assert!((embedding[0] - 0.95).abs() < 1e-6);
//! ```

use oneembed_core::{OptimizerKind, OptimizerOptions};

mod adagrad;
mod adam;
mod momentum;
pub mod schedule;
mod sgd;
mod state;

pub use adagrad::Adagrad;
pub use adam::Adam;
pub use momentum::Momentum;
pub use schedule::{
    LearningRateFunction, LearningRateSchedule, LinearWarmup, PolynomialDecay, ScheduleState,
};
pub use sgd::Sgd;
pub use state::{OptimizerState, StateShape};

/// A per-key update rule.
///
/// Implementations hold only hyperparameters. The embedding and its
/// auxiliary state are passed in by the caller, which is responsible for
/// serializing updates to the same key.
pub trait UpdateRule: Send + Sync {
    /// Returns the optimizer type as named in the options blob.
    fn kind(&self) -> OptimizerKind;

    /// Applies one update step to `embedding` in place.
    ///
    /// `state` is reset to zeroed state first if its layout doesn't match
    /// this rule. `gradients` must have the same length as `embedding`.
    fn apply(
        &self,
        embedding: &mut [f32],
        state: &mut OptimizerState,
        gradients: &[f32],
        learning_rate: f32,
    );

    /// Returns the shape of the per-key state this rule keeps.
    fn state_shape(&self) -> StateShape {
        StateShape::of(self.kind())
    }

    /// Returns the name of the optimizer type.
    fn name(&self) -> &'static str {
        self.kind().name()
    }
}

/// An update rule selected from the options blob.
#[derive(Debug, Clone, PartialEq)]
pub enum Optimizer {
    /// Plain SGD.
    Sgd(Sgd),
    /// SGD with momentum.
    Momentum(Momentum),
    /// Adam.
    Adam(Adam),
    /// Adagrad.
    Adagrad(Adagrad),
}

impl Optimizer {
    /// Builds the rule named by `options.kind` with its hyperparameters.
    pub fn from_options(options: &OptimizerOptions) -> Self {
        match options.kind {
            OptimizerKind::Sgd => Self::Sgd(Sgd::new(options.weight_decay)),
            OptimizerKind::Momentum => {
                Self::Momentum(Momentum::new(options.beta, options.weight_decay))
            }
            OptimizerKind::Adam => Self::Adam(Adam::new(
                options.beta1,
                options.beta2,
                options.epsilon,
                options.do_bias_correction,
                options.weight_decay,
            )),
            OptimizerKind::Adagrad => {
                Self::Adagrad(Adagrad::new(options.epsilon, options.weight_decay))
            }
        }
    }

    /// Zeroed state for a freshly initialized key.
    pub fn initial_state(&self, dim: usize) -> OptimizerState {
        OptimizerState::zeroed(self.kind(), dim)
    }

    fn rule(&self) -> &dyn UpdateRule {
        match self {
            Self::Sgd(rule) => rule,
            Self::Momentum(rule) => rule,
            Self::Adam(rule) => rule,
            Self::Adagrad(rule) => rule,
        }
    }
}

impl UpdateRule for Optimizer {
    fn kind(&self) -> OptimizerKind {
        self.rule().kind()
    }

    fn apply(
        &self,
        embedding: &mut [f32],
        state: &mut OptimizerState,
        gradients: &[f32],
        learning_rate: f32,
    ) {
        self.rule()
            .apply(embedding, state, gradients, learning_rate)
    }
}

/// Shrinks weights by `learning_rate * weight_decay` ahead of the gradient step.
pub(crate) fn decay_weights(embedding: &mut [f32], learning_rate: f32, weight_decay: f32) {
    if weight_decay > 0.0 {
        let scale = 1.0 - learning_rate * weight_decay;
        for e in embedding.iter_mut() {
            *e *= scale;
        }
    }
}

/// Resets `state` to zeroed state for `kind` when its layout doesn't fit.
pub(crate) fn ensure_state(state: &mut OptimizerState, kind: OptimizerKind, dim: usize) {
    if !state.matches(kind, dim) {
        *state = OptimizerState::zeroed(kind, dim);
    }
}
