//! Per-key optimizer state.

use oneembed_core::OptimizerKind;
use serde::{Deserialize, Serialize};

const F32_BYTES: usize = std::mem::size_of::<f32>();

/// Shape of the auxiliary state an optimizer keeps for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateShape {
    /// Number of `dim`-wide auxiliary vectors.
    pub vectors: usize,
    /// Whether a per-key update counter is kept.
    pub has_step: bool,
}

impl StateShape {
    /// Returns the state shape used by the given optimizer.
    pub fn of(kind: OptimizerKind) -> Self {
        match kind {
            OptimizerKind::Sgd => Self {
                vectors: 0,
                has_step: false,
            },
            OptimizerKind::Momentum | OptimizerKind::Adagrad => Self {
                vectors: 1,
                has_step: false,
            },
            OptimizerKind::Adam => Self {
                vectors: 2,
                has_step: true,
            },
        }
    }

    /// In-memory footprint of the state for one key, in bytes.
    pub fn bytes(&self, dim: usize) -> usize {
        self.vectors * dim * F32_BYTES + if self.has_step { 8 } else { 0 }
    }
}

/// State maintained by optimizers for each embedding.
///
/// Different optimizers maintain different state:
/// - SGD: No additional state
/// - Momentum: A velocity vector
/// - Adam: First and second moment estimates plus an update count
/// - Adagrad: Sum of squared gradients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum OptimizerState {
    /// No optimizer state.
    #[default]
    None,

    /// State for SGD with momentum.
    Momentum {
        /// Velocity vector.
        velocity: Vec<f32>,
    },

    /// State for Adam optimizer.
    Adam {
        /// First moment estimate (mean of gradients).
        m: Vec<f32>,
        /// Second moment estimate (variance of gradients).
        v: Vec<f32>,
        /// Number of updates applied.
        t: u64,
    },

    /// State for Adagrad optimizer.
    Adagrad {
        /// Sum of squared gradients.
        accumulator: Vec<f32>,
    },
}

impl OptimizerState {
    /// Creates zeroed state for the given optimizer and dimension.
    pub fn zeroed(kind: OptimizerKind, dim: usize) -> Self {
        match kind {
            OptimizerKind::Sgd => Self::None,
            OptimizerKind::Momentum => Self::Momentum {
                velocity: vec![0.0; dim],
            },
            OptimizerKind::Adam => Self::Adam {
                m: vec![0.0; dim],
                v: vec![0.0; dim],
                t: 0,
            },
            OptimizerKind::Adagrad => Self::Adagrad {
                accumulator: vec![0.0; dim],
            },
        }
    }

    /// Returns `true` if this state has the layout `kind` expects for `dim`.
    pub fn matches(&self, kind: OptimizerKind, dim: usize) -> bool {
        match (self, kind) {
            (Self::None, OptimizerKind::Sgd) => true,
            (Self::Momentum { velocity }, OptimizerKind::Momentum) => velocity.len() == dim,
            (Self::Adam { m, v, .. }, OptimizerKind::Adam) => m.len() == dim && v.len() == dim,
            (Self::Adagrad { accumulator }, OptimizerKind::Adagrad) => accumulator.len() == dim,
            _ => false,
        }
    }

    /// Returns the memory size of this optimizer state in bytes.
    pub fn memory_size(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Momentum { velocity } => velocity.len() * F32_BYTES,
            Self::Adam { m, v, .. } => (m.len() + v.len()) * F32_BYTES + 8,
            Self::Adagrad { accumulator } => accumulator.len() * F32_BYTES,
        }
    }

    /// Per-key update count, 0 for optimizers that don't keep one.
    pub fn step(&self) -> u64 {
        match self {
            Self::Adam { t, .. } => *t,
            _ => 0,
        }
    }

    /// The auxiliary vectors in storage order.
    pub fn vectors(&self) -> Vec<&[f32]> {
        match self {
            Self::None => Vec::new(),
            Self::Momentum { velocity } => vec![velocity],
            Self::Adam { m, v, .. } => vec![m, v],
            Self::Adagrad { accumulator } => vec![accumulator],
        }
    }

    /// Rebuilds state from its vectors in storage order.
    ///
    /// Returns `None` if the number of vectors doesn't fit `kind`.
    pub fn from_parts(kind: OptimizerKind, mut vectors: Vec<Vec<f32>>, step: u64) -> Option<Self> {
        if vectors.len() != StateShape::of(kind).vectors {
            return None;
        }
        let state = match kind {
            OptimizerKind::Sgd => Self::None,
            OptimizerKind::Momentum => Self::Momentum {
                velocity: vectors.pop()?,
            },
            OptimizerKind::Adam => {
                let v = vectors.pop()?;
                let m = vectors.pop()?;
                Self::Adam { m, v, t: step }
            }
            OptimizerKind::Adagrad => Self::Adagrad {
                accumulator: vectors.pop()?,
            },
        };
        Some(state)
    }
}
