//! Embedding initializers.
//!
//! Initializers produce the starting vector for a key seen for the first
//! time. Random initializers seed a fresh generator from the configured seed
//! and the key itself, so a key's initial vector is reproducible across runs
//! and independent of lookup order or thread scheduling.
//!
//! # Example
//!
//! ```
//! use oneembed_cache::initializer::{Initializer, RandomUniformInitializer};
//! use oneembed_core::Key;
//!
//! let initializer = RandomUniformInitializer::new(0.0, 1.0, 7);
//! let a = initializer.initialize(Key::from_id(3), 64);
//! let b = initializer.initialize(Key::from_id(3), 64);
//! assert_eq!(a, b);
//! ```

use oneembed_core::{EmbeddingError, InitializerKind, InitializerOptions, Key, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal, Uniform};

/// A trait for embedding initializers.
///
/// All initializers must be `Send + Sync` so worker threads can share one.
pub trait Initializer: Send + Sync {
    /// Returns the initial vector for `key`.
    fn initialize(&self, key: Key, dim: usize) -> Vec<f32>;

    /// Returns the name of the initializer.
    fn name(&self) -> &str;
}

/// Initializer that sets all values to zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZerosInitializer;

impl Initializer for ZerosInitializer {
    fn initialize(&self, _key: Key, dim: usize) -> Vec<f32> {
        vec![0.0; dim]
    }

    fn name(&self) -> &str {
        "zeros"
    }
}

/// Initializer that sets all values to a constant.
#[derive(Debug, Clone, Copy)]
pub struct ConstantInitializer {
    value: f32,
}

impl ConstantInitializer {
    pub fn new(value: f32) -> Self {
        Self { value }
    }

    pub fn value(&self) -> f32 {
        self.value
    }
}

impl Initializer for ConstantInitializer {
    fn initialize(&self, _key: Key, dim: usize) -> Vec<f32> {
        vec![self.value; dim]
    }

    fn name(&self) -> &str {
        "constant"
    }
}

/// Initializer that samples from a uniform distribution with a given mean
/// and standard deviation.
///
/// Values are drawn from `[mean - std * sqrt(3), mean + std * sqrt(3)]`,
/// the interval whose uniform distribution has exactly that standard
/// deviation.
#[derive(Debug, Clone)]
pub struct RandomUniformInitializer {
    mean: f32,
    std: f32,
    seed: u64,
    distribution: Uniform<f32>,
}

impl RandomUniformInitializer {
    /// Creates a new uniform initializer. `std` must be finite and non-negative.
    pub fn new(mean: f32, std: f32, seed: u64) -> Self {
        let half_width = std.abs() * 3.0_f32.sqrt();
        Self {
            mean,
            std,
            seed,
            distribution: Uniform::new_inclusive(mean - half_width, mean + half_width),
        }
    }

    pub fn mean(&self) -> f32 {
        self.mean
    }

    pub fn std(&self) -> f32 {
        self.std
    }
}

impl Initializer for RandomUniformInitializer {
    fn initialize(&self, key: Key, dim: usize) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(key.mix_with(self.seed));
        (&self.distribution).sample_iter(&mut rng).take(dim).collect()
    }

    fn name(&self) -> &str {
        "uniform"
    }
}

/// Initializer that samples from a normal (Gaussian) distribution.
#[derive(Debug, Clone)]
pub struct RandomNormalInitializer {
    mean: f32,
    std: f32,
    seed: u64,
    distribution: Normal<f32>,
}

impl RandomNormalInitializer {
    /// Creates a new normal initializer.
    pub fn new(mean: f32, std: f32, seed: u64) -> Result<Self> {
        let distribution = Normal::new(mean, std).map_err(|e| {
            EmbeddingError::config(format!("invalid normal initializer (std {std}): {e}"))
        })?;
        Ok(Self {
            mean,
            std,
            seed,
            distribution,
        })
    }

    pub fn mean(&self) -> f32 {
        self.mean
    }

    pub fn std(&self) -> f32 {
        self.std
    }
}

impl Initializer for RandomNormalInitializer {
    fn initialize(&self, key: Key, dim: usize) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(key.mix_with(self.seed));
        (&self.distribution).sample_iter(&mut rng).take(dim).collect()
    }

    fn name(&self) -> &str {
        "normal"
    }
}

/// The initializer selected from the options blob.
#[derive(Debug, Clone)]
pub enum KeyInitializer {
    Zeros(ZerosInitializer),
    Constant(ConstantInitializer),
    Uniform(RandomUniformInitializer),
    Normal(RandomNormalInitializer),
}

impl KeyInitializer {
    /// Builds the initializer named by `options.kind`.
    pub fn from_options(options: &InitializerOptions) -> Result<Self> {
        Ok(match options.kind {
            InitializerKind::Zeros => Self::Zeros(ZerosInitializer),
            InitializerKind::Constant => Self::Constant(ConstantInitializer::new(options.value)),
            InitializerKind::Uniform => Self::Uniform(RandomUniformInitializer::new(
                options.mean,
                options.std,
                options.seed,
            )),
            InitializerKind::Normal => Self::Normal(RandomNormalInitializer::new(
                options.mean,
                options.std,
                options.seed,
            )?),
        })
    }

    fn inner(&self) -> &dyn Initializer {
        match self {
            Self::Zeros(i) => i,
            Self::Constant(i) => i,
            Self::Uniform(i) => i,
            Self::Normal(i) => i,
        }
    }
}

impl Initializer for KeyInitializer {
    fn initialize(&self, key: Key, dim: usize) -> Vec<f32> {
        self.inner().initialize(key, dim)
    }

    fn name(&self) -> &str {
        self.inner().name()
    }
}
