//! Key space for embedding rows.
//!
//! Raw feature ids arrive as signed 64-bit integers. A [`Key`] is the
//! fixed-width form every tier addresses by: the id's bit pattern
//! reinterpreted as `u64`, so the mapping is injective and never collides.
//!
//! Placement decisions (lock stripes, initializer seeds) go through
//! [`Key::mix`], a 64-bit finalizer that spreads sequential ids evenly.

use serde::{Deserialize, Serialize};

/// A raw feature id as supplied by the caller.
pub type FeatureId = i64;

/// Normalized identifier of one embedding row.
///
/// # Examples
///
/// ```
/// use oneembed_core::Key;
///
/// let key = Key::from_id(-1);
/// assert_eq!(key.raw(), u64::MAX);
/// assert_eq!(key.to_id(), -1);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(u64);

impl Key {
    /// Builds a key from a raw feature id.
    #[inline]
    pub const fn from_id(id: FeatureId) -> Self {
        Self(id as u64)
    }

    /// Builds a key from its stored representation.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the stored representation.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Returns the feature id this key was built from.
    #[inline]
    pub const fn to_id(self) -> FeatureId {
        self.0 as i64
    }

    /// Returns a well-distributed 64-bit hash of the key.
    #[inline]
    pub const fn mix(self) -> u64 {
        mix64(self.0)
    }

    /// Returns the hash of the key combined with a seed.
    #[inline]
    pub const fn mix_with(self, seed: u64) -> u64 {
        mix64(self.0 ^ mix64(seed.wrapping_add(0x9e37_79b9_7f4a_7c15)))
    }

    /// Maps the key onto one of `buckets` slots.
    ///
    /// # Panics
    ///
    /// Panics if `buckets` is 0.
    #[inline]
    pub fn bucket(self, buckets: usize) -> usize {
        assert!(buckets > 0, "buckets must be greater than 0");
        (self.mix() % buckets as u64) as usize
    }
}

impl From<FeatureId> for Key {
    fn from(id: FeatureId) -> Self {
        Self::from_id(id)
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_id())
    }
}

/// SplitMix64 finalizer.
#[inline]
const fn mix64(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}
