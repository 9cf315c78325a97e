//! The publisher's target set.
//!
//! Loaded once from a JSON array of `npub` strings and never mutated. Each
//! dispatch round works on a freshly shuffled copy.

use nostr::PublicKey;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::identity::{decode_npub, IdentityError};

#[derive(Debug, Error)]
pub enum TargetsError {
    #[error("Failed to read targets file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse targets file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Ordered, read-only collection of recipient keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetSet {
    targets: Vec<PublicKey>,
}

/// Result of decoding externally supplied identifiers.
#[derive(Debug)]
pub struct DecodedTargets {
    pub targets: TargetSet,
    /// Inputs that failed to decode, with the reason. These are skipped.
    pub rejected: Vec<(String, IdentityError)>,
}

impl TargetSet {
    pub fn new(targets: Vec<PublicKey>) -> Self {
        Self { targets }
    }

    /// Decode `npub` strings, skipping (and reporting) the ones that fail.
    pub fn decode<I, S>(encoded: I) -> DecodedTargets
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut targets = Vec::new();
        let mut rejected = Vec::new();

        for item in encoded {
            let item = item.as_ref();
            match decode_npub(item) {
                Ok(key) => targets.push(key),
                Err(e) => rejected.push((item.to_string(), e)),
            }
        }

        DecodedTargets {
            targets: Self { targets },
            rejected,
        }
    }

    /// Load a JSON array of `npub` strings from disk.
    ///
    /// A missing file or a document that is not a string array is an error;
    /// individual bad entries are reported in `DecodedTargets::rejected`.
    pub fn load(path: &Path) -> Result<DecodedTargets, TargetsError> {
        let content = std::fs::read_to_string(path)?;
        let encoded: Vec<String> = serde_json::from_str(&content)?;
        Ok(Self::decode(encoded))
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn contains(&self, key: &PublicKey) -> bool {
        self.targets.contains(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PublicKey> {
        self.targets.iter()
    }

    /// A uniformly random permutation of the targets. The set itself is untouched.
    pub fn shuffled<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<PublicKey> {
        let mut order = self.targets.clone();
        fisher_yates(&mut order, rng);
        order
    }
}

/// In-place Fisher–Yates shuffle.
pub fn fisher_yates<T, R: Rng + ?Sized>(items: &mut [T], rng: &mut R) {
    for i in (1..items.len()).rev() {
        let j = rng.random_range(0..=i);
        items.swap(i, j);
    }
}

/// Process-local random source seeded from the wall clock.
pub fn clock_seeded_rng() -> StdRng {
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    StdRng::seed_from_u64(seed)
}
