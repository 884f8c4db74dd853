//! Deterministic frequency assignment and bounce-rate derivation.
//!
//! Frequencies are drawn from a ChaCha20 stream seeded with
//! SHA-256(address || shard_id), so any node can recompute the frequency of
//! any shard from its coordinates alone. Values are uniform integers in
//! [1, 1000] carried as f64.

use crate::types::Address;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const FREQ_MIN: u32 = 1;
pub const FREQ_MAX: u32 = 1000;

/// Reproducible frequency source for one address.
#[derive(Debug, Clone)]
pub struct FrequencySource {
    address: Address,
}

impl FrequencySource {
    pub fn new(address: impl Into<Address>) -> Self {
        Self {
            address: address.into(),
        }
    }

    /// Frequency of the shard identified by `shard_id` under this address.
    pub fn for_shard(&self, shard_id: &str) -> f64 {
        let mut hasher = Sha256::new();
        hasher.update(self.address.as_bytes());
        hasher.update(shard_id.as_bytes());
        let seed: [u8; 32] = hasher.finalize().into();

        let mut rng = ChaCha20Rng::from_seed(seed);
        rng.gen_range(FREQ_MIN..=FREQ_MAX) as f64
    }
}

/// Round to two fractional digits, ties to even.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round_ties_even() / 100.0
}

/// Mean of `values` rounded via [`round2`]; `None` when empty.
pub fn mean_frequency(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(round2(values.iter().sum::<f64>() / values.len() as f64))
}

/// Bounce rate of a frequency: `1000 / frequency`, infinite at zero.
pub fn bounce_rate(frequency: f64) -> f64 {
    if frequency == 0.0 {
        f64::INFINITY
    } else {
        1000.0 / frequency
    }
}

/// Per-shard bounce ledger entry, reconciled by audit against the sidecar
/// metadata of the shard it describes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BounceEntry {
    pub address: Address,
    pub particle: crate::types::Particle,
    pub bit_index: u8,
    pub frequency: f64,
    pub bounce_rate: f64,
    /// IV of the shard ciphertext this entry describes (base64)
    pub iv: String,
    /// GCM tag of the shard ciphertext (base64)
    pub auth_tag: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub token_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frequency_reproducible_and_in_range() {
        let source = FrequencySource::new("atm1aabbcc");
        let f1 = source.for_shard("shard-1");
        let f2 = source.for_shard("shard-1");
        assert_eq!(f1, f2);
        assert!((FREQ_MIN as f64..=FREQ_MAX as f64).contains(&f1));

        let other = FrequencySource::new("atm1ddeeff").for_shard("shard-1");
        // Different addresses seed different streams; equal draws are possible
        // but the stream itself must differ somewhere.
        let probe_a: Vec<f64> = (0..8)
            .map(|i| source.for_shard(&format!("s{i}")))
            .collect();
        let probe_b: Vec<f64> = (0..8)
            .map(|i| FrequencySource::new("atm1ddeeff").for_shard(&format!("s{i}")))
            .collect();
        assert!(probe_a != probe_b || f1 != other);
    }

    #[test]
    fn test_round2_banker() {
        assert_eq!(round2(2.675), 2.67); // 2.675 is 2.67499.. in binary
        assert_eq!(round2(0.125), 0.12);
        assert_eq!(round2(0.135), 0.14);
        assert_eq!(round2(10.0), 10.0);
    }

    #[test]
    fn test_mean_frequency_empty_is_none() {
        assert_eq!(mean_frequency(&[]), None);
        assert_eq!(mean_frequency(&[3.0, 4.0]), Some(3.5));
    }

    #[test]
    fn test_bounce_rate() {
        assert_eq!(bounce_rate(500.0), 2.0);
        assert!(bounce_rate(0.0).is_infinite());
    }
}
