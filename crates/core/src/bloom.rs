use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SweepError};

/// Probabilistic path set. Never yields a false negative for an added path.
///
/// Each hash function is one blake3 pass keyed by its seed; there is no
/// single-element removal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u64>,
    bit_count: u64,
    seeds: Vec<u64>,
    inserted: u64,
}

impl BloomFilter {
    /// Size for `expected_elements` at `false_positive_rate`:
    /// `bits = round(-n ln p / ln(2)^2)` and `k = round(ln 2 * bits / n)`.
    pub fn new(expected_elements: usize, false_positive_rate: f64) -> Result<Self> {
        if expected_elements == 0 {
            return Err(SweepError::InvalidConfig(
                "bloom filter needs at least one expected element".to_string(),
            ));
        }
        if !(false_positive_rate > 0.0 && false_positive_rate < 1.0) {
            return Err(SweepError::InvalidConfig(format!(
                "bloom filter false positive rate {false_positive_rate} outside (0, 1)"
            )));
        }

        let n = expected_elements as f64;
        let ln2 = std::f64::consts::LN_2;
        let bit_count = ((-n * false_positive_rate.ln()) / (ln2 * ln2)).round().max(1.0) as u64;
        let hash_count = ((ln2 * bit_count as f64) / n).round().max(1.0) as usize;

        Ok(Self::with_dimensions(bit_count, default_seeds(hash_count)))
    }

    fn with_dimensions(bit_count: u64, seeds: Vec<u64>) -> Self {
        let words = bit_count.div_ceil(64) as usize;
        Self {
            bits: vec![0; words],
            bit_count,
            seeds,
            inserted: 0,
        }
    }

    /// Same seeds and width, no members.
    pub fn empty_like(&self) -> Self {
        Self::with_dimensions(self.bit_count, self.seeds.clone())
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn hash_count(&self) -> usize {
        self.seeds.len()
    }

    pub fn inserted(&self) -> u64 {
        self.inserted
    }

    pub fn add(&mut self, path: &Path) {
        for position in positions(&self.seeds, self.bit_count, path) {
            let (word, mask) = split(position);
            self.bits[word] |= mask;
        }
        self.inserted += 1;
    }

    pub fn contains(&self, path: &Path) -> bool {
        positions(&self.seeds, self.bit_count, path).all(|position| {
            let (word, mask) = split(position);
            self.bits[word] & mask != 0
        })
    }

    pub fn clear(&mut self) {
        self.bits.iter_mut().for_each(|word| *word = 0);
        self.inserted = 0;
    }

    /// Share of bits set, for diagnostics.
    pub fn fill_ratio(&self) -> f64 {
        let set: u64 = self.bits.iter().map(|word| u64::from(word.count_ones())).sum();
        set as f64 / self.bit_count as f64
    }

    /// Reject filters whose stored shape cannot have come from this type.
    pub fn check_shape(&self) -> Result<()> {
        let words = self.bit_count.div_ceil(64) as usize;
        if self.bit_count == 0 || self.seeds.is_empty() || self.bits.len() != words {
            return Err(SweepError::IndexCorruption(format!(
                "bloom filter shape mismatch: {} bits, {} words, {} hashes",
                self.bit_count,
                self.bits.len(),
                self.seeds.len()
            )));
        }
        Ok(())
    }
}

/// Bit positions for `path`, one per seed.
fn positions<'a>(
    seeds: &'a [u64],
    bit_count: u64,
    path: &'a Path,
) -> impl Iterator<Item = u64> + 'a {
    let encoded = path.to_string_lossy();
    seeds.iter().map(move |seed| {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&seed.to_le_bytes());
        hasher.update(encoded.as_bytes());
        let digest = hasher.finalize();
        let mut head = [0_u8; 8];
        head.copy_from_slice(&digest.as_bytes()[..8]);
        u64::from_le_bytes(head) % bit_count
    })
}

fn split(position: u64) -> (usize, u64) {
    ((position / 64) as usize, 1_u64 << (position % 64))
}

fn default_seeds(count: usize) -> Vec<u64> {
    // Odd multiples of the 64-bit golden ratio constant.
    (0..count as u64)
        .map(|index| (2 * index + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::BloomFilter;

    #[test]
    fn sizing_follows_standard_formulas() {
        let filter = BloomFilter::new(100_000, 0.01).expect("filter");
        assert_eq!(filter.bit_count(), 958_506);
        assert_eq!(filter.hash_count(), 7);
        assert!(BloomFilter::new(0, 0.01).is_err());
        assert!(BloomFilter::new(10, 1.5).is_err());
    }

    #[test]
    fn added_paths_are_always_found() {
        let mut filter = BloomFilter::new(2_000, 0.01).expect("filter");
        let paths = (0..2_000)
            .map(|index| PathBuf::from(format!("/home/u/project/src/file-{index}.rs")))
            .collect::<Vec<_>>();
        for path in &paths {
            filter.add(path);
        }
        assert!(paths.iter().all(|path| filter.contains(path)));
        assert_eq!(filter.inserted(), 2_000);
    }

    #[test]
    fn false_positive_rate_stays_near_target() {
        let expected = 10_000;
        let mut filter = BloomFilter::new(expected, 0.01).expect("filter");
        for index in 0..expected {
            filter.add(&PathBuf::from(format!("/indexed/{index}")));
        }

        let samples = 10_000;
        let false_positives = (0..samples)
            .filter(|index| filter.contains(&PathBuf::from(format!("/never/{index}"))))
            .count();
        let rate = false_positives as f64 / samples as f64;
        assert!(rate < 0.03, "observed false positive rate {rate}");
    }

    #[test]
    fn clear_forgets_members_and_keeps_shape() {
        let mut filter = BloomFilter::new(100, 0.01).expect("filter");
        filter.add(&PathBuf::from("/a"));
        let empty = filter.empty_like();
        filter.clear();
        assert!(!filter.contains(&PathBuf::from("/a")));
        assert_eq!(filter, empty);
        assert!(filter.check_shape().is_ok());
    }

    #[test]
    fn survives_serde_round_trip() {
        let mut filter = BloomFilter::new(500, 0.02).expect("filter");
        let path = PathBuf::from("/Users/a/Library/Caches/thing");
        filter.add(&path);
        let encoded = serde_json::to_vec(&filter).expect("encode");
        let decoded: BloomFilter = serde_json::from_slice(&encoded).expect("decode");
        assert!(decoded.contains(&path));
        assert_eq!(decoded, filter);
    }
}
