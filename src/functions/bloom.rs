//! Bloom filters over packed k-mers, used as negative pre-filters in front of
//! the exact k-mer store.
//!
//! All hash strategies start from one base hash of the packed k-mer and derive
//! `h` bit positions from it. A position is always folded into the bit array the
//! same way: signed remainder modulo `m`, negated when negative.

use std::f64::consts::LN_2;
use std::io::{Read, Write};

use bincode::{Decode, Encode};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::debug;
use xxhash_rust::xxh3::{xxh3_64, xxh3_64_with_seed};

use crate::functions::kmer_store::KmerStore;
use crate::utils::cgat::{self, CgatError};
use crate::utils::rolling_encoder::CgatRingBuffer;

const BLOOM_MAGIC: [u8; 4] = *b"KFBL";
const BLOOM_VERSION: u32 = 1;

const TABLE_SEED: u64 = 0x5EED_B100_F11E_0001;
const SECOND_HASH_SEED: u64 = 0x9E37_79B9_7F4A_7C15;
const POLYNOMIAL_DEGREE: usize = 4;
/// 2^61 - 1
const MERSENNE_61: u64 = (1u64 << 61) - 1;
/// Upper bound on hash functions per key; enough for any rate down to 1e-19.
pub const MAX_HASH_COUNT: usize = 64;
/// Upper bound on a decoded filter payload (a 2^37-bit array).
const MAX_BLOB_BYTES: usize = 1 << 34;

#[derive(Debug, Error)]
pub enum BloomError {
    #[error("invalid k: {0}")]
    Kmer(#[from] CgatError),
    #[error("expected insertions must be positive")]
    NoInsertions,
    #[error("false positive probability must be in (0, 1), got {0}")]
    Probability(f64),
    #[error("filters are incompatible: {0}")]
    Incompatible(&'static str),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid bloom filter file: {0}")]
    Format(String),
}

/// How the `h` bit positions are derived from a k-mer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum HashStrategy {
    /// Double hashing: `h1 + i * h2`.
    TwoLongs,
    /// A seeded degree-4 polynomial per hash function, evaluated modulo 2^61 - 1.
    Polynomial,
    /// Simple tabulation over the 8 bytes of the base hash, one table set per hash function.
    Tabulation,
}

#[derive(Debug, Clone)]
enum BitHasher {
    TwoLongs,
    Polynomial {
        coefficients: Vec<[u64; POLYNOMIAL_DEGREE + 1]>,
    },
    Tabulation { tables: Vec<[[u64; 256]; 8]> },
}

impl BitHasher {
    fn new(strategy: HashStrategy, hash_count: usize) -> Self {
        let mut rng = StdRng::seed_from_u64(TABLE_SEED);
        match strategy {
            HashStrategy::TwoLongs => BitHasher::TwoLongs,
            HashStrategy::Polynomial => {
                let coefficients = (0..hash_count)
                    .map(|_| {
                        let mut c = [0u64; POLYNOMIAL_DEGREE + 1];
                        for slot in c.iter_mut() {
                            *slot = rng.random::<u64>() % MERSENNE_61;
                        }
                        c
                    })
                    .collect();
                BitHasher::Polynomial { coefficients }
            }
            HashStrategy::Tabulation => {
                let tables = (0..hash_count)
                    .map(|_| {
                        let mut lanes = [[0u64; 256]; 8];
                        for lane in lanes.iter_mut() {
                            for slot in lane.iter_mut() {
                                *slot = rng.random::<u64>();
                            }
                        }
                        lanes
                    })
                    .collect();
                BitHasher::Tabulation { tables }
            }
        }
    }
}

/// `(x * y) mod 2^61 - 1`
#[inline(always)]
fn mul_mod_mersenne(x: u64, y: u64) -> u64 {
    let product = x as u128 * y as u128;
    let folded = (product & MERSENNE_61 as u128) as u64 + (product >> 61) as u64;
    let folded = (folded & MERSENNE_61) + (folded >> 61);
    if folded >= MERSENNE_61 {
        folded - MERSENNE_61
    } else {
        folded
    }
}

/// Signed remainder, negated when negative.
#[inline(always)]
fn fold_index(hash: i64, bits: i64) -> usize {
    let r = hash % bits;
    (if r < 0 { -r } else { r }) as usize
}

/// Standard optimal Bloom parameters for `n` insertions at false-positive rate `p`.
/// The hash count is kept within `1..=MAX_HASH_COUNT`.
pub fn optimal_parameters(n: u64, p: f64) -> (u64, usize) {
    let bits = (-(n as f64) * p.ln() / (LN_2 * LN_2)).ceil().max(64.0) as u64;
    let hashes = ((bits as f64 / n as f64) * LN_2).round().max(1.0) as usize;
    (bits, hashes.min(MAX_HASH_COUNT))
}

#[derive(Encode, Decode)]
struct BloomBlob {
    k: u32,
    strategy: HashStrategy,
    bit_size: u64,
    hash_count: u32,
    expected_insertions: u64,
    fpp: f64,
    words: Vec<u64>,
}

/// Fixed-size Bloom filter over k-mers of one length.
///
/// Keys are inserted in forward packing; `contains` can test either orientation
/// of a sequence window, mirroring how the k-mer store is queried.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    k: usize,
    strategy: HashStrategy,
    bit_size: u64,
    hash_count: usize,
    expected_insertions: u64,
    fpp: f64,
    words: Vec<u64>,
    hasher: BitHasher,
}

impl BloomFilter {
    pub fn new(
        k: usize,
        expected_insertions: u64,
        fpp: f64,
        strategy: HashStrategy,
    ) -> Result<Self, BloomError> {
        cgat::check_k(k)?;
        if expected_insertions == 0 {
            return Err(BloomError::NoInsertions);
        }
        if !(fpp > 0.0 && fpp < 1.0) {
            return Err(BloomError::Probability(fpp));
        }
        let (bit_size, hash_count) = optimal_parameters(expected_insertions, fpp);
        debug!(k, expected_insertions, fpp, bit_size, hash_count, ?strategy, "sizing bloom filter");
        Ok(Self::with_bits(k, bit_size, hash_count, expected_insertions, fpp, strategy))
    }

    fn with_bits(
        k: usize,
        bit_size: u64,
        hash_count: usize,
        expected_insertions: u64,
        fpp: f64,
        strategy: HashStrategy,
    ) -> Self {
        Self {
            k,
            strategy,
            bit_size,
            hash_count,
            expected_insertions,
            fpp,
            words: vec![0u64; bit_size.div_ceil(64) as usize],
            hasher: BitHasher::new(strategy, hash_count),
        }
    }

    /// Builds a filter holding every key of an optimized store.
    pub fn from_store<V>(
        store: &KmerStore<V>,
        fpp: f64,
        strategy: HashStrategy,
    ) -> Result<Self, BloomError> {
        let mut filter = Self::new(store.k(), store.len().max(1) as u64, fpp, strategy)?;
        for (kmer, _) in store.iter() {
            filter.put_packed(kmer);
        }
        Ok(filter)
    }

    #[inline]
    pub fn k(&self) -> usize {
        self.k
    }

    pub fn strategy(&self) -> HashStrategy {
        self.strategy
    }

    pub fn bit_size(&self) -> u64 {
        self.bit_size
    }

    pub fn hash_count(&self) -> usize {
        self.hash_count
    }

    pub fn memory_bytes(&self) -> usize {
        self.words.len() * 8
    }

    /// Inserts the forward packing of `seq[start..start + k]`.
    pub fn put(&mut self, seq: &[u8], start: usize) -> Result<(), CgatError> {
        let kmer = cgat::pack_forward(seq, start, self.k)?;
        self.put_packed(kmer);
        Ok(())
    }

    /// Tests the window in the requested orientation. Windows that are not pure
    /// CGAT can never have been inserted.
    pub fn contains(&self, seq: &[u8], start: usize, reverse: bool) -> bool {
        match cgat::pack(seq, start, self.k, reverse) {
            Ok(kmer) => self.contains_packed(kmer),
            Err(_) => false,
        }
    }

    #[inline]
    pub fn contains_ring(&self, ring: &CgatRingBuffer, reverse: bool) -> bool {
        debug_assert_eq!(ring.k(), self.k);
        self.contains_packed(ring.packed(reverse))
    }

    #[inline]
    pub fn put_packed(&mut self, kmer: u64) {
        let (base, second) = self.base_hashes(kmer);
        for i in 0..self.hash_count {
            let bit = self.bit_index(base, second, i);
            self.words[bit / 64] |= 1u64 << (bit % 64);
        }
    }

    #[inline]
    pub fn contains_packed(&self, kmer: u64) -> bool {
        let (base, second) = self.base_hashes(kmer);
        (0..self.hash_count).all(|i| {
            let bit = self.bit_index(base, second, i);
            self.words[bit / 64] & (1u64 << (bit % 64)) != 0
        })
    }

    /// Base hash of the packed k-mer, plus the second hash double hashing needs.
    #[inline(always)]
    fn base_hashes(&self, kmer: u64) -> (u64, u64) {
        let bytes = kmer.to_le_bytes();
        let second = match self.hasher {
            BitHasher::TwoLongs => xxh3_64_with_seed(&bytes, SECOND_HASH_SEED),
            _ => 0,
        };
        (xxh3_64(&bytes), second)
    }

    #[inline(always)]
    fn bit_index(&self, base: u64, second: u64, i: usize) -> usize {
        let bits = self.bit_size as i64;
        let hash = match &self.hasher {
            BitHasher::TwoLongs => {
                (base as i64).wrapping_add((i as i64).wrapping_mul(second as i64))
            }
            BitHasher::Polynomial { coefficients } => {
                let x = base % MERSENNE_61;
                let mut acc = 0u64;
                for &c in coefficients[i].iter() {
                    acc = mul_mod_mersenne(acc, x) + c;
                    if acc >= MERSENNE_61 {
                        acc -= MERSENNE_61;
                    }
                }
                acc as i64
            }
            BitHasher::Tabulation { tables } => {
                let mut acc = 0u64;
                for (&byte, lane) in base.to_le_bytes().iter().zip(tables[i].iter()) {
                    acc = acc.wrapping_add(lane[byte as usize]);
                }
                acc as i64
            }
        };
        fold_index(hash, bits)
    }

    pub fn clear(&mut self) {
        self.words.fill(0);
    }

    /// Ors another filter into this one. Both must share k, size and strategy.
    pub fn merge(&mut self, other: &BloomFilter) -> Result<(), BloomError> {
        if self.k != other.k {
            return Err(BloomError::Incompatible("k differs"));
        }
        if self.bit_size != other.bit_size || self.hash_count != other.hash_count {
            return Err(BloomError::Incompatible("size differs"));
        }
        if self.strategy != other.strategy {
            return Err(BloomError::Incompatible("hash strategy differs"));
        }
        for (a, b) in self.words.iter_mut().zip(other.words.iter()) {
            *a |= *b;
        }
        Ok(())
    }

    /// False-positive rate implied by the current fill ratio.
    pub fn estimated_fpp(&self) -> f64 {
        let set: u64 = self.words.iter().map(|w| w.count_ones() as u64).sum();
        (set as f64 / self.bit_size as f64).powi(self.hash_count as i32)
    }

    pub fn save<W: Write>(&self, mut out: W) -> Result<(), BloomError> {
        out.write_all(&BLOOM_MAGIC)?;
        out.write_all(&BLOOM_VERSION.to_le_bytes())?;
        let blob = BloomBlob {
            k: self.k as u32,
            strategy: self.strategy,
            bit_size: self.bit_size,
            hash_count: self.hash_count as u32,
            expected_insertions: self.expected_insertions,
            fpp: self.fpp,
            words: self.words.clone(),
        };
        let encoded = bincode::encode_to_vec(&blob, bincode::config::standard())
            .map_err(|e| BloomError::Format(e.to_string()))?;
        let compressed = zstd::encode_all(&encoded[..], 3)?;
        out.write_all(&compressed)?;
        out.flush()?;
        Ok(())
    }

    pub fn load<R: Read>(mut input: R) -> Result<Self, BloomError> {
        let mut magic = [0u8; 4];
        input.read_exact(&mut magic)?;
        if magic != BLOOM_MAGIC {
            return Err(BloomError::Format("bad magic".into()));
        }
        let mut version = [0u8; 4];
        input.read_exact(&mut version)?;
        if u32::from_le_bytes(version) != BLOOM_VERSION {
            return Err(BloomError::Format("unsupported version".into()));
        }
        let mut decoder = zstd::stream::Decoder::new(input)?;
        let config = bincode::config::standard().with_limit::<MAX_BLOB_BYTES>();
        let blob: BloomBlob = bincode::decode_from_std_read(&mut decoder, config)
            .map_err(|e| BloomError::Format(e.to_string()))?;

        let k = blob.k as usize;
        cgat::check_k(k)?;
        if blob.bit_size == 0 || blob.words.len() as u64 != blob.bit_size.div_ceil(64) {
            return Err(BloomError::Format("bit array does not match its size".into()));
        }
        let hash_count = blob.hash_count as usize;
        if hash_count == 0 || hash_count > MAX_HASH_COUNT {
            return Err(BloomError::Format(format!(
                "hash count {hash_count} outside 1..={MAX_HASH_COUNT}"
            )));
        }
        let mut filter = Self::with_bits(
            k,
            blob.bit_size,
            hash_count,
            blob.expected_insertions,
            blob.fpp,
            blob.strategy,
        );
        filter.words = blob.words;
        Ok(filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STRATEGIES: [HashStrategy; 3] = [
        HashStrategy::TwoLongs,
        HashStrategy::Polynomial,
        HashStrategy::Tabulation,
    ];

    fn framed(payload: &[u8]) -> Vec<u8> {
        let mut file = BLOOM_MAGIC.to_vec();
        file.extend_from_slice(&BLOOM_VERSION.to_le_bytes());
        file.extend_from_slice(&zstd::encode_all(payload, 3).unwrap());
        file
    }

    #[test]
    fn optimal_parameters_follow_the_formula() {
        // 1000 items at 1% -> 9586 bits, 7 hashes
        assert_eq!(optimal_parameters(1000, 0.01), (9586, 7));
    }

    #[test]
    fn fold_index_negates_negative_remainders() {
        assert_eq!(fold_index(-7, 5), 2);
        assert_eq!(fold_index(7, 5), 2);
        assert_eq!(fold_index(i64::MIN, 1000), 808);
    }

    #[test]
    fn construction_validates_parameters() {
        assert!(matches!(
            BloomFilter::new(0, 10, 0.01, HashStrategy::TwoLongs),
            Err(BloomError::Kmer(CgatError::InvalidK(0)))
        ));
        assert!(matches!(
            BloomFilter::new(40, 10, 0.01, HashStrategy::TwoLongs),
            Err(BloomError::Kmer(CgatError::InvalidK(40)))
        ));
        assert!(matches!(
            BloomFilter::new(21, 0, 0.01, HashStrategy::TwoLongs),
            Err(BloomError::NoInsertions)
        ));
        assert!(matches!(
            BloomFilter::new(21, 10, 1.5, HashStrategy::TwoLongs),
            Err(BloomError::Probability(_))
        ));
    }

    #[test]
    fn no_false_negatives_in_either_orientation() {
        let seq = b"ACGGTCATTGACCATGGATCCAGTTTACGATCGGA";
        let k = 11;
        for strategy in STRATEGIES {
            let mut bloom = BloomFilter::new(k, 100, 0.01, strategy).unwrap();
            for start in 0..=seq.len() - k {
                bloom.put(seq, start).unwrap();
            }
            let rc = cgat::reverse_complement(seq);
            for start in 0..=seq.len() - k {
                assert!(bloom.contains(seq, start, false), "{strategy:?} lost a key");
                // the reverse complement window packs back to the inserted key
                assert!(bloom.contains(&rc, seq.len() - k - start, true));
            }
        }
    }

    #[test]
    fn ambiguous_windows_are_absent() {
        let mut bloom = BloomFilter::new(4, 10, 0.01, HashStrategy::Tabulation).unwrap();
        assert!(bloom.put(b"ACNT", 0).is_err());
        assert!(!bloom.contains(b"ACNT", 0, false));
    }

    #[test]
    fn clear_and_merge() {
        let mut a = BloomFilter::new(8, 100, 0.01, HashStrategy::Polynomial).unwrap();
        let mut b = BloomFilter::new(8, 100, 0.01, HashStrategy::Polynomial).unwrap();
        a.put(b"AAAACCCC", 0).unwrap();
        b.put(b"GGGGTTTT", 0).unwrap();
        a.merge(&b).unwrap();
        assert!(a.contains(b"AAAACCCC", 0, false));
        assert!(a.contains(b"GGGGTTTT", 0, false));

        a.clear();
        assert!(!a.contains(b"AAAACCCC", 0, false));
        assert_eq!(a.estimated_fpp(), 0.0);

        let c = BloomFilter::new(8, 100, 0.01, HashStrategy::TwoLongs).unwrap();
        assert!(matches!(a.merge(&c), Err(BloomError::Incompatible(_))));
    }

    #[test]
    fn save_and_load() {
        for strategy in STRATEGIES {
            let mut bloom = BloomFilter::new(6, 50, 0.05, strategy).unwrap();
            bloom.put(b"CGATCG", 0).unwrap();
            let mut blob = Vec::new();
            bloom.save(&mut blob).unwrap();

            let loaded = BloomFilter::load(&blob[..]).unwrap();
            assert_eq!(loaded.bit_size(), bloom.bit_size());
            assert_eq!(loaded.hash_count(), bloom.hash_count());
            assert!(loaded.contains(b"CGATCG", 0, false));
            assert_eq!(loaded.words, bloom.words);
        }
        assert!(matches!(
            BloomFilter::load(&b"nope0000"[..]),
            Err(BloomError::Format(_))
        ));
    }

    #[test]
    fn oversized_bit_array_is_rejected() {
        // k = 5, TwoLongs, 64 bits, 3 hashes, 10 insertions, then a word count of 2^60
        let mut payload = vec![5u8, 0, 64, 3, 10];
        payload.extend_from_slice(&0.01f64.to_le_bytes());
        payload.push(253);
        payload.extend_from_slice(&(1u64 << 60).to_le_bytes());
        assert!(matches!(
            BloomFilter::load(&framed(&payload)[..]),
            Err(BloomError::Format(_))
        ));
    }

    #[test]
    fn hash_count_must_be_in_range() {
        for hash_count in [0, MAX_HASH_COUNT as u32 + 1] {
            let blob = BloomBlob {
                k: 5,
                strategy: HashStrategy::Tabulation,
                bit_size: 64,
                hash_count,
                expected_insertions: 10,
                fpp: 0.01,
                words: vec![0],
            };
            let config = bincode::config::standard();
            let payload = bincode::encode_to_vec(&blob, config).unwrap();
            assert!(matches!(
                BloomFilter::load(&framed(&payload)[..]),
                Err(BloomError::Format(_))
            ));
        }
    }

    #[test]
    fn extreme_rates_keep_the_hash_count_bounded() {
        let (_, hashes) = optimal_parameters(10, 1e-300);
        assert_eq!(hashes, MAX_HASH_COUNT);
    }
}
