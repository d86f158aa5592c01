//! Exact k-mer to value store.
//!
//! A store goes through three states:
//! - *uninitialized*: [`KmerStore::init_size`] must be called before any put,
//! - *open*: keys go into a pre-sized open-addressed table, a repeated key keeps
//!   the value of its last put,
//! - *optimized*: keys are sorted and unique, values are interned into a dense
//!   table and every key carries a `u32` value id. Lookups binary-search the
//!   sorted keys; no further puts are accepted.
//!
//! Keys are stored in the orientation they were put (forward packing). Callers
//! that want orientation-agnostic matches query both packings of a window.

use std::collections::HashMap;
use std::hash::Hash;
use std::io::{Read, Write};

use bincode::{Decode, Encode};
use rayon::prelude::*;
use thiserror::Error;
use tracing::info;
use xxhash_rust::xxh3::xxh3_64;

use crate::utils::cgat::{self, CgatError};
use crate::utils::rolling_encoder::CgatRingBuffer;

const STORE_MAGIC: [u8; 4] = *b"KFST";
const STORE_VERSION: u32 = 1;
/// Upper bound on a decoded store payload, about 5.7 billion k-mers with `u32` values.
const MAX_BLOB_BYTES: usize = 1 << 36;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Kmer(#[from] CgatError),
    #[error("init_size() must be called before put()")]
    NotInitialized,
    #[error("init_size() was already called")]
    AlreadyInitialized,
    #[error("store is optimized and no longer accepts puts")]
    AlreadyOptimized,
    #[error("store must be optimized first")]
    NotOptimized,
    #[error("store is full: capacity {0}")]
    CapacityExceeded(usize),
    #[error("more than {} distinct values", u32::MAX)]
    TooManyValues,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding failed: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("decoding failed: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("invalid store file: {0}")]
    Format(String),
}

struct OpenTable<V> {
    slots: Vec<Option<(u64, V)>>,
    mask: usize,
    capacity: usize,
    len: usize,
}

impl<V> OpenTable<V> {
    fn with_capacity(capacity: usize) -> Self {
        let size = (capacity.max(8) * 2).next_power_of_two();
        let mut slots = Vec::with_capacity(size);
        slots.resize_with(size, || None);
        Self {
            slots,
            mask: size - 1,
            capacity,
            len: 0,
        }
    }

    /// Inserts or overwrites; returns whether the key is new.
    fn insert(&mut self, kmer: u64, value: V) -> Result<bool, StoreError> {
        let mut slot = xxh3_64(&kmer.to_le_bytes()) as usize & self.mask;
        loop {
            match &mut self.slots[slot] {
                Some((key, existing)) if *key == kmer => {
                    *existing = value;
                    return Ok(false);
                }
                Some(_) => slot = (slot + 1) & self.mask,
                empty @ None => {
                    if self.len == self.capacity {
                        return Err(StoreError::CapacityExceeded(self.capacity));
                    }
                    *empty = Some((kmer, value));
                    self.len += 1;
                    return Ok(true);
                }
            }
        }
    }
}

struct SortedEntries<V> {
    keys: Vec<u64>,
    value_ids: Vec<u32>,
    values: Vec<V>,
    value_lookup: HashMap<V, u32>,
}

enum StoreState<V> {
    Uninitialized,
    Open(OpenTable<V>),
    Optimized(SortedEntries<V>),
}

#[derive(Encode)]
struct StoreBlobRef<'a, V> {
    k: u32,
    keys: &'a [u64],
    value_ids: &'a [u32],
    values: &'a [V],
}

#[derive(Decode)]
struct StoreBlob<V> {
    k: u32,
    keys: Vec<u64>,
    value_ids: Vec<u32>,
    values: Vec<V>,
}

pub struct KmerStore<V> {
    k: usize,
    state: StoreState<V>,
}

impl<V> KmerStore<V> {
    pub fn new(k: usize) -> Result<Self, StoreError> {
        cgat::check_k(k)?;
        Ok(Self {
            k,
            state: StoreState::Uninitialized,
        })
    }

    #[inline]
    pub fn k(&self) -> usize {
        self.k
    }

    /// Pre-allocates room for `n` distinct keys. Must be called exactly once,
    /// before the first put.
    pub fn init_size(&mut self, n: usize) -> Result<(), StoreError> {
        match self.state {
            StoreState::Uninitialized => {
                self.state = StoreState::Open(OpenTable::with_capacity(n));
                Ok(())
            }
            StoreState::Open(_) => Err(StoreError::AlreadyInitialized),
            StoreState::Optimized(_) => Err(StoreError::AlreadyOptimized),
        }
    }

    /// Stores `value` under the forward packing of `seq[start..start + k]`.
    /// Returns true if the key was not present yet.
    pub fn put(&mut self, seq: &[u8], start: usize, value: V) -> Result<bool, StoreError> {
        let kmer = cgat::pack_forward(seq, start, self.k)?;
        self.put_packed(kmer, value)
    }

    pub fn put_packed(&mut self, kmer: u64, value: V) -> Result<bool, StoreError> {
        match &mut self.state {
            StoreState::Uninitialized => Err(StoreError::NotInitialized),
            StoreState::Open(table) => table.insert(kmer, value),
            StoreState::Optimized(_) => Err(StoreError::AlreadyOptimized),
        }
    }

    pub fn is_optimized(&self) -> bool {
        matches!(self.state, StoreState::Optimized(_))
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        match &self.state {
            StoreState::Uninitialized => 0,
            StoreState::Open(table) => table.len,
            StoreState::Optimized(sorted) => sorted.keys.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn sorted(&self) -> &SortedEntries<V> {
        match &self.state {
            StoreState::Optimized(sorted) => sorted,
            _ => panic!("k-mer store queried before optimize()"),
        }
    }

    /// Looks up `seq[start..start + k]` in the orientation selected by `reverse`.
    /// Windows that are not pure CGAT are absent.
    ///
    /// # Panics
    /// If the store has not been optimized.
    pub fn get(&self, seq: &[u8], start: usize, reverse: bool) -> Option<&V> {
        let kmer = cgat::pack(seq, start, self.k, reverse).ok()?;
        self.get_packed(kmer)
    }

    /// Lookup sourced from a rolling buffer, for the classification hot loop.
    #[inline]
    pub fn get_ring(&self, ring: &CgatRingBuffer, reverse: bool) -> Option<&V> {
        debug_assert_eq!(ring.k(), self.k);
        self.get_packed(ring.packed(reverse))
    }

    #[inline]
    pub fn get_packed(&self, kmer: u64) -> Option<&V> {
        let sorted = self.sorted();
        self.get_indexed(kmer)
            .map(|(_, id)| &sorted.values[id as usize])
    }

    /// Position of the key in the sorted key array, and its value id.
    #[inline]
    pub fn get_indexed(&self, kmer: u64) -> Option<(usize, u32)> {
        let sorted = self.sorted();
        let pos = sorted.keys.binary_search(&kmer).ok()?;
        Some((pos, sorted.value_ids[pos]))
    }

    #[inline]
    pub fn get_indexed_ring(&self, ring: &CgatRingBuffer, reverse: bool) -> Option<(usize, u32)> {
        debug_assert_eq!(ring.k(), self.k);
        self.get_indexed(ring.packed(reverse))
    }

    /// Interned value for a value id.
    pub fn value(&self, id: u32) -> Option<&V> {
        match &self.state {
            StoreState::Optimized(sorted) => sorted.values.get(id as usize),
            _ => None,
        }
    }

    /// The dense value table; empty until optimized.
    pub fn values(&self) -> &[V] {
        match &self.state {
            StoreState::Optimized(sorted) => &sorted.values,
            _ => &[],
        }
    }

    /// Lazy traversal of `(key, value)` pairs in ascending key order. Yields
    /// nothing until the store is optimized.
    pub fn iter(&self) -> StoreIter<'_, V> {
        match &self.state {
            StoreState::Optimized(sorted) => StoreIter {
                keys: &sorted.keys,
                value_ids: &sorted.value_ids,
                values: &sorted.values,
                pos: 0,
            },
            _ => StoreIter {
                keys: &[],
                value_ids: &[],
                values: &[],
                pos: 0,
            },
        }
    }

    pub fn visit<F: FnMut(u64, &V)>(&self, mut visitor: F) {
        for (kmer, value) in self.iter() {
            visitor(kmer, value);
        }
    }
}

impl<V: Clone + Eq + Hash + Send> KmerStore<V> {
    /// Sorts the keys, drops duplicates and interns the values. Calling it on an
    /// optimized store does nothing; calling it on an uninitialized store yields
    /// an empty optimized store.
    pub fn optimize(&mut self) -> Result<(), StoreError> {
        let table = match std::mem::replace(&mut self.state, StoreState::Uninitialized) {
            StoreState::Optimized(sorted) => {
                self.state = StoreState::Optimized(sorted);
                return Ok(());
            }
            StoreState::Uninitialized => OpenTable::with_capacity(0),
            StoreState::Open(table) => table,
        };

        let mut entries: Vec<(u64, V)> = table.slots.into_iter().flatten().collect();
        entries.par_sort_unstable_by_key(|(kmer, _)| *kmer);
        // The open table never holds a key twice; this keeps the invariant explicit.
        entries.dedup_by(|later, earlier| later.0 == earlier.0);

        let mut keys = Vec::with_capacity(entries.len());
        let mut value_ids = Vec::with_capacity(entries.len());
        let mut values: Vec<V> = Vec::new();
        let mut value_lookup: HashMap<V, u32> = HashMap::new();

        for (kmer, value) in entries {
            let id = match value_lookup.get(&value) {
                Some(&id) => id,
                None => {
                    let id = u32::try_from(values.len()).map_err(|_| StoreError::TooManyValues)?;
                    value_lookup.insert(value.clone(), id);
                    values.push(value);
                    id
                }
            };
            keys.push(kmer);
            value_ids.push(id);
        }
        values.shrink_to_fit();

        info!(
            k = self.k,
            kmers = keys.len(),
            distinct_values = values.len(),
            "optimized k-mer store"
        );

        self.state = StoreState::Optimized(SortedEntries {
            keys,
            value_ids,
            values,
            value_lookup,
        });
        Ok(())
    }

    /// Dense id of a value, if any stored key maps to it.
    pub fn value_id(&self, value: &V) -> Option<u32> {
        match &self.state {
            StoreState::Optimized(sorted) => sorted.value_lookup.get(value).copied(),
            _ => None,
        }
    }
}

impl<V: Encode> KmerStore<V> {
    /// Writes the optimized store: magic, version, then a zstd-compressed
    /// bincode payload.
    pub fn save<W: Write>(&self, mut out: W) -> Result<(), StoreError> {
        let StoreState::Optimized(sorted) = &self.state else {
            return Err(StoreError::NotOptimized);
        };
        out.write_all(&STORE_MAGIC)?;
        out.write_all(&STORE_VERSION.to_le_bytes())?;

        let blob = StoreBlobRef {
            k: self.k as u32,
            keys: &sorted.keys,
            value_ids: &sorted.value_ids,
            values: &sorted.values,
        };
        let mut encoder = zstd::stream::Encoder::new(out, 3)?;
        bincode::encode_into_std_write(
            &blob,
            &mut encoder,
            bincode::config::standard().with_fixed_int_encoding(),
        )?;
        encoder.finish()?.flush()?;

        info!(kmers = sorted.keys.len(), "saved k-mer store");
        Ok(())
    }
}

impl<V: Decode<()> + Clone + Eq + Hash> KmerStore<V> {
    /// Reads a store written by [`save`](Self::save). The result is optimized.
    pub fn load<R: Read>(mut input: R) -> Result<Self, StoreError> {
        let mut magic = [0u8; 4];
        input.read_exact(&mut magic)?;
        if magic != STORE_MAGIC {
            return Err(StoreError::Format("bad magic".into()));
        }
        let mut version = [0u8; 4];
        input.read_exact(&mut version)?;
        if u32::from_le_bytes(version) != STORE_VERSION {
            return Err(StoreError::Format("unsupported version".into()));
        }

        // A corrupt length prefix fails with `LimitExceeded` instead of allocating.
        let config = bincode::config::standard()
            .with_fixed_int_encoding()
            .with_limit::<MAX_BLOB_BYTES>();
        let mut decoder = zstd::stream::Decoder::new(input)?;
        let blob: StoreBlob<V> = bincode::decode_from_std_read(&mut decoder, config)?;

        let k = blob.k as usize;
        cgat::check_k(k)?;
        if blob.keys.len() != blob.value_ids.len() {
            return Err(StoreError::Format("key and value id counts differ".into()));
        }
        if blob.keys.windows(2).any(|w| w[0] >= w[1]) {
            return Err(StoreError::Format("keys are not strictly ascending".into()));
        }
        if blob.value_ids.iter().any(|&id| id as usize >= blob.values.len()) {
            return Err(StoreError::Format("value id out of range".into()));
        }

        let mut value_lookup = HashMap::with_capacity(blob.values.len());
        for (id, value) in blob.values.iter().enumerate() {
            if value_lookup.insert(value.clone(), id as u32).is_some() {
                return Err(StoreError::Format("duplicate value in value table".into()));
            }
        }

        info!(
            k,
            kmers = blob.keys.len(),
            distinct_values = blob.values.len(),
            "loaded k-mer store"
        );
        Ok(Self {
            k,
            state: StoreState::Optimized(SortedEntries {
                keys: blob.keys,
                value_ids: blob.value_ids,
                values: blob.values,
                value_lookup,
            }),
        })
    }
}

pub struct StoreIter<'a, V> {
    keys: &'a [u64],
    value_ids: &'a [u32],
    values: &'a [V],
    pos: usize,
}

impl<'a, V> Iterator for StoreIter<'a, V> {
    type Item = (u64, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let kmer = *self.keys.get(self.pos)?;
        let value = &self.values[self.value_ids[self.pos] as usize];
        self.pos += 1;
        Some((kmer, value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let rest = self.keys.len() - self.pos;
        (rest, Some(rest))
    }
}

impl<V> ExactSizeIterator for StoreIter<'_, V> {}
