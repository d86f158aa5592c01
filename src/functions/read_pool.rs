//! Reusable read buffers and the free list they circulate through.
//!
//! A [`ReadEntry`] is owned by exactly one party at a time: the pool, the
//! producer filling it, the work queue, or the consumer classifying it. Moving
//! the value through channels is what hands it over, so no entry can be
//! touched by two threads at once.

use crossbeam::channel::{Receiver, Sender, unbounded};
use pulp::Arch;

const PHRED_OFFSET: u8 = 33;

/// Per-read counters for one taxon (value id).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadTaxonHits {
    pub value_id: u32,
    pub kmers: u32,
    pub unique_kmers: u32,
    pub contigs: u32,
    pub max_contig_len: u32,
}

impl ReadTaxonHits {
    fn new(value_id: u32) -> Self {
        Self {
            value_id,
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
pub struct ReadEntry {
    /// 0-based position of the record in its input.
    pub index: u64,
    pub descriptor: Vec<u8>,
    pub sequence: Vec<u8>,
    pub quality: Vec<u8>,
    /// Per-read output line, filled by the classifier when enabled.
    pub output: Vec<u8>,
    pub(crate) hits: Vec<ReadTaxonHits>,
}

impl ReadEntry {
    pub fn with_capacity(read_len: usize) -> Self {
        Self {
            index: 0,
            descriptor: Vec::with_capacity(256),
            sequence: Vec::with_capacity(read_len),
            quality: Vec::with_capacity(read_len),
            output: Vec::new(),
            hits: Vec::with_capacity(8),
        }
    }

    /// Copies a framed record into the buffers, replacing any previous read.
    ///
    /// With `min_base_quality` set, bases whose Phred+33 quality is below it are
    /// replaced by `N`, so they break k-mers like any ambiguous base.
    pub fn fill(
        &mut self,
        index: u64,
        descriptor: &[u8],
        sequence: &[u8],
        quality: Option<&[u8]>,
        min_base_quality: Option<u8>,
    ) {
        self.index = index;
        self.descriptor.clear();
        self.descriptor.extend_from_slice(descriptor);
        self.quality.clear();
        if let Some(quality) = quality {
            self.quality.extend_from_slice(quality);
        }
        self.output.clear();
        self.hits.clear();

        self.sequence.clear();
        match (min_base_quality, quality) {
            (Some(min), Some(quality)) if quality.len() == sequence.len() => {
                let threshold = min.saturating_add(PHRED_OFFSET);
                let arch = Arch::new();
                let masked = &mut self.sequence;
                arch.dispatch(|| {
                    masked.extend(
                        sequence
                            .iter()
                            .zip(quality.iter())
                            .map(|(&base, &q)| if q < threshold { b'N' } else { base }),
                    )
                });
            }
            _ => self.sequence.extend_from_slice(sequence),
        }
    }

    /// Per-taxon counters of the last classification.
    pub fn hits(&self) -> &[ReadTaxonHits] {
        &self.hits
    }

    pub(crate) fn hit_slot(&mut self, value_id: u32) -> &mut ReadTaxonHits {
        let pos = match self.hits.iter().position(|h| h.value_id == value_id) {
            Some(pos) => pos,
            None => {
                self.hits.push(ReadTaxonHits::new(value_id));
                self.hits.len() - 1
            }
        };
        &mut self.hits[pos]
    }
}

/// Fixed set of read entries. Entries are created once and only ever move
/// between the free list and their current owner.
pub struct ReadPool {
    free_tx: Sender<ReadEntry>,
    free_rx: Receiver<ReadEntry>,
    size: usize,
}

impl ReadPool {
    pub fn new(size: usize, read_len: usize) -> Self {
        let (free_tx, free_rx) = unbounded();
        for _ in 0..size {
            // The receiver is alive, sending cannot fail.
            let _ = free_tx.send(ReadEntry::with_capacity(read_len));
        }
        Self {
            free_tx,
            free_rx,
            size,
        }
    }

    /// Pool size for a queue of `queue_capacity` entries drained by `consumers`
    /// threads: every queued entry, one per consumer, one being filled.
    pub fn for_pipeline(queue_capacity: usize, consumers: usize, read_len: usize) -> Self {
        Self::new(queue_capacity + consumers + 1, read_len)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Entries currently free.
    pub fn available(&self) -> usize {
        self.free_rx.len()
    }

    /// Takes a free entry without blocking.
    pub fn try_take(&self) -> Option<ReadEntry> {
        self.free_rx.try_recv().ok()
    }

    /// Free list receiver, for callers that wait on it alongside other channels.
    pub fn free_list(&self) -> &Receiver<ReadEntry> {
        &self.free_rx
    }

    pub fn give_back(&self, entry: ReadEntry) {
        let _ = self.free_tx.send(entry);
    }

    /// Handle consumers use to return entries.
    pub fn returner(&self) -> PoolReturner {
        PoolReturner {
            free_tx: self.free_tx.clone(),
        }
    }
}

#[derive(Clone)]
pub struct PoolReturner {
    free_tx: Sender<ReadEntry>,
}

impl PoolReturner {
    pub fn give_back(&self, entry: ReadEntry) {
        // Fails only once the pool is gone, at which point the entry is not needed.
        let _ = self.free_tx.send(entry);
    }
}
