//! Streaming classification of FASTQ reads against a [`KmerStore`].
//!
//! One producer (the calling thread) frames records and fills pooled
//! [`ReadEntry`] buffers; `consumers` worker threads take them from a bounded
//! queue, classify them and hand them back to the pool. With zero consumers
//! every read is classified on the calling thread.
//!
//! Blocking on the queue and on the pool is unbounded: a stalled consumer
//! stalls the producer.

use std::collections::HashSet;
use std::fmt::Display;
use std::fs::File;
use std::hash::Hash;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam::channel::{Receiver, Sender, bounded, select};
use needletail::errors::{ParseError, ParseErrorKind};
use needletail::parse_fastx_reader;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::functions::bloom::BloomFilter;
use crate::functions::kmer_store::KmerStore;
use crate::functions::read_pool::{PoolReturner, ReadEntry, ReadPool, ReadTaxonHits};
use crate::utils::rolling_encoder::CgatRingBuffer;

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("k-mer store must be optimized before matching")]
    StoreNotOptimized,
    #[error("bloom filter k ({bloom}) differs from store k ({store})")]
    KMismatch { bloom: usize, store: usize },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("FASTQ parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("read {read} has {len} bases, more than the maximum of {max}")]
    ReadTooLong { read: u64, len: usize, max: usize },
    #[error("all consumer threads stopped before the input was consumed")]
    WorkersGone,
    #[error("a consumer thread panicked")]
    WorkerPanicked,
}

#[derive(Debug, Clone)]
pub struct MatcherConfig {
    consumers: usize,
    queue_capacity: usize,
    max_dust: i64,
    min_base_quality: Option<u8>,
    max_read_len: usize,
    read_output: bool,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        let consumers = thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1))
            .unwrap_or(0);
        Self {
            consumers,
            queue_capacity: (2 * consumers).max(1),
            max_dust: -1,
            min_base_quality: None,
            max_read_len: 64 * 1024,
            read_output: false,
        }
    }
}

impl MatcherConfig {
    /// Number of worker threads; 0 classifies on the calling thread.
    pub fn consumers(mut self, n: usize) -> Self {
        self.consumers = n;
        self
    }
    /// Bound of the work queue between producer and consumers.
    pub fn queue_capacity(mut self, n: usize) -> Self {
        self.queue_capacity = n.max(1);
        self
    }
    /// Highest acceptable dust score for a k-mer window; negative disables.
    pub fn max_dust(mut self, score: i64) -> Self {
        self.max_dust = score;
        self
    }
    /// Mask bases below this Phred quality.
    pub fn min_base_quality(mut self, q: Option<u8>) -> Self {
        self.min_base_quality = q;
        self
    }
    /// Longer reads abort the run.
    pub fn max_read_len(mut self, n: usize) -> Self {
        self.max_read_len = n;
        self
    }
    /// Emit one line per read to the writer given to `match_reader_with_output`.
    pub fn read_output(mut self, yes: bool) -> Self {
        self.read_output = yes;
        self
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers
    }
}

/// Per-taxon statistics over a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaxonStats {
    /// Reads with at least one k-mer of this taxon.
    pub reads: u64,
    pub kmers: u64,
    /// K-mers of this taxon seen for the first time in the run.
    pub unique_kmers: u64,
    pub contigs: u64,
    pub max_contig_len: u32,
}

impl TaxonStats {
    fn merge(&mut self, other: &TaxonStats) {
        self.reads += other.reads;
        self.kmers += other.kmers;
        self.unique_kmers += other.unique_kmers;
        self.contigs += other.contigs;
        self.max_contig_len = self.max_contig_len.max(other.max_contig_len);
    }
}

/// Bit per store entry; set the first time the entry's k-mer is hit.
struct UniqueBitmap {
    words: Vec<AtomicU64>,
}

impl UniqueBitmap {
    fn new(entries: usize) -> Self {
        Self {
            words: (0..entries.div_ceil(64)).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    #[inline]
    fn first_hit(&self, pos: usize) -> bool {
        let bit = 1u64 << (pos % 64);
        self.words[pos / 64].fetch_or(bit, Ordering::Relaxed) & bit == 0
    }
}

/// Where "first seen" is decided: the run-wide bitmap, or a set private to one
/// sequence whose cost grows with its hits, not with the store.
enum Uniqueness<'a> {
    Run(&'a UniqueBitmap),
    Local(HashSet<usize>),
}

impl Uniqueness<'_> {
    #[inline]
    fn first_hit(&mut self, pos: usize) -> bool {
        match self {
            Uniqueness::Run(bitmap) => bitmap.first_hit(pos),
            Uniqueness::Local(seen) => seen.insert(pos),
        }
    }
}

/// Accumulator owned by one thread; merged once all threads are done.
#[derive(Debug, Clone)]
struct RunTotals {
    stats: Vec<Option<TaxonStats>>,
    reads: u64,
    classified_reads: u64,
    kmers: u64,
    kmer_hits: u64,
}

impl RunTotals {
    fn new(values: usize) -> Self {
        Self {
            stats: vec![None; values],
            reads: 0,
            classified_reads: 0,
            kmers: 0,
            kmer_hits: 0,
        }
    }

    fn absorb(&mut self, entry: &ReadEntry, kmers: u64) {
        self.reads += 1;
        self.kmers += kmers;
        if !entry.hits.is_empty() {
            self.classified_reads += 1;
        }
        for hit in &entry.hits {
            self.kmer_hits += hit.kmers as u64;
            let stats = self.stats[hit.value_id as usize]
                .get_or_insert_with(TaxonStats::default);
            stats.reads += 1;
            stats.kmers += hit.kmers as u64;
            stats.unique_kmers += hit.unique_kmers as u64;
            stats.contigs += hit.contigs as u64;
            stats.max_contig_len = stats.max_contig_len.max(hit.max_contig_len);
        }
    }

    fn merge(&mut self, other: RunTotals) {
        self.reads += other.reads;
        self.classified_reads += other.classified_reads;
        self.kmers += other.kmers;
        self.kmer_hits += other.kmer_hits;
        for (mine, theirs) in self.stats.iter_mut().zip(other.stats) {
            if let Some(theirs) = theirs {
                mine.get_or_insert_with(TaxonStats::default).merge(&theirs);
            }
        }
    }
}

/// Result of one matcher run.
pub struct MatchReport<V> {
    store: Arc<KmerStore<V>>,
    stats: Vec<Option<TaxonStats>>,
    pub reads: u64,
    /// Reads with at least one k-mer hit.
    pub classified_reads: u64,
    /// Reads shorter than k.
    pub short_reads: u64,
    /// Full k-mer windows examined.
    pub kmers: u64,
    pub kmer_hits: u64,
    /// The run was stopped through [`MatcherHandle::close`].
    pub interrupted: bool,
}

impl<V: Clone + Eq + Hash + Send> MatchReport<V> {
    /// Statistics for a taxon; `None` if the run never hit it.
    pub fn get(&self, taxon: &V) -> Option<&TaxonStats> {
        let id = self.store.value_id(taxon)?;
        self.stats[id as usize].as_ref()
    }
}

impl<V> MatchReport<V> {
    /// Taxa with hits, in value id order.
    pub fn iter(&self) -> impl Iterator<Item = (&V, &TaxonStats)> + '_ {
        self.stats.iter().enumerate().filter_map(|(id, stats)| {
            let stats = stats.as_ref()?;
            Some((self.store.value(id as u32)?, stats))
        })
    }

    pub fn taxa(&self) -> usize {
        self.stats.iter().filter(|s| s.is_some()).count()
    }
}

impl<V: Display> MatchReport<V> {
    /// `taxon;reads;kmers;unique_kmers;contigs;max_contig_len` per taxon with hits.
    pub fn write_csv<W: Write>(&self, mut out: W) -> io::Result<()> {
        writeln!(out, "taxon;reads;kmers;unique_kmers;contigs;max_contig_len")?;
        for (taxon, s) in self.iter() {
            writeln!(
                out,
                "{};{};{};{};{};{}",
                taxon, s.reads, s.kmers, s.unique_kmers, s.contigs, s.max_contig_len
            )?;
        }
        out.flush()
    }
}

/// Stops a running matcher from another thread.
#[derive(Clone)]
pub struct MatcherHandle {
    closed: Arc<AtomicBool>,
}

impl MatcherHandle {
    /// Stops the producer after its current record; consumers hand back queued
    /// reads without classifying them. The run still returns a report.
    ///
    /// The matcher stays closed: later runs return at once with an interrupted,
    /// empty report until [`reopen`](Self::reopen) is called.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Clears a previous [`close`](Self::close) so the matcher can run again.
    pub fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Classification state owned by one thread.
struct ReadClassifier<'a, V> {
    store: &'a KmerStore<V>,
    bloom: Option<&'a BloomFilter>,
    unique: Uniqueness<'a>,
    ring: CgatRingBuffer,
}

impl<'a, V: Display> ReadClassifier<'a, V> {
    fn new(
        store: &'a KmerStore<V>,
        bloom: Option<&'a BloomFilter>,
        unique: Uniqueness<'a>,
        max_dust: i64,
    ) -> Self {
        Self {
            store,
            bloom,
            unique,
            ring: CgatRingBuffer::new(store.k(), max_dust),
        }
    }

    #[inline]
    fn lookup(&self, reverse: bool) -> Option<(usize, u32)> {
        if let Some(bloom) = self.bloom {
            if !bloom.contains_ring(&self.ring, reverse) {
                return None;
            }
        }
        self.store.get_indexed_ring(&self.ring, reverse)
    }

    /// Classifies the read held by `entry`, leaving per-taxon counters in its
    /// hit list. Returns the number of full k-mer windows examined.
    fn classify(&mut self, entry: &mut ReadEntry) -> u64 {
        entry.hits.clear();
        self.ring.reset();

        let mut windows = 0u64;
        // (value id, length) of the open contig
        let mut contig: Option<(u32, u32)> = None;

        for i in 0..entry.sequence.len() {
            let base = entry.sequence[i];
            if self.ring.push(base).is_err() || !self.ring.is_filled() {
                close_contig(entry, contig.take());
                continue;
            }
            windows += 1;
            if self.ring.is_dust() {
                close_contig(entry, contig.take());
                continue;
            }

            let Some((pos, id)) = self.lookup(false).or_else(|| self.lookup(true)) else {
                close_contig(entry, contig.take());
                continue;
            };

            let first_hit = self.unique.first_hit(pos);
            let slot = entry.hit_slot(id);
            slot.kmers += 1;
            if first_hit {
                slot.unique_kmers += 1;
            }
            contig = match contig {
                Some((open, len)) if open == id => Some((open, len + 1)),
                other => {
                    close_contig(entry, other);
                    Some((id, 1))
                }
            };
        }
        close_contig(entry, contig);
        windows
    }

    /// `descriptor\ttaxon:kmers taxon:kmers...` or `descriptor\t-`.
    fn write_output(&self, entry: &mut ReadEntry) {
        let ReadEntry { descriptor, output, hits, .. } = entry;
        output.clear();
        output.extend_from_slice(descriptor);
        output.push(b'\t');
        if hits.is_empty() {
            output.push(b'-');
        }
        for (i, hit) in hits.iter().enumerate() {
            if i > 0 {
                output.push(b' ');
            }
            if let Some(taxon) = self.store.value(hit.value_id) {
                // Writing into a Vec cannot fail.
                let _ = write!(output, "{}:{}", taxon, hit.kmers);
            }
        }
        output.push(b'\n');
    }
}

#[inline]
fn close_contig(entry: &mut ReadEntry, contig: Option<(u32, u32)>) {
    if let Some((id, len)) = contig {
        let slot = entry.hit_slot(id);
        slot.contigs += 1;
        slot.max_contig_len = slot.max_contig_len.max(len);
    }
}

fn write_line<W: Write>(output: Option<&Mutex<W>>, line: &[u8]) -> Result<(), MatchError> {
    if let Some(output) = output {
        let mut out = output.lock().map_err(|_| MatchError::WorkerPanicked)?;
        out.write_all(line)?;
    }
    Ok(())
}

pub struct FastqMatcher<V> {
    store: Arc<KmerStore<V>>,
    bloom: Option<Arc<BloomFilter>>,
    config: MatcherConfig,
    closed: Arc<AtomicBool>,
}

impl<V> FastqMatcher<V>
where
    V: Clone + Eq + Hash + Send + Sync + Display,
{
    pub fn new(store: Arc<KmerStore<V>>, config: MatcherConfig) -> Result<Self, MatchError> {
        if !store.is_optimized() {
            return Err(MatchError::StoreNotOptimized);
        }
        Ok(Self {
            store,
            bloom: None,
            config,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Gates store lookups with a Bloom filter built over the same keys.
    pub fn with_bloom(mut self, bloom: Arc<BloomFilter>) -> Result<Self, MatchError> {
        if bloom.k() != self.store.k() {
            return Err(MatchError::KMismatch {
                bloom: bloom.k(),
                store: self.store.k(),
            });
        }
        self.bloom = Some(bloom);
        Ok(self)
    }

    pub fn store(&self) -> &Arc<KmerStore<V>> {
        &self.store
    }

    pub fn handle(&self) -> MatcherHandle {
        MatcherHandle {
            closed: self.closed.clone(),
        }
    }

    /// Same as [`MatcherHandle::close`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Same as [`MatcherHandle::reopen`].
    pub fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    pub fn match_file<P: AsRef<Path>>(&self, path: P) -> Result<MatchReport<V>, MatchError> {
        let file = File::open(path.as_ref())?;
        let reader = BufReader::with_capacity(8 * 1024 * 1024, file);
        self.match_reader(reader)
    }

    pub fn match_reader<R: Read + Send>(&self, reader: R) -> Result<MatchReport<V>, MatchError> {
        self.run::<R, io::Sink>(reader, None)
    }

    /// Like [`match_reader`](Self::match_reader), also writing one line per read
    /// to `out` if the config asks for read output. Line order across reads is
    /// unspecified with more than one consumer.
    pub fn match_reader_with_output<R: Read + Send, W: Write + Send>(
        &self,
        reader: R,
        out: W,
    ) -> Result<(MatchReport<V>, W), MatchError> {
        let out = Mutex::new(out);
        let report = self.run(reader, Some(&out))?;
        let mut out = out.into_inner().map_err(|_| MatchError::WorkerPanicked)?;
        out.flush()?;
        Ok((report, out))
    }

    /// Classifies a single sequence on the calling thread. Uniqueness is
    /// judged within the sequence alone, so the call costs nothing per store
    /// entry. Returns `(taxon, counters)` per taxon hit.
    pub fn classify_sequence(&self, sequence: &[u8]) -> Vec<(V, ReadTaxonHits)> {
        let mut classifier = ReadClassifier::new(
            &self.store,
            self.bloom.as_deref(),
            Uniqueness::Local(HashSet::new()),
            self.config.max_dust,
        );
        let mut entry = ReadEntry::with_capacity(sequence.len());
        entry.fill(0, b"", sequence, None, None);
        classifier.classify(&mut entry);
        entry
            .hits
            .iter()
            .filter_map(|hit| Some((self.store.value(hit.value_id)?.clone(), *hit)))
            .collect()
    }

    fn run<R: Read + Send, W: Write + Send>(
        &self,
        reader: R,
        output: Option<&Mutex<W>>,
    ) -> Result<MatchReport<V>, MatchError> {
        let output = if self.config.read_output { output } else { None };
        let unique = UniqueBitmap::new(self.store.len());
        let values = self.store.values().len();

        info!(
            k = self.store.k(),
            kmers = self.store.len(),
            consumers = self.config.consumers,
            bloom = self.bloom.is_some(),
            "matching reads"
        );

        let mut producer = Producer {
            config: &self.config,
            closed: &self.closed,
            k: self.store.k(),
            next_index: 0,
            short_reads: 0,
            interrupted: false,
        };

        let totals = match parse_fastx_reader(reader) {
            Ok(mut records) => {
                if self.config.consumers == 0 {
                    self.run_inline(&mut producer, &mut *records, &unique, values, output)?
                } else {
                    self.run_pipeline(&mut producer, &mut *records, &unique, values, output)?
                }
            }
            Err(e) if e.kind == ParseErrorKind::EmptyFile => RunTotals::new(values),
            Err(e) => return Err(e.into()),
        };

        let report = MatchReport {
            store: self.store.clone(),
            stats: totals.stats,
            reads: totals.reads,
            classified_reads: totals.classified_reads,
            short_reads: producer.short_reads,
            kmers: totals.kmers,
            kmer_hits: totals.kmer_hits,
            interrupted: producer.interrupted,
        };
        info!(
            reads = report.reads,
            classified = report.classified_reads,
            kmer_hits = report.kmer_hits,
            taxa = report.taxa(),
            interrupted = report.interrupted,
            "matching finished"
        );
        Ok(report)
    }

    fn run_inline<W: Write + Send>(
        &self,
        producer: &mut Producer<'_>,
        records: &mut dyn needletail::FastxReader,
        unique: &UniqueBitmap,
        values: usize,
        output: Option<&Mutex<W>>,
    ) -> Result<RunTotals, MatchError> {
        let mut classifier = ReadClassifier::new(
            &self.store,
            self.bloom.as_deref(),
            Uniqueness::Run(unique),
            self.config.max_dust,
        );
        let mut entry = ReadEntry::with_capacity(self.config.max_read_len.min(1024));
        let mut totals = RunTotals::new(values);

        while producer.fill_next(records, &mut entry)? {
            let windows = classifier.classify(&mut entry);
            totals.absorb(&entry, windows);
            if output.is_some() {
                classifier.write_output(&mut entry);
                write_line(output, &entry.output)?;
            }
        }
        Ok(totals)
    }

    fn run_pipeline<W: Write + Send>(
        &self,
        producer: &mut Producer<'_>,
        records: &mut dyn needletail::FastxReader,
        unique: &UniqueBitmap,
        values: usize,
        output: Option<&Mutex<W>>,
    ) -> Result<RunTotals, MatchError> {
        let consumers = self.config.consumers;
        let queue_capacity = self.config.queue_capacity;
        let pool = ReadPool::for_pipeline(
            queue_capacity,
            consumers,
            self.config.max_read_len.min(1024),
        );
        let (work_tx, work_rx) = bounded::<ReadEntry>(queue_capacity);
        // Never sent on; disconnects once every consumer has exited.
        let (alive_tx, alive_rx) = bounded::<()>(0);

        thread::scope(|scope| {
            let mut workers = Vec::with_capacity(consumers);
            for i in 0..consumers {
                let consumer = Consumer {
                    classifier: ReadClassifier::new(
                        &self.store,
                        self.bloom.as_deref(),
                        Uniqueness::Run(unique),
                        self.config.max_dust,
                    ),
                    work_rx: work_rx.clone(),
                    returner: pool.returner(),
                    closed: &self.closed,
                    totals: RunTotals::new(values),
                    _alive: alive_tx.clone(),
                };
                let worker = thread::Builder::new()
                    .name(format!("kmer-consumer-{i}"))
                    .spawn_scoped(scope, move || consumer.run(output));
                match worker {
                    Ok(worker) => workers.push(worker),
                    Err(e) => {
                        // Already spawned consumers exit once the queue closes.
                        drop(work_tx);
                        for worker in workers {
                            let _ = worker.join();
                        }
                        return Err(MatchError::Io(e));
                    }
                }
            }
            drop(work_rx);
            drop(alive_tx);

            let produced = producer.feed(records, &pool, &work_tx, &alive_rx);
            // Closing the queue lets consumers drain it and exit.
            drop(work_tx);

            let mut totals = RunTotals::new(values);
            let mut failure = None;
            for worker in workers {
                match worker.join() {
                    Ok(Ok(part)) => totals.merge(part),
                    Ok(Err(e)) => {
                        failure.get_or_insert(e);
                    }
                    Err(_) => {
                        failure.get_or_insert(MatchError::WorkerPanicked);
                    }
                }
            }

            match (produced, failure) {
                (_, Some(e)) => Err(e),
                (Err(e), None) => Err(e),
                (Ok(()), None) => Ok(totals),
            }
        })
    }
}

struct Producer<'a> {
    config: &'a MatcherConfig,
    closed: &'a AtomicBool,
    k: usize,
    next_index: u64,
    short_reads: u64,
    interrupted: bool,
}

impl Producer<'_> {
    /// Frames the next record into `entry`. Returns false at end of input or
    /// once the matcher has been closed.
    fn fill_next(
        &mut self,
        records: &mut dyn needletail::FastxReader,
        entry: &mut ReadEntry,
    ) -> Result<bool, MatchError> {
        if self.closed.load(Ordering::Relaxed) {
            self.interrupted = true;
            return Ok(false);
        }
        let Some(record) = records.next() else {
            return Ok(false);
        };
        let record = record?;
        let index = self.next_index;
        self.next_index += 1;

        let sequence = record.seq();
        if sequence.len() > self.config.max_read_len {
            return Err(MatchError::ReadTooLong {
                read: index,
                len: sequence.len(),
                max: self.config.max_read_len,
            });
        }
        if sequence.len() < self.k {
            self.short_reads += 1;
        }
        entry.fill(
            index,
            record.id(),
            &sequence,
            record.qual(),
            self.config.min_base_quality,
        );
        Ok(true)
    }

    /// Fills pooled entries and queues them until the input ends.
    fn feed(
        &mut self,
        records: &mut dyn needletail::FastxReader,
        pool: &ReadPool,
        work_tx: &Sender<ReadEntry>,
        alive_rx: &Receiver<()>,
    ) -> Result<(), MatchError> {
        loop {
            let mut entry = match pool.try_take() {
                Some(entry) => entry,
                None => {
                    select! {
                        recv(pool.free_list()) -> entry => match entry {
                            Ok(entry) => entry,
                            Err(_) => return Err(MatchError::WorkersGone),
                        },
                        recv(alive_rx) -> _ => return Err(MatchError::WorkersGone),
                    }
                }
            };
            match self.fill_next(records, &mut entry) {
                Ok(true) => {}
                Ok(false) => {
                    pool.give_back(entry);
                    return Ok(());
                }
                Err(e) => {
                    pool.give_back(entry);
                    return Err(e);
                }
            }
            if work_tx.send(entry).is_err() {
                warn!("consumer threads are gone, stopping producer");
                return Err(MatchError::WorkersGone);
            }
        }
    }
}

struct Consumer<'a, V> {
    classifier: ReadClassifier<'a, V>,
    work_rx: Receiver<ReadEntry>,
    returner: PoolReturner,
    closed: &'a AtomicBool,
    totals: RunTotals,
    _alive: Sender<()>,
}

impl<V: Display> Consumer<'_, V> {
    fn run<W: Write + Send>(mut self, output: Option<&Mutex<W>>) -> Result<RunTotals, MatchError> {
        debug!(thread = ?thread::current().name(), "consumer started");
        let mut handed_back = 0u64;
        while let Ok(mut entry) = self.work_rx.recv() {
            if self.closed.load(Ordering::Relaxed) {
                // Shutting down: return queued reads untouched.
                self.returner.give_back(entry);
                handed_back += 1;
                continue;
            }
            let windows = self.classifier.classify(&mut entry);
            self.totals.absorb(&entry, windows);
            let written = if output.is_some() {
                self.classifier.write_output(&mut entry);
                write_line(output, &entry.output)
            } else {
                Ok(())
            };
            self.returner.give_back(entry);
            written?;
        }
        debug!(
            thread = ?thread::current().name(),
            reads = self.totals.reads,
            skipped = handed_back,
            "consumer stopped"
        );
        Ok(self.totals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_base_store() -> Arc<KmerStore<String>> {
        let mut store = KmerStore::new(1).unwrap();
        store.init_size(3).unwrap();
        store.put(b"C", 0, "1".to_string()).unwrap();
        store.put(b"G", 0, "2".to_string()).unwrap();
        store.put(b"A", 0, "3".to_string()).unwrap();
        store.optimize().unwrap();
        Arc::new(store)
    }

    fn fastq(reads: &[(&str, &str)]) -> Vec<u8> {
        let mut out = Vec::new();
        for (id, seq) in reads {
            let quality = "I".repeat(seq.len());
            out.extend_from_slice(format!("@{id}\n{seq}\n+\n{quality}\n").as_bytes());
        }
        out
    }

    fn matcher_with(consumers: usize) -> FastqMatcher<String> {
        let config = MatcherConfig::default().consumers(consumers);
        FastqMatcher::new(single_base_store(), config).unwrap()
    }

    #[test]
    fn single_base_scenario() {
        let matcher = matcher_with(0);
        let report = matcher.match_reader(&fastq(&[("r1", "CGACG")])[..]).unwrap();

        let stats = |t: &str| *report.get(&t.to_string()).unwrap();
        assert_eq!(stats("1").kmers, 2);
        assert_eq!(stats("2").kmers, 2);
        assert_eq!(stats("3").kmers, 1);
        assert_eq!(stats("1").contigs, 2);
        assert_eq!(stats("2").contigs, 2);
        assert_eq!(stats("3").contigs, 1);
        assert_eq!(stats("1").unique_kmers, 1);
        assert_eq!(stats("2").unique_kmers, 1);
        assert_eq!(stats("3").unique_kmers, 1);
        assert_eq!(stats("1").max_contig_len, 1);
        assert_eq!(report.reads, 1);
        assert_eq!(report.kmers, 5);
        assert_eq!(report.kmer_hits, 5);
    }

    #[test]
    fn unseen_taxa_are_absent() {
        let matcher = matcher_with(0);
        let report = matcher.match_reader(&fastq(&[("r1", "CCCC")])[..]).unwrap();
        assert!(report.get(&"1".to_string()).is_some());
        assert!(report.get(&"2".to_string()).is_none());
        assert!(report.get(&"42".to_string()).is_none());
    }

    #[test]
    fn reverse_complement_hits_count() {
        // T is only reachable through its reverse complement A
        let matcher = matcher_with(0);
        let hits = matcher.classify_sequence(b"TT");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "3");
        assert_eq!(hits[0].1.kmers, 2);
        assert_eq!(hits[0].1.contigs, 1);
        assert_eq!(hits[0].1.max_contig_len, 2);
    }

    #[test]
    fn ambiguous_bases_split_contigs() {
        let matcher = matcher_with(0);
        let hits = matcher.classify_sequence(b"CCNCC");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].1.kmers, 4);
        assert_eq!(hits[0].1.contigs, 2);
        assert_eq!(hits[0].1.max_contig_len, 2);
    }

    #[test]
    fn requires_an_optimized_store() {
        let mut store: KmerStore<String> = KmerStore::new(3).unwrap();
        store.init_size(1).unwrap();
        assert!(matches!(
            FastqMatcher::new(Arc::new(store), MatcherConfig::default()),
            Err(MatchError::StoreNotOptimized)
        ));
    }

    #[test]
    fn empty_input_gives_empty_report() {
        let matcher = matcher_with(2);
        let report = matcher.match_reader(&b""[..]).unwrap();
        assert_eq!(report.reads, 0);
        assert_eq!(report.taxa(), 0);
    }

    #[test]
    fn read_too_long_is_fatal() {
        let matcher = FastqMatcher::new(
            single_base_store(),
            MatcherConfig::default().consumers(0).max_read_len(4),
        )
        .unwrap();
        let result = matcher.match_reader(&fastq(&[("r1", "CGA"), ("r2", "CGACG")])[..]);
        let Err(MatchError::ReadTooLong { read, len, max }) = result else {
            panic!("expected a ReadTooLong error");
        };
        assert_eq!((read, len, max), (1, 5, 4));
    }

    #[test]
    fn closed_matcher_reports_interruption() {
        let matcher = matcher_with(2);
        matcher.handle().close();
        let report = matcher.match_reader(&fastq(&[("r1", "CGACG")])[..]).unwrap();
        assert!(report.interrupted);
        assert_eq!(report.reads, 0);
    }

    #[test]
    fn close_persists_until_reopen() {
        let matcher = matcher_with(2);
        let input = fastq(&[("r1", "CGACG")]);
        matcher.close();
        for _ in 0..2 {
            let report = matcher.match_reader(&input[..]).unwrap();
            assert!(report.interrupted);
            assert_eq!(report.reads, 0);
        }

        matcher.handle().reopen();
        assert!(!matcher.handle().is_closed());
        let report = matcher.match_reader(&input[..]).unwrap();
        assert!(!report.interrupted);
        assert_eq!(report.reads, 1);
    }

    #[test]
    fn classify_sequence_judges_uniqueness_per_call() {
        let matcher = matcher_with(0);
        for _ in 0..2 {
            let hits = matcher.classify_sequence(b"CCC");
            assert_eq!(hits.len(), 1);
            assert_eq!(hits[0].1.kmers, 3);
            assert_eq!(hits[0].1.unique_kmers, 1);
        }
    }

    #[test]
    fn read_output_lines() {
        let matcher = FastqMatcher::new(
            single_base_store(),
            MatcherConfig::default().consumers(0).read_output(true),
        )
        .unwrap();
        let input = fastq(&[("r1 sample", "CCA"), ("r2", "TTNN")]);
        let (_, out) = matcher.match_reader_with_output(&input[..], Vec::new()).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "r1 sample\t1:2 3:1\nr2\t3:2\n");
    }
}
