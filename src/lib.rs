//! K-mer based taxonomic classification of sequencing reads.
//!
//! Reference k-mers (2-bit CGAT packed, `k <= 32`) are loaded into a
//! [`KmerStore`], optimized into a sorted array and matched against FASTQ
//! reads by a [`FastqMatcher`] running one producer and N consumer threads.
//! [`BloomFilter`] gives a fast negative pre-filter, and
//! [`KrakenFastqMerger`] joins external Kraken output with the reads it was
//! computed from.

pub mod functions;
pub mod utils;

pub use functions::bloom::{BloomError, BloomFilter, HashStrategy};
pub use functions::fastq_matcher::{
    FastqMatcher, MatchError, MatchReport, MatcherConfig, MatcherHandle, TaxonStats,
};
pub use functions::kmer_store::{KmerStore, StoreError};
pub use functions::kraken_merge::{
    KrakenFastqMerger, KrakenTaxonCounter, MergeConfig, MergeError, MergeListener,
};
pub use functions::read_pool::{ReadEntry, ReadPool, ReadTaxonHits};
pub use utils::cgat::CgatError;
pub use utils::digit_trie::DigitTrie;
pub use utils::rolling_encoder::CgatRingBuffer;
