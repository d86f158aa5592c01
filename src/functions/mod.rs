pub mod bloom;
pub mod fastq_matcher;
pub mod kmer_store;
pub mod kraken_merge;
pub mod read_pool;
