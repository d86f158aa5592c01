//! Builds a k-mer store from a reference FASTA (one taxon per record, named by
//! the first token of its header) and classifies a FASTQ against it.
//!
//! cargo run --release --example classify_fastq -- refs.fa reads.fq.gz [k] [threads]

use std::error::Error;
use std::io::{self, BufWriter};
use std::sync::Arc;
use std::time::Instant;

use kmer_forge::*;
use needletail::parse_fastx_file;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn taxon_of(id: &[u8]) -> String {
    let end = id.iter().position(|b| b.is_ascii_whitespace()).unwrap_or(id.len());
    String::from_utf8_lossy(&id[..end]).into_owned()
}

fn build_store(path: &str, k: usize) -> Result<KmerStore<String>, Box<dyn Error>> {
    let mut store = KmerStore::new(k)?;

    // First pass sizes the table.
    let mut windows = 0usize;
    let mut reader = parse_fastx_file(path)?;
    while let Some(record) = reader.next() {
        windows += record?.num_bases().saturating_sub(k - 1);
    }

    store.init_size(windows)?;
    let mut reader = parse_fastx_file(path)?;
    while let Some(record) = reader.next() {
        let record = record?;
        let taxon = taxon_of(record.id());
        let seq = record.seq();
        for start in 0..seq.len().saturating_sub(k - 1) {
            // Windows with ambiguous bases are not indexed.
            match store.put(&seq, start, taxon.clone()) {
                Ok(_) | Err(StoreError::Kmer(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
    store.optimize()?;
    Ok(store)
}

fn main() -> Result<(), Box<dyn Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("usage: {} <refs.fasta> <reads.fastq> [k] [threads]", args[0]);
        std::process::exit(2);
    }
    let k: usize = args.get(3).map(|s| s.parse()).transpose()?.unwrap_or(21);

    let start = Instant::now();
    let store = Arc::new(build_store(&args[1], k)?);
    info!(
        kmers = store.len(),
        taxa = store.values().len(),
        elapsed = ?start.elapsed(),
        "store ready"
    );

    let bloom = Arc::new(BloomFilter::from_store(&*store, 0.01, HashStrategy::TwoLongs)?);

    let mut config = MatcherConfig::default();
    if let Some(threads) = args.get(4) {
        let threads: usize = threads.parse()?;
        config = config.consumers(threads).queue_capacity(2 * threads);
    }
    let matcher = FastqMatcher::new(store, config)?.with_bloom(bloom)?;

    let start = Instant::now();
    let report = matcher.match_file(&args[2])?;
    info!(
        reads = report.reads,
        classified = report.classified_reads,
        elapsed = ?start.elapsed(),
        "classification done"
    );

    report.write_csv(BufWriter::new(io::stdout().lock()))?;
    Ok(())
}
