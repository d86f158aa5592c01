//! Joins an external Kraken classification output with the FASTQ it was run on.
//!
//! Both inputs are walked in lockstep, one Kraken line per FASTQ record. The
//! taxon id is taken from the line as a byte span and handed to the listener
//! without building a string.

use std::io::{self, BufRead, Read, Write};

use needletail::errors::{ParseError, ParseErrorKind};
use needletail::parse_fastx_reader;
use thiserror::Error;
use tracing::{debug, info};

use crate::utils::digit_trie::DigitTrie;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("FASTQ parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("malformed Kraken line for read {read}: {reason}")]
    Malformed { read: u64, reason: &'static str },
    #[error("inconsistent files for read {read}")]
    InconsistentFiles { read: u64 },
    #[error("Kraken output ends at read {read} but the FASTQ continues")]
    KrakenTruncated { read: u64 },
    #[error("FASTQ ends at read {read} but the Kraken output continues")]
    FastqTruncated { read: u64 },
}

#[derive(Debug, Clone)]
pub struct MergeConfig {
    check_descriptors: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            check_descriptors: true,
        }
    }
}

impl MergeConfig {
    /// Compare each Kraken read id with the FASTQ descriptor's first token.
    pub fn check_descriptors(mut self, yes: bool) -> Self {
        self.check_descriptors = yes;
        self
    }
}

/// Receives one call per merged read.
pub trait MergeListener {
    fn on_read(
        &mut self,
        read: u64,
        taxid: &[u8],
        descriptor: &[u8],
        sequence: &[u8],
        quality: &[u8],
    ) -> Result<(), MergeError>;
}

impl<F> MergeListener for F
where
    F: FnMut(u64, &[u8], &[u8], &[u8], &[u8]) -> Result<(), MergeError>,
{
    fn on_read(
        &mut self,
        read: u64,
        taxid: &[u8],
        descriptor: &[u8],
        sequence: &[u8],
        quality: &[u8],
    ) -> Result<(), MergeError> {
        self(read, taxid, descriptor, sequence, quality)
    }
}

/// Fields of a Kraken line the merger needs, as spans into the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct KrakenFields {
    read_id: (usize, usize),
    taxid: (usize, usize),
}

/// Splits one line of Kraken / kraken2 standard output. Its tab-separated
/// columns are: `C` or `U` (classified or not), read id, taxon, read length
/// (`150` or `150|148` for pairs), then the LCA k-mer list (`562:116 0:4`).
/// The taxon column is a bare taxid, or `Name (taxid N)` under kraken2's
/// `--use-names`. Only the first three columns are read.
fn parse_kraken_line(line: &[u8], read: u64) -> Result<KrakenFields, MergeError> {
    if bytecount::count(line, b'\t') < 2 {
        return Err(MergeError::Malformed {
            read,
            reason: "fewer than three columns",
        });
    }
    let first = column_end(line, 0);
    let second = column_end(line, first + 1);
    let third_end = column_end(line, second + 1);
    let fields = [(0, first), (first + 1, second), (second + 1, third_end)];

    let (read_start, read_end) = fields[1];
    if read_start == read_end {
        return Err(MergeError::Malformed {
            read,
            reason: "empty read id",
        });
    }
    let taxid = taxid_span(line, fields[2]).ok_or(MergeError::Malformed {
        read,
        reason: "no taxid in taxon column",
    })?;
    Ok(KrakenFields {
        read_id: fields[1],
        taxid,
    })
}

/// End of the column starting at `from`.
fn column_end(line: &[u8], from: usize) -> usize {
    line[from..]
        .iter()
        .position(|&b| b == b'\t')
        .map_or(line.len(), |p| from + p)
}

fn taxid_span(line: &[u8], (start, end): (usize, usize)) -> Option<(usize, usize)> {
    const NAMED: &[u8] = b"(taxid ";
    let field = &line[start..end];
    let (start, end) = match field.strip_suffix(b")") {
        Some(inner) => {
            let open = inner.windows(NAMED.len()).rposition(|w| w == NAMED)?;
            (start + open + NAMED.len(), start + inner.len())
        }
        None => (start, end),
    };
    let digits = &line[start..end];
    (!digits.is_empty() && digits.iter().all(u8::is_ascii_digit)).then_some((start, end))
}

fn first_token(descriptor: &[u8]) -> &[u8] {
    let end = descriptor
        .iter()
        .position(|b| b.is_ascii_whitespace())
        .unwrap_or(descriptor.len());
    &descriptor[..end]
}

/// Reads the next non-blank line into `line` without its line ending.
fn next_line<B: BufRead>(input: &mut B, line: &mut Vec<u8>) -> io::Result<bool> {
    loop {
        line.clear();
        if input.read_until(b'\n', line)? == 0 {
            return Ok(false);
        }
        while matches!(line.last(), Some(b'\n' | b'\r')) {
            line.pop();
        }
        if !line.is_empty() {
            return Ok(true);
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct KrakenFastqMerger {
    config: MergeConfig,
}

impl KrakenFastqMerger {
    pub fn new(config: MergeConfig) -> Self {
        Self { config }
    }

    /// Walks both inputs and calls `listener` once per read, in input order.
    /// Read indices are 0-based. Stops at the first inconsistency; no later
    /// read reaches the listener. Returns the number of reads merged.
    pub fn merge<K, R, L>(
        &self,
        mut kraken: K,
        fastq: R,
        listener: &mut L,
    ) -> Result<u64, MergeError>
    where
        K: BufRead,
        R: Read + Send,
        L: MergeListener + ?Sized,
    {
        let mut records = match parse_fastx_reader(fastq) {
            Ok(records) => Some(records),
            Err(e) if e.kind == ParseErrorKind::EmptyFile => None,
            Err(e) => return Err(e.into()),
        };

        let mut line = Vec::with_capacity(1024);
        let mut read = 0u64;
        loop {
            let has_line = next_line(&mut kraken, &mut line)?;
            let record = records.as_mut().and_then(|r| r.next()).transpose()?;
            let record = match (has_line, record) {
                (false, None) => break,
                (false, Some(_)) => return Err(MergeError::KrakenTruncated { read }),
                (true, None) => return Err(MergeError::FastqTruncated { read }),
                (true, Some(record)) => record,
            };

            let fields = parse_kraken_line(&line, read)?;
            let descriptor = record.id();
            if self.config.check_descriptors
                && line[fields.read_id.0..fields.read_id.1] != *first_token(descriptor)
            {
                debug!(
                    read,
                    kraken = %String::from_utf8_lossy(&line[fields.read_id.0..fields.read_id.1]),
                    fastq = %String::from_utf8_lossy(descriptor),
                    "descriptor mismatch"
                );
                return Err(MergeError::InconsistentFiles { read });
            }

            let sequence = record.seq();
            listener.on_read(
                read,
                &line[fields.taxid.0..fields.taxid.1],
                descriptor,
                &sequence,
                record.qual().unwrap_or(&[]),
            )?;
            read += 1;
        }

        info!(reads = read, "merged Kraken output with FASTQ");
        Ok(read)
    }
}

/// Counts reads per Kraken-assigned taxid.
#[derive(Debug, Clone, Default)]
pub struct KrakenTaxonCounter {
    taxa: DigitTrie,
    reads: u64,
}

impl KrakenTaxonCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reads(&self) -> u64 {
        self.reads
    }

    pub fn count(&mut self, taxid: &str) -> u64 {
        self.taxa.count(taxid.as_bytes())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> + '_ {
        self.taxa.iter()
    }

    /// `taxid;reads` per taxid, in lexicographic taxid order.
    pub fn write_report<W: Write>(&self, mut out: W) -> io::Result<()> {
        let mut result = Ok(());
        self.taxa.collect(|taxid, reads| {
            if result.is_ok() {
                result = writeln!(out, "{taxid};{reads}");
            }
        });
        result?;
        out.flush()
    }
}

impl MergeListener for KrakenTaxonCounter {
    fn on_read(
        &mut self,
        read: u64,
        taxid: &[u8],
        _descriptor: &[u8],
        _sequence: &[u8],
        _quality: &[u8],
    ) -> Result<(), MergeError> {
        self.taxa
            .inc(taxid, 0, taxid.len())
            .ok_or(MergeError::Malformed {
                read,
                reason: "taxid is not a digit string",
            })?;
        self.reads += 1;
        Ok(())
    }
}
