//! CGAT codec: 2-bit nucleotide codes and k-mer packing.
//!
//! Codes follow the alphabet order `C=0, G=1, A=2, T=3`, so the complement of a
//! code is `code ^ 1`. A packed k-mer keeps its first base in the most
//! significant occupied bits (lower `2k` bits of the `u64` are used).

use thiserror::Error;

/// Largest k that fits into a `u64` at 2 bits per base.
pub const MAX_K: usize = 32;

/// Marker for bytes outside the CGAT alphabet.
pub const INVALID_CODE: u8 = 0xFF;

static CGAT_CODES: [u8; 256] = {
    let mut table = [INVALID_CODE; 256];
    table[b'C' as usize] = 0;
    table[b'c' as usize] = 0;
    table[b'G' as usize] = 1;
    table[b'g' as usize] = 1;
    table[b'A' as usize] = 2;
    table[b'a' as usize] = 2;
    table[b'T' as usize] = 3;
    table[b't' as usize] = 3;
    table
};

static CGAT_BASES: [u8; 4] = *b"CGAT";

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CgatError {
    #[error("not a CGAT sequence: byte {byte:#04x}")]
    NotCgat { byte: u8 },
    #[error("not a CGAT sequence: byte {byte:#04x} at position {pos}")]
    NotCgatAt { byte: u8, pos: usize },
    #[error("k-mer {start}..{end} does not fit a sequence of length {len}")]
    OutOfBounds { start: usize, end: usize, len: usize },
    #[error("k must be in 1..=32, got {0}")]
    InvalidK(usize),
}

/// Table lookup without error construction, for hot loops.
#[inline(always)]
pub fn encode_base(base: u8) -> Option<u8> {
    let code = CGAT_CODES[base as usize];
    if code == INVALID_CODE {
        None
    } else {
        Some(code)
    }
}

#[inline]
pub fn encode(base: u8) -> Result<u8, CgatError> {
    encode_base(base).ok_or(CgatError::NotCgat { byte: base })
}

/// Inverse of [`encode`]; only the lower two bits of `code` are used.
#[inline(always)]
pub fn decode(code: u8) -> u8 {
    CGAT_BASES[(code & 0b11) as usize]
}

#[inline(always)]
pub fn complement_code(code: u8) -> u8 {
    code ^ 1
}

pub fn check_k(k: usize) -> Result<(), CgatError> {
    if k == 0 || k > MAX_K {
        return Err(CgatError::InvalidK(k));
    }
    Ok(())
}

/// Mask covering the lower `2k` bits.
#[inline]
pub fn kmer_mask(k: usize) -> u64 {
    if k >= MAX_K {
        u64::MAX
    } else {
        (1u64 << (2 * k)) - 1
    }
}

#[inline]
fn check_window(seq: &[u8], start: usize, k: usize) -> Result<(), CgatError> {
    check_k(k)?;
    let end = start.checked_add(k).unwrap_or(usize::MAX);
    if end > seq.len() {
        return Err(CgatError::OutOfBounds {
            start,
            end,
            len: seq.len(),
        });
    }
    Ok(())
}

/// Packs `seq[start..start + k]` in forward orientation.
pub fn pack_forward(seq: &[u8], start: usize, k: usize) -> Result<u64, CgatError> {
    check_window(seq, start, k)?;
    let mut kmer = 0u64;
    for (i, &b) in seq[start..start + k].iter().enumerate() {
        let code = encode_base(b).ok_or(CgatError::NotCgatAt {
            byte: b,
            pos: start + i,
        })?;
        kmer = (kmer << 2) | code as u64;
    }
    Ok(kmer)
}

/// Packs the reverse complement of `seq[start..start + k]`.
pub fn pack_reverse_complement(seq: &[u8], start: usize, k: usize) -> Result<u64, CgatError> {
    check_window(seq, start, k)?;
    let mut kmer = 0u64;
    for i in (0..k).rev() {
        let b = seq[start + i];
        let code = encode_base(b).ok_or(CgatError::NotCgatAt {
            byte: b,
            pos: start + i,
        })?;
        kmer = (kmer << 2) | complement_code(code) as u64;
    }
    Ok(kmer)
}

/// Packs either orientation, as selected by `reverse`.
#[inline]
pub fn pack(seq: &[u8], start: usize, k: usize, reverse: bool) -> Result<u64, CgatError> {
    if reverse {
        pack_reverse_complement(seq, start, k)
    } else {
        pack_forward(seq, start, k)
    }
}

/// Reverse complement of an already packed k-mer.
#[inline]
pub fn reverse_complement_packed(kmer: u64, k: usize) -> u64 {
    debug_assert!(k >= 1 && k <= MAX_K);
    let mut rc = 0u64;
    let mut rest = kmer;
    for _ in 0..k {
        rc = (rc << 2) | ((rest & 0b11) ^ 1);
        rest >>= 2;
    }
    rc
}

/// Writes the bases of a packed k-mer into `out[..k]`.
pub fn unpack_into(kmer: u64, k: usize, out: &mut [u8]) {
    for (i, slot) in out[..k].iter_mut().enumerate() {
        let shift = 2 * (k - 1 - i);
        *slot = decode(((kmer >> shift) & 0b11) as u8);
    }
}

/// Inverse of [`pack_forward`], used to report stored keys as sequences.
pub fn unpack(kmer: u64, k: usize) -> Vec<u8> {
    let mut out = vec![0u8; k];
    unpack_into(kmer, k, &mut out);
    out
}

#[inline]
pub fn complement_byte(b: u8) -> u8 {
    match b {
        b'C' => b'G',
        b'G' => b'C',
        b'A' => b'T',
        b'T' => b'A',
        b'c' => b'g',
        b'g' => b'c',
        b'a' => b't',
        b't' => b'a',
        other => other,
    }
}

/// Byte-level reverse complement. Bytes outside CGAT are kept as they are.
pub fn reverse_complement(seq: &[u8]) -> Vec<u8> {
    seq.iter().rev().map(|&b| complement_byte(b)).collect()
}
