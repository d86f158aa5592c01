use crate::utils::cgat::{CgatError, MAX_K, complement_code, encode_base, kmer_mask};

/// Runs longer than this contribute the same dust weight.
const MAX_DUST_RUN: usize = 40;

/// `DUST_WEIGHTS[n]` is the weight a base adds when it extends a run of the same
/// base to length `n`. Single bases weigh nothing, longer runs grow like fib(n).
const DUST_WEIGHTS: [u64; MAX_DUST_RUN + 1] = {
    let mut fib = [0u64; MAX_DUST_RUN + 1];
    fib[1] = 1;
    let mut i = 2;
    while i <= MAX_DUST_RUN {
        fib[i] = fib[i - 1] + fib[i - 2];
        i += 1;
    }
    fib[1] = 0;
    fib
};

/// A rolling k-mer over 2-bit CGAT codes.
///
/// Keeps the last `k` bases, their forward packing and their reverse-complement
/// packing, each updated in O(1) per pushed base. Pushing a byte outside CGAT
/// resets the buffer, so [`is_filled`](Self::is_filled) only turns true again
/// after `k` further valid bases.
///
/// The buffer also tracks a dust score: the sum of the run weights of the bases
/// currently in the window. A window made of one repeated base scores roughly
/// fib(k + 2); a window without adjacent repeats scores 0.
#[derive(Debug, Clone)]
pub struct CgatRingBuffer {
    k: usize,
    bases: Vec<u8>,
    weights: Vec<u64>,
    head: usize,
    filled: usize,
    forward: u64,
    reverse: u64,
    mask: u64,
    rc_shift: u32,
    run_code: u8,
    run_len: usize,
    dust: u64,
    max_dust: i64,
}

impl CgatRingBuffer {
    /// Creates an empty buffer for k-mers of length `k`.
    ///
    /// `max_dust` is the highest acceptable dust score; a negative value turns
    /// the check off.
    pub fn new(k: usize, max_dust: i64) -> Self {
        assert!(k >= 1 && k <= MAX_K, "k-mer size must be in 1..=32");
        Self {
            k,
            bases: vec![b'N'; k],
            weights: vec![0; k],
            head: 0,
            filled: 0,
            forward: 0,
            reverse: 0,
            mask: kmer_mask(k),
            rc_shift: 2 * (k as u32 - 1),
            run_code: u8::MAX,
            run_len: 0,
            dust: 0,
            max_dust,
        }
    }

    #[inline]
    pub fn k(&self) -> usize {
        self.k
    }

    /// Appends a base, dropping the oldest one once `k` bases are held.
    ///
    /// On a non-CGAT byte the buffer is reset and the error is returned; the
    /// caller decides whether to skip or abort.
    #[inline]
    pub fn push(&mut self, base: u8) -> Result<(), CgatError> {
        let Some(code) = encode_base(base) else {
            self.reset();
            return Err(CgatError::NotCgat { byte: base });
        };

        self.forward = ((self.forward << 2) | code as u64) & self.mask;
        self.reverse = (self.reverse >> 2) | ((complement_code(code) as u64) << self.rc_shift);

        if code == self.run_code {
            self.run_len = (self.run_len + 1).min(MAX_DUST_RUN);
        } else {
            self.run_code = code;
            self.run_len = 1;
        }
        let weight = DUST_WEIGHTS[self.run_len];
        self.dust = self.dust - self.weights[self.head] + weight;
        self.weights[self.head] = weight;

        self.bases[self.head] = base.to_ascii_uppercase();
        self.head = (self.head + 1) % self.k;
        if self.filled < self.k {
            self.filled += 1;
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        self.filled = 0;
        self.forward = 0;
        self.reverse = 0;
        self.run_code = u8::MAX;
        self.run_len = 0;
        self.dust = 0;
        self.weights.fill(0);
    }

    /// True once `k` consecutive valid bases have been pushed since the last reset.
    #[inline]
    pub fn is_filled(&self) -> bool {
        self.filled == self.k
    }

    /// Forward packing of the current window.
    #[inline]
    pub fn kmer(&self) -> u64 {
        self.forward
    }

    /// Reverse-complement packing of the current window.
    #[inline]
    pub fn reverse_kmer(&self) -> u64 {
        self.reverse
    }

    #[inline]
    pub fn packed(&self, reverse: bool) -> u64 {
        if reverse { self.reverse } else { self.forward }
    }

    #[inline]
    pub fn dust_score(&self) -> u64 {
        self.dust
    }

    #[inline]
    pub fn is_dust(&self) -> bool {
        self.max_dust >= 0 && self.dust > self.max_dust as u64
    }

    /// Copies the window, oldest base first, into `out`.
    pub fn write_window(&self, out: &mut Vec<u8>) {
        let held = self.filled;
        let start = (self.head + self.k - held) % self.k;
        for i in 0..held {
            out.push(self.bases[(start + i) % self.k]);
        }
    }
}
