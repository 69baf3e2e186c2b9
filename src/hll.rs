//! HyperLogLog cardinality estimator with sparse and dense
//! representations.
//!
//! 2^14 six-bit registers. An element hashes to 64 bits: the top 14 bits
//! pick a register, the rank is one plus the count of leading zeros in
//! the remaining 50 bits. Small sets live in a run-length-encoded sparse
//! form and are promoted to the 12 KiB dense form once the encoding
//! outgrows its byte ceiling or sees a rank too large for its value
//! opcode.

use crate::hash::str_hash;

const P: u32 = 14;
const M: usize = 1 << P;
const Q: u32 = 64 - P;
const DENSE_BYTES: usize = M * 6 / 8;
/// Sparse encodings beyond this many bytes are promoted to dense.
const SPARSE_MAX_BYTES: usize = 3000;
/// Largest rank the sparse VAL opcode can store.
const VAL_MAX_RANK: u8 = 32;

// Sparse opcodes, one or two bytes each:
//   ZERO  00xxxxxx            run of x+1 zero registers (1..=64)
//   XZERO 01xxxxxx yyyyyyyy   run of (x<<8|y)+1 zero registers (1..=16384)
//   VAL   1vvvvvxx            run of x+1 registers holding v+1 (1..=4, 1..=32)

#[derive(Clone)]
enum Repr {
    Sparse(Vec<u8>),
    Dense(Vec<u8>),
}

#[derive(Clone)]
pub struct Hll {
    repr: Repr,
    cached: Option<u64>,
}

impl Default for Hll {
    fn default() -> Self {
        Self::new()
    }
}

impl Hll {
    pub fn new() -> Self {
        // One XZERO run covering all 16384 registers.
        let run = (M - 1) as u16;
        Self {
            repr: Repr::Sparse(vec![0x40 | (run >> 8) as u8, run as u8]),
            cached: Some(0),
        }
    }

    /// Observe an element. Returns true when a register grew, i.e. the
    /// estimate may have changed.
    pub fn add(&mut self, elem: &[u8]) -> bool {
        let (index, rank) = index_and_rank(elem);
        let changed = match &mut self.repr {
            Repr::Dense(regs) => {
                if dense_get(regs, index) < rank {
                    dense_set(regs, index, rank);
                    true
                } else {
                    false
                }
            }
            Repr::Sparse(bytes) => {
                if rank > VAL_MAX_RANK {
                    self.promote();
                    return self.add(elem);
                }
                let mut runs = decode_runs(bytes);
                if !bump_run(&mut runs, index, rank) {
                    return false;
                }
                let encoded = encode_runs(&runs);
                if encoded.len() > SPARSE_MAX_BYTES {
                    self.repr = Repr::Dense(dense_from_runs(&runs));
                } else {
                    *bytes = encoded;
                }
                true
            }
        };
        if changed {
            self.cached = None;
        }
        changed
    }

    /// Estimated cardinality; cached until the next mutation.
    pub fn count(&mut self) -> u64 {
        if let Some(cached) = self.cached {
            return cached;
        }
        let (sum, zeros) = match &self.repr {
            Repr::Dense(regs) => {
                let mut sum = 0.0f64;
                let mut zeros = 0usize;
                for index in 0..M {
                    let rank = dense_get(regs, index);
                    sum += 1.0 / (1u64 << u32::from(rank)) as f64;
                    if rank == 0 {
                        zeros += 1;
                    }
                }
                (sum, zeros)
            }
            Repr::Sparse(bytes) => {
                let mut sum = 0.0f64;
                let mut zeros = 0usize;
                for (val, len) in decode_runs(bytes) {
                    sum += len as f64 / (1u64 << u32::from(val)) as f64;
                    if val == 0 {
                        zeros += len as usize;
                    }
                }
                (sum, zeros)
            }
        };

        let m = M as f64;
        let alpha = 0.7213 / (1.0 + 1.079 / m);
        let mut estimate = alpha * m * m / sum;
        if estimate <= 2.5 * m && zeros > 0 {
            // Linear counting is more accurate while registers are
            // mostly empty.
            estimate = m * (m / zeros as f64).ln();
        }
        let rounded = estimate.round() as u64;
        self.cached = Some(rounded);
        rounded
    }

    /// Fold another estimator into this one: register-wise maximum.
    /// The destination always ends up dense.
    pub fn merge(&mut self, other: &Hll) {
        self.promote();
        let Repr::Dense(regs) = &mut self.repr else {
            unreachable!()
        };
        match &other.repr {
            Repr::Dense(src) => {
                for index in 0..M {
                    let rank = dense_get(src, index);
                    if dense_get(regs, index) < rank {
                        dense_set(regs, index, rank);
                    }
                }
            }
            Repr::Sparse(bytes) => {
                let mut index = 0usize;
                for (val, len) in decode_runs(bytes) {
                    if val > 0 {
                        for i in index..index + len as usize {
                            if dense_get(regs, i) < val {
                                dense_set(regs, i, val);
                            }
                        }
                    }
                    index += len as usize;
                }
            }
        }
        self.cached = None;
    }

    fn promote(&mut self) {
        if let Repr::Sparse(bytes) = &self.repr {
            self.repr = Repr::Dense(dense_from_runs(&decode_runs(bytes)));
        }
    }

    #[cfg(test)]
    fn is_dense(&self) -> bool {
        matches!(self.repr, Repr::Dense(_))
    }
}

fn index_and_rank(elem: &[u8]) -> (usize, u8) {
    let hash = str_hash(elem);
    let index = (hash >> Q) as usize;
    let rest = hash << P;
    let rank = if rest == 0 {
        (Q + 1) as u8
    } else {
        (rest.leading_zeros() + 1) as u8
    };
    (index, rank)
}

fn dense_get(regs: &[u8], index: usize) -> u8 {
    let bit = index * 6;
    let byte = bit / 8;
    let shift = bit & 7;
    let lo = u16::from(regs[byte]);
    let hi = u16::from(regs.get(byte + 1).copied().unwrap_or(0));
    ((lo | hi << 8) >> shift) as u8 & 0x3f
}

fn dense_set(regs: &mut [u8], index: usize, rank: u8) {
    let bit = index * 6;
    let byte = bit / 8;
    let shift = bit & 7;
    let lo = u16::from(regs[byte]);
    let hi = u16::from(regs.get(byte + 1).copied().unwrap_or(0));
    let merged = (lo | hi << 8) & !(0x3f << shift) | u16::from(rank) << shift;
    regs[byte] = merged as u8;
    if byte + 1 < regs.len() {
        regs[byte + 1] = (merged >> 8) as u8;
    }
}

fn dense_from_runs(runs: &[(u8, u32)]) -> Vec<u8> {
    let mut regs = vec![0u8; DENSE_BYTES];
    let mut index = 0usize;
    for &(val, len) in runs {
        if val > 0 {
            for i in index..index + len as usize {
                dense_set(&mut regs, i, val);
            }
        }
        index += len as usize;
    }
    regs
}

/// Expand the sparse encoding into (register value, run length) pairs.
fn decode_runs(bytes: &[u8]) -> Vec<(u8, u32)> {
    let mut runs = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b & 0x80 != 0 {
            runs.push(((b >> 2 & 0x1f) + 1, u32::from(b & 0x03) + 1));
            i += 1;
        } else if b & 0x40 != 0 {
            let run = u32::from(b & 0x3f) << 8 | u32::from(bytes[i + 1]);
            runs.push((0, run + 1));
            i += 2;
        } else {
            runs.push((0, u32::from(b & 0x3f) + 1));
            i += 1;
        }
    }
    runs
}

fn encode_runs(runs: &[(u8, u32)]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut pending: Option<(u8, u32)> = None;
    for &run in runs.iter().chain(std::iter::once(&(0u8, 0u32))) {
        // Coalesce adjacent runs of the same value before emitting.
        match pending {
            Some((val, len)) if val == run.0 && run.1 > 0 => {
                pending = Some((val, len + run.1));
                continue;
            }
            Some((val, mut len)) => {
                while len > 0 {
                    if val == 0 {
                        if len <= 64 {
                            out.push((len - 1) as u8);
                            len = 0;
                        } else {
                            let chunk = len.min(M as u32);
                            let enc = (chunk - 1) as u16;
                            out.push(0x40 | (enc >> 8) as u8);
                            out.push(enc as u8);
                            len -= chunk;
                        }
                    } else {
                        let chunk = len.min(4);
                        out.push(0x80 | (val - 1) << 2 | (chunk - 1) as u8);
                        len -= chunk;
                    }
                }
                pending = (run.1 > 0).then_some(run);
            }
            None => pending = Some(run),
        }
    }
    out
}

/// Raise the register at `index` to `rank` within a run list, splitting
/// the containing run. Returns false when the register already holds an
/// equal or greater value.
fn bump_run(runs: &mut Vec<(u8, u32)>, index: usize, rank: u8) -> bool {
    let index = index as u32;
    let mut pos = 0u32;
    for i in 0..runs.len() {
        let (val, len) = runs[i];
        if index < pos + len {
            if val >= rank {
                return false;
            }
            let before = index - pos;
            let after = pos + len - index - 1;
            let mut repl = Vec::with_capacity(3);
            if before > 0 {
                repl.push((val, before));
            }
            repl.push((rank, 1));
            if after > 0 {
                repl.push((val, after));
            }
            runs.splice(i..=i, repl);
            return true;
        }
        pos += len;
    }
    unreachable!("register index {index} beyond register space");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn elem(i: u64) -> Vec<u8> {
        format!("element-{i}").into_bytes()
    }

    #[test]
    fn empty_counts_zero() {
        let mut hll = Hll::new();
        assert_eq!(hll.count(), 0);
        assert!(!hll.is_dense());
    }

    #[test]
    fn duplicate_adds_report_no_change() {
        let mut hll = Hll::new();
        assert!(hll.add(b"once"));
        assert!(!hll.add(b"once"));
        assert_eq!(hll.count(), 1);
    }

    #[test]
    fn small_counts_are_near_exact() {
        let mut hll = Hll::new();
        for i in 0..100 {
            hll.add(&elem(i));
        }
        let est = hll.count() as f64;
        assert!((est - 100.0).abs() <= 3.0, "estimate {est}");
    }

    #[test]
    fn estimate_within_error_bound() {
        // Standard error at 2^14 registers is ~0.81%; allow a generous
        // multiple of it.
        for n in [10_000u64, 100_000] {
            let mut hll = Hll::new();
            for i in 0..n {
                hll.add(&elem(i));
            }
            let est = hll.count() as f64;
            let err = (est - n as f64).abs() / n as f64;
            assert!(err < 0.05, "n={n} estimate={est} err={err}");
        }
    }

    #[test]
    fn estimate_within_error_bound_at_a_million() {
        let mut hll = Hll::new();
        for i in 0..1_000_000u64 {
            hll.add(&elem(i));
        }
        assert!(hll.is_dense());
        let est = hll.count() as f64;
        let err = (est - 1e6).abs() / 1e6;
        assert!(err < 0.05, "estimate={est} err={err}");
    }

    #[test]
    fn promotes_to_dense_under_volume() {
        let mut hll = Hll::new();
        let mut i = 0u64;
        while !hll.is_dense() {
            hll.add(&elem(i));
            i += 1;
            assert!(i < 100_000, "never promoted");
        }
        // The estimate survives the representation change.
        let est = hll.count() as f64;
        let err = (est - i as f64).abs() / i as f64;
        assert!(err < 0.05, "post-promotion estimate={est} for n={i}");
    }

    #[test]
    fn sparse_and_dense_agree() {
        let mut sparse = Hll::new();
        let mut dense = Hll::new();
        dense.promote();
        for i in 0..500 {
            sparse.add(&elem(i));
            dense.add(&elem(i));
        }
        assert!(!sparse.is_dense());
        assert!(dense.is_dense());
        assert_eq!(sparse.count(), dense.count());
    }

    #[test]
    fn merge_is_a_union() {
        let mut a = Hll::new();
        let mut b = Hll::new();
        for i in 0..3000 {
            a.add(&elem(i));
        }
        for i in 1500..4500 {
            b.add(&elem(i));
        }
        let (ca, cb) = (a.count(), b.count());
        a.merge(&b);
        let merged = a.count();
        assert!(merged >= ca.max(cb));
        let err = (merged as f64 - 4500.0).abs() / 4500.0;
        assert!(err < 0.05, "merged={merged}");

        // Merging an empty set changes nothing.
        let before = a.count();
        a.merge(&Hll::new());
        assert_eq!(a.count(), before);
    }

    #[test]
    fn sparse_encoding_round_trips() {
        let runs = vec![(0u8, 100u32), (5, 1), (0, 3), (17, 6), (0, 16274)];
        let encoded = encode_runs(&runs);
        let total: u32 = decode_runs(&encoded).iter().map(|&(_, len)| len).sum();
        assert_eq!(total, M as u32);
        // Values land on the right registers.
        let dense = dense_from_runs(&decode_runs(&encoded));
        assert_eq!(dense_get(&dense, 99), 0);
        assert_eq!(dense_get(&dense, 100), 5);
        assert_eq!(dense_get(&dense, 104), 17);
        assert_eq!(dense_get(&dense, 109), 17);
        assert_eq!(dense_get(&dense, 110), 0);
    }

    #[test]
    fn dense_registers_pack_and_unpack() {
        let mut regs = vec![0u8; DENSE_BYTES];
        for (index, rank) in [(0usize, 63u8), (1, 1), (16383, 50), (8191, 33)] {
            dense_set(&mut regs, index, rank);
        }
        assert_eq!(dense_get(&regs, 0), 63);
        assert_eq!(dense_get(&regs, 1), 1);
        assert_eq!(dense_get(&regs, 2), 0);
        assert_eq!(dense_get(&regs, 16383), 50);
        assert_eq!(dense_get(&regs, 8191), 33);
        // Overwrites clear the old value.
        dense_set(&mut regs, 0, 2);
        assert_eq!(dense_get(&regs, 0), 2);
        assert_eq!(dense_get(&regs, 1), 1);
    }
}
