//! # Permutation — Single-Cycle Successor Tables
//!
//! A `Permutation` is a successor table `next[i]` over {0, …, n−1} that forms
//! exactly one cycle of length n: walking `next` from 0 visits every index once
//! before coming back to 0. Two independent builders produce one:
//!
//! - **Stepping** (`SteppingBuilder`): additive stepping mod a prime,
//!   next(x) = (x + shift) mod P. Any 0 < shift < P is coprime to P, so the
//!   orbit of 0 has length P.
//! - **Shuffle** (`ShuffleBuilder`): Sattolo-style construction. Starting at
//!   0, repeatedly pull a uniformly random element out of the pool of unvisited
//!   indices (swap-remove) and chain to it; finally link the last one back to 0.
//!   Every n-cycle is equally likely and there are no fixed points for n > 1.
//!
//! The two strategies share only the single-cycle guarantee; they do not
//! produce equivalent orderings.

use rand::Rng;
use std::fmt;

/// Errors from building or checking a permutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermutationError {
    /// Stepping requires 0 < shift < modulus.
    InvalidShift { shift: u64, modulus: u64 },
    /// Sizes are bounded by the 32-bit index space.
    SizeTooLarge { size: u64 },
    /// Empty permutations have no cycle.
    Empty,
    /// An entry points outside [0, n).
    OutOfRange { index: u32, next: u32 },
    /// Walking from 0 returned after `length` steps instead of `expected`.
    CycleLength { length: u64, expected: u64 },
}

impl fmt::Display for PermutationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PermutationError::InvalidShift { shift, modulus } => {
                write!(f, "shift {} is not in (0, {})", shift, modulus)
            }
            PermutationError::SizeTooLarge { size } => {
                write!(f, "permutation size {} exceeds the 32-bit index space", size)
            }
            PermutationError::Empty => write!(f, "permutation is empty"),
            PermutationError::OutOfRange { index, next } => {
                write!(f, "next({}) = {} is out of range", index, next)
            }
            PermutationError::CycleLength { length, expected } => write!(
                f,
                "cycle through 0 has length {}, expected {}",
                length, expected
            ),
        }
    }
}

impl std::error::Error for PermutationError {}

/// Successor table forming one full cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permutation {
    next: Vec<u32>,
}

impl Permutation {
    /// Wrap a successor table after checking it is a single full cycle.
    pub fn from_successors(next: Vec<u32>) -> Result<Self, PermutationError> {
        let perm = Permutation { next };
        perm.verify_single_cycle()?;
        Ok(perm)
    }

    /// Number of indices.
    pub fn len(&self) -> usize {
        self.next.len()
    }

    pub fn is_empty(&self) -> bool {
        self.next.is_empty()
    }

    /// Successor of `index`.
    #[inline]
    pub fn next(&self, index: u32) -> u32 {
        self.next[index as usize]
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.next
    }

    /// Steps taken walking from 0 until 0 is reached again.
    ///
    /// Gives up after `len()` steps, so a table whose cycle through 0 is
    /// shorter than some other cycle still terminates; the result is then
    /// `len() + 1`, which never equals a valid length.
    pub fn cycle_length(&self) -> u64 {
        let n = self.next.len() as u64;
        let mut cur = 0u32;
        let mut length = 0u64;
        loop {
            cur = self.next[cur as usize];
            length += 1;
            if cur == 0 || length > n {
                return length;
            }
        }
    }

    /// Check that every entry is in range and that the cycle through 0 has
    /// length `len()` (which makes it the only cycle).
    pub fn verify_single_cycle(&self) -> Result<(), PermutationError> {
        let n = self.next.len();
        if n == 0 {
            return Err(PermutationError::Empty);
        }
        if let Some((index, &next)) = self
            .next
            .iter()
            .enumerate()
            .find(|&(_, &next)| next as usize >= n)
        {
            return Err(PermutationError::OutOfRange {
                index: index as u32,
                next,
            });
        }
        let length = self.cycle_length();
        if length != n as u64 {
            return Err(PermutationError::CycleLength {
                length,
                expected: n as u64,
            });
        }
        Ok(())
    }

    /// Indices in visiting order, starting at 0.
    pub fn walk(&self) -> impl Iterator<Item = u32> + '_ {
        let mut cur = 0u32;
        (0..self.next.len()).map(move |_| {
            let here = cur;
            cur = self.next[cur as usize];
            here
        })
    }
}

/// A strategy producing a single full cycle over {0, …, size−1}.
pub trait CycleBuilder {
    /// Short strategy name for diagnostics.
    fn name(&self) -> &'static str;

    /// Build and verify a permutation of `size` indices.
    fn build(&mut self, size: u64) -> Result<Permutation, PermutationError>;
}

fn check_size(size: u64) -> Result<(), PermutationError> {
    if size == 0 {
        return Err(PermutationError::Empty);
    }
    if size > u32::MAX as u64 + 1 {
        return Err(PermutationError::SizeTooLarge { size });
    }
    Ok(())
}

/// Additive stepping mod a prime modulus.
#[derive(Debug, Clone, Copy)]
pub struct SteppingBuilder {
    pub shift: u64,
}

/// Residues visited by x ← (x + shift) mod `modulus`, starting at `shift`
/// and ending at 0 (after `modulus` values).
pub fn stepping_sequence(modulus: u64, shift: u64) -> Result<Vec<u32>, PermutationError> {
    check_size(modulus)?;
    if shift == 0 || shift >= modulus {
        return Err(PermutationError::InvalidShift { shift, modulus });
    }
    let mut seq = Vec::with_capacity(modulus as usize);
    let mut cur = shift;
    loop {
        seq.push(cur as u32);
        cur = (cur + shift) % modulus;
        if cur == shift {
            break;
        }
    }
    Ok(seq)
}

impl CycleBuilder for SteppingBuilder {
    fn name(&self) -> &'static str {
        "stepping"
    }

    fn build(&mut self, size: u64) -> Result<Permutation, PermutationError> {
        let seq = stepping_sequence(size, self.shift)?;
        let mut next = vec![0u32; seq.len()];
        for (k, &x) in seq.iter().enumerate() {
            next[x as usize] = seq[(k + 1) % seq.len()];
        }
        Permutation::from_successors(next)
    }
}

/// Uniformly random single cycle.
pub struct ShuffleBuilder<R: Rng> {
    rng: R,
}

impl<R: Rng> ShuffleBuilder<R> {
    pub fn new(rng: R) -> Self {
        ShuffleBuilder { rng }
    }
}

impl<R: Rng> CycleBuilder for ShuffleBuilder<R> {
    fn name(&self) -> &'static str {
        "shuffle"
    }

    fn build(&mut self, size: u64) -> Result<Permutation, PermutationError> {
        check_size(size)?;
        let n = size as usize;
        let mut next = vec![0u32; n];
        let mut pool: Vec<u32> = (1..size).map(|i| i as u32).collect();
        let mut cur = 0u32;
        while !pool.is_empty() {
            let pick = self.rng.gen_range(0..pool.len());
            let chosen = pool.swap_remove(pick);
            next[cur as usize] = chosen;
            cur = chosen;
        }
        next[cur as usize] = 0;
        Permutation::from_successors(next)
    }
}

#[cfg(test)]
mod tests {
    //! Tests for both cycle builders and the single-cycle checker.
    //!
    //! Every builder output must pass `verify_single_cycle`; the checker itself
    //! is tested against hand-built tables with two cycles, a fixed point and
    //! an out-of-range entry so that a passing builder test means something.

    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::collections::HashSet;

    fn assert_full_cycle(perm: &Permutation) {
        let visited: Vec<u32> = perm.walk().collect();
        let unique: HashSet<u32> = visited.iter().copied().collect();
        assert_eq!(unique.len(), perm.len());
        assert_eq!(perm.cycle_length(), perm.len() as u64);
    }

    // ── Stepping ───────────────────────────────────────────────────────

    /// P = 7 (largest prime below 10), shift 3: 3, 6, 2, 5, 1, 4 cover the
    /// nonzero residues, then 0 closes the cycle.
    #[test]
    fn stepping_sequence_p7_shift3() {
        let seq = stepping_sequence(7, 3).unwrap();
        assert_eq!(&seq[..6], &[3, 6, 2, 5, 1, 4]);
        assert_eq!(seq[6], 0);
        assert_eq!(seq.len(), 7);
    }

    #[test]
    fn stepping_builds_full_cycle() {
        let perm = SteppingBuilder { shift: 3 }.build(7).unwrap();
        assert_eq!(perm.as_slice(), &[3, 4, 5, 6, 0, 1, 2]);
        assert_full_cycle(&perm);
    }

    #[test]
    fn stepping_every_shift_of_small_prime() {
        for shift in 1..101 {
            let perm = SteppingBuilder { shift }.build(101).unwrap();
            assert_full_cycle(&perm);
            assert_eq!(perm.next(0), shift as u32);
        }
    }

    #[test]
    fn stepping_rejects_bad_shift() {
        assert_eq!(
            SteppingBuilder { shift: 0 }.build(7),
            Err(PermutationError::InvalidShift { shift: 0, modulus: 7 })
        );
        assert_eq!(
            SteppingBuilder { shift: 7 }.build(7),
            Err(PermutationError::InvalidShift { shift: 7, modulus: 7 })
        );
    }

    // ── Shuffle ────────────────────────────────────────────────────────

    #[test]
    fn shuffle_builds_full_cycle() {
        let mut builder = ShuffleBuilder::new(ChaCha8Rng::seed_from_u64(7));
        for size in [1u64, 2, 3, 10, 997, 10_000] {
            let perm = builder.build(size).unwrap();
            assert_eq!(perm.len() as u64, size);
            assert_full_cycle(&perm);
        }
    }

    #[test]
    fn shuffle_has_no_fixed_points() {
        let mut builder = ShuffleBuilder::new(ChaCha8Rng::seed_from_u64(42));
        let perm = builder.build(5000).unwrap();
        assert!(perm.as_slice().iter().enumerate().all(|(i, &n)| i as u32 != n));
    }

    #[test]
    fn shuffle_is_reproducible_from_seed() {
        let a = ShuffleBuilder::new(ChaCha8Rng::seed_from_u64(9)).build(500).unwrap();
        let b = ShuffleBuilder::new(ChaCha8Rng::seed_from_u64(9)).build(500).unwrap();
        let c = ShuffleBuilder::new(ChaCha8Rng::seed_from_u64(10)).build(500).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    /// All (n−1)! = 6 four-cycles should appear over enough draws.
    #[test]
    fn shuffle_reaches_every_cycle_of_four() {
        let mut builder = ShuffleBuilder::new(ChaCha8Rng::seed_from_u64(1));
        let seen: HashSet<Vec<u32>> = (0..500)
            .map(|_| builder.build(4).unwrap().as_slice().to_vec())
            .collect();
        assert_eq!(seen.len(), 6);
    }

    #[test]
    fn shuffle_rejects_empty() {
        let mut builder = ShuffleBuilder::new(ChaCha8Rng::seed_from_u64(0));
        assert_eq!(builder.build(0), Err(PermutationError::Empty));
    }

    // ── Single-Cycle Checker ───────────────────────────────────────────

    #[test]
    fn checker_rejects_two_cycles() {
        assert_eq!(
            Permutation::from_successors(vec![1, 0, 3, 2]),
            Err(PermutationError::CycleLength {
                length: 2,
                expected: 4
            })
        );
    }

    #[test]
    fn checker_rejects_fixed_point_off_the_cycle() {
        // 0 -> 1 -> 2 -> 0 with 3 fixed
        assert!(Permutation::from_successors(vec![1, 2, 0, 3]).is_err());
    }

    /// 0 -> 1 -> 2 -> 1 never returns to 0; the walk must still stop.
    #[test]
    fn checker_terminates_on_rho_shape() {
        assert_eq!(
            Permutation::from_successors(vec![1, 2, 1]),
            Err(PermutationError::CycleLength {
                length: 4,
                expected: 3
            })
        );
    }

    #[test]
    fn checker_rejects_out_of_range() {
        assert_eq!(
            Permutation::from_successors(vec![1, 5]),
            Err(PermutationError::OutOfRange { index: 1, next: 5 })
        );
    }

    #[test]
    fn walk_starts_at_zero() {
        let perm = SteppingBuilder { shift: 3 }.build(7).unwrap();
        let order: Vec<u32> = perm.walk().collect();
        assert_eq!(order, vec![0, 3, 6, 2, 5, 1, 4]);
    }
}
