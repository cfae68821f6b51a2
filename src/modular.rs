//! # Modular — Prime Selection and Modular Arithmetic
//!
//! Small-integer number theory used to size the permutation and to test
//! primitive roots:
//!
//! 1. **Prime selection** (`largest_prime_below`): the modulus P is the largest
//!    prime strictly below the requested size.
//! 2. **Modular exponentiation** (`pow_mod`) using u128 intermediates.
//! 3. **Distinct prime factors** (`distinct_prime_factors`) of the group order
//!    P − 1, computed once per search and shared read-only by every worker.
//!
//! ## Algorithm: 6k ± 1 Trial Division
//!
//! Every prime above 3 is of the form 6k ± 1, so after ruling out 2 and 3 only
//! those divisors up to √n are tried. Selection walks down from N − 1 until a
//! prime is hit; prime gaps below 2^32 are tiny, so this runs once at startup
//! in well under a millisecond.

use std::fmt;

/// Errors from prime selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrimeError {
    /// No prime exists strictly below the bound (bound <= 2).
    NoPrimeBelow { bound: u64 },
}

impl fmt::Display for PrimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimeError::NoPrimeBelow { bound } => {
                write!(f, "no prime exists strictly below {}", bound)
            }
        }
    }
}

impl std::error::Error for PrimeError {}

/// Deterministic primality test by 6k ± 1 trial division.
pub fn is_prime(n: u64) -> bool {
    if n <= 1 {
        return false;
    }
    if n <= 3 {
        return true;
    }
    if n.is_multiple_of(2) || n.is_multiple_of(3) {
        return false;
    }
    let mut i = 5u64;
    while i * i <= n {
        if n.is_multiple_of(i) || n.is_multiple_of(i + 2) {
            return false;
        }
        i += 6;
    }
    true
}

/// Largest prime p with p < `bound`.
pub fn largest_prime_below(bound: u64) -> Result<u64, PrimeError> {
    (2..bound)
        .rev()
        .find(|&n| is_prime(n))
        .ok_or(PrimeError::NoPrimeBelow { bound })
}

/// Modular exponentiation: base^exp mod modulus.
/// Uses u128 intermediates to avoid overflow for moduli up to ~2^63.
pub fn pow_mod(mut base: u64, mut exp: u64, modulus: u64) -> u64 {
    if modulus == 1 {
        return 0;
    }
    let mut result: u64 = 1;
    base %= modulus;
    while exp > 0 {
        if exp & 1 == 1 {
            result = (result as u128 * base as u128 % modulus as u128) as u64;
        }
        exp >>= 1;
        base = (base as u128 * base as u128 % modulus as u128) as u64;
    }
    result
}

/// Distinct prime factors of `n` in ascending order.
///
/// Trial division up to √n; whatever cofactor is left above 1 after dividing
/// out every small factor is itself prime and is kept as the largest factor.
pub fn distinct_prime_factors(mut n: u64) -> Vec<u64> {
    let mut factors = Vec::new();
    let mut d = 2u64;
    while d * d <= n {
        if n.is_multiple_of(d) {
            factors.push(d);
            while n.is_multiple_of(d) {
                n /= d;
            }
        }
        d += if d == 2 { 1 } else { 2 };
    }
    if n > 1 {
        factors.push(n);
    }
    factors
}
