//! Property-based tests for cyclechase's arithmetic, permutation and
//! encoding layers.
//!
//! These tests use the `proptest` framework to check invariants over many
//! randomly generated inputs. The chain is only useful if it is one single
//! cycle through every slot, so most properties come back to that: the
//! permutation is a single cycle, and following the encoded jumps in
//! software returns to the entry after exactly P hops.
//!
//! # How to run
//!
//! ```bash
//! # Run all property tests:
//! cargo test --test property_tests
//!
//! # Increase case count for thorough testing (default is 256):
//! PROPTEST_CASES=10000 cargo test --test property_tests
//! ```
//!
//! Each property is named `prop_<function>_<invariant>`.

use cyclechase::chain::{self, AddressWidth, ChainLayout};
use cyclechase::modular::{distinct_prime_factors, is_prime, largest_prime_below, pow_mod};
use cyclechase::permutation::{CycleBuilder, ShuffleBuilder, SteppingBuilder};
use cyclechase::roots::{partition, primitive_roots_with_workers};
use proptest::prelude::*;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

fn naive_is_prime(n: u64) -> bool {
    n >= 2 && (2..n).take_while(|d| d * d <= n).all(|d| n % d != 0)
}

/// Multiplicative order of g mod p by repeated multiplication.
fn naive_order(g: u64, p: u64) -> u64 {
    let mut x = g % p;
    let mut k = 1;
    while x != 1 {
        x = x * g % p;
        k += 1;
    }
    k
}

fn euler_phi(n: u64) -> u64 {
    distinct_prime_factors(n)
        .iter()
        .fold(n, |acc, &q| acc / q * (q - 1))
}

/// Strategy producing primes in `range`.
fn prime_in(range: std::ops::Range<u64>) -> impl Strategy<Value = u64> {
    range.prop_filter("prime", |&n| is_prime(n))
}

// == Modular Arithmetic ========================================================

proptest! {
    /// is_prime agrees with plain trial division.
    #[test]
    fn prop_is_prime_matches_trial_division(n in 0u64..20_000) {
        prop_assert_eq!(is_prime(n), naive_is_prime(n));
    }

    /// pow_mod(b, e, m) equals e repeated multiplications mod m.
    #[test]
    fn prop_pow_mod_matches_repeated_multiplication(
        base in 0u64..1_000_000,
        exp in 0u64..64,
        modulus in 2u64..1_000_000,
    ) {
        let mut expected = 1 % modulus;
        for _ in 0..exp {
            expected = (expected as u128 * base as u128 % modulus as u128) as u64;
        }
        prop_assert_eq!(pow_mod(base, exp, modulus), expected);
    }

    /// pow_mod never overflows near u64::MAX.
    #[test]
    fn prop_pow_mod_large_modulus_fermat(base in 2u64..1_000_000) {
        // 2^61 - 1 is prime
        let p = (1u64 << 61) - 1;
        prop_assert_eq!(pow_mod(base, p - 1, p), 1);
    }

    /// The selected prime is below the bound with no prime in between.
    #[test]
    fn prop_largest_prime_below_is_tight(bound in 3u64..100_000) {
        let p = largest_prime_below(bound).unwrap();
        prop_assert!(p < bound);
        prop_assert!(naive_is_prime(p));
        prop_assert!((p + 1..bound).all(|n| !naive_is_prime(n)));
    }

    /// Distinct factors multiply back into n with nothing left over that is
    /// not a repeat of a listed factor.
    #[test]
    fn prop_distinct_factors_are_prime_divisors(n in 2u64..1_000_000) {
        let factors = distinct_prime_factors(n);
        let mut rest = n;
        for &q in &factors {
            prop_assert!(naive_is_prime(q));
            prop_assert_eq!(n % q, 0);
            while rest % q == 0 {
                rest /= q;
            }
        }
        prop_assert_eq!(rest, 1);
        prop_assert!(factors.windows(2).all(|w| w[0] < w[1]));
    }
}

// == Primitive Roots ===========================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Every reported root has full order, and there are exactly φ(p − 1).
    #[test]
    fn prop_primitive_roots_have_full_order(p in prime_in(3..2_000)) {
        let roots = primitive_roots_with_workers(p, 3).unwrap();
        prop_assert_eq!(roots.len() as u64, euler_phi(p - 1));
        for &g in &roots {
            prop_assert_eq!(naive_order(g, p), p - 1);
        }
        prop_assert!(roots.windows(2).all(|w| w[0] < w[1]));
    }

    /// The root set does not depend on how the search is split.
    #[test]
    fn prop_primitive_roots_independent_of_workers(
        p in prime_in(3..20_000),
        workers in 1usize..32,
    ) {
        let one = primitive_roots_with_workers(p, 1).unwrap();
        let many = primitive_roots_with_workers(p, workers).unwrap();
        prop_assert_eq!(one, many);
    }

    /// Partition covers the range exactly once, in order.
    #[test]
    fn prop_partition_covers_range(start in 0u64..1000, len in 0u64..5000, workers in 1usize..64) {
        let chunks = partition(start..start + len, workers);
        prop_assert!(chunks.len() <= workers);
        let flat: Vec<u64> = chunks.into_iter().flatten().collect();
        let expected: Vec<u64> = (start..start + len).collect();
        prop_assert_eq!(flat, expected);
    }
}

// == Permutations ==============================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Stepping by any non-zero shift mod a prime is one cycle of length P.
    #[test]
    fn prop_stepping_is_single_cycle(p in prime_in(3..5_000), shift_seed in any::<u64>()) {
        let shift = 1 + shift_seed % (p - 1);
        let perm = SteppingBuilder { shift }.build(p).unwrap();
        prop_assert_eq!(perm.len() as u64, p);
        prop_assert_eq!(perm.cycle_length(), p);
        prop_assert!(perm.verify_single_cycle().is_ok());
        // next(x) = x + shift mod p
        for x in 0..p as u32 {
            prop_assert_eq!(perm.next(x) as u64, (x as u64 + shift) % p);
        }
    }

    /// Sattolo shuffling yields a single cycle for every seed and size.
    #[test]
    fn prop_shuffle_is_single_cycle(size in 1u64..5_000, seed in any::<u64>()) {
        let mut builder = ShuffleBuilder::new(ChaCha8Rng::seed_from_u64(seed));
        let perm = builder.build(size).unwrap();
        prop_assert_eq!(perm.cycle_length(), size);
        prop_assert!(perm.verify_single_cycle().is_ok());
    }
}

// == Encoder ===================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Following the encoded jumps from slot 0 returns there after exactly
    /// P hops, whatever the base address and offset.
    #[test]
    fn prop_encoded_chain_laps_once(
        p in prime_in(3..3_000),
        seed in any::<u64>(),
        base_page in 1u64..0x1000,
        offset_words in 0u64..64,
    ) {
        let mut builder = ShuffleBuilder::new(ChaCha8Rng::seed_from_u64(seed));
        let perm = builder.build(p).unwrap();
        let span = 2 * 8 * 3_000;
        let offset = offset_words * 8;
        let layout = ChainLayout::split(base_page << 12, offset, span, AddressWidth::Signed32);
        let mut region = vec![0u8; (offset + span) as usize];
        let summary = chain::encode(&perm, &mut region, &layout).unwrap();
        prop_assert_eq!(summary.entries, p);
        prop_assert_eq!(chain::lap_length(&region, &layout, p).unwrap(), Some(p));
        prop_assert!(chain::verify(&perm, &region, &layout).is_ok());
    }
}
