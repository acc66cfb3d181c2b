//! Deterministic variant assignment.
//!
//! An identity is bucketed by hashing `identity_hash ++ test_name` with
//! SHA-256, reading the digest as a big-endian integer `H`, and mapping it to
//! `(H mod N) + 1` where `N` is the total weight. The variant whose range in
//! the name-ordered cumulative weight partition contains that value wins.
//!
//! Nothing is stored: the same identity, test name and variant map produce
//! the same variant in any process at any time.

use crate::errors::AssignError;
use crate::experiment::{Experiment, TestName, Variants};
use crate::record::AssignmentRecord;
use sha2::{Digest, Sha256};

/// Validates the inputs and assigns `identity_hash` to one of `variants`.
///
/// Fails with `InvalidArgument` for a malformed test name and with
/// `InvalidConfiguration` for an empty, zero-weight or overflowing map.
pub fn assign<I, K>(
    identity_hash: &str,
    test_name: &str,
    variants: I,
) -> Result<AssignmentRecord, AssignError>
where
    I: IntoIterator<Item = (K, u64)>,
    K: Into<String>,
{
    let name = TestName::new(test_name)?;
    let variants = Variants::from_pairs(variants)?;

    Ok(Experiment::new(name, variants).assign(identity_hash))
}

/// Bucket value of an identity within a test, in `[1, total]`.
///
/// `total` must be non-zero.
pub fn mapped_value(identity_hash: &str, test_name: &str, total: u64) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(identity_hash.as_bytes());
    hasher.update(test_name.as_bytes());
    let digest = hasher.finalize();

    digest_mod(&digest, total) + 1
}

/// Exact remainder of a big-endian unsigned integer divided by `modulus`.
fn digest_mod(digest: &[u8], modulus: u64) -> u64 {
    let modulus = u128::from(modulus);
    let remainder = digest
        .iter()
        .fold(0u128, |acc, &byte| ((acc << 8) | u128::from(byte)) % modulus);
    // remainder < modulus <= u64::MAX
    remainder as u64
}
