//! Proof-of-work and block-submission capabilities.
//!
//! The consensus primitives live in the kaspa crates; this module wraps them
//! behind narrow traits so share validation can be exercised against a
//! deterministic double, and keeps the pool-side difficulty/target arithmetic
//! in one place.

use crate::errors::SubmitError;
use kaspa_consensus_core::hashing::header as header_hashing;
use kaspa_consensus_core::header::Header;
use kaspa_hashes::Hash;
use num_bigint::BigUint;
use num_traits::Num;
use std::sync::Arc;

/// Maximum pool target, `2^224 - 1`.
const MAX_TARGET: &str = "FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF";

/// Hashes represented by one unit of difficulty: `2^256 / 2^224 = 2^32`.
const MIN_HASH: f64 = 4_294_967_296.0;

const BIG_GIG: f64 = 1_000_000_000.0;

/// One template's worth of PoW state: validates nonces against the network
/// target.
pub trait PowWork: Send + Sync {
    /// Returns whether the nonce satisfies the network target, and the full
    /// PoW value for pool-difficulty comparison.
    fn check_work(&self, nonce: u64) -> (bool, BigUint);
}

/// Constructs [`PowWork`] handles from block headers.
pub trait PowBackend: Send + Sync {
    fn new_work(&self, header: &Header) -> Arc<dyn PowWork>;
}

/// The real thing, backed by `kaspa_pow`.
pub struct NativePowBackend;

struct NativeWork {
    state: kaspa_pow::State,
}

impl PowWork for NativeWork {
    fn check_work(&self, nonce: u64) -> (bool, BigUint) {
        let (passed, pow_value) = self.state.check_pow(nonce);
        (passed, BigUint::from_bytes_be(&pow_value.to_be_bytes()))
    }
}

impl PowBackend for NativePowBackend {
    fn new_work(&self, header: &Header) -> Arc<dyn PowWork> {
        Arc::new(NativeWork { state: kaspa_pow::State::new(header) })
    }
}

/// Header hash with nonce and timestamp zeroed; this is the job identity the
/// miners grind on.
pub fn pre_pow_hash(header: &Header) -> Hash {
    header_hashing::hash_override_nonce_time(header, 0, 0)
}

/// Finalized header hash (the block hash).
pub fn header_hash(header: &Header) -> Hash {
    header_hashing::hash(header)
}

/// Convert a stratum difficulty to the pool target a share's PoW value is
/// compared against: `target = (2^224 - 1) / diff`, truncating.
pub fn calculate_target(diff: f64) -> BigUint {
    let max_target = BigUint::from_str_radix(MAX_TARGET, 16).unwrap();
    if diff <= 0.0 || !diff.is_finite() {
        return max_target;
    }

    // Scale to 18 decimal places before the integer division so fractional
    // difficulties keep their precision.
    let diff_scaled = (diff * 1e18) as u128;
    if diff_scaled == 0 {
        return max_target;
    }
    (max_target * BigUint::from(1_000_000_000_000_000_000u128)) / BigUint::from(diff_scaled)
}

/// Difficulty to GH: `diff * 2^32 / 1e9`.
pub fn diff_to_gh(diff: f64) -> f64 {
    diff * MIN_HASH / BIG_GIG
}

/// Upstream verdict for a submitted block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    Rejected(String),
}

/// Block-submission capability. The pool never talks to the node directly;
/// the finalized header is handed to whoever owns that connection.
#[async_trait::async_trait]
pub trait BlockSubmitter: Send + Sync {
    async fn submit_block(&self, header: Header) -> Result<SubmitOutcome, SubmitError>;
}
