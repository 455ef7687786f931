//! The variable-difficulty feedback controller.
//!
//! Each worker walks a ladder of observation windows. Short windows react
//! fast with loose tolerances; surviving a window promotes the worker to the
//! next, tighter one, and the final stage adjusts freely on any breach.
//! Chosen difficulties only take effect once a `set_difficulty` has gone out
//! with the next job, so a change disarms the tracker until the coordinator
//! re-arms it.

use crate::constants::{ASIC_DIFF_TIERS, VARDIFF_REJECTION_RATE, VARDIFF_TOLERANCES, VARDIFF_WINDOWS};
use crate::worker_stats::{check_active, hashrate_ghs, WorkerStats};
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct VardiffParams {
    pub expected_shares_per_min: f64,
    pub min_diff: f64,
    pub max_diff: f64,
    pub clamp_pow2: bool,
}

/// One controller pass over a single worker.
pub fn adjust_worker(stats: &mut WorkerStats, params: &VardiffParams, now_ms: u64) {
    if !stats.var_diff_enabled || check_active(stats, now_ms) == 0 {
        return;
    }
    let Some(start_ms) = stats.var_diff_start_time_ms else {
        debug!("vardiff {}.{}: no diff sent yet, waiting", stats.address, stats.worker_name);
        return;
    };
    if stats.min_diff <= 0.0 {
        return;
    }

    let elapsed_min = now_ms.saturating_sub(start_ms) as f64 / 60_000.0;
    if elapsed_min <= 0.0 {
        return;
    }

    let shares = stats.var_diff_shares_found as f64;
    let rate = shares / elapsed_min;
    let ratio = rate / params.expected_shares_per_min;

    let stage = stats.var_diff_window % VARDIFF_WINDOWS.len();
    let window = VARDIFF_WINDOWS[stage];
    let tolerance = VARDIFF_TOLERANCES[stage];

    // Final stage: no window to complete, adjust on any breach.
    if window == 0.0 {
        if (1.0 - ratio).abs() >= tolerance {
            update_var_diff(stats, stats.min_diff * ratio, params, now_ms);
        }
        return;
    }

    // A rate that would have breached an already-cleared window's tolerance
    // regresses the worker immediately; the remaining checks are skipped.
    for cleared in 1..=stage {
        if (1.0 - ratio).abs() >= VARDIFF_TOLERANCES[cleared] {
            update_var_diff(stats, stats.min_diff * ratio, params, now_ms);
            return;
        }
    }

    // Breaching the upper bound inside the current window.
    if shares >= window * params.expected_shares_per_min * (1.0 + tolerance) {
        update_var_diff(stats, stats.min_diff * ratio, params, now_ms);
        return;
    }

    // Window complete: too slow adjusts down (floored), on-pace promotes.
    if elapsed_min >= window {
        if shares <= window * params.expected_shares_per_min * (1.0 - tolerance) {
            update_var_diff(stats, stats.min_diff * ratio.max(0.1), params, now_ms);
        } else {
            stats.var_diff_window += 1;
        }
    }
}

/// Apply a candidate difficulty: optional power-of-two clamp, range clamp,
/// and the rejection-rate override. On an effective change the tracker is
/// disarmed until the new difficulty reaches the client.
pub fn update_var_diff(stats: &mut WorkerStats, candidate: f64, params: &VardiffParams, now_ms: u64) -> bool {
    if !candidate.is_finite() || candidate <= 0.0 {
        return false;
    }

    let mut new_diff = candidate;
    if params.clamp_pow2 {
        new_diff = pow2_floor(new_diff);
    }
    new_diff = new_diff.clamp(params.min_diff, params.max_diff);

    if stats.shares_found > 0 {
        let rejection_rate = stats.invalid_shares as f64 / stats.shares_found as f64;
        if rejection_rate >= VARDIFF_REJECTION_RATE {
            let pinned = asic_tier_diff(hashrate_ghs(stats, now_ms));
            debug!(
                "vardiff {}.{}: rejection rate {:.1}% >= {:.0}%, pinning diff {} from ASIC tier table",
                stats.address,
                stats.worker_name,
                rejection_rate * 100.0,
                VARDIFF_REJECTION_RATE * 100.0,
                pinned
            );
            new_diff = pinned.clamp(params.min_diff, params.max_diff);
        }
    }

    if new_diff == stats.min_diff {
        return false;
    }

    debug!("vardiff {}.{}: diff {} -> {}", stats.address, stats.worker_name, stats.min_diff, new_diff);
    stats.var_diff_start_time_ms = None;
    stats.var_diff_window = 0;
    stats.min_diff = new_diff;
    true
}

/// Re-arm the tracker after the difficulty was announced to the client.
pub fn rearm(stats: &mut WorkerStats, now_ms: u64) {
    stats.var_diff_start_time_ms = Some(now_ms);
    stats.var_diff_shares_found = 0;
    stats.var_diff_window = 0;
}

/// Largest power of two at or below the value.
pub fn pow2_floor(value: f64) -> f64 {
    2f64.powi(value.log2().floor() as i32)
}

/// Power of two nearest to the value (used for client-requested static
/// difficulties).
pub fn pow2_nearest(value: f64) -> f64 {
    2f64.powi(value.log2().round() as i32)
}

/// Difficulty pinned by estimated hashrate once the feedback loop is
/// distrusted. Closed tiers, first match wins; anything above the table keeps
/// the top tier.
pub fn asic_tier_diff(hashrate_ghs: f64) -> f64 {
    for &(bound, diff) in ASIC_DIFF_TIERS {
        if hashrate_ghs <= bound {
            return diff;
        }
    }
    ASIC_DIFF_TIERS.last().map(|&(_, diff)| diff).unwrap_or(64.0)
}
