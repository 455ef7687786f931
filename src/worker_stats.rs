//! Per-worker accounting: share counters, the recent-share ring used by the
//! hashrate estimator and duplicate detection, and the vardiff tracker state.

use crate::constants::{ACTIVE_WINDOW_MS, RECENT_SHARE_WINDOW_MS};
use crate::pow::diff_to_gh;
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn unix_now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[derive(Debug, Clone)]
pub struct RecentShare {
    pub timestamp_ms: u64,
    pub difficulty: f64,
    pub nonce: u64,
}

#[derive(Debug, Clone)]
pub struct WorkerStats {
    pub address: String,
    pub worker_name: String,
    pub miner_agent: String,
    pub blocks_found: u64,
    pub shares_found: u64,
    pub stale_shares: u64,
    pub invalid_shares: u64,
    pub duplicate_shares: u64,
    pub var_diff_shares_found: u64,
    pub start_time_ms: u64,
    pub last_share_ms: u64,
    /// `None` means the tracker is not armed: a new difficulty has been
    /// chosen but not yet announced to the client.
    pub var_diff_start_time_ms: Option<u64>,
    pub var_diff_window: usize,
    pub min_diff: f64,
    pub var_diff_enabled: bool,
    pub recent_shares: VecDeque<RecentShare>,
}

impl WorkerStats {
    pub fn new(address: &str, worker_name: &str, miner_agent: &str, min_diff: f64, var_diff_enabled: bool) -> Self {
        let now = unix_now_millis();
        Self {
            address: address.to_string(),
            worker_name: worker_name.to_string(),
            miner_agent: miner_agent.to_string(),
            blocks_found: 0,
            shares_found: 0,
            stale_shares: 0,
            invalid_shares: 0,
            duplicate_shares: 0,
            var_diff_shares_found: 0,
            start_time_ms: now,
            last_share_ms: now,
            var_diff_start_time_ms: Some(now),
            var_diff_window: 0,
            min_diff,
            var_diff_enabled,
            recent_shares: VecDeque::new(),
        }
    }

    /// True when this nonce already appears in the retained share ring.
    pub fn has_recent_nonce(&self, nonce: u64) -> bool {
        self.recent_shares.iter().any(|s| s.nonce == nonce)
    }

    /// Append a credited share and evict ring entries older than the
    /// retention window. Entries are appended in submit order, so the ring
    /// stays ordered by timestamp.
    pub fn record_share(&mut self, now_ms: u64, difficulty: f64, nonce: u64) {
        self.recent_shares.push_back(RecentShare { timestamp_ms: now_ms, difficulty, nonce });
        let horizon = now_ms.saturating_sub(RECENT_SHARE_WINDOW_MS);
        while self.recent_shares.front().is_some_and(|s| s.timestamp_ms < horizon) {
            self.recent_shares.pop_front();
        }
    }
}

/// Estimated hashrate in GH/s over shares inside the window: the summed
/// per-share hash work divided by the span back to the oldest such share.
pub fn hashrate_ghs(stats: &WorkerStats, now_ms: u64) -> f64 {
    let horizon = now_ms.saturating_sub(RECENT_SHARE_WINDOW_MS);
    let mut oldest_ms = u64::MAX;
    let mut total_gh = 0.0;
    let mut count = 0u64;
    for share in stats.recent_shares.iter().filter(|s| s.timestamp_ms >= horizon) {
        oldest_ms = oldest_ms.min(share.timestamp_ms);
        total_gh += diff_to_gh(share.difficulty);
        count += 1;
    }
    if count == 0 || oldest_ms >= now_ms {
        return 0.0;
    }
    let elapsed_secs = (now_ms - oldest_ms) as f64 / 1000.0;
    total_gh / elapsed_secs
}

/// Activity probe doubling as a metric value: the last-share unix timestamp
/// in seconds when it falls inside the window, else 0. `last_share_ms` is
/// initialised to creation time, so a freshly authorized worker counts as
/// active until the window elapses.
pub fn check_active(stats: &WorkerStats, now_ms: u64) -> u64 {
    if now_ms.saturating_sub(stats.last_share_ms) <= ACTIVE_WINDOW_MS {
        stats.last_share_ms / 1000
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker() -> WorkerStats {
        WorkerStats::new("kaspa:qq0", "rig1", "GodMiner", 4096.0, true)
    }

    #[test]
    fn test_hashrate_zero_without_shares() {
        let stats = worker();
        assert_eq!(hashrate_ghs(&stats, unix_now_millis()), 0.0);
    }

    #[test]
    fn test_hashrate_zero_when_all_shares_are_stale() {
        let mut stats = worker();
        let now = 2_000_000_000_000u64;
        stats.recent_shares.push_back(RecentShare { timestamp_ms: now - RECENT_SHARE_WINDOW_MS - 1, difficulty: 4096.0, nonce: 1 });
        assert_eq!(hashrate_ghs(&stats, now), 0.0);
    }

    #[test]
    fn test_hashrate_matches_hand_computation() {
        let mut stats = worker();
        let now = 2_000_000_000_000u64;
        // Two diff-4096 shares, the older one 60 s back.
        stats.recent_shares.push_back(RecentShare { timestamp_ms: now - 60_000, difficulty: 4096.0, nonce: 1 });
        stats.recent_shares.push_back(RecentShare { timestamp_ms: now - 10_000, difficulty: 4096.0, nonce: 2 });
        let expected = 2.0 * diff_to_gh(4096.0) / 60.0;
        let got = hashrate_ghs(&stats, now);
        assert!((got - expected).abs() < 1e-9, "got {got}, expected {expected}");
    }

    #[test]
    fn test_record_share_prunes_old_entries() {
        let mut stats = worker();
        let now = 2_000_000_000_000u64;
        stats.record_share(now - RECENT_SHARE_WINDOW_MS - 5_000, 4096.0, 1);
        stats.record_share(now - 5_000, 4096.0, 2);
        stats.record_share(now, 4096.0, 3);
        assert_eq!(stats.recent_shares.len(), 2);
        assert!(stats.recent_shares.iter().all(|s| s.nonce != 1));
        // Ring stays ordered by timestamp.
        let mut last = 0;
        for share in &stats.recent_shares {
            assert!(share.timestamp_ms >= last);
            last = share.timestamp_ms;
        }
    }

    #[test]
    fn test_duplicate_nonce_detection() {
        let mut stats = worker();
        let now = 2_000_000_000_000u64;
        stats.record_share(now, 4096.0, 0x4d2);
        assert!(stats.has_recent_nonce(0x4d2));
        assert!(!stats.has_recent_nonce(0x4d3));
    }

    #[test]
    fn test_check_active_window_boundary() {
        let mut stats = worker();
        let now = 2_000_000_000_000u64;

        stats.last_share_ms = now - ACTIVE_WINDOW_MS;
        assert_eq!(check_active(&stats, now), stats.last_share_ms / 1000);

        stats.last_share_ms = now - ACTIVE_WINDOW_MS - 1;
        assert_eq!(check_active(&stats, now), 0);
    }

    #[test]
    fn test_fresh_worker_counts_as_active() {
        let stats = worker();
        assert_ne!(check_active(&stats, unix_now_millis()), 0);
    }
}
