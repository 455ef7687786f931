//! The rolling window of credited shares consumed by the reward allocator.

use crate::constants::FALLBACK_RAMP_WINDOW_MS;
use crate::worker_stats::WorkerStats;
use std::collections::VecDeque;

/// One credited share, in submit order.
#[derive(Debug, Clone, PartialEq)]
pub struct Contribution {
    pub address: String,
    pub miner_id: String,
    pub difficulty: f64,
    pub timestamp_ms: u64,
    pub job_id: String,
    pub daa_score: u64,
}

/// FIFO of contributions, drained by DAA-score cut-off.
#[derive(Debug, Default)]
pub struct ShareWindow {
    entries: VecDeque<Contribution>,
}

impl ShareWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, contribution: Contribution) {
        self.entries.push_back(contribution);
    }

    /// Remove and return the head run of contributions whose DAA score is at
    /// or below the cut-off, preserving insertion order. Everything left has
    /// a score above the cut-off.
    pub fn drain_up_to(&mut self, daa_score: u64) -> Vec<Contribution> {
        let mut drained = Vec::new();
        while self.entries.front().is_some_and(|c| c.daa_score <= daa_score) {
            drained.push(self.entries.pop_front().unwrap());
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Allocation fallback when a reward event has no recorded shares: one
/// synthetic contribution per live worker, weighted by how recently it was
/// seen, ramping over five minutes of silence. A worker whose weighted
/// difficulty rounds to zero still gets a token stake.
pub fn snapshot_by_scaled_difficulty<'a>(workers: impl Iterator<Item = &'a WorkerStats>, now_ms: u64) -> Vec<Contribution> {
    let mut snapshot = Vec::new();
    for stats in workers {
        let elapsed = now_ms.saturating_sub(stats.last_share_ms).min(FALLBACK_RAMP_WINDOW_MS);
        let weight = elapsed as f64 / FALLBACK_RAMP_WINDOW_MS as f64;
        let mut difficulty = weight * stats.min_diff;
        if difficulty < 1.0 {
            difficulty = (stats.min_diff / 10.0).max(1.0);
        }
        snapshot.push(Contribution {
            address: stats.address.clone(),
            miner_id: stats.worker_name.clone(),
            difficulty,
            timestamp_ms: now_ms,
            job_id: String::new(),
            daa_score: 0,
        });
    }
    snapshot
}
