//! Share validation and miner accounting.
//!
//! All registrations, worker-stats mutation and share-window appends happen
//! under one message-level mutex, so subscribe/authorize/submit interleavings
//! across sockets are linearised. The upstream block submit runs inside the
//! section; blocks are rare enough that the stall is acceptable.

use crate::constants::STATS_REPORT_INTERVAL;
use crate::constants::VARDIFF_TICK;
use crate::metrics;
use crate::pow::{calculate_target, SubmitOutcome};
use crate::share_window::{snapshot_by_scaled_difficulty, Contribution, ShareWindow};
use crate::stratum_context::ClientRegistry;
use crate::template_registry::TemplateRegistry;
use crate::vardiff::{self, VardiffParams};
use crate::worker_stats::{check_active, hashrate_ghs, unix_now_millis, WorkerStats};
use kaspa_hashes::Hash;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Per-address miner state: live sockets and per-worker accounting.
#[derive(Default)]
pub struct MinerData {
    pub sockets: HashSet<u64>,
    pub worker_stats: HashMap<String, WorkerStats>,
}

/// Everything guarded by the global message section.
#[derive(Default)]
pub struct PoolState {
    pub miners: HashMap<String, MinerData>,
    pub window: ShareWindow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareOutcome {
    Accepted { is_block: bool, block_accepted: bool },
    Unauthorized,
    Duplicate,
    Stale,
    LowDifficulty,
}

pub struct SharesManager {
    state: Mutex<PoolState>,
    registry: Arc<TemplateRegistry>,
    vardiff_params: VardiffParams,
}

impl SharesManager {
    pub fn new(registry: Arc<TemplateRegistry>, vardiff_params: VardiffParams) -> Self {
        Self { state: Mutex::new(PoolState::default()), registry, vardiff_params }
    }

    pub async fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().await
    }

    /// Bind `(address, worker)` to a socket and create its stats. Returns
    /// false when the pair is already live anywhere — the same worker may not
    /// mine from two sockets, and re-authorizing it on its own socket is
    /// equally a client bug.
    pub async fn register_worker(&self, conn_id: u64, stats: WorkerStats) -> bool {
        let mut state = self.state.lock().await;
        let miner = state.miners.entry(stats.address.clone()).or_default();
        if miner.worker_stats.contains_key(&stats.worker_name) {
            return false;
        }
        info!("worker {}.{} authorized on connection {} (diff {})", stats.address, stats.worker_name, conn_id, stats.min_diff);
        miner.sockets.insert(conn_id);
        miner.worker_stats.insert(stats.worker_name.clone(), stats);
        true
    }

    /// Close-time cleanup: unlink the socket and every worker bound to it;
    /// drop miner entries that end up empty.
    pub async fn remove_connection(&self, conn_id: u64, workers: &[(String, String)]) {
        let mut state = self.state.lock().await;
        for (worker_name, address) in workers {
            let mut prune = false;
            if let Some(miner) = state.miners.get_mut(address) {
                miner.sockets.remove(&conn_id);
                miner.worker_stats.remove(worker_name);
                metrics::record_disconnect(address, worker_name);
                prune = miner.sockets.is_empty() && miner.worker_stats.is_empty();
            }
            if prune {
                state.miners.remove(address);
            }
        }
        // A socket that authorized nothing still needs its id dropped.
        if workers.is_empty() {
            state.miners.retain(|_, miner| {
                miner.sockets.remove(&conn_id);
                !(miner.sockets.is_empty() && miner.worker_stats.is_empty())
            });
        }
    }

    /// A submit referencing a job the registry no longer knows. Counts as a
    /// stale share for the worker (when it exists at all).
    pub async fn record_stale(&self, miner_id: &str, address: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(stats) = state.miners.get_mut(address).and_then(|m| m.worker_stats.get_mut(miner_id)) else {
            return false;
        };
        stats.stale_shares += 1;
        metrics::record_rejected_share(address, miner_id, "stale");
        true
    }

    /// Validate and credit one submitted share.
    pub async fn add_share(
        &self,
        miner_id: &str,
        address: &str,
        header_hash: Hash,
        base_difficulty: f64,
        nonce: u64,
        job_id: &str,
    ) -> ShareOutcome {
        let mut state = self.state.lock().await;
        let now = unix_now_millis();

        let Some(stats) = state.miners.get_mut(address).and_then(|m| m.worker_stats.get_mut(miner_id)) else {
            return ShareOutcome::Unauthorized;
        };

        if stats.has_recent_nonce(nonce) {
            stats.duplicate_shares += 1;
            metrics::record_rejected_share(address, miner_id, "duplicate");
            debug!("duplicate share from {}.{} (nonce {:016x})", address, miner_id, nonce);
            return ShareOutcome::Duplicate;
        }

        let Some(pow) = self.registry.pow_of(&header_hash) else {
            stats.stale_shares += 1;
            metrics::record_rejected_share(address, miner_id, "stale");
            debug!("stale share from {}.{}: template {} gone", address, miner_id, header_hash);
            return ShareOutcome::Stale;
        };

        let (is_block, pow_value) = pow.check_work(nonce);
        let share_diff = if stats.min_diff > 0.0 { stats.min_diff } else { base_difficulty };
        if pow_value > calculate_target(share_diff) {
            stats.invalid_shares += 1;
            metrics::record_rejected_share(address, miner_id, "weak");
            debug!("weak share from {}.{} (diff {})", address, miner_id, share_diff);
            return ShareOutcome::LowDifficulty;
        }

        stats.shares_found += 1;
        stats.var_diff_shares_found += 1;
        stats.last_share_ms = now;
        stats.record_share(now, share_diff, nonce);
        metrics::record_share_found(address, miner_id, share_diff);

        let daa_score = self.registry.daa_score_of_job(job_id);
        state.window.push(Contribution {
            address: address.to_string(),
            miner_id: miner_id.to_string(),
            difficulty: share_diff,
            timestamp_ms: now,
            job_id: job_id.to_string(),
            daa_score,
        });

        if !is_block {
            return ShareOutcome::Accepted { is_block: false, block_accepted: false };
        }

        // Block share: submit upstream. The verdict only decides the block
        // counter; the share credit above stands either way.
        info!("block share from {}.{} on job {}", address, miner_id, job_id);
        let block_accepted = match self.registry.submit(miner_id, address, header_hash, nonce).await {
            Ok(SubmitOutcome::Accepted) => {
                if let Some(stats) = state.miners.get_mut(address).and_then(|m| m.worker_stats.get_mut(miner_id)) {
                    stats.blocks_found += 1;
                }
                metrics::record_block_found(address, miner_id, &header_hash.to_string());
                true
            }
            Ok(SubmitOutcome::Rejected(reason)) => {
                warn!("block from {}.{} rejected: {}", address, miner_id, reason);
                false
            }
            Err(e) => {
                error!("block submission from {}.{} failed: {}", address, miner_id, e);
                false
            }
        };
        ShareOutcome::Accepted { is_block: true, block_accepted }
    }

    /// Allocator API: FIFO prefix of the window up to the DAA cut-off.
    pub async fn drain_by_daa_score(&self, cutoff: u64) -> Vec<Contribution> {
        self.state.lock().await.window.drain_up_to(cutoff)
    }

    /// Allocator API: synthetic per-worker snapshot for reward events with no
    /// recorded shares.
    pub async fn fallback_snapshot(&self) -> Vec<Contribution> {
        let state = self.state.lock().await;
        let now = unix_now_millis();
        snapshot_by_scaled_difficulty(state.miners.values().flat_map(|m| m.worker_stats.values()), now)
    }

    pub async fn worker_min_diff(&self, address: &str, worker_name: &str) -> Option<f64> {
        let state = self.state.lock().await;
        state.miners.get(address).and_then(|m| m.worker_stats.get(worker_name)).map(|s| s.min_diff)
    }

    pub async fn worker_vardiff_enabled(&self, address: &str, worker_name: &str) -> bool {
        let state = self.state.lock().await;
        state.miners.get(address).and_then(|m| m.worker_stats.get(worker_name)).map(|s| s.var_diff_enabled).unwrap_or(false)
    }

    /// Bring every worker on a socket back to the difficulty actually
    /// announced on its wire. `set_difficulty` is connection-scoped, so
    /// non-primary workers cannot mine at their own controller output; they
    /// follow the announced value, and any tracker left disarmed by the
    /// controller is re-armed against it.
    pub async fn sync_socket_difficulty(&self, workers: &[(String, String)], announced: f64) {
        let mut state = self.state.lock().await;
        let now = unix_now_millis();
        for (worker_name, address) in workers {
            if let Some(stats) = state.miners.get_mut(address).and_then(|m| m.worker_stats.get_mut(worker_name)) {
                if stats.min_diff != announced || stats.var_diff_start_time_ms.is_none() {
                    stats.min_diff = announced;
                    vardiff::rearm(stats, now);
                }
            }
        }
    }

    /// Periodic vardiff controller pass over every worker.
    pub async fn vardiff_cycle(&self) {
        let mut state = self.state.lock().await;
        let now = unix_now_millis();
        for miner in state.miners.values_mut() {
            for stats in miner.worker_stats.values_mut() {
                vardiff::adjust_worker(stats, &self.vardiff_params, now);
            }
        }
    }

    pub fn start_vardiff_task(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        info!(
            "vardiff enabled (target {} shares/min, tick {:?}, pow2_clamp {})",
            manager.vardiff_params.expected_shares_per_min,
            VARDIFF_TICK,
            manager.vardiff_params.clamp_pow2
        );
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(VARDIFF_TICK);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                manager.vardiff_cycle().await;
            }
        })
    }

    /// Periodic stats reporter: tabular summary, gauge refresh, and a
    /// graceful close for sockets whose workers have gone quiet. Never
    /// mutates worker accounting.
    pub fn start_stats_reporter(self: &Arc<Self>, clients: Arc<ClientRegistry>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATS_REPORT_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so a fresh pool does
            // not print an empty table.
            interval.tick().await;
            loop {
                interval.tick().await;
                manager.report_stats(&clients).await;
            }
        })
    }

    async fn report_stats(&self, clients: &ClientRegistry) {
        let now = unix_now_millis();
        let mut rows = Vec::new();
        let mut idle_workers = Vec::new();
        {
            let state = self.state.lock().await;
            for (address, miner) in &state.miners {
                for (name, stats) in &miner.worker_stats {
                    let rate = hashrate_ghs(stats, now);
                    let active = check_active(stats, now);
                    metrics::set_worker_hashrate(address, name, rate);
                    metrics::set_worker_active(address, name, active);
                    if active == 0 {
                        idle_workers.push((address.clone(), name.clone()));
                    }
                    let uptime_min = now.saturating_sub(stats.start_time_ms) as f64 / 60_000.0;
                    rows.push((
                        format!("{}.{}", short_address(address), name),
                        format_hashrate(rate),
                        stats.min_diff.round() as u64,
                        format!("{}/{}/{}", stats.shares_found, stats.stale_shares, stats.invalid_shares),
                        stats.blocks_found,
                        format!("{:.1}m", uptime_min),
                    ));
                }
            }
        }

        if !rows.is_empty() {
            rows.sort_by(|a, b| a.0.cmp(&b.0));
            let mut out = Vec::with_capacity(rows.len() + 4);
            let border = format!("+-{}-+-{}-+-{}-+-{}-+-{}-+-{}-+", "-".repeat(24), "-".repeat(11), "-".repeat(8), "-".repeat(14), "-".repeat(6), "-".repeat(7));
            out.push(border.clone());
            out.push(format!(
                "| {:<24} | {:>11} | {:>8} | {:>14} | {:>6} | {:>7} |",
                "Worker", "Hash", "Diff", "Acc/Stl/Inv", "Blocks", "Time"
            ));
            out.push(border.clone());
            for (worker, hash, diff, counts, blocks, uptime) in &rows {
                out.push(format!("| {:<24} | {:>11} | {:>8} | {:>14} | {:>6} | {:>7} |", worker, hash, diff, counts, blocks, uptime));
            }
            out.push(border);
            info!("\n{}", out.join("\n"));
        }

        for (address, name) in idle_workers {
            info!("worker {}.{} inactive, closing its sockets", address, name);
            clients.close_worker_sockets(&address, &name, "inactive worker");
        }
    }
}

fn short_address(address: &str) -> String {
    match address.len() {
        0..=16 => address.to_string(),
        _ => format!("{}..{}", &address[..10], &address[address.len() - 4..]),
    }
}

fn format_hashrate(ghs: f64) -> String {
    if ghs < 1.0 {
        format!("{:.2}MH/s", ghs * 1000.0)
    } else if ghs < 1000.0 {
        format!("{:.2}GH/s", ghs)
    } else {
        format!("{:.2}TH/s", ghs / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pow::mock::{MockPowBackend, MockSubmitter};
    use crate::pow::{BlockSubmitter, PowBackend};
    use crate::template_registry::test_support::test_header;

    const ADDRESS: &str = "kaspa:qq0";

    fn vardiff_params() -> VardiffParams {
        VardiffParams { expected_shares_per_min: 20.0, min_diff: 64.0, max_diff: 131_072.0, clamp_pow2: false }
    }

    struct Fixture {
        manager: Arc<SharesManager>,
        registry: Arc<TemplateRegistry>,
        submitter: Arc<MockSubmitter>,
        job_id: String,
        header_hash: Hash,
    }

    async fn fixture(backend: MockPowBackend) -> Fixture {
        let submitter = Arc::new(MockSubmitter::accepting());
        let registry =
            Arc::new(TemplateRegistry::new(Arc::new(backend) as Arc<dyn PowBackend>, submitter.clone() as Arc<dyn BlockSubmitter>, 8));
        let mut rx = registry.register();
        registry.on_template(test_header(1));
        let notification = rx.try_recv().unwrap();
        let header_hash = registry.hash_of_job(&notification.job_id).unwrap();

        let manager = Arc::new(SharesManager::new(Arc::clone(&registry), vardiff_params()));
        assert!(manager.register_worker(1, WorkerStats::new(ADDRESS, "w1", "GodMiner", 4096.0, true)).await);
        Fixture { manager, registry, submitter, job_id: notification.job_id, header_hash }
    }

    async fn stats_of(fixture: &Fixture) -> WorkerStats {
        let state = fixture.manager.lock_state().await;
        state.miners.get(ADDRESS).unwrap().worker_stats.get("w1").unwrap().clone()
    }

    #[tokio::test]
    async fn test_happy_share_credits_once() {
        let f = fixture(MockPowBackend::accepting()).await;
        let outcome = f.manager.add_share("w1", ADDRESS, f.header_hash, 4096.0, 0x4d2, &f.job_id).await;
        assert_eq!(outcome, ShareOutcome::Accepted { is_block: false, block_accepted: false });

        let stats = stats_of(&f).await;
        assert_eq!(stats.shares_found, 1);
        assert_eq!(stats.var_diff_shares_found, 1);
        assert_eq!(stats.recent_shares.len(), 1);
        assert_eq!((stats.stale_shares, stats.invalid_shares, stats.duplicate_shares), (0, 0, 0));

        let window = f.manager.drain_by_daa_score(u64::MAX).await;
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].daa_score, f.registry.daa_score_of_job(&f.job_id));
        assert_eq!(window[0].miner_id, "w1");
    }

    #[tokio::test]
    async fn test_unauthorized_share_mutates_nothing() {
        let f = fixture(MockPowBackend::accepting()).await;
        let outcome = f.manager.add_share("ghost", ADDRESS, f.header_hash, 4096.0, 1, &f.job_id).await;
        assert_eq!(outcome, ShareOutcome::Unauthorized);
        let outcome = f.manager.add_share("w1", "kaspa:other", f.header_hash, 4096.0, 1, &f.job_id).await;
        assert_eq!(outcome, ShareOutcome::Unauthorized);

        let stats = stats_of(&f).await;
        assert_eq!(stats.shares_found + stats.stale_shares + stats.invalid_shares + stats.duplicate_shares, 0);
        assert!(f.manager.drain_by_daa_score(u64::MAX).await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_nonce_credits_exactly_once() {
        let f = fixture(MockPowBackend::accepting()).await;
        let first = f.manager.add_share("w1", ADDRESS, f.header_hash, 4096.0, 0x4d2, &f.job_id).await;
        let second = f.manager.add_share("w1", ADDRESS, f.header_hash, 4096.0, 0x4d2, &f.job_id).await;
        assert!(matches!(first, ShareOutcome::Accepted { .. }));
        assert_eq!(second, ShareOutcome::Duplicate);

        let stats = stats_of(&f).await;
        assert_eq!(stats.shares_found, 1);
        assert_eq!(stats.duplicate_shares, 1);
        assert_eq!(f.manager.drain_by_daa_score(u64::MAX).await.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_share_when_template_evicted() {
        let f = fixture(MockPowBackend::accepting()).await;
        // Unknown header hash stands in for an evicted template.
        let outcome = f.manager.add_share("w1", ADDRESS, Hash::from_bytes([0xAAu8; 32]), 4096.0, 7, &f.job_id).await;
        assert_eq!(outcome, ShareOutcome::Stale);
        let stats = stats_of(&f).await;
        assert_eq!(stats.stale_shares, 1);
        assert_eq!(stats.shares_found, 0);
    }

    #[tokio::test]
    async fn test_low_difficulty_share() {
        let f = fixture(MockPowBackend::rejecting()).await;
        let outcome = f.manager.add_share("w1", ADDRESS, f.header_hash, 4096.0, 7, &f.job_id).await;
        assert_eq!(outcome, ShareOutcome::LowDifficulty);
        let stats = stats_of(&f).await;
        assert_eq!(stats.invalid_shares, 1);
        assert_eq!(stats.shares_found, 0);
        assert!(f.manager.drain_by_daa_score(u64::MAX).await.is_empty());
    }

    #[tokio::test]
    async fn test_zero_min_diff_falls_back_to_base_difficulty() {
        let f = fixture(MockPowBackend::accepting()).await;
        {
            let mut state = f.manager.lock_state().await;
            state.miners.get_mut(ADDRESS).unwrap().worker_stats.get_mut("w1").unwrap().min_diff = 0.0;
        }
        let outcome = f.manager.add_share("w1", ADDRESS, f.header_hash, 2048.0, 7, &f.job_id).await;
        assert!(matches!(outcome, ShareOutcome::Accepted { .. }));
        let window = f.manager.drain_by_daa_score(u64::MAX).await;
        assert_eq!(window[0].difficulty, 2048.0);
    }

    #[tokio::test]
    async fn test_block_share_submits_and_counts() {
        let f = fixture(MockPowBackend::block_finding()).await;
        let outcome = f.manager.add_share("w1", ADDRESS, f.header_hash, 4096.0, 0xbeef, &f.job_id).await;
        assert_eq!(outcome, ShareOutcome::Accepted { is_block: true, block_accepted: true });

        let stats = stats_of(&f).await;
        assert_eq!(stats.blocks_found, 1);
        assert_eq!(stats.shares_found, 1);
        assert_eq!(f.submitter.submitted.lock().len(), 1);
        assert_eq!(f.submitter.submitted.lock()[0].nonce, 0xbeef);
    }

    #[tokio::test]
    async fn test_rejected_block_still_counts_the_share() {
        let submitter = Arc::new(MockSubmitter::rejecting("stale"));
        let registry = Arc::new(TemplateRegistry::new(
            Arc::new(MockPowBackend::block_finding()) as Arc<dyn PowBackend>,
            submitter.clone() as Arc<dyn BlockSubmitter>,
            8,
        ));
        let mut rx = registry.register();
        registry.on_template(test_header(1));
        let notification = rx.try_recv().unwrap();
        let header_hash = registry.hash_of_job(&notification.job_id).unwrap();

        let manager = Arc::new(SharesManager::new(Arc::clone(&registry), vardiff_params()));
        assert!(manager.register_worker(1, WorkerStats::new(ADDRESS, "w1", "GodMiner", 4096.0, true)).await);

        let outcome = manager.add_share("w1", ADDRESS, header_hash, 4096.0, 1, &notification.job_id).await;
        assert_eq!(outcome, ShareOutcome::Accepted { is_block: true, block_accepted: false });

        let state = manager.lock_state().await;
        let stats = state.miners.get(ADDRESS).unwrap().worker_stats.get("w1").unwrap();
        assert_eq!(stats.blocks_found, 0);
        assert_eq!(stats.shares_found, 1);
        assert_eq!(state.window.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_worker_registration_fails() {
        let f = fixture(MockPowBackend::accepting()).await;
        assert!(!f.manager.register_worker(2, WorkerStats::new(ADDRESS, "w1", "agent", 64.0, true)).await);
        // Different worker name on the same address is fine.
        assert!(f.manager.register_worker(2, WorkerStats::new(ADDRESS, "w2", "agent", 64.0, true)).await);
    }

    #[tokio::test]
    async fn test_remove_connection_prunes_empty_miners() {
        let f = fixture(MockPowBackend::accepting()).await;
        f.manager.remove_connection(1, &[("w1".to_string(), ADDRESS.to_string())]).await;
        let state = f.manager.lock_state().await;
        assert!(state.miners.is_empty());
    }

    #[tokio::test]
    async fn test_record_stale_requires_authorization() {
        let f = fixture(MockPowBackend::accepting()).await;
        assert!(f.manager.record_stale("w1", ADDRESS).await);
        assert!(!f.manager.record_stale("ghost", ADDRESS).await);
        let stats = stats_of(&f).await;
        assert_eq!(stats.stale_shares, 1);
    }

    #[tokio::test]
    async fn test_sync_socket_difficulty_rearms_and_locksteps() {
        let f = fixture(MockPowBackend::accepting()).await;
        {
            let mut state = f.manager.lock_state().await;
            state.miners.get_mut(ADDRESS).unwrap().worker_stats.get_mut("w1").unwrap().var_diff_shares_found = 5;
        }
        // Second worker on the same socket whose controller wandered off and
        // left the tracker disarmed.
        let mut stray = WorkerStats::new(ADDRESS, "w2", "agent", 512.0, true);
        stray.var_diff_start_time_ms = None;
        assert!(f.manager.register_worker(1, stray).await);

        let workers = vec![("w1".to_string(), ADDRESS.to_string()), ("w2".to_string(), ADDRESS.to_string())];
        f.manager.sync_socket_difficulty(&workers, 4096.0).await;

        let state = f.manager.lock_state().await;
        let miner = state.miners.get(ADDRESS).unwrap();
        for name in ["w1", "w2"] {
            let stats = miner.worker_stats.get(name).unwrap();
            assert_eq!(stats.min_diff, 4096.0);
            assert!(stats.var_diff_start_time_ms.is_some());
        }
        // An armed worker already at the announced value is left alone.
        assert_eq!(miner.worker_stats.get("w1").unwrap().var_diff_shares_found, 5);
        assert_eq!(miner.worker_stats.get("w2").unwrap().var_diff_shares_found, 0);
    }

    #[tokio::test]
    async fn test_fallback_snapshot_covers_live_workers() {
        let f = fixture(MockPowBackend::accepting()).await;
        assert!(f.manager.register_worker(2, WorkerStats::new(ADDRESS, "w2", "agent", 2048.0, true)).await);
        let snapshot = f.manager.fallback_snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|c| c.difficulty >= 1.0));
    }
}
