//! Prometheus recording. Counters and gauges land in the process-global
//! registry; scraping/exporting them is somebody else's job.

use prometheus::{register_counter_vec, register_gauge_vec, CounterVec, GaugeVec};
use std::sync::OnceLock;

const WORKER_LABELS: &[&str] = &["wallet", "worker"];
const INVALID_LABELS: &[&str] = &["wallet", "worker", "type"];
const BLOCK_LABELS: &[&str] = &["wallet", "worker", "hash"];

static SHARE_COUNTER: OnceLock<CounterVec> = OnceLock::new();
static SHARE_DIFF_COUNTER: OnceLock<CounterVec> = OnceLock::new();
static INVALID_COUNTER: OnceLock<CounterVec> = OnceLock::new();
static BLOCK_COUNTER: OnceLock<CounterVec> = OnceLock::new();
static DISCONNECT_COUNTER: OnceLock<CounterVec> = OnceLock::new();
static JOB_COUNTER: OnceLock<CounterVec> = OnceLock::new();
static WORKER_HASHRATE: OnceLock<GaugeVec> = OnceLock::new();
static WORKER_ACTIVE: OnceLock<GaugeVec> = OnceLock::new();

/// Idempotent; call once at startup.
pub fn init_metrics() {
    SHARE_COUNTER.get_or_init(|| {
        register_counter_vec!("pool_valid_share_counter", "Number of valid shares found by worker", WORKER_LABELS).unwrap()
    });
    SHARE_DIFF_COUNTER.get_or_init(|| {
        register_counter_vec!("pool_valid_share_diff_counter", "Total difficulty of valid shares by worker", WORKER_LABELS).unwrap()
    });
    INVALID_COUNTER.get_or_init(|| {
        register_counter_vec!("pool_rejected_share_counter", "Rejected shares by worker and rejection type", INVALID_LABELS).unwrap()
    });
    BLOCK_COUNTER.get_or_init(|| register_counter_vec!("pool_blocks_mined", "Blocks found by worker", BLOCK_LABELS).unwrap());
    DISCONNECT_COUNTER.get_or_init(|| {
        register_counter_vec!("pool_worker_disconnect_counter", "Socket disconnects by worker", WORKER_LABELS).unwrap()
    });
    JOB_COUNTER.get_or_init(|| register_counter_vec!("pool_jobs_sent_counter", "Jobs written to miners", WORKER_LABELS).unwrap());
    WORKER_HASHRATE.get_or_init(|| {
        register_gauge_vec!("pool_worker_hashrate_ghs", "Estimated worker hashrate in GH/s", WORKER_LABELS).unwrap()
    });
    WORKER_ACTIVE.get_or_init(|| {
        register_gauge_vec!("pool_worker_active", "Last-share unix time when active within the window, else 0", WORKER_LABELS)
            .unwrap()
    });
}

pub fn record_share_found(wallet: &str, worker: &str, difficulty: f64) {
    if let Some(counter) = SHARE_COUNTER.get() {
        counter.with_label_values(&[wallet, worker]).inc();
    }
    if let Some(counter) = SHARE_DIFF_COUNTER.get() {
        counter.with_label_values(&[wallet, worker]).inc_by(difficulty);
    }
}

pub fn record_rejected_share(wallet: &str, worker: &str, kind: &str) {
    if let Some(counter) = INVALID_COUNTER.get() {
        counter.with_label_values(&[wallet, worker, kind]).inc();
    }
}

pub fn record_block_found(wallet: &str, worker: &str, hash: &str) {
    if let Some(counter) = BLOCK_COUNTER.get() {
        counter.with_label_values(&[wallet, worker, hash]).inc();
    }
}

pub fn record_disconnect(wallet: &str, worker: &str) {
    if let Some(counter) = DISCONNECT_COUNTER.get() {
        counter.with_label_values(&[wallet, worker]).inc();
    }
}

pub fn record_job_sent(wallet: &str, worker: &str) {
    if let Some(counter) = JOB_COUNTER.get() {
        counter.with_label_values(&[wallet, worker]).inc();
    }
}

pub fn set_worker_hashrate(wallet: &str, worker: &str, ghs: f64) {
    if let Some(gauge) = WORKER_HASHRATE.get() {
        gauge.with_label_values(&[wallet, worker]).set(ghs);
    }
}

pub fn set_worker_active(wallet: &str, worker: &str, value: u64) {
    if let Some(gauge) = WORKER_ACTIVE.get() {
        gauge.with_label_values(&[wallet, worker]).set(value as f64);
    }
}
