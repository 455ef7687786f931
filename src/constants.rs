//! Central timing values, caps and tuning tables for the pool core.

use std::time::Duration;

// ============================================================================
// Timing
// ============================================================================

/// Cadence of the vardiff controller.
pub const VARDIFF_TICK: Duration = Duration::from_secs(10);

/// Cadence of the worker stats reporter.
pub const STATS_REPORT_INTERVAL: Duration = Duration::from_secs(600);

/// Sliding window for the hashrate estimator and the recent-share ring.
pub const RECENT_SHARE_WINDOW_MS: u64 = 600_000;

/// A worker with no share inside this window counts as inactive.
pub const ACTIVE_WINDOW_MS: u64 = 600_000;

/// Ramp-up window for the fallback allocation snapshot.
pub const FALLBACK_RAMP_WINDOW_MS: u64 = 300_000;

/// Write timeout for a single line on a client socket.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay before reconnecting a dropped template feed.
pub const FEED_RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// How long a block submission waits for the upstream verdict.
pub const SUBMIT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Buffers and caps
// ============================================================================

/// Read buffer size for client sockets.
pub const READ_BUFFER_SIZE: usize = 1024;

/// A connection accumulating this many bytes without a newline is dropped.
pub const MAX_PENDING_LINE_BYTES: usize = 512;

/// Default number of cached block templates (FIFO).
pub const TEMPLATE_CACHE_SIZE: usize = 300;

/// The job-to-DAA-score map outlives the template cache by this factor so
/// shares still sitting in the window can resolve their reward cycle.
pub const JOB_DAA_RETENTION_MULTIPLIER: usize = 4;

// ============================================================================
// Ports and extranonce
// ============================================================================

/// Connections on this port may request a static difficulty via the
/// authorize password (`d=<N>` / `diff=<N>`).
pub const CLIENT_DIFF_PORT: u16 = 8888;

/// Upper bound on the configured extranonce size in bytes.
pub const MAX_EXTRANONCE_SIZE: u8 = 3;

/// Total nonce width in hex characters; extranonce2 is left-padded up to
/// this width minus the assigned extranonce prefix.
pub const NONCE_HEX_WIDTH: usize = 16;

// ============================================================================
// Miner agent detection
// ============================================================================

/// Agent substrings that select the Bitmain job encoding (case-insensitive).
pub const BITMAIN_KEYWORDS: &[&str] = &["godminer", "bitmain", "antminer"];

// ============================================================================
// Vardiff tables
// ============================================================================

/// Observation windows in minutes; the final stage (0) adjusts on any
/// tolerance breach without waiting for a window to complete.
pub const VARDIFF_WINDOWS: [f64; 7] = [1.0, 3.0, 10.0, 30.0, 60.0, 240.0, 0.0];

/// Per-stage tolerance on the share-rate ratio.
pub const VARDIFF_TOLERANCES: [f64; 7] = [1.0, 0.5, 0.25, 0.15, 0.1, 0.1, 0.1];

/// Rejection rate at which the controller stops trusting the feedback loop
/// and pins the difficulty from the ASIC tier table instead.
pub const VARDIFF_REJECTION_RATE: f64 = 0.20;

/// Difficulty tiers keyed on estimated hashrate in GH/s. Tier ranges are
/// closed; lookups resolve by first match, so the shared 200/400-style
/// boundaries land in the lower tier. Hashrates above the last bound keep
/// the last tier.
pub const ASIC_DIFF_TIERS: &[(f64, f64)] = &[
    (100.0, 64.0),
    (200.0, 128.0),
    (400.0, 256.0),
    (1000.0, 512.0),
    (2000.0, 1024.0),
    (5000.0, 2048.0),
    (8000.0, 4096.0),
    (12000.0, 8192.0),
    (15000.0, 16384.0),
    (21000.0, 32768.0),
];
