//! Request handlers for the three Stratum methods, plus the address and
//! difficulty negotiation they depend on.

use crate::config::PoolConfig;
use crate::constants::{CLIENT_DIFF_PORT, NONCE_HEX_WIDTH};
use crate::errors::{ProtocolError, WireCode};
use crate::job_encoding::{detect_encoding, JobEncoding};
use crate::jsonrpc_event::{JsonRpcEvent, StratumMethod};
use crate::shares_manager::{ShareOutcome, SharesManager};
use crate::stratum_context::{ErrorDisconnected, StratumContext};
use crate::template_registry::TemplateRegistry;
use crate::vardiff::{pow2_floor, pow2_nearest};
use crate::worker_stats::WorkerStats;
use kaspa_addresses::Address;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

static WALLET_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"kaspa(test|dev)?:([a-z0-9]{61}|[a-z0-9]{63})").unwrap());

pub struct StratumHandler {
    shares: Arc<SharesManager>,
    registry: Arc<TemplateRegistry>,
    config: Arc<PoolConfig>,
    next_extranonce: AtomicU32,
}

impl StratumHandler {
    pub fn new(shares: Arc<SharesManager>, registry: Arc<TemplateRegistry>, config: Arc<PoolConfig>) -> Self {
        Self { shares, registry, config, next_extranonce: AtomicU32::new(0) }
    }

    /// Dispatch one validated request. Errors terminate the connection;
    /// recoverable rejects are answered on the wire and return `Ok`.
    pub async fn handle_event(&self, ctx: &Arc<StratumContext>, event: JsonRpcEvent) -> Result<(), ProtocolError> {
        match event.method_enum() {
            StratumMethod::Subscribe => self.handle_subscribe(ctx, event),
            StratumMethod::ExtranonceSubscribe => ctx.reply_result(event.id, Value::Bool(true)).map_err(disconnected),
            StratumMethod::Authorize => self.handle_authorize(ctx, event).await,
            StratumMethod::Submit => self.handle_submit(ctx, event).await,
            StratumMethod::Other(method) => {
                let _ = ctx.reply_error(event.id, WireCode::Unknown);
                Err(ProtocolError::UnknownMethod(method))
            }
        }
    }

    fn handle_subscribe(&self, ctx: &Arc<StratumContext>, event: JsonRpcEvent) -> Result<(), ProtocolError> {
        if ctx.subscribed.load(Ordering::Acquire) {
            warn!("client {} re-subscribed, rejecting", ctx.remote_addr);
            return ctx.reply_error(event.id, WireCode::Unknown).map_err(disconnected);
        }

        let agent = event.params.first().and_then(Value::as_str).unwrap_or("unknown").to_string();
        let encoding = detect_encoding(&agent);
        *ctx.miner_agent.lock() = agent.clone();
        *ctx.encoding.lock() = encoding;

        if self.config.extranonce_size > 0 {
            *ctx.extranonce.lock() = self.next_extranonce();
        }
        let extranonce = ctx.extranonce.lock().clone();
        ctx.subscribed.store(true, Ordering::Release);
        debug!("client {} subscribed (agent '{}', encoding {:?}, extranonce '{}')", ctx.remote_addr, agent, encoding, extranonce);

        let result = match encoding {
            JobEncoding::Bitmain => json!([Value::Null, extranonce, 8 - extranonce.len() / 2]),
            JobEncoding::BigHeader => json!([true, "EthereumStratum/1.0.0"]),
        };
        ctx.reply_result(event.id, result).map_err(disconnected)
    }

    /// Sequential per-connection extranonce prefixes; wrap-around is logged
    /// since it reopens nonce-space overlap with long-lived clients.
    fn next_extranonce(&self) -> String {
        let width = self.config.extranonce_size as usize * 2;
        let max = (1u32 << (self.config.extranonce_size as u32 * 8)) - 1;
        let previous = self
            .next_extranonce
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(if v >= max { 0 } else { v + 1 }))
            .unwrap_or(0);
        if previous >= max {
            warn!("extranonce wrapped, new clients may duplicate work");
        }
        format!("{previous:0width$x}")
    }

    async fn handle_authorize(&self, ctx: &Arc<StratumContext>, event: JsonRpcEvent) -> Result<(), ProtocolError> {
        let login = event
            .params
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::Malformed("expected params[0] to be address.worker".to_string()))?;
        let password = event.params.get(1).and_then(Value::as_str).unwrap_or("");

        let mut parts = login.splitn(2, '.');
        let address_part = parts.next().unwrap_or("");
        let worker_name = parts.next().unwrap_or("").to_string();

        let address = match clean_wallet(address_part) {
            Ok(address) => address,
            Err(e) => {
                warn!("authorize from {} with invalid address '{}': {}", ctx.remote_addr, address_part, e);
                return ctx.reply_error(event.id, WireCode::UnauthorizedWorker).map_err(disconnected);
            }
        };
        if worker_name.is_empty() {
            warn!("authorize from {} without a worker name", ctx.remote_addr);
            return ctx.reply_error(event.id, WireCode::UnauthorizedWorker).map_err(disconnected);
        }
        if ctx.has_worker(&worker_name) {
            warn!("duplicate worker '{}' on connection {}", worker_name, ctx.id);
            return ctx.reply_error(event.id, WireCode::UnauthorizedWorker).map_err(disconnected);
        }

        // The socket carries one difficulty (set_difficulty has no worker
        // parameter), so only the first authorize negotiates; workers joining
        // later inherit the socket's difficulty and vardiff mode.
        let (difficulty, var_diff_enabled) = match ctx.primary_worker() {
            Some((primary_name, primary_address)) => {
                let current_difficulty = *ctx.difficulty.lock();
                (current_difficulty, self.shares.worker_vardiff_enabled(&primary_address, &primary_name).await)
            }
            None => self.negotiate_difficulty(ctx.port, password),
        };
        let agent = ctx.miner_agent.lock().clone();
        let stats = WorkerStats::new(&address, &worker_name, &agent, difficulty, var_diff_enabled);
        if !self.shares.register_worker(ctx.id, stats).await {
            warn!("worker {}.{} already live elsewhere", address, worker_name);
            return ctx.reply_error(event.id, WireCode::UnauthorizedWorker).map_err(disconnected);
        }

        let first_worker = {
            let mut workers = ctx.workers.lock();
            workers.push((worker_name.clone(), address.clone()));
            workers.len() == 1
        };
        if first_worker {
            *ctx.difficulty.lock() = difficulty;
        }

        ctx.reply_result(event.id, Value::Bool(true)).map_err(disconnected)?;

        // Extranonce before difficulty; the job itself follows with the next
        // template fan-out.
        let extranonce = ctx.extranonce.lock().clone();
        if !extranonce.is_empty() {
            let params = match *ctx.encoding.lock() {
                JobEncoding::Bitmain => vec![Value::String(extranonce.clone()), Value::from(8 - extranonce.len() / 2)],
                JobEncoding::BigHeader => vec![Value::String(extranonce.clone())],
            };
            ctx.notify("mining.set_extranonce", params).map_err(disconnected)?;
        }
        ctx.notify("mining.set_difficulty", vec![json!(difficulty)]).map_err(disconnected)?;
        Ok(())
    }

    /// Difficulty negotiation. On the client-difficulty port, a parseable
    /// `d=`/`diff=` password value inside the configured range pins a static
    /// difficulty snapped to the nearest power of two; anything else falls
    /// back to the default with vardiff per configuration.
    fn negotiate_difficulty(&self, port: u16, password: &str) -> (f64, bool) {
        if port == CLIENT_DIFF_PORT {
            if let Some(requested) = parse_password_diff(password) {
                if requested >= self.config.min_difficulty && requested <= self.config.max_difficulty {
                    let snapped =
                        pow2_nearest(requested).clamp(self.config.min_difficulty, self.config.max_difficulty);
                    return (snapped, false);
                }
                debug!("requested difficulty {} outside [{}, {}], using default", requested, self.config.min_difficulty, self.config.max_difficulty);
            }
        }
        let mut default_diff = self.config.initial_difficulty;
        if self.config.pow2_clamp {
            default_diff = pow2_floor(default_diff);
        }
        (default_diff.clamp(self.config.min_difficulty, self.config.max_difficulty), self.config.var_diff)
    }

    async fn handle_submit(&self, ctx: &Arc<StratumContext>, event: JsonRpcEvent) -> Result<(), ProtocolError> {
        if !ctx.subscribed.load(Ordering::Acquire) {
            return ctx.reply_error(event.id, WireCode::NotSubscribed).map_err(disconnected);
        }
        if event.params.len() < 3 {
            return Err(ProtocolError::Malformed("submit expects [address.worker, job_id, extranonce2]".to_string()));
        }

        let login = event.params[0]
            .as_str()
            .ok_or_else(|| ProtocolError::Malformed("expected params[0] to be address.worker".to_string()))?;
        let worker_name = login.splitn(2, '.').nth(1).unwrap_or("");
        let Some(address) = ctx.worker_address(worker_name) else {
            debug!("submit for unknown worker '{}' on connection {}", worker_name, ctx.id);
            return ctx.reply_error(event.id, WireCode::UnauthorizedWorker).map_err(disconnected);
        };

        let job_id = match &event.params[1] {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return Err(ProtocolError::Malformed("job id must be a string or number".to_string())),
        };
        let extranonce2 = event.params[2]
            .as_str()
            .ok_or_else(|| ProtocolError::Malformed("expected params[2] to be the nonce string".to_string()))?;

        let Some(header_hash) = self.registry.hash_of_job(&job_id) else {
            debug!("submit for unknown job {} from {}.{}", job_id, address, worker_name);
            self.shares.record_stale(worker_name, &address).await;
            return ctx.reply_error(event.id, WireCode::JobNotFound).map_err(disconnected);
        };

        let encoding = *ctx.encoding.lock();
        let extranonce = ctx.extranonce.lock().clone();
        let nonce_str = assemble_nonce(&extranonce, extranonce2);
        let Some(nonce) = parse_nonce(encoding, &nonce_str) else {
            warn!("unparseable nonce '{}' from {}.{}", nonce_str, address, worker_name);
            return ctx.reply_error(event.id, WireCode::Unknown).map_err(disconnected);
        };

        let base_difficulty = *ctx.difficulty.lock();
        let outcome = self.shares.add_share(worker_name, &address, header_hash, base_difficulty, nonce, &job_id).await;
        let reply = match outcome {
            ShareOutcome::Accepted { .. } => ctx.reply_result(event.id, Value::Bool(true)),
            ShareOutcome::Duplicate => ctx.reply_error(event.id, WireCode::DuplicateShare),
            ShareOutcome::Stale => ctx.reply_error(event.id, WireCode::JobNotFound),
            ShareOutcome::LowDifficulty => ctx.reply_error(event.id, WireCode::LowDifficultyShare),
            ShareOutcome::Unauthorized => ctx.reply_error(event.id, WireCode::UnauthorizedWorker),
        };
        reply.map_err(disconnected)
    }
}

fn disconnected(_: ErrorDisconnected) -> ProtocolError {
    ProtocolError::Disconnected
}

/// Left-pad the miner's extranonce2 to the remaining nonce width and prefix
/// the assigned extranonce. Oversized values pass through untouched and fail
/// the parse downstream.
fn assemble_nonce(extranonce: &str, extranonce2: &str) -> String {
    let trimmed = extranonce2.trim_start_matches("0x");
    if extranonce.is_empty() {
        return trimmed.to_string();
    }
    let width = NONCE_HEX_WIDTH.saturating_sub(extranonce.len());
    if trimmed.len() <= width {
        format!("{extranonce}{trimmed:0>width$}")
    } else {
        trimmed.to_string()
    }
}

/// Bitmain firmwares submit decimal nonce strings; everything else speaks
/// hex. Some Bitmain stacks still send hex, so the decimal parse falls back
/// rather than rejecting the share.
fn parse_nonce(encoding: JobEncoding, nonce_str: &str) -> Option<u64> {
    match encoding {
        JobEncoding::Bitmain => nonce_str.parse::<u64>().ok().or_else(|| u64::from_str_radix(nonce_str, 16).ok()),
        JobEncoding::BigHeader => u64::from_str_radix(nonce_str, 16).ok(),
    }
}

/// Coerce the login into a valid kaspa address: direct parse, retry with the
/// mainnet prefix, finally a bech32-shaped regex match.
fn clean_wallet(input: &str) -> Result<String, String> {
    if Address::try_from(input).is_ok() {
        return Ok(input.to_string());
    }
    if !input.starts_with("kaspa:") && !input.starts_with("kaspatest:") && !input.starts_with("kaspadev:") {
        return clean_wallet(&format!("kaspa:{input}"));
    }
    if let Some(m) = WALLET_REGEX.find(input) {
        return Ok(m.as_str().to_string());
    }
    Err("unable to coerce wallet to a valid kaspa address".to_string())
}

fn parse_password_diff(password: &str) -> Option<f64> {
    for token in password.split([',', ';', ' ']) {
        let Some(value) = token.strip_prefix("d=").or_else(|| token.strip_prefix("diff=")) else {
            continue;
        };
        return match value.parse::<f64>() {
            Ok(parsed) if parsed > 0.0 && parsed.is_finite() => Some(parsed),
            _ => None,
        };
    }
    None
}
