//! Per-connection state and the outbound write path.

use crate::errors::WireCode;
use crate::job_encoding::JobEncoding;
use crate::jsonrpc_event::{JsonRpcNotification, JsonRpcResponse};
use crate::worker_stats::unix_now_millis;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// The peer went away (or is being sent away).
#[derive(Debug, Error)]
#[error("disconnecting")]
pub struct ErrorDisconnected;

/// Outbound transport for one connection. Lines are queued; the writer task
/// owns the socket half. Swappable for a buffer in tests.
pub trait MessageSink: Send + Sync {
    fn send_line(&self, line: String) -> Result<(), ErrorDisconnected>;
    fn close(&self);
}

/// Production sink: hands lines to the connection's writer task.
pub struct ChannelSink {
    tx: tokio::sync::mpsc::UnboundedSender<String>,
}

impl ChannelSink {
    pub fn new(tx: tokio::sync::mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }
}

impl MessageSink for ChannelSink {
    fn send_line(&self, line: String) -> Result<(), ErrorDisconnected> {
        self.tx.send(line).map_err(|_| ErrorDisconnected)
    }

    fn close(&self) {
        // Dropping the last sender ends the writer task; an explicit close
        // message keeps it deterministic even while the context is alive.
        let _ = self.tx.send(String::new());
    }
}

/// State attached to one miner socket for its lifetime.
pub struct StratumContext {
    pub id: u64,
    pub port: u16,
    pub remote_addr: String,
    pub connected_at_ms: u64,
    pub miner_agent: Mutex<String>,
    pub encoding: Mutex<JobEncoding>,
    pub extranonce: Mutex<String>,
    /// The difficulty last announced on this socket. `set_difficulty` has no
    /// worker parameter, so all workers sharing the socket mine at this one
    /// value.
    pub difficulty: Mutex<f64>,
    /// Authorized workers in authorize order: `(worker name, address)`.
    pub workers: Mutex<Vec<(String, String)>>,
    pub subscribed: AtomicBool,
    pub last_activity_ms: AtomicU64,
    pub close_reason: Mutex<Option<String>>,
    disconnecting: AtomicBool,
    sink: Arc<dyn MessageSink>,
}

impl StratumContext {
    pub fn new(id: u64, port: u16, remote_addr: String, sink: Arc<dyn MessageSink>) -> Arc<Self> {
        let now = unix_now_millis();
        Arc::new(Self {
            id,
            port,
            remote_addr,
            connected_at_ms: now,
            miner_agent: Mutex::new(String::new()),
            encoding: Mutex::new(JobEncoding::BigHeader),
            extranonce: Mutex::new(String::new()),
            difficulty: Mutex::new(0.0),
            workers: Mutex::new(Vec::new()),
            subscribed: AtomicBool::new(false),
            last_activity_ms: AtomicU64::new(now),
            close_reason: Mutex::new(None),
            disconnecting: AtomicBool::new(false),
            sink,
        })
    }

    pub fn connected(&self) -> bool {
        !self.disconnecting.load(Ordering::Acquire)
    }

    /// Heartbeat: stamped on every byte received.
    pub fn touch(&self) {
        self.last_activity_ms.store(unix_now_millis(), Ordering::Relaxed);
    }

    /// Stamp the close reason (first writer wins) and tear the socket down.
    pub fn disconnect(&self, reason: &str) {
        {
            let mut close_reason = self.close_reason.lock();
            if close_reason.is_none() {
                *close_reason = Some(reason.to_string());
            }
        }
        if !self.disconnecting.swap(true, Ordering::AcqRel) {
            info!("disconnecting client {} ({}): {}", self.id, self.remote_addr, reason);
            self.sink.close();
        }
    }

    /// First authorized worker. Its vardiff controller drives the socket's
    /// announced difficulty; the other workers follow in lockstep.
    pub fn primary_worker(&self) -> Option<(String, String)> {
        self.workers.lock().first().cloned()
    }

    pub fn has_worker(&self, name: &str) -> bool {
        self.workers.lock().iter().any(|(worker, _)| worker == name)
    }

    /// Address bound to a worker name on this socket, if authorized.
    pub fn worker_address(&self, name: &str) -> Option<String> {
        self.workers.lock().iter().find(|(worker, _)| worker == name).map(|(_, address)| address.clone())
    }

    fn write_json<T: serde::Serialize>(&self, message: &T) -> Result<(), ErrorDisconnected> {
        if !self.connected() {
            return Err(ErrorDisconnected);
        }
        let mut line = serde_json::to_string(message).map_err(|_| ErrorDisconnected)?;
        line.push('\n');
        self.sink.send_line(line)
    }

    pub fn reply(&self, response: JsonRpcResponse) -> Result<(), ErrorDisconnected> {
        self.write_json(&response)
    }

    pub fn reply_result(&self, id: Value, result: Value) -> Result<(), ErrorDisconnected> {
        self.reply(JsonRpcResponse::result(id, result))
    }

    pub fn reply_error(&self, id: Value, code: WireCode) -> Result<(), ErrorDisconnected> {
        self.reply(JsonRpcResponse::error(id, code))
    }

    pub fn notify(&self, method: &str, params: Vec<Value>) -> Result<(), ErrorDisconnected> {
        self.write_json(&JsonRpcNotification::new(method, params))
    }
}

/// All live connections, keyed by connection id.
#[derive(Default)]
pub struct ClientRegistry {
    clients: Mutex<std::collections::HashMap<u64, Arc<StratumContext>>>,
    next_id: AtomicU64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert(&self, ctx: Arc<StratumContext>) {
        self.clients.lock().insert(ctx.id, ctx);
    }

    pub fn remove(&self, id: u64) {
        self.clients.lock().remove(&id);
    }

    pub fn snapshot(&self) -> Vec<Arc<StratumContext>> {
        self.clients.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }

    /// Gracefully close every socket hosting the given worker.
    pub fn close_worker_sockets(&self, address: &str, worker_name: &str, reason: &str) {
        for ctx in self.snapshot() {
            if ctx.worker_address(worker_name).as_deref() == Some(address) {
                ctx.disconnect(reason);
            }
        }
    }

    /// Close every connection (shutdown path).
    pub fn close_all(&self, reason: &str) {
        for ctx in self.snapshot() {
            ctx.disconnect(reason);
        }
    }
}
