//! TCP accept loop and line framing for miner connections.
//!
//! Each connection gets a reader task (serialising its own message stream)
//! and a writer task fed by the context's outbound queue. Framing violations
//! cost the peer its connection with the reason stamped into the context.

use crate::constants::{MAX_PENDING_LINE_BYTES, READ_BUFFER_SIZE, WRITE_TIMEOUT};
use crate::errors::ProtocolError;
use crate::jsonrpc_event::unmarshal_event;
use crate::shares_manager::SharesManager;
use crate::stratum_context::{ChannelSink, ClientRegistry, MessageSink, StratumContext};
use crate::stratum_handler::StratumHandler;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

pub struct StratumListener {
    pub port: u16,
    handler: Arc<StratumHandler>,
    clients: Arc<ClientRegistry>,
    shares: Arc<SharesManager>,
    shutdown: watch::Receiver<bool>,
}

impl StratumListener {
    pub fn new(
        port: u16,
        handler: Arc<StratumHandler>,
        clients: Arc<ClientRegistry>,
        shares: Arc<SharesManager>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self { port, handler, clients, shares, shutdown }
    }

    /// Bind and serve. A bind failure is fatal and propagates to the caller.
    pub async fn listen(self) -> std::io::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.port)).await?;
        info!("stratum listener started on port {}", self.port);
        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener.
    pub async fn serve(mut self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = self.shutdown.changed() => {
                    info!("port {}: stopping accept loop for shutdown", self.port);
                    return Ok(());
                }
            };
            match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    self.spawn_connection(stream, peer.to_string());
                }
                Err(e) => {
                    // Transient accept errors (fd exhaustion and friends);
                    // the listener itself is still healthy.
                    error!("port {}: failed to accept connection: {}", self.port, e);
                }
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, peer: String) {
        let id = self.clients.next_id();
        debug!("connection {} open from {} on port {}", id, peer, self.port);

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let sink = Arc::new(ChannelSink::new(tx));
        let ctx = StratumContext::new(id, self.port, peer, sink as Arc<dyn MessageSink>);
        self.clients.insert(Arc::clone(&ctx));

        tokio::spawn(writer_task(write_half, rx, Arc::clone(&ctx)));

        let handler = Arc::clone(&self.handler);
        let clients = Arc::clone(&self.clients);
        let shares = Arc::clone(&self.shares);
        tokio::spawn(async move {
            read_loop(Arc::clone(&ctx), read_half, handler).await;
            // Whatever ended the loop stamped its reason first; this is the
            // fallback for a silent peer close.
            ctx.disconnect("connection closed");
            let workers = ctx.workers.lock().clone();
            shares.remove_connection(ctx.id, &workers).await;
            clients.remove(ctx.id);
            info!(
                "connection {} ({}) closed: {}",
                ctx.id,
                ctx.remote_addr,
                ctx.close_reason.lock().as_deref().unwrap_or("unknown")
            );
        });
    }
}

/// Drain the outbound queue onto the socket. An empty line is the close
/// marker from the sink.
async fn writer_task(
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<String>,
    ctx: Arc<StratumContext>,
) {
    while let Some(line) = rx.recv().await {
        if line.is_empty() {
            break;
        }
        match tokio::time::timeout(WRITE_TIMEOUT, write_half.write_all(line.as_bytes())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                ctx.disconnect(&format!("write error: {e}"));
                break;
            }
            Err(_) => {
                ctx.disconnect("write timeout");
                break;
            }
        }
    }
    let _ = write_half.shutdown().await;
}

async fn read_loop(ctx: Arc<StratumContext>, mut read_half: tokio::net::tcp::OwnedReadHalf, handler: Arc<StratumHandler>) {
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    let mut pending: Vec<u8> = Vec::new();

    'connection: while ctx.connected() {
        let n = match read_half.read(&mut buffer).await {
            Ok(0) => {
                ctx.disconnect("client closed connection");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                ctx.disconnect(&format!("read error: {e}"));
                break;
            }
        };
        ctx.touch();
        pending.extend_from_slice(&buffer[..n]);

        while let Some(line) = drain_line(&mut pending) {
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let event = match unmarshal_event(line) {
                Ok(event) => event,
                Err(e) => {
                    warn!("connection {}: dropping client over bad frame: {}", ctx.id, e);
                    ctx.disconnect(&format!("malformed line: {e}"));
                    break 'connection;
                }
            };
            if let Err(e) = handler.handle_event(&ctx, event).await {
                match &e {
                    ProtocolError::UnknownMethod(method) => {
                        warn!("connection {}: unknown method '{}'", ctx.id, method);
                    }
                    ProtocolError::Malformed(reason) => {
                        warn!("connection {}: malformed request: {}", ctx.id, reason);
                    }
                    ProtocolError::Disconnected => {}
                }
                ctx.disconnect(&e.to_string());
                break 'connection;
            }
        }

        if pending.len() > MAX_PENDING_LINE_BYTES {
            ctx.disconnect("line buffer exceeded without newline");
            break;
        }
    }
}

/// Pop one newline-terminated line off the accumulator, if present.
fn drain_line(pending: &mut Vec<u8>) -> Option<Vec<u8>> {
    let pos = pending.iter().position(|&b| b == b'\n')?;
    let mut line: Vec<u8> = pending.drain(..=pos).collect();
    line.pop();
    Some(line)
}
