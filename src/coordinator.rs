//! Wires the registry, shares manager, handler and listeners together, fans
//! new jobs out to subscribed sockets, and owns the periodic tasks and the
//! shutdown path.

use crate::config::PoolConfig;
use crate::job_encoding::{encode_job, JobEncoding};
use crate::metrics;
use crate::shares_manager::SharesManager;
use crate::stratum_context::ClientRegistry;
use crate::stratum_handler::StratumHandler;
use crate::stratum_listener::StratumListener;
use crate::template_registry::{JobNotification, TemplateRegistry};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub struct StratumCoordinator {
    pub registry: Arc<TemplateRegistry>,
    pub shares: Arc<SharesManager>,
    pub clients: Arc<ClientRegistry>,
    pub handler: Arc<StratumHandler>,
    config: Arc<PoolConfig>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl StratumCoordinator {
    pub fn new(registry: Arc<TemplateRegistry>, config: Arc<PoolConfig>) -> Arc<Self> {
        let shares = Arc::new(SharesManager::new(Arc::clone(&registry), config.vardiff_params()));
        let clients = Arc::new(ClientRegistry::new());
        let handler = Arc::new(StratumHandler::new(Arc::clone(&shares), Arc::clone(&registry), Arc::clone(&config)));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            registry,
            shares,
            clients,
            handler,
            config,
            shutdown_tx,
            shutdown_rx,
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Start the periodic tasks and the job fan-out loop.
    pub fn start(self: &Arc<Self>) {
        if self.config.var_diff {
            self.tasks.lock().push(self.shares.start_vardiff_task());
        }
        if self.config.print_stats {
            self.tasks.lock().push(self.shares.start_stats_reporter(Arc::clone(&self.clients)));
        }

        let coordinator = Arc::clone(self);
        let mut jobs = self.registry.register();
        let mut shutdown = self.shutdown_rx.clone();
        self.tasks.lock().push(tokio::spawn(async move {
            loop {
                let notification = tokio::select! {
                    notification = jobs.recv() => notification,
                    _ = shutdown.changed() => return,
                };
                match notification {
                    Some(notification) => coordinator.fan_out(&notification).await,
                    None => return,
                }
            }
        }));
    }

    /// Build one listener per configured port; each runs to completion on its
    /// own task via the caller.
    pub fn listeners(self: &Arc<Self>) -> Vec<StratumListener> {
        self.config
            .ports
            .iter()
            .map(|&port| {
                StratumListener::new(
                    port,
                    Arc::clone(&self.handler),
                    Arc::clone(&self.clients),
                    Arc::clone(&self.shares),
                    self.shutdown_rx.clone(),
                )
            })
            .collect()
    }

    /// Deliver one job to every subscribed socket. Payloads are derived once
    /// per encoding; vardiff results are announced before the job so the
    /// first share is mined at the new difficulty.
    pub async fn fan_out(&self, notification: &JobNotification) {
        let big_header = encode_job(JobEncoding::BigHeader, &notification.job_id, &notification.pre_pow_hash, notification.timestamp);
        let bitmain = encode_job(JobEncoding::Bitmain, &notification.job_id, &notification.pre_pow_hash, notification.timestamp);

        let mut delivered = 0usize;
        for ctx in self.clients.snapshot() {
            if !ctx.connected() {
                self.clients.remove(ctx.id);
                continue;
            }
            if !ctx.subscribed.load(std::sync::atomic::Ordering::Acquire) {
                continue;
            }

            // One difficulty per socket: the primary worker's controller
            // output is what gets announced, and every worker on the socket
            // is brought back in lockstep with it (re-arming any tracker the
            // controller left disarmed).
            let workers = ctx.workers.lock().clone();
            if let Some((primary_name, primary_address)) = workers.first() {
                let mut vardiff_on = false;
                for (name, address) in &workers {
                    if self.shares.worker_vardiff_enabled(address, name).await {
                        vardiff_on = true;
                        break;
                    }
                }
                if vardiff_on {
                    if let Some(target_diff) = self.shares.worker_min_diff(primary_address, primary_name).await {
                        let current = *ctx.difficulty.lock();
                        if target_diff > 0.0 && target_diff != current {
                            debug!("connection {}: difficulty {} -> {}", ctx.id, current, target_diff);
                            if ctx.notify("mining.set_difficulty", vec![json!(target_diff)]).is_err() {
                                continue;
                            }
                            *ctx.difficulty.lock() = target_diff;
                        }
                        let announced = *ctx.difficulty.lock();
                        self.shares.sync_socket_difficulty(&workers, announced).await;
                    }
                }
                for (name, address) in &workers {
                    metrics::record_job_sent(address, name);
                }
            }

            let params = match *ctx.encoding.lock() {
                JobEncoding::BigHeader => big_header.clone(),
                JobEncoding::Bitmain => bitmain.clone(),
            };
            if ctx.notify("mining.notify", params).is_ok() {
                delivered += 1;
            }
        }
        debug!("job {} delivered to {} subscribers", notification.job_id, delivered);
    }

    /// Graceful shutdown: stop accepting, cancel periodic tasks, close every
    /// socket with a reason. In-flight submits finish on their own time.
    pub fn shutdown(&self) {
        info!("stratum coordinator shutting down");
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.clients.close_all("server shutdown");
    }
}
