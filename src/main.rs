use anyhow::Context;
use clap::Parser;
use kaspa_stratum_pool::config::PoolConfig;
use kaspa_stratum_pool::coordinator::StratumCoordinator;
use kaspa_stratum_pool::metrics;
use kaspa_stratum_pool::pow::NativePowBackend;
use kaspa_stratum_pool::template_registry::TemplateRegistry;
use kaspa_stratum_pool::template_source::{run_template_feed, FeedSubmitter};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "kaspa-stratum-pool", about = "Stratum server and share-processing core for a Kaspa mining pool")]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Stratum listen ports (overrides the config file)
    #[arg(long, value_delimiter = ',')]
    ports: Option<Vec<u16>>,

    /// Template feed address (host:port of the upstream fetcher)
    #[arg(long)]
    template_feed: Option<String>,

    /// Default share difficulty for new workers
    #[arg(long)]
    initial_difficulty: Option<f64>,

    /// Target shares per minute for the vardiff controller
    #[arg(long)]
    shares_per_min: Option<u32>,

    /// Enable/disable variable difficulty
    #[arg(long)]
    var_diff: Option<bool>,

    /// Clamp vardiff-chosen difficulties to powers of two
    #[arg(long)]
    pow2_clamp: Option<bool>,

    /// Extranonce prefix size in bytes (0..=3)
    #[arg(long)]
    extranonce_size: Option<u8>,

    /// Log filter (overrides the config file; RUST_LOG wins over both)
    #[arg(long)]
    log_level: Option<String>,
}

fn load_config(args: &Args) -> anyhow::Result<PoolConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let content = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            PoolConfig::from_yaml(&content).map_err(|e| anyhow::anyhow!("{e}"))?
        }
        None => PoolConfig::default(),
    };

    if let Some(ports) = &args.ports {
        config.ports = ports.clone();
    }
    if let Some(feed) = &args.template_feed {
        config.template_feed = feed.clone();
    }
    if let Some(diff) = args.initial_difficulty {
        config.initial_difficulty = diff;
    }
    if let Some(spm) = args.shares_per_min {
        config.shares_per_min = spm;
    }
    if let Some(var_diff) = args.var_diff {
        config.var_diff = var_diff;
    }
    if let Some(clamp) = args.pow2_clamp {
        config.pow2_clamp = clamp;
    }
    if let Some(size) = args.extranonce_size {
        config.extranonce_size = size;
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
    config.validate().map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(config)
}

fn init_tracing(config: &PoolConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);

    if config.log_to_file {
        let appender = tracing_appender::rolling::daily("logs", "stratum-pool.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let file_layer = tracing_subscriber::fmt::layer().with_target(false).with_ansi(false).with_writer(writer);
        tracing_subscriber::registry().with(filter).with(stdout_layer).with(file_layer).init();
        Some(guard)
    } else {
        tracing_subscriber::registry().with(filter).with(stdout_layer).init();
        None
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Arc::new(load_config(&args)?);
    let _log_guard = init_tracing(&config);
    metrics::init_metrics();

    tracing::info!(
        "starting kaspa-stratum-pool on ports {:?} (diff {} in [{}, {}], vardiff {}, feed {})",
        config.ports,
        config.initial_difficulty,
        config.min_difficulty,
        config.max_difficulty,
        config.var_diff,
        config.template_feed
    );

    let submitter = Arc::new(FeedSubmitter::new(config.submit_endpoint().to_string()));
    let registry = Arc::new(TemplateRegistry::new(Arc::new(NativePowBackend), submitter, config.template_cache_size));
    let coordinator = StratumCoordinator::new(Arc::clone(&registry), Arc::clone(&config));
    coordinator.start();

    tokio::spawn(run_template_feed(config.template_feed.clone(), Arc::clone(&registry), coordinator.shutdown_signal()));

    let mut listeners = Vec::new();
    for listener in coordinator.listeners() {
        listeners.push(tokio::spawn(listener.listen()));
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received");
        }
        result = futures_util::future::try_join_all(&mut listeners) => {
            // A listener only returns early on a fatal bind/serve error.
            for join in result.context("listener task panicked")? {
                join.context("stratum listener failed")?;
            }
        }
    }

    coordinator.shutdown();
    Ok(())
}
