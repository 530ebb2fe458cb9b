//! Standalone egress queue worker.
//!
//! Runs independently from the web tier: consumes a tenant instance's
//! outbound stream and delivers via the provider API. With `--discover`,
//! instances are picked up dynamically over pub/sub instead of being named
//! on the command line.
//!
//! Environment: REDIS_URL, EVOLUTION_API_URL (or EVOLUTION_SERVER_URL),
//! EVOLUTION_API_KEY, plus the WA_* tunables.

use clap::Parser;
use redis::aio::ConnectionManager;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use concierge_core::config::ProviderConfig;
use concierge_core::ConciergeConfig;
use concierge_core::types::InstanceName;
use concierge_egress::client::ProviderClient;
use concierge_egress::config::EgressConfig;
use concierge_egress::limiter::TokenBucket;
use concierge_egress::pubsub::WorkerSupervisor;
use concierge_egress::worker::EgressWorker;

#[derive(Parser, Debug)]
#[command(name = "concierge-worker", about = "WhatsApp egress queue worker")]
struct Args {
    /// Tenant instance to process. Falls back to INSTANCE_NAME.
    instance: Option<String>,

    /// Discover instances over pub/sub instead of naming one.
    #[arg(long)]
    discover: bool,

    /// Unique consumer name (auto-generated if not set).
    #[arg(long)]
    consumer_name: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // concierge.toml fills in anything the environment leaves out.
    let file_config = ConciergeConfig::load(None).unwrap_or_else(|e| {
        warn!(error = %e, "config file unreadable, using defaults");
        ConciergeConfig::default()
    });

    let redis_url = std::env::var("REDIS_URL").unwrap_or(file_config.redis.url);
    let mut provider_config = ProviderConfig::from_env();
    if provider_config.api_key.is_empty() {
        provider_config = file_config.provider;
    }
    if provider_config.api_key.is_empty() {
        error!("EVOLUTION_API_KEY is not set (env or concierge.toml [provider])");
        std::process::exit(1);
    }
    let egress_config = EgressConfig::from_env();

    // Log connection targets without credentials.
    let redis_host = redis_url.split('@').next_back().unwrap_or("configured");
    info!(redis = redis_host, provider = %provider_config.base_url, "egress worker starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx);

    if args.discover {
        let supervisor = WorkerSupervisor::new(&redis_url, provider_config, egress_config);
        if let Err(e) = supervisor.run(shutdown_rx).await {
            error!(error = %e, "supervisor failed");
            std::process::exit(1);
        }
        return;
    }

    let instance = match args.instance.or_else(|| std::env::var("INSTANCE_NAME").ok()) {
        Some(name) => InstanceName::new(&name),
        None => {
            error!("no instance given: pass one as an argument, set INSTANCE_NAME, or use --discover");
            std::process::exit(1);
        }
    };

    let worker = match build_worker(&redis_url, &provider_config, &egress_config, instance, args.consumer_name).await {
        Ok(worker) => worker,
        Err(e) => {
            error!(error = %e, "failed to initialise worker");
            std::process::exit(1);
        }
    };

    info!("worker initialised, entering loop (Ctrl+C to stop)");
    worker.run(shutdown_rx).await;

    let stats = worker.stats();
    info!(
        processed = stats.processed,
        failed = stats.failed,
        "worker stopped cleanly"
    );
}

async fn build_worker(
    redis_url: &str,
    provider_config: &ProviderConfig,
    egress_config: &EgressConfig,
    instance: InstanceName,
    consumer_name: Option<String>,
) -> concierge_egress::Result<EgressWorker> {
    let client = redis::Client::open(redis_url)?;
    let conn = ConnectionManager::new(client).await?;
    let limiter = TokenBucket::connect(
        redis_url,
        instance.clone(),
        egress_config.tokens_per_second,
        egress_config.bucket_capacity,
    )
    .await?;
    let provider = ProviderClient::new(provider_config)?;
    Ok(EgressWorker::new(
        conn,
        limiter,
        provider,
        instance,
        egress_config.clone(),
        consumer_name,
    ))
}

/// Flip the shutdown signal on SIGINT/SIGTERM. Workers observe it, stop
/// reading, drain in-flight sends, then exit.
fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });
}
