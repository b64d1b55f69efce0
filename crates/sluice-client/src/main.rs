use clap::Parser;
use sluice_client::{
    config::{ClientConfig, ProducerArgs, ProducerConfig},
    pool::{GrpcConnector, StreamPool},
    producer,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = ProducerArgs::parse();
    let client_config = ClientConfig::try_from(&args)?;
    let producer_config = ProducerConfig::try_from(&args)?;

    init_logging()?;

    if cfg!(debug_assertions) {
        tracing::info!("Producer config: {client_config:#?} {producer_config:#?}");
    } else {
        tracing::info!(
            "Streaming to {} over {} streams",
            client_config.server_addr,
            client_config.pool_size
        );
    }

    let init_timeout = client_config.init_timeout;
    let pool = StreamPool::new(
        GrpcConnector::new(client_config.clone()),
        client_config.pool_size,
    );

    // Eager setup is best-effort; the upload path retries lazily.
    if let Err(e) = pool.initialize().await {
        tracing::warn!("Initial connection failed: {e}");
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    producer::run(&pool, &producer_config, init_timeout, &shutdown).await;

    // A burst cut short has already cleaned up; this covers an idle pool.
    let leftover = pool.cleanup().await;
    if !leftover.is_empty() {
        tracing::debug!("Closed {} idle streams", leftover.len());
    }

    tracing::info!("Producer finished");
    Ok(())
}

fn init_logging() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true),
        )
        .try_init()?;
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Stopping producer and closing streams...");
    shutdown.cancel();
}
