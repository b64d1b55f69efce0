use clap::Parser;
use futures::Stream;
use sluice_core::proto::{FILE_DESCRIPTOR_SET, ingestion_server::IngestionServer};
use sluice_server::server::{
    config::{CliArgs, ServerConfig},
    lifecycle::{ServeExit, serve_with_grace},
    service::handler::IngestionService,
    telemetry::{TelemetryProviders, init_telemetry},
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::server::Connected;
use tonic::{codec::CompressionEncoding, transport::Server};
use tonic_health::server::HealthReporter;
use tonic_reflection::server::Builder;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;

    if config.uds {
        #[cfg(unix)]
        {
            use tokio::net::UnixListener;
            use tokio_stream::wrappers::UnixListenerStream;
            let uds_path = config.server_addr.clone();
            let uds = UnixListener::bind(&uds_path)?;
            let incoming = UnixListenerStream::new(uds);
            log_startup_info(&uds_path, &config);
            let res = run_server_with_incoming(providers, incoming, config).await;
            // A panic can still leave the socket file behind.
            let _ = std::fs::remove_file(&uds_path);
            res
        }
        #[cfg(not(unix))]
        {
            anyhow::bail!("Unix domain sockets are not supported on this platform");
        }
    } else {
        let tcp_path = config.server_addr.clone();
        let tcp = TcpListener::bind(&tcp_path).await?;
        let incoming = TcpListenerStream::new(tcp);
        log_startup_info(&tcp_path, &config);
        run_server_with_incoming(providers, incoming, config).await
    }
}

async fn run_server_with_incoming<I, IO, IE>(
    providers: TelemetryProviders,
    incoming: I,
    config: ServerConfig,
) -> anyhow::Result<()>
where
    I: Stream<Item = Result<IO, IE>>,
    IO: AsyncRead + AsyncWrite + Connected + Unpin + Send + 'static,
    IE: Into<tower::BoxError>,
{
    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<IngestionServer<IngestionService>>()
        .await;

    let service = IngestionService::new(config.clone());

    let reflection = Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build_v1()?;

    let shutdown = CancellationToken::new();
    let serve = Server::builder()
        .http2_adaptive_window(Some(true))
        .http2_keepalive_interval(Some(config.keepalive_interval))
        .http2_keepalive_timeout(Some(config.keepalive_timeout))
        .max_concurrent_streams(Some(config.max_concurrent_streams))
        .add_service(health_service)
        .add_service(reflection)
        .add_service(build_ingestion_service(service.clone(), &config))
        .serve_with_incoming_shutdown(
            incoming,
            shutdown_signal(service, health_reporter, shutdown.clone()),
        );

    let exit = serve_with_grace(serve, &shutdown, config.shutdown_timeout).await;

    // Flush exporters however the server ended.
    providers.shutdown();

    match exit? {
        ServeExit::Drained => tracing::info!("Service shut down successfully"),
        ServeExit::Forced => tracing::warn!("Service shut down with streams still open"),
    }
    Ok(())
}

fn log_startup_info(addr: &str, config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!("Starting ingestion service on {addr} with full config: {config:#?}");
    } else {
        tracing::info!(
            "Starting ingestion service on {addr} (queues {}/{}, ceiling {} {:?}, {} workers per tier)",
            config.priority_capacity,
            config.normal_capacity,
            config.max_concurrent_tasks,
            config.limit_mode,
            config.num_workers
        );
    }
}

fn build_ingestion_service(
    service: IngestionService,
    config: &ServerConfig,
) -> IngestionServer<IngestionService> {
    IngestionServer::new(service)
        .max_decoding_message_size(config.max_message_size)
        .max_encoding_message_size(config.max_message_size)
        .send_compressed(CompressionEncoding::Zstd)
        .send_compressed(CompressionEncoding::Gzip)
        .send_compressed(CompressionEncoding::Deflate)
        .accept_compressed(CompressionEncoding::Zstd)
        .accept_compressed(CompressionEncoding::Gzip)
        .accept_compressed(CompressionEncoding::Deflate)
}

async fn shutdown_signal(
    service: IngestionService,
    health_reporter: HealthReporter,
    shutdown: CancellationToken,
) {
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

    tracing::info!("Shutdown signal received, terminating gracefully...");
    // Starts the grace period for open streams.
    shutdown.cancel();

    // 1. Publish the status
    health_reporter
        .set_not_serving::<IngestionServer<IngestionService>>()
        .await;

    // 2. Stop the batch workers and drain in-flight processing
    if let Err(e) = service.shutdown().await {
        tracing::error!("Error during service shutdown: {e:?}");
    }
}
