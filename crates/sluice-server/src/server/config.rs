use anyhow::bail;
use clap::{Parser, ValueEnum};
use core::time::Duration;
use sluice_core::types::{
    DEFAULT_KEEPALIVE_INTERVAL, DEFAULT_KEEPALIVE_TIMEOUT, DEFAULT_MAX_CONCURRENT_TASKS,
    DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_NORMAL_CAPACITY, DEFAULT_PRIORITY_CAPACITY,
};

/// How the concurrency ceiling is enforced.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LimitMode {
    /// Cool down once at the ceiling, then dispatch anyway. Concurrent
    /// dispatchers may overshoot the ceiling.
    #[default]
    Soft,
    /// Block dispatch until a processing slot frees up.
    Hard,
}

/// Runtime configuration for the `sluice-server` binary.
///
/// All values are parsed from CLI arguments or environment variables. The
/// defaults size the server for a small demo deployment.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "sluice-server",
    version,
    about = "A gRPC ingestion server with priority-aware admission and adaptive batching"
)]
pub struct CliArgs {
    /// Capacity of the priority admission queue.
    ///
    /// Items arriving while the queue is full are dropped and reported in the
    /// stream summary.
    ///
    /// Environment variable: `PRIORITY_CAPACITY`
    #[arg(long, env = "PRIORITY_CAPACITY", default_value_t = DEFAULT_PRIORITY_CAPACITY)]
    pub priority_capacity: usize,

    /// Capacity of the normal admission queue.
    ///
    /// Environment variable: `NORMAL_CAPACITY`
    #[arg(long, env = "NORMAL_CAPACITY", default_value_t = DEFAULT_NORMAL_CAPACITY)]
    pub normal_capacity: usize,

    /// Ceiling on concurrently running batch processing tasks, shared by both
    /// tiers.
    ///
    /// Environment variable: `MAX_CONCURRENT_TASKS`
    #[arg(long, env = "MAX_CONCURRENT_TASKS", default_value_t = DEFAULT_MAX_CONCURRENT_TASKS)]
    pub max_concurrent_tasks: usize,

    /// Whether the ceiling is a soft target (cooldown, then overshoot) or a
    /// hard bound.
    ///
    /// Environment variable: `LIMIT_MODE`
    #[arg(long, env = "LIMIT_MODE", value_enum, default_value_t = LimitMode::Soft)]
    pub limit_mode: LimitMode,

    /// Number of batch workers draining each tier's queue.
    ///
    /// Environment variable: `NUM_WORKERS`
    #[arg(long, env = "NUM_WORKERS", default_value_t = 1)]
    pub num_workers: usize,

    /// Simulated processing cost per item, in milliseconds.
    ///
    /// Environment variable: `ITEM_LATENCY_MS`
    #[arg(long, env = "ITEM_LATENCY_MS", default_value_t = 50)]
    pub item_latency_ms: u64,

    /// Simulated downstream delivery latency per batch, in milliseconds.
    ///
    /// Environment variable: `DOWNSTREAM_LATENCY_MS`
    #[arg(long, env = "DOWNSTREAM_LATENCY_MS", default_value_t = 300)]
    pub downstream_latency_ms: u64,

    /// Largest accepted or emitted gRPC message, in bytes.
    ///
    /// Environment variable: `MAX_MESSAGE_SIZE`
    #[arg(long, env = "MAX_MESSAGE_SIZE", default_value_t = DEFAULT_MAX_MESSAGE_SIZE)]
    pub max_message_size: usize,

    /// Maximum concurrent HTTP/2 streams per client connection.
    ///
    /// Environment variable: `MAX_CONCURRENT_STREAMS`
    #[arg(long, env = "MAX_CONCURRENT_STREAMS", default_value_t = 50)]
    pub max_concurrent_streams: u32,

    /// Interval between HTTP/2 keepalive pings, in seconds.
    ///
    /// Environment variable: `KEEPALIVE_INTERVAL_SECS`
    #[arg(long, env = "KEEPALIVE_INTERVAL_SECS", default_value_t = DEFAULT_KEEPALIVE_INTERVAL.as_secs())]
    pub keepalive_interval_secs: u64,

    /// How long to wait for a keepalive acknowledgement, in seconds.
    ///
    /// Environment variable: `KEEPALIVE_TIMEOUT_SECS`
    #[arg(long, env = "KEEPALIVE_TIMEOUT_SECS", default_value_t = DEFAULT_KEEPALIVE_TIMEOUT.as_secs())]
    pub keepalive_timeout_secs: u64,

    /// Grace period for in-flight processing tasks on shutdown, in seconds.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT`
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 30)]
    pub shutdown_timeout: u64,

    /// Address to listen on (TCP or Unix socket path; use --uds for Unix socket).
    ///
    /// Example: "0.0.0.0:50051" or "/tmp/sluice.sock"
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:50051"))]
    pub server_addr: String,

    /// Listen on a Unix socket instead of TCP. If set, `SERVER_ADDR` must be a file path.
    #[arg(short, long, default_value_t = false)]
    pub uds: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub priority_capacity: usize,
    pub normal_capacity: usize,
    pub max_concurrent_tasks: usize,
    pub limit_mode: LimitMode,
    pub num_workers: usize,
    pub item_latency: Duration,
    pub downstream_latency: Duration,
    pub max_message_size: usize,
    pub max_concurrent_streams: u32,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub server_addr: String,
    pub uds: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            priority_capacity: DEFAULT_PRIORITY_CAPACITY,
            normal_capacity: DEFAULT_NORMAL_CAPACITY,
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
            limit_mode: LimitMode::Soft,
            num_workers: 1,
            item_latency: Duration::from_millis(50),
            downstream_latency: Duration::from_millis(300),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_concurrent_streams: 50,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            keepalive_timeout: DEFAULT_KEEPALIVE_TIMEOUT,
            shutdown_timeout: Duration::from_secs(30),
            server_addr: String::from("0.0.0.0:50051"),
            uds: false,
        }
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.priority_capacity == 0 {
            bail!("PRIORITY_CAPACITY must be greater than 0");
        }
        if args.normal_capacity == 0 {
            bail!("NORMAL_CAPACITY must be greater than 0");
        }
        if args.max_concurrent_tasks == 0 {
            bail!("MAX_CONCURRENT_TASKS must be greater than 0");
        }
        if args.num_workers == 0 {
            bail!("NUM_WORKERS must be greater than 0");
        }
        if args.max_message_size == 0 {
            bail!("MAX_MESSAGE_SIZE must be greater than 0");
        }
        if args.max_concurrent_streams == 0 {
            bail!("MAX_CONCURRENT_STREAMS must be greater than 0");
        }

        Ok(Self {
            priority_capacity: args.priority_capacity,
            normal_capacity: args.normal_capacity,
            max_concurrent_tasks: args.max_concurrent_tasks,
            limit_mode: args.limit_mode,
            num_workers: args.num_workers,
            item_latency: Duration::from_millis(args.item_latency_ms),
            downstream_latency: Duration::from_millis(args.downstream_latency_ms),
            max_message_size: args.max_message_size,
            max_concurrent_streams: args.max_concurrent_streams,
            keepalive_interval: Duration::from_secs(args.keepalive_interval_secs),
            keepalive_timeout: Duration::from_secs(args.keepalive_timeout_secs),
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
            server_addr: args.server_addr,
            uds: args.uds,
        })
    }
}
