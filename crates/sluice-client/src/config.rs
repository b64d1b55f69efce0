use anyhow::bail;
use clap::Parser;
use core::time::Duration;
use sluice_core::types::{
    DEFAULT_KEEPALIVE_INTERVAL, DEFAULT_KEEPALIVE_TIMEOUT, DEFAULT_MAX_MESSAGE_SIZE,
    DEFAULT_POOL_SIZE,
};

/// Runtime configuration for the `sluice-producer` binary.
///
/// Connection settings configure the [`StreamPool`](crate::pool::StreamPool);
/// the remaining flags shape the synthetic load.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "sluice-producer",
    version,
    about = "Streams synthetic work items to a sluice ingestion server"
)]
pub struct ProducerArgs {
    /// Server address as `host:port`. The host may resolve to several
    /// replicas; streams are spread over all of them.
    ///
    /// Environment variable: `GRPC_SERVER`
    #[arg(long, env = "GRPC_SERVER", default_value_t = String::from("localhost:50051"))]
    pub grpc_server: String,

    /// Number of concurrently open write streams.
    ///
    /// Environment variable: `POOL_SIZE`
    #[arg(long, env = "POOL_SIZE", default_value_t = DEFAULT_POOL_SIZE)]
    pub pool_size: usize,

    /// Largest gRPC message sent or accepted, in bytes.
    ///
    /// Environment variable: `MAX_MESSAGE_SIZE`
    #[arg(long, env = "MAX_MESSAGE_SIZE", default_value_t = DEFAULT_MAX_MESSAGE_SIZE)]
    pub max_message_size: usize,

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

    /// Timeout for establishing each replica connection, in milliseconds.
    ///
    /// Environment variable: `CONNECT_TIMEOUT_MS`
    #[arg(long, env = "CONNECT_TIMEOUT_MS", default_value_t = 1_000)]
    pub connect_timeout_ms: u64,

    /// Time box for re-initializing the pool on the upload path, in
    /// milliseconds. Items are dropped when it elapses.
    ///
    /// Environment variable: `INIT_TIMEOUT_MS`
    #[arg(long, env = "INIT_TIMEOUT_MS", default_value_t = 100)]
    pub init_timeout_ms: u64,

    /// Items buffered per stream before a write waits.
    ///
    /// Environment variable: `STREAM_BUFFER_SIZE`
    #[arg(long, env = "STREAM_BUFFER_SIZE", default_value_t = 64)]
    pub stream_buffer_size: usize,

    /// Items successfully written per burst.
    ///
    /// Environment variable: `MAX_MESSAGES`
    #[arg(long, env = "MAX_MESSAGES", default_value_t = 300)]
    pub max_messages: u64,

    /// Pause before each write, in milliseconds.
    ///
    /// Environment variable: `SEND_INTERVAL_MS`
    #[arg(long, env = "SEND_INTERVAL_MS", default_value_t = 5)]
    pub send_interval_ms: u64,

    /// Fraction of generated items flagged as priority, in `[0, 1]`.
    ///
    /// Environment variable: `PRIORITY_RATIO`
    #[arg(long, env = "PRIORITY_RATIO", default_value_t = 0.3)]
    pub priority_ratio: f64,

    /// Number of bursts to run; 0 runs until interrupted.
    ///
    /// Environment variable: `BURSTS`
    #[arg(long, env = "BURSTS", default_value_t = 1)]
    pub bursts: u64,
}

/// Connection settings of a [`StreamPool`](crate::pool::StreamPool).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: String,
    pub pool_size: usize,
    pub max_message_size: usize,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    pub connect_timeout: Duration,
    pub init_timeout: Duration,
    pub stream_buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: String::from("localhost:50051"),
            pool_size: DEFAULT_POOL_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            keepalive_timeout: DEFAULT_KEEPALIVE_TIMEOUT,
            connect_timeout: Duration::from_secs(1),
            init_timeout: Duration::from_millis(100),
            stream_buffer_size: 64,
        }
    }
}

/// Shape of the synthetic load.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub max_messages: u64,
    pub send_interval: Duration,
    pub priority_ratio: f64,
    /// `None` runs bursts until interrupted.
    pub bursts: Option<u64>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            max_messages: 300,
            send_interval: Duration::from_millis(5),
            priority_ratio: 0.3,
            bursts: Some(1),
        }
    }
}

impl TryFrom<&ProducerArgs> for ClientConfig {
    type Error = anyhow::Error;

    fn try_from(args: &ProducerArgs) -> Result<Self, Self::Error> {
        if args.pool_size == 0 {
            bail!("POOL_SIZE must be greater than 0");
        }
        if args.max_message_size == 0 {
            bail!("MAX_MESSAGE_SIZE must be greater than 0");
        }
        if args.stream_buffer_size == 0 {
            bail!("STREAM_BUFFER_SIZE must be greater than 0");
        }

        Ok(Self {
            server_addr: args.grpc_server.clone(),
            pool_size: args.pool_size,
            max_message_size: args.max_message_size,
            keepalive_interval: Duration::from_secs(args.keepalive_interval_secs),
            keepalive_timeout: Duration::from_secs(args.keepalive_timeout_secs),
            connect_timeout: Duration::from_millis(args.connect_timeout_ms),
            init_timeout: Duration::from_millis(args.init_timeout_ms),
            stream_buffer_size: args.stream_buffer_size,
        })
    }
}

impl TryFrom<&ProducerArgs> for ProducerConfig {
    type Error = anyhow::Error;

    fn try_from(args: &ProducerArgs) -> Result<Self, Self::Error> {
        if !(0.0..=1.0).contains(&args.priority_ratio) {
            bail!(
                "PRIORITY_RATIO must be within [0, 1], got {}",
                args.priority_ratio
            );
        }

        Ok(Self {
            max_messages: args.max_messages,
            send_interval: Duration::from_millis(args.send_interval_ms),
            priority_ratio: args.priority_ratio,
            bursts: (args.bursts > 0).then_some(args.bursts),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<(ClientConfig, ProducerConfig)> {
        let argv = core::iter::once("sluice-producer").chain(args.iter().copied());
        let args = ProducerArgs::try_parse_from(argv)?;
        Ok((
            ClientConfig::try_from(&args)?,
            ProducerConfig::try_from(&args)?,
        ))
    }

    #[test]
    fn defaults() {
        let (client, producer) = parse(&[]).unwrap();
        assert_eq!(client.server_addr, "localhost:50051");
        assert_eq!(client.pool_size, 6);
        assert_eq!(client.max_message_size, 52_428_800);
        assert_eq!(client.keepalive_interval, Duration::from_secs(30));
        assert_eq!(client.keepalive_timeout, Duration::from_secs(5));
        assert_eq!(client.init_timeout, Duration::from_millis(100));
        assert_eq!(producer.max_messages, 300);
        assert_eq!(producer.send_interval, Duration::from_millis(5));
        assert_eq!(producer.bursts, Some(1));
    }

    #[test]
    fn zero_bursts_means_unbounded() {
        let (_, producer) = parse(&["--bursts", "0"]).unwrap();
        assert_eq!(producer.bursts, None);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(parse(&["--pool-size", "0"]).is_err());
        assert!(parse(&["--max-message-size", "0"]).is_err());
        assert!(parse(&["--stream-buffer-size", "0"]).is_err());
        assert!(parse(&["--priority-ratio", "1.5"]).is_err());
    }
}
