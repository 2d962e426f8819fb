//! Runtime configuration.

use std::time::Duration;

use crate::downstream::ServiceEndpoints;
use crate::retry::Backoff;
use crate::transport::TransportKind;

/// Configuration for the orchestrator and its collaborators. Built from
/// defaults, the environment, or assembled by hand in tests.
#[derive(Debug, Clone)]
pub struct Config {
    /// sqlx connection string for the status store.
    pub database_url: String,

    /// Base URLs for the downstream compute services.
    pub endpoints: ServiceEndpoints,

    /// Timeout for one downstream call.
    pub downstream_timeout: Duration,

    /// Which transport to wire up at startup.
    pub transport: TransportKind,

    /// Broker base URL (HTTP poll transport only).
    pub broker_url: String,

    /// Topic and consumer group names.
    pub topic: String,
    pub consumer_group: String,

    /// How long one consumer poll waits for messages.
    pub poll_wait: Duration,

    /// Delay before an uncommitted message is redelivered (in-memory
    /// transport only).
    pub redelivery_delay: Duration,

    /// Partition count for the in-memory transport.
    pub partitions: u32,

    /// Backoff for transport connection establishment and poll retries.
    pub connect_backoff: Backoff,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".into(),
            endpoints: ServiceEndpoints::default(),
            downstream_timeout: crate::downstream::DEFAULT_TIMEOUT,
            transport: TransportKind::InMemory,
            broker_url: "http://eventhubs-emulator:8080".into(),
            topic: "orchestrator-events".into(),
            consumer_group: "orchestrator-consumer-group".into(),
            poll_wait: Duration::from_secs(1),
            redelivery_delay: Duration::from_millis(500),
            partitions: 4,
            connect_backoff: Backoff::default(),
        }
    }
}

impl Config {
    /// Build a configuration from `CONFLUX_*` environment variables,
    /// falling back to the defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let endpoints = ServiceEndpoints {
            revenue: env_or("CONFLUX_REVENUE_URL", defaults.endpoints.revenue),
            rebates: env_or("CONFLUX_REBATES_URL", defaults.endpoints.rebates),
            specialty: env_or("CONFLUX_SPECIALTY_URL", defaults.endpoints.specialty),
        };
        let transport = match std::env::var("CONFLUX_TRANSPORT").as_deref() {
            Ok("http") => TransportKind::HttpPoll,
            _ => TransportKind::InMemory,
        };

        Self {
            database_url: env_or("CONFLUX_DATABASE_URL", defaults.database_url),
            endpoints,
            downstream_timeout: env_secs("CONFLUX_HTTP_TIMEOUT_SECS", defaults.downstream_timeout),
            transport,
            broker_url: env_or("CONFLUX_BROKER_URL", defaults.broker_url),
            topic: env_or("CONFLUX_TOPIC", defaults.topic),
            consumer_group: env_or("CONFLUX_CONSUMER_GROUP", defaults.consumer_group),
            poll_wait: env_secs("CONFLUX_POLL_WAIT_SECS", defaults.poll_wait),
            redelivery_delay: defaults.redelivery_delay,
            partitions: env_parse("CONFLUX_PARTITIONS", defaults.partitions),
            connect_backoff: defaults.connect_backoff,
        }
    }
}

fn env_or(name: &str, default: String) -> String {
    std::env::var(name).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn env_secs(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
