//! Configuration for the coordination core.
//!
//! Every field has a code default from [`crate::constants`]; `from_env`
//! overlays `LOGSHARD_*` environment variables and `validate` rejects
//! combinations that cannot work before any agent starts.

use std::collections::HashMap;
use std::time::Duration;

use crate::constants::{
    DEFAULT_COMMITTER_MAX_BATCH, DEFAULT_COMMITTER_MAX_INTERVAL, DEFAULT_COMMITTER_PARALLELISM,
    DEFAULT_ENTIRE_REPLAY_TIMEOUT, DEFAULT_FLUSH_INTERVAL, INIT_RETRY_BACKOFF,
    METADATA_POLL_INTERVAL, TRANSACTION_UNHEALTHY_AFTER,
};
use crate::error::{CoreError, CoreResult};
use crate::log::{HOST_AWARENESS_HOST, HOST_AWARENESS_PORT};
use crate::types::HostPort;

/// Transactional publisher tuning.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// How often pending writes are drained into one transaction.
    pub flush_interval: Duration,

    /// How often the state-store metadata cursor is polled.
    pub metadata_poll_interval: Duration,

    /// Backoff between transaction-initialization attempts.
    pub init_retry_backoff: Duration,

    /// An open transaction older than this marks the publisher DOWN.
    pub transaction_unhealthy_after: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            metadata_poll_interval: METADATA_POLL_INTERVAL,
            init_retry_backoff: INIT_RETRY_BACKOFF,
            transaction_unhealthy_after: TRANSACTION_UNHEALTHY_AFTER,
        }
    }
}

/// Offset committer tuning for the consumed stream.
#[derive(Debug, Clone)]
pub struct CommitterConfig {
    /// Offsets accumulated before a commit batch is flushed.
    pub max_batch: usize,

    /// Longest an offset waits before being committed.
    pub max_interval: Duration,

    /// Concurrent business-flow invocations feeding the committer.
    pub parallelism: usize,
}

impl Default for CommitterConfig {
    fn default() -> Self {
        Self {
            max_batch: DEFAULT_COMMITTER_MAX_BATCH,
            max_interval: DEFAULT_COMMITTER_MAX_INTERVAL,
            parallelism: DEFAULT_COMMITTER_PARALLELISM,
        }
    }
}

/// Replay orchestration tuning.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Upper bound on one entire stop-rewind-restart cycle.
    pub entire_replay_timeout: Duration,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            entire_replay_timeout: DEFAULT_ENTIRE_REPLAY_TIMEOUT,
        }
    }
}

/// Configuration for one node of the coordination core.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Log brokers, `host:port` each.
    pub brokers: Vec<String>,

    /// This node's advertised identity; used for assignment diffs and for
    /// the host-aware consumer properties.
    pub advertised: HostPort,

    /// Topic carrying domain events.
    pub events_topic: String,

    /// Compacted topic carrying entity state; also the tracked topic for
    /// partition assignments and entity partitioning.
    pub state_topic: String,

    /// Pin `client.id` / `group.instance.id` so restarts do not trigger a
    /// rebalance.
    pub reuse_consumer_id: bool,

    /// Start the router passive; no local regions until a routable command
    /// arrives.
    pub dr_standby_enabled: bool,

    /// Prefix for transactional ids. Must be unique per application
    /// cluster: two deployments sharing a prefix and topic will fence each
    /// other.
    pub transactional_id_prefix: String,

    pub publisher: PublisherConfig,
    pub committer: CommitterConfig,
    pub replay: ReplayConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            advertised: HostPort::new("localhost", 0),
            events_topic: "events".to_string(),
            state_topic: "state".to_string(),
            reuse_consumer_id: false,
            dr_standby_enabled: false,
            transactional_id_prefix: "logshard".to_string(),
            publisher: PublisherConfig::default(),
            committer: CommitterConfig::default(),
            replay: ReplayConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Build a configuration from `LOGSHARD_*` environment variables on top
    /// of the defaults, then validate it.
    ///
    /// Recognized variables:
    /// - `LOGSHARD_BROKERS`: comma-separated `host:port` list
    /// - `LOGSHARD_ADVERTISED_HOST` / `LOGSHARD_ADVERTISED_PORT`
    /// - `LOGSHARD_EVENTS_TOPIC` / `LOGSHARD_STATE_TOPIC`
    /// - `LOGSHARD_REUSE_CONSUMER_ID`: `true`/`false`
    /// - `LOGSHARD_DR_STANDBY`: `true`/`false`
    /// - `LOGSHARD_TRANSACTIONAL_ID_PREFIX`
    /// - `LOGSHARD_FLUSH_INTERVAL_MS`
    /// - `LOGSHARD_COMMITTER_MAX_BATCH` / `LOGSHARD_COMMITTER_MAX_INTERVAL_MS`
    ///   / `LOGSHARD_COMMITTER_PARALLELISM`
    /// - `LOGSHARD_REPLAY_TIMEOUT_SECS`
    pub fn from_env() -> CoreResult<Self> {
        let mut config = Self::default();

        if let Ok(brokers) = std::env::var("LOGSHARD_BROKERS") {
            config.brokers = brokers
                .split(',')
                .map(|b| b.trim().to_string())
                .filter(|b| !b.is_empty())
                .collect();
        }
        if let Ok(host) = std::env::var("LOGSHARD_ADVERTISED_HOST") {
            config.advertised.host = host;
        }
        config.advertised.port = env_parse("LOGSHARD_ADVERTISED_PORT", config.advertised.port)?;
        if let Ok(topic) = std::env::var("LOGSHARD_EVENTS_TOPIC") {
            config.events_topic = topic;
        }
        if let Ok(topic) = std::env::var("LOGSHARD_STATE_TOPIC") {
            config.state_topic = topic;
        }
        config.reuse_consumer_id =
            env_parse("LOGSHARD_REUSE_CONSUMER_ID", config.reuse_consumer_id)?;
        config.dr_standby_enabled = env_parse("LOGSHARD_DR_STANDBY", config.dr_standby_enabled)?;
        if let Ok(prefix) = std::env::var("LOGSHARD_TRANSACTIONAL_ID_PREFIX") {
            config.transactional_id_prefix = prefix;
        }
        config.publisher.flush_interval = env_parse_ms(
            "LOGSHARD_FLUSH_INTERVAL_MS",
            config.publisher.flush_interval,
        )?;
        config.committer.max_batch =
            env_parse("LOGSHARD_COMMITTER_MAX_BATCH", config.committer.max_batch)?;
        config.committer.max_interval = env_parse_ms(
            "LOGSHARD_COMMITTER_MAX_INTERVAL_MS",
            config.committer.max_interval,
        )?;
        config.committer.parallelism = env_parse(
            "LOGSHARD_COMMITTER_PARALLELISM",
            config.committer.parallelism,
        )?;
        if let Ok(secs) = std::env::var("LOGSHARD_REPLAY_TIMEOUT_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                CoreError::Config(format!(
                    "LOGSHARD_REPLAY_TIMEOUT_SECS is not a number: {secs}"
                ))
            })?;
            config.replay.entire_replay_timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> CoreResult<()> {
        if self.brokers.is_empty() {
            return Err(CoreError::Config("at least one broker is required".into()));
        }
        for broker in &self.brokers {
            if !broker.contains(':') {
                return Err(CoreError::Config(format!(
                    "broker '{broker}' is not host:port"
                )));
            }
        }
        if self.events_topic.is_empty() || self.state_topic.is_empty() {
            return Err(CoreError::Config("topic names must be non-empty".into()));
        }
        if self.events_topic == self.state_topic {
            return Err(CoreError::Config(
                "events topic and state topic must differ".into(),
            ));
        }
        if self.transactional_id_prefix.is_empty() {
            return Err(CoreError::Config(
                "transactional id prefix must be non-empty".into(),
            ));
        }
        if self.publisher.flush_interval.is_zero() {
            return Err(CoreError::Config("flush interval must be positive".into()));
        }
        if self.committer.max_batch == 0 {
            return Err(CoreError::Config("committer max_batch must be > 0".into()));
        }
        if self.committer.parallelism == 0 {
            return Err(CoreError::Config(
                "committer parallelism must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Transactional id for one owned partition: prefix plus
    /// `topic-partition`. Uniqueness of the prefix per application cluster
    /// is the deployment's responsibility.
    pub fn transactional_id(&self, partition: u32) -> String {
        format!(
            "{}-{}-{}",
            self.transactional_id_prefix, self.state_topic, partition
        )
    }

    /// Consumer properties for the consumed stream: broker list, the
    /// host-awareness pair, and pinned ids when `reuse_consumer_id` is set.
    pub fn consumer_properties(&self) -> HashMap<String, String> {
        let mut props = HashMap::new();
        props.insert("bootstrap.servers".to_string(), self.brokers.join(","));
        props.insert(
            HOST_AWARENESS_HOST.to_string(),
            self.advertised.host.clone(),
        );
        props.insert(
            HOST_AWARENESS_PORT.to_string(),
            self.advertised.port.to_string(),
        );
        if self.reuse_consumer_id {
            let instance = format!("{}-{}", self.advertised.host, self.advertised.port);
            props.insert("client.id".to_string(), instance.clone());
            props.insert("group.instance.id".to_string(), instance);
        }
        props
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> CoreResult<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| CoreError::Config(format!("{key} has invalid value: {raw}"))),
        Err(_) => Ok(default),
    }
}

fn env_parse_ms(key: &str, default: Duration) -> CoreResult<Duration> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| CoreError::Config(format!("{key} is not a millisecond count: {raw}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(CoreConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_empty_brokers() {
        let config = CoreConfig {
            brokers: vec![],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_broker_without_port() {
        let config = CoreConfig {
            brokers: vec!["localhost".to_string()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_matching_topics() {
        let config = CoreConfig {
            events_topic: "same".to_string(),
            state_topic: "same".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_committer_settings() {
        let mut config = CoreConfig::default();
        config.committer.max_batch = 0;
        assert!(config.validate().is_err());

        let mut config = CoreConfig::default();
        config.committer.parallelism = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn transactional_id_embeds_topic_and_partition() {
        let config = CoreConfig {
            transactional_id_prefix: "orders".to_string(),
            state_topic: "order-state".to_string(),
            events_topic: "order-events".to_string(),
            ..Default::default()
        };
        assert_eq!(config.transactional_id(5), "orders-order-state-5");
    }

    #[test]
    fn consumer_properties_carry_host_awareness() {
        let config = CoreConfig {
            advertised: HostPort::new("node-a", 7070),
            ..Default::default()
        };
        let props = config.consumer_properties();
        assert_eq!(props.get(HOST_AWARENESS_HOST).unwrap(), "node-a");
        assert_eq!(props.get(HOST_AWARENESS_PORT).unwrap(), "7070");
        assert!(!props.contains_key("group.instance.id"));
    }

    #[test]
    fn reuse_consumer_id_pins_instance_ids() {
        let config = CoreConfig {
            advertised: HostPort::new("node-a", 7070),
            reuse_consumer_id: true,
            ..Default::default()
        };
        let props = config.consumer_properties();
        assert_eq!(props.get("client.id").unwrap(), "node-a-7070");
        assert_eq!(props.get("group.instance.id").unwrap(), "node-a-7070");
    }
}
