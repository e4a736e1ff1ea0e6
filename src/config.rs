use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::message::SubscriptionFilter;
use crate::{Error, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    pub group_id: String,
    pub topic: String,
    /// Read a single partition instead of joining the group rebalance.
    #[serde(default)]
    pub partition: Option<i32>,
    /// Extra librdkafka properties, applied last.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub unit: TimeUnit,
    #[serde(default)]
    pub filter: String,
    #[serde(default = "default_true")]
    pub flat_message: bool,
    #[serde(default = "default_true")]
    pub async_dispatch: bool,
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    #[serde(default)]
    pub shutdown_grace_ms: Option<u64>,
    #[serde(default = "default_min_backoff_ms")]
    pub min_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Milliseconds,
    #[default]
    Seconds,
    Minutes,
}

impl TimeUnit {
    pub fn duration(self, amount: u64) -> Duration {
        match self {
            TimeUnit::Milliseconds => Duration::from_millis(amount),
            TimeUnit::Seconds => Duration::from_secs(amount),
            TimeUnit::Minutes => Duration::from_secs(amount.saturating_mul(60)),
        }
    }
}

/// A table the binary logs changes for.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenerConfig {
    pub schema: String,
    pub table: String,
    #[serde(default)]
    pub columns: Vec<String>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("CDC_DISPATCH")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.kafka.brokers.is_empty() {
            return Err(Error::Config("kafka.brokers must not be empty".to_string()));
        }
        if self.kafka.topic.trim().is_empty() {
            return Err(Error::Config("kafka.topic must not be empty".to_string()));
        }
        if self.kafka.group_id.trim().is_empty() {
            return Err(Error::Config("kafka.group_id must not be empty".to_string()));
        }
        self.consumer.validate()
    }
}

impl ConsumerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("consumer.batch_size must be positive".to_string()));
        }
        if self.worker_pool_size == 0 {
            return Err(Error::Config(
                "consumer.worker_pool_size must be positive".to_string(),
            ));
        }
        if self.min_backoff_ms > self.max_backoff_ms {
            return Err(Error::Config(
                "consumer.min_backoff_ms exceeds consumer.max_backoff_ms".to_string(),
            ));
        }
        SubscriptionFilter::parse(&self.filter)?;
        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        self.unit.duration(self.timeout)
    }

    pub fn shutdown_grace(&self) -> Option<Duration> {
        self.shutdown_grace_ms.map(Duration::from_millis)
    }

    pub fn min_backoff(&self) -> Duration {
        Duration::from_millis(self.min_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            timeout: default_timeout(),
            unit: TimeUnit::default(),
            filter: String::new(),
            flat_message: true,
            async_dispatch: true,
            worker_pool_size: default_worker_pool_size(),
            shutdown_grace_ms: None,
            min_backoff_ms: default_min_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_batch_size() -> usize {
    1
}

fn default_timeout() -> u64 {
    1
}

fn default_true() -> bool {
    true
}

fn default_worker_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(8)
}

fn default_min_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kafka() -> KafkaConfig {
        KafkaConfig {
            brokers: vec!["localhost:9092".to_string()],
            group_id: "cdc".to_string(),
            topic: "example".to_string(),
            partition: None,
            properties: BTreeMap::new(),
        }
    }

    #[test]
    fn test_consumer_defaults() {
        let config = ConsumerConfig::default();
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.poll_timeout(), Duration::from_secs(1));
        assert!(config.flat_message);
        assert!(config.async_dispatch);
        assert!(config.worker_pool_size > 0);
        assert!(config.shutdown_grace().is_none());
    }

    #[test]
    fn test_time_units() {
        assert_eq!(TimeUnit::Milliseconds.duration(250), Duration::from_millis(250));
        assert_eq!(TimeUnit::Minutes.duration(2), Duration::from_secs(120));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config {
            kafka: kafka(),
            consumer: ConsumerConfig::default(),
            listeners: Vec::new(),
        };
        assert!(config.validate().is_ok());

        config.consumer.batch_size = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.consumer.batch_size = 10;
        config.consumer.filter = "db\\.(".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.consumer.filter = String::new();
        config.kafka.brokers.clear();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
