use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::KafkaConfig;
use crate::consumer::{BatchSource, PulledBatch};
use crate::{Error, Result};

const SEEK_TIMEOUT: Duration = Duration::from_secs(10);

/// Offsets pulled from one partition within a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpan {
    pub topic: String,
    pub partition: i32,
    pub first_offset: i64,
    pub last_offset: i64,
}

/// Position of a pulled batch: one span per partition it touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KafkaPosition {
    pub spans: Vec<PartitionSpan>,
}

impl KafkaPosition {
    fn record(&mut self, topic: &str, partition: i32, offset: i64) {
        match self
            .spans
            .iter_mut()
            .find(|s| s.partition == partition && s.topic == topic)
        {
            Some(span) => {
                span.first_offset = span.first_offset.min(offset);
                span.last_offset = span.last_offset.max(offset);
            }
            None => self.spans.push(PartitionSpan {
                topic: topic.to_string(),
                partition,
                first_offset: offset,
                last_offset: offset,
            }),
        }
    }

    /// Offsets to commit: the next one to read in each partition.
    fn commit_list(&self) -> Result<TopicPartitionList> {
        let mut list = TopicPartitionList::new();
        for span in &self.spans {
            list.add_partition_offset(&span.topic, span.partition, Offset::Offset(span.last_offset + 1))?;
        }
        Ok(list)
    }
}

/// Pulls change messages from a Kafka topic with manual offset commits.
///
/// Auto-commit is disabled: offsets advance only through [`BatchSource::ack`].
pub struct KafkaSource {
    consumer: StreamConsumer,
    topic: String,
}

impl KafkaSource {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let mut client = ClientConfig::new();
        client
            .set("bootstrap.servers", config.brokers.join(","))
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false");
        for (key, value) in &config.properties {
            client.set(key, value);
        }

        let consumer: StreamConsumer = client.create()?;

        match config.partition {
            Some(partition) => {
                let mut assignment = TopicPartitionList::new();
                assignment.add_partition(&config.topic, partition);
                consumer.assign(&assignment)?;
                info!(topic = %config.topic, partition, "Assigned Kafka partition");
            }
            None => {
                consumer.subscribe(&[config.topic.as_str()])?;
                info!(topic = %config.topic, group_id = %config.group_id, "Subscribed to Kafka topic");
            }
        }

        Ok(Self {
            consumer,
            topic: config.topic.clone(),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl BatchSource for KafkaSource {
    type Position = KafkaPosition;

    async fn pull(
        &mut self,
        max_messages: usize,
        timeout: Duration,
    ) -> Result<Option<PulledBatch<KafkaPosition>>> {
        let deadline = Instant::now() + timeout;
        let mut payloads = Vec::new();
        let mut position = KafkaPosition::default();

        while payloads.len() < max_messages {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let message = match tokio::time::timeout(remaining, self.consumer.recv()).await {
                Err(_) => break,
                Ok(Err(e)) if payloads.is_empty() => {
                    return Err(Error::Pull {
                        message: format!("receive failed: {}", e),
                    })
                }
                Ok(Err(e)) => {
                    // Keep what was already pulled; the next pull reports a
                    // persistent error.
                    warn!(error = %e, "Receive failed mid-batch");
                    break;
                }
                Ok(Ok(message)) => message,
            };

            position.record(message.topic(), message.partition(), message.offset());
            match message.payload() {
                Some(payload) => payloads.push(payload.to_vec()),
                None => debug!(
                    partition = message.partition(),
                    offset = message.offset(),
                    "Skipping message without payload"
                ),
            }
        }

        if position.spans.is_empty() {
            return Ok(None);
        }
        Ok(Some(PulledBatch { payloads, position }))
    }

    async fn ack(&mut self, position: &KafkaPosition) -> Result<()> {
        if position.spans.is_empty() {
            return Ok(());
        }
        let offsets = position.commit_list()?;
        self.consumer.commit(&offsets, CommitMode::Sync)?;
        debug!(?position, "Committed offsets");
        Ok(())
    }

    async fn rewind(&mut self, position: &KafkaPosition) -> Result<()> {
        for span in &position.spans {
            self.consumer.seek(
                &span.topic,
                span.partition,
                Offset::Offset(span.first_offset),
                SEEK_TIMEOUT,
            )?;
            debug!(
                topic = %span.topic,
                partition = span.partition,
                offset = span.first_offset,
                "Rewound partition"
            );
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.consumer.unsubscribe();
        info!(topic = %self.topic, "Kafka source closed");
        Ok(())
    }
}
