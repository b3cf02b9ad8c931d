use crate::config::Config;
use crate::error::Disposition;
use crate::orchestrator::Orchestrator;
use anyhow::{Context, Result};
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaResult;
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::{Offset, TopicPartitionList};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const SEEK_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a consumed message sits in the topic
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessagePosition {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl MessagePosition {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }

    fn of(message: &BorrowedMessage<'_>) -> Self {
        Self::new(message.topic(), message.partition(), message.offset())
    }
}

impl fmt::Display for MessagePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

/// What to do with a message once its run has finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryAction {
    /// Commit the offset
    Commit,
    /// Seek back so the message is fetched again
    Redeliver { attempt: u32 },
    /// Out of redeliveries; log and commit
    DeadLetter { attempts: u32 },
}

/// Counts redeliveries per message position, in memory.
///
/// Counts are lost on restart, so a poison message can be retried up to
/// `max_redeliveries` more times after each restart.
#[derive(Debug)]
pub struct RedeliveryTracker {
    max_redeliveries: u32,
    attempts: HashMap<MessagePosition, u32>,
}

impl RedeliveryTracker {
    pub fn new(max_redeliveries: u32) -> Self {
        Self {
            max_redeliveries,
            attempts: HashMap::new(),
        }
    }

    pub fn decide(&mut self, position: &MessagePosition, disposition: Disposition) -> DeliveryAction {
        match disposition {
            Disposition::Acknowledge => {
                self.attempts.remove(position);
                DeliveryAction::Commit
            }
            Disposition::Redeliver => {
                let seen = self.attempts.get(position).copied().unwrap_or(0);
                if seen >= self.max_redeliveries {
                    self.attempts.remove(position);
                    DeliveryAction::DeadLetter { attempts: seen }
                } else {
                    self.attempts.insert(position.clone(), seen + 1);
                    DeliveryAction::Redeliver { attempt: seen + 1 }
                }
            }
        }
    }

    /// Messages currently waiting for another attempt
    pub fn pending(&self) -> usize {
        self.attempts.len()
    }
}

/// Offset operations needed to settle a message
#[cfg_attr(test, mockall::automock)]
pub trait OffsetControl: Send + Sync {
    /// Mark everything up to and including `position` as consumed
    fn commit_position(&self, position: &MessagePosition) -> KafkaResult<()>;

    /// Make `position` the next message fetched from its partition
    fn seek_to(&self, position: &MessagePosition) -> KafkaResult<()>;
}

impl OffsetControl for StreamConsumer {
    fn commit_position(&self, position: &MessagePosition) -> KafkaResult<()> {
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(
            &position.topic,
            position.partition,
            Offset::Offset(position.offset + 1),
        )?;
        Consumer::commit(self, &offsets, CommitMode::Async)
    }

    fn seek_to(&self, position: &MessagePosition) -> KafkaResult<()> {
        Consumer::seek(
            self,
            &position.topic,
            position.partition,
            Offset::Offset(position.offset),
            SEEK_TIMEOUT,
        )
    }
}

/// Apply a delivery decision to the consumer.
///
/// A failed seek is returned as an error: carrying on would let a later
/// commit on the same partition skip the message. A shutdown during the
/// redelivery backoff leaves the message uncommitted.
pub async fn settle<C: OffsetControl + ?Sized>(
    control: &C,
    position: &MessagePosition,
    action: DeliveryAction,
    backoff: Duration,
    shutdown: &CancellationToken,
) -> Result<()> {
    match action {
        DeliveryAction::Commit => {
            commit(control, position);
            metrics::counter!("classifier.messages.acknowledged").increment(1);
        }
        DeliveryAction::DeadLetter { attempts } => {
            error!(
                position = %position,
                attempts,
                "Message still failing after redeliveries, dropping"
            );
            commit(control, position);
            metrics::counter!("classifier.messages.dead_lettered").increment(1);
        }
        DeliveryAction::Redeliver { attempt } => {
            warn!(
                position = %position,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                "Message will be redelivered"
            );
            metrics::counter!("classifier.messages.redelivered").increment(1);

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(position = %position, "Shutdown during redelivery backoff, leaving message uncommitted");
                    return Ok(());
                }
                _ = tokio::time::sleep(backoff) => {}
            }

            control
                .seek_to(position)
                .with_context(|| format!("Failed to seek back to {position} for redelivery"))?;
        }
    }

    Ok(())
}

fn commit<C: OffsetControl + ?Sized>(control: &C, position: &MessagePosition) {
    // A lost commit only means the message is processed again
    if let Err(e) = control.commit_position(position) {
        warn!(error = %e, position = %position, "Failed to commit offset");
    }
}

/// Kafka consumer feeding blob-created events to the orchestrator
pub struct ClassifierKafkaConsumer {
    consumer: StreamConsumer,
    orchestrator: Arc<Orchestrator>,
    max_redeliveries: u32,
    redelivery_backoff: Duration,
}

impl ClassifierKafkaConsumer {
    /// Create a new Kafka consumer subscribed to the event topic
    pub fn new(config: &Config, orchestrator: Arc<Orchestrator>) -> Result<Self> {
        let kafka = &config.kafka;
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", &kafka.bootstrap_servers)
            .set("group.id", &kafka.consumer_group)
            .set("auto.offset.reset", &kafka.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", kafka.session_timeout_ms.to_string())
            .set("max.poll.interval.ms", kafka.max_poll_interval_ms.to_string());

        // Configure SSL if enabled
        if kafka.ssl_enabled {
            client_config.set("security.protocol", "SASL_SSL");
            if let Some(ref ca_location) = kafka.ssl_ca_location {
                client_config.set("ssl.ca.location", ca_location);
            }
        }

        // Configure SASL if credentials provided
        if let (Some(ref username), Some(ref password)) =
            (&kafka.sasl_username, &kafka.sasl_password)
        {
            client_config
                .set("sasl.mechanisms", "PLAIN")
                .set("sasl.username", username)
                .set("sasl.password", password);
        }

        let consumer: StreamConsumer = client_config
            .create()
            .context("Failed to create Kafka consumer")?;

        consumer
            .subscribe(&[&config.queue_name])
            .context("Failed to subscribe to blob event topic")?;

        info!(
            topic = %config.queue_name,
            group = %kafka.consumer_group,
            "Subscribed to Kafka topic"
        );

        Ok(Self {
            consumer,
            orchestrator,
            max_redeliveries: kafka.max_redeliveries,
            redelivery_backoff: config.redelivery_backoff(),
        })
    }

    /// Consume messages one at a time until `shutdown` is cancelled.
    /// The message in flight is finished before returning. Returns an error
    /// when a message can no longer be redelivered in place; the group then
    /// resumes from the last committed offset once the process restarts.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!("Starting classifier Kafka consumer");

        let mut tracker = RedeliveryTracker::new(self.max_redeliveries);
        let mut message_stream = self.consumer.stream();

        loop {
            let message = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!(pending_redeliveries = tracker.pending(), "Received shutdown signal, stopping consumer");
                    break;
                }
                next = message_stream.next() => match next {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        error!(error = %e, "Kafka consumer error");
                        metrics::counter!("classifier.kafka.errors").increment(1);
                        continue;
                    }
                    None => {
                        warn!("Kafka message stream ended");
                        break;
                    }
                },
            };

            let position = MessagePosition::of(&message);
            let disposition = self.process_message(&message).await;
            let action = tracker.decide(&position, disposition);
            settle(
                &self.consumer,
                &position,
                action,
                self.redelivery_backoff,
                &shutdown,
            )
            .await?;
        }

        info!("Consumer stopped gracefully");
        Ok(())
    }

    /// Run the pipeline for a single Kafka message
    #[instrument(skip(self, message), fields(partition = message.partition(), offset = message.offset()))]
    async fn process_message(&self, message: &BorrowedMessage<'_>) -> Disposition {
        let Some(payload) = message.payload() else {
            warn!("Message has no payload, dropping");
            return Disposition::Acknowledge;
        };

        let report = self.orchestrator.handle(payload).await;
        debug!(
            run_id = %report.run_id,
            disposition = report.disposition.as_str(),
            "Message handled"
        );

        report.disposition
    }
}
