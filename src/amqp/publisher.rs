//! AMQP event publisher for outbound events

use crate::amqp::messages::{
    MessageEnvelope, MessageUtils, CHALLENGE_EVENTS_EXCHANGE, MATCH_EVENTS_EXCHANGE,
};
use crate::error::{MatchmakingError, Result};
use crate::metrics::MetricsCollector;
use crate::types::*;
use amqprs::{
    channel::{BasicPublishArguments, Channel, ExchangeDeclareArguments},
    BasicProperties,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Trait for publishing matchmaking events
///
/// Callers log publish failures and carry on; an event never decides whether
/// the state change that produced it happened.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_challenge_updated(&self, event: ChallengeUpdated) -> Result<()>;

    async fn publish_veto_progress(&self, event: VetoProgress) -> Result<()>;

    async fn publish_match_lifecycle(&self, event: MatchLifecycle) -> Result<()>;
}

/// Configuration for event publishing
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 500,
        }
    }
}

/// AMQP-based event publisher implementation
pub struct AmqpEventPublisher {
    channel: Channel,
    config: PublisherConfig,
}

impl AmqpEventPublisher {
    /// Create a new event publisher and declare its exchanges
    pub async fn new(channel: Channel, config: PublisherConfig) -> Result<Self> {
        let publisher = Self { channel, config };

        publisher.setup_exchanges().await?;

        Ok(publisher)
    }

    async fn setup_exchanges(&self) -> Result<()> {
        for exchange in [CHALLENGE_EVENTS_EXCHANGE, MATCH_EVENTS_EXCHANGE] {
            let mut args = ExchangeDeclareArguments::new(exchange, "topic");
            args.durable(true);
            self.channel.exchange_declare(args).await.map_err(|e| {
                MatchmakingError::AmqpConnectionFailed {
                    message: format!("Failed to declare exchange {}: {}", exchange, e),
                }
            })?;
        }

        info!("Successfully set up AMQP exchanges");
        Ok(())
    }

    /// Publish with exponential backoff retry
    async fn publish(&self, message: AmqpMessage) -> Result<()> {
        let exchange = MessageUtils::exchange(&message);
        let routing_key = MessageUtils::routing_key(&message);
        let envelope = MessageEnvelope::new(message, routing_key);

        let mut retry_count = 0;
        let mut delay = Duration::from_millis(self.config.retry_delay_ms);

        loop {
            match self.try_publish(exchange, &envelope).await {
                Ok(_) => {
                    debug!(
                        "Published message {} to {} with key {}",
                        envelope.correlation_id, exchange, envelope.routing_key
                    );
                    return Ok(());
                }
                Err(e) => {
                    retry_count += 1;
                    if retry_count > self.config.max_retries {
                        error!(
                            "Failed to publish message {} after {} retries: {}",
                            envelope.correlation_id, self.config.max_retries, e
                        );
                        return Err(e);
                    }

                    warn!(
                        "Publish attempt {} failed for message {}: {}. Retrying in {:?}",
                        retry_count, envelope.correlation_id, e, delay
                    );

                    sleep(delay).await;
                    delay = Duration::from_millis((delay.as_millis() as u64 * 2).min(5000));
                }
            }
        }
    }

    /// Single publish attempt
    async fn try_publish(
        &self,
        exchange: &str,
        envelope: &MessageEnvelope<AmqpMessage>,
    ) -> Result<()> {
        let payload = envelope.to_bytes()?;

        let args = BasicPublishArguments::new(exchange, &envelope.routing_key);
        let mut properties = BasicProperties::default();
        properties
            .with_message_id(&envelope.correlation_id)
            .with_timestamp(envelope.timestamp.timestamp() as u64)
            .with_content_type("application/json");

        self.channel
            .basic_publish(properties, payload, args)
            .await
            .map_err(|e| MatchmakingError::AmqpConnectionFailed {
                message: format!("Failed to publish message: {}", e),
            })?;

        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }
}

#[async_trait]
impl EventPublisher for AmqpEventPublisher {
    async fn publish_challenge_updated(&self, event: ChallengeUpdated) -> Result<()> {
        self.publish(AmqpMessage::ChallengeUpdated(event)).await
    }

    async fn publish_veto_progress(&self, event: VetoProgress) -> Result<()> {
        self.publish(AmqpMessage::VetoProgress(event)).await
    }

    async fn publish_match_lifecycle(&self, event: MatchLifecycle) -> Result<()> {
        self.publish(AmqpMessage::MatchLifecycle(event)).await
    }
}

/// Publisher used when no broker is configured; events only reach the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingEventPublisher;

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish_challenge_updated(&self, event: ChallengeUpdated) -> Result<()> {
        debug!(
            "Challenge {} is now {} (ready: {}/{})",
            event.challenge_id, event.status, event.challenger_ready, event.challenged_ready
        );
        Ok(())
    }

    async fn publish_veto_progress(&self, event: VetoProgress) -> Result<()> {
        debug!(
            "Veto for challenge {}: {:?}, {} maps remaining",
            event.challenge_id,
            event.phase,
            event.remaining_maps.len()
        );
        Ok(())
    }

    async fn publish_match_lifecycle(&self, event: MatchLifecycle) -> Result<()> {
        debug!(
            "Match for challenge {}: {}",
            event.challenge_id,
            event.phase.as_str()
        );
        Ok(())
    }
}

/// Publishes engine events, logging failures instead of returning them
#[derive(Clone)]
pub struct Notifier {
    publisher: Arc<dyn EventPublisher>,
    metrics: Arc<MetricsCollector>,
}

impl Notifier {
    pub fn new(publisher: Arc<dyn EventPublisher>, metrics: Arc<MetricsCollector>) -> Self {
        Self { publisher, metrics }
    }

    pub async fn challenge_updated(
        &self,
        challenge: &ChallengeRequest,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) {
        let event = ChallengeUpdated::from_challenge(challenge, reason, at);
        let result = self.publisher.publish_challenge_updated(event).await;
        self.record("challenge", challenge.id, result);
    }

    pub async fn veto_progress(&self, event: VetoProgress) {
        let challenge_id = event.challenge_id;
        let result = self.publisher.publish_veto_progress(event).await;
        self.record("veto", challenge_id, result);
    }

    pub async fn match_lifecycle(
        &self,
        challenge_id: ChallengeId,
        match_id: Option<MatchId>,
        phase: MatchPhase,
        detail: Option<String>,
    ) {
        let event = MatchLifecycle {
            challenge_id,
            match_id,
            phase,
            detail,
            timestamp: chrono::Utc::now(),
        };
        let result = self.publisher.publish_match_lifecycle(event).await;
        self.record("match", challenge_id, result);
    }

    fn record(&self, kind: &str, challenge_id: ChallengeId, result: Result<()>) {
        self.metrics.record_event_published(kind, result.is_ok());
        if let Err(e) = result {
            warn!(
                "Failed to publish {} event for challenge {}: {}",
                kind, challenge_id, e
            );
        }
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier").finish_non_exhaustive()
    }
}

/// Mock event publisher for testing
#[derive(Debug, Default)]
pub struct MockEventPublisher {
    published_events: std::sync::Mutex<Vec<AmqpMessage>>,
    fail_publishes: std::sync::atomic::AtomicBool,
}

impl MockEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all published events (for testing)
    pub fn get_published_events(&self) -> Vec<AmqpMessage> {
        self.published_events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Routing keys of published events, in order
    pub fn routing_keys(&self) -> Vec<String> {
        self.get_published_events()
            .iter()
            .map(MessageUtils::routing_key)
            .collect()
    }

    /// Make every publish fail, to check callers shrug it off
    pub fn set_failing(&self, failing: bool) {
        self.fail_publishes
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    /// Clear published events (for testing)
    pub fn clear_events(&self) {
        if let Ok(mut events) = self.published_events.lock() {
            events.clear();
        }
    }

    fn record(&self, message: AmqpMessage) -> Result<()> {
        if self.fail_publishes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(MatchmakingError::AmqpConnectionFailed {
                message: "mock publisher is failing".to_string(),
            }
            .into());
        }
        if let Ok(mut events) = self.published_events.lock() {
            events.push(message);
        }
        Ok(())
    }
}

#[async_trait]
impl EventPublisher for MockEventPublisher {
    async fn publish_challenge_updated(&self, event: ChallengeUpdated) -> Result<()> {
        self.record(AmqpMessage::ChallengeUpdated(event))
    }

    async fn publish_veto_progress(&self, event: VetoProgress) -> Result<()> {
        self.record(AmqpMessage::VetoProgress(event))
    }

    async fn publish_match_lifecycle(&self, event: MatchLifecycle) -> Result<()> {
        self.record(AmqpMessage::MatchLifecycle(event))
    }
}
