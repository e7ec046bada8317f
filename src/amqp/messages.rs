//! AMQP message definitions and serialization

use crate::error::{MatchmakingError, Result};
use crate::types::*;

/// Exchange for challenge and veto events
pub const CHALLENGE_EVENTS_EXCHANGE: &str = "scrim.challenge_events";
/// Exchange for match lifecycle events
pub const MATCH_EVENTS_EXCHANGE: &str = "scrim.match_events";

/// Message envelope with metadata
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MessageEnvelope<T> {
    pub payload: T,
    pub correlation_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub routing_key: String,
}

impl<T> MessageEnvelope<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned,
{
    /// Create a new message envelope
    pub fn new(payload: T, routing_key: String) -> Self {
        Self {
            payload,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now(),
            routing_key,
        }
    }

    /// Serialize the envelope to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| {
            MatchmakingError::InternalError {
                message: format!("Failed to serialize message: {}", e),
            }
            .into()
        })
    }

    /// Deserialize envelope from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            MatchmakingError::InternalError {
                message: format!("Failed to deserialize message: {}", e),
            }
            .into()
        })
    }
}

/// Routing helpers for outbound messages
pub struct MessageUtils;

impl MessageUtils {
    /// Topic routing key, e.g. `challenge.accepted` or `veto.timed_out`
    pub fn routing_key(message: &AmqpMessage) -> String {
        match message {
            AmqpMessage::ChallengeUpdated(event) => format!("challenge.{}", event.status),
            AmqpMessage::VetoProgress(event) => {
                let phase = match event.phase {
                    VetoPhase::Started => "started",
                    VetoPhase::Banned => "banned",
                    VetoPhase::Completed => "completed",
                    VetoPhase::TimedOut => "timed_out",
                };
                format!("veto.{}", phase)
            }
            AmqpMessage::MatchLifecycle(event) => format!("match.{}", event.phase.as_str()),
        }
    }

    /// Exchange a message is published to
    pub fn exchange(message: &AmqpMessage) -> &'static str {
        match message {
            AmqpMessage::ChallengeUpdated(_) | AmqpMessage::VetoProgress(_) => {
                CHALLENGE_EVENTS_EXCHANGE
            }
            AmqpMessage::MatchLifecycle(_) => MATCH_EVENTS_EXCHANGE,
        }
    }
}
