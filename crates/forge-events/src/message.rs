//! Message envelope carried by every backend.
//!
//! The envelope has one canonical JSON wire encoding shared by all transports:
//!
//! ```json
//! {"message_id": "<uuid>", "topic": "<string>", "payload": <any-json>, "timestamp": <float-seconds>}
//! ```

use crate::error::{EventBusError, EventBusResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Immutable message envelope.
///
/// Fields are only readable through accessors, so the id and timestamp
/// assigned at construction never change while the message moves through
/// the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    message_id: String,
    topic: String,
    payload: serde_json::Value,
    timestamp: f64,
}

impl Message {
    /// Create a new message with a fresh UUID v4 id and the current time.
    ///
    /// # Arguments
    ///
    /// * `topic` - Topic the message is published to
    /// * `payload` - Opaque JSON payload
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::with_parts(topic, payload, None, None)
    }

    /// Create a message from any serializable payload.
    ///
    /// Fails with [`EventBusError::SerializationError`] when the payload has
    /// no JSON representation (for example a map with non-string keys).
    pub fn from_payload<T: Serialize>(topic: impl Into<String>, payload: &T) -> EventBusResult<Self> {
        let payload = serde_json::to_value(payload)?;
        Ok(Self::new(topic, payload))
    }

    /// Create a message, keeping a caller-supplied id and timestamp when given.
    ///
    /// An empty id or a non-finite timestamp counts as absent.
    pub fn with_parts(
        topic: impl Into<String>,
        payload: serde_json::Value,
        message_id: Option<String>,
        timestamp: Option<f64>,
    ) -> Self {
        Self {
            message_id: message_id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            topic: topic.into(),
            payload,
            timestamp: timestamp.filter(|t| t.is_finite()).unwrap_or_else(unix_now),
        }
    }

    /// Unique message id.
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Topic the message belongs to.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Message payload.
    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Creation time in unix seconds.
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    /// Creation time as a UTC datetime, if it is within chrono's range.
    pub fn datetime(&self) -> Option<DateTime<Utc>> {
        let micros = (self.timestamp * 1_000_000.0).round() as i64;
        DateTime::from_timestamp_micros(micros)
    }

    /// Parse the payload into a specific type.
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Encode the message in its wire format.
    pub fn to_json(&self) -> EventBusResult<String> {
        serde_json::to_string(self).map_err(EventBusError::from)
    }

    /// Decode a message from its wire format.
    ///
    /// Fails with [`EventBusError::SerializationError`] on invalid JSON or
    /// when a required field is missing.
    pub fn from_json(json: &str) -> EventBusResult<Self> {
        serde_json::from_str(json).map_err(EventBusError::from)
    }
}

fn unix_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
