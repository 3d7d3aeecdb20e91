use bytes::Bytes;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{ProbeError, Result};

pub const CONTENT_TYPE_JSON: &str = "application/json;charset=utf-8";

/// Payload written by the sender and read back by any consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMessage {
    pub session_number: i64,
    pub text: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_date: OffsetDateTime,
}

impl SessionMessage {
    pub fn new(session_number: i64, text: impl Into<String>) -> Self {
        Self {
            session_number,
            text: text.into(),
            created_date: OffsetDateTime::now_utc(),
        }
    }

    pub fn with_created_date(mut self, created_date: OffsetDateTime) -> Self {
        self.created_date = created_date;
        self
    }

    pub fn session_id(&self) -> String {
        self.session_number.to_string()
    }

    pub fn to_envelope(&self, correlation_id: Uuid) -> Result<Envelope> {
        let body =
            serde_json::to_vec(self).map_err(|e| ProbeError::Serialization(e.to_string()))?;
        Ok(Envelope {
            message_id: Uuid::new_v4(),
            session_id: self.session_id(),
            correlation_id,
            content_type: CONTENT_TYPE_JSON.to_string(),
            body: Bytes::from(body),
        })
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<Self> {
        if !envelope
            .content_type
            .eq_ignore_ascii_case(CONTENT_TYPE_JSON)
        {
            return Err(ProbeError::Serialization(format!(
                "unsupported content type '{}'",
                envelope.content_type
            )));
        }
        serde_json::from_slice(&envelope.body)
            .map_err(|e| ProbeError::Serialization(e.to_string()))
    }
}

/// Transport form of a message: opaque body plus broker metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: Uuid,
    pub session_id: String,
    pub correlation_id: Uuid,
    pub content_type: String,
    #[serde(with = "body_base64")]
    pub body: Bytes,
}

/// A message handed out under a session lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedMessage {
    pub envelope: Envelope,
    pub lock_token: Uuid,
    pub sequence_number: u64,
    pub delivery_count: u32,
}

impl ReceivedMessage {
    pub fn decode(&self) -> Result<SessionMessage> {
        SessionMessage::from_envelope(&self.envelope)
    }
}

mod body_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
