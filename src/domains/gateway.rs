//! Request and response bodies of the broker gateway protocol.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::domains::message::{Envelope, ReceivedMessage};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedSession {
    pub receiver_id: Uuid,
    pub session_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub locked_until: OffsetDateTime,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendRequest {
    pub messages: Vec<Envelope>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AcceptRequest {
    pub max_wait_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FetchRequest {
    pub max_messages: u32,
    pub max_wait_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FetchResponse {
    pub messages: Vec<ReceivedMessage>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub lock_token: Uuid,
}
