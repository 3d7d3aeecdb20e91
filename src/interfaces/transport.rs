use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::domains::message::ReceivedMessage;
use crate::error::Result;

/// Broker-side half of an accepted session, shared by the local and HTTP backends.
#[async_trait]
pub trait SessionLink: Send + Sync {
    /// Pull up to `max_messages` under the lease, waiting at most `max_wait` for the first.
    async fn fetch(&self, max_messages: u32, max_wait: Duration) -> Result<Vec<ReceivedMessage>>;

    async fn settle(&self, lock_token: Uuid) -> Result<()>;

    /// Give the lease back. Releasing an unknown or already released link succeeds.
    async fn release(&self) -> Result<()>;
}
