use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::domains::message::{Envelope, ReceivedMessage};
use crate::domains::queue::QueueDescription;
use crate::error::Result;

/// Largest number of messages a single send call may carry.
pub const MAX_BATCH_MESSAGES: usize = 100;

/// Longest accept or receive wait a caller may ask for.
pub const MAX_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionReceiverOptions {
    /// Messages the receiver may pull ahead into its local buffer.
    pub prefetch_count: u32,
    /// How long to wait for a session to become available.
    pub max_wait: Duration,
}

impl Default for SessionReceiverOptions {
    fn default() -> Self {
        Self {
            prefetch_count: 0,
            max_wait: Duration::from_secs(5),
        }
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn get_queue(&self, name: &str) -> Result<QueueDescription>;

    async fn create_queue(&self, description: &QueueDescription) -> Result<QueueDescription>;

    async fn delete_queue(&self, name: &str) -> Result<()>;

    async fn create_sender(&self, queue: &str) -> Result<Box<dyn MessageSender>>;

    async fn accept_next_session(
        &self,
        queue: &str,
        options: SessionReceiverOptions,
    ) -> Result<Box<dyn SessionReceiver>>;
}

#[async_trait]
pub trait MessageSender: Send + Sync {
    fn queue_name(&self) -> &str;

    async fn send_batch(&self, batch: &[Envelope]) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Receiver bound to one session lease.
///
/// None of these operations renews the lease.
#[async_trait]
pub trait SessionReceiver: Send + Sync {
    fn session_id(&self) -> &str;

    /// Lease expiry as reported when the session was accepted.
    fn locked_until(&self) -> OffsetDateTime;

    async fn receive(&mut self, max_wait: Duration) -> Result<Option<ReceivedMessage>>;

    async fn complete(&mut self, message: &ReceivedMessage) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}
