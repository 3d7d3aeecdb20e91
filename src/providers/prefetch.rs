use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::domains::message::ReceivedMessage;
use crate::error::{ProbeError, Result};
use crate::interfaces::broker::SessionReceiver;
use crate::interfaces::transport::SessionLink;

/// Session receiver that serves `receive` from a local buffer filled up to
/// `prefetch_count` messages per round trip.
pub struct PrefetchingReceiver<L> {
    link: L,
    session_id: String,
    locked_until: OffsetDateTime,
    prefetch_count: u32,
    buffer: VecDeque<ReceivedMessage>,
    closed: bool,
}

impl<L: SessionLink> PrefetchingReceiver<L> {
    pub fn new(
        link: L,
        session_id: String,
        locked_until: OffsetDateTime,
        prefetch_count: u32,
    ) -> Self {
        Self {
            link,
            session_id,
            locked_until,
            prefetch_count,
            buffer: VecDeque::new(),
            closed: false,
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(ProbeError::Runtime(format!(
                "receiver for session '{}' is closed",
                self.session_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl<L: SessionLink> SessionReceiver for PrefetchingReceiver<L> {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn locked_until(&self) -> OffsetDateTime {
        self.locked_until
    }

    async fn receive(&mut self, max_wait: Duration) -> Result<Option<ReceivedMessage>> {
        self.ensure_open()?;
        if let Some(message) = self.buffer.pop_front() {
            return Ok(Some(message));
        }
        let batch = self.prefetch_count.max(1);
        let fetched = self.link.fetch(batch, max_wait).await?;
        tracing::debug!(
            session_id = %self.session_id,
            fetched = fetched.len(),
            "filled receive buffer"
        );
        self.buffer.extend(fetched);
        Ok(self.buffer.pop_front())
    }

    async fn complete(&mut self, message: &ReceivedMessage) -> Result<()> {
        self.ensure_open()?;
        self.link.settle(message.lock_token).await
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.buffer.clear();
        self.link.release().await?;
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use uuid::Uuid;

    use crate::domains::message::SessionMessage;

    #[derive(Clone, Default)]
    struct ScriptedLink {
        pending: Arc<Mutex<VecDeque<ReceivedMessage>>>,
        fetch_sizes: Arc<Mutex<Vec<u32>>>,
        releases: Arc<AtomicUsize>,
        failed_releases: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SessionLink for ScriptedLink {
        async fn fetch(&self, max_messages: u32, _max_wait: Duration) -> Result<Vec<ReceivedMessage>> {
            self.fetch_sizes.lock().unwrap().push(max_messages);
            let mut pending = self.pending.lock().unwrap();
            let take = (max_messages as usize).min(pending.len());
            Ok(pending.drain(..take).collect())
        }

        async fn settle(&self, _lock_token: Uuid) -> Result<()> {
            Ok(())
        }

        async fn release(&self) -> Result<()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .failed_releases
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if failing {
                return Err(ProbeError::Http("connection reset".to_string()));
            }
            Ok(())
        }
    }

    fn received(sequence_number: u64) -> ReceivedMessage {
        ReceivedMessage {
            envelope: SessionMessage::new(0, format!("m{sequence_number}"))
                .to_envelope(Uuid::new_v4())
                .unwrap(),
            lock_token: Uuid::new_v4(),
            sequence_number,
            delivery_count: 1,
        }
    }

    #[tokio::test]
    async fn serves_from_buffer_before_round_trip() {
        let link = ScriptedLink::default();
        link.pending
            .lock()
            .unwrap()
            .extend([received(1), received(2), received(3)]);
        let mut receiver =
            PrefetchingReceiver::new(link.clone(), "0".to_string(), OffsetDateTime::now_utc(), 2);

        let first = receiver.receive(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(first.sequence_number, 1);
        assert_eq!(receiver.buffered(), 1);

        let second = receiver.receive(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(second.sequence_number, 2);
        assert_eq!(link.fetch_sizes.lock().unwrap().len(), 1);

        let third = receiver.receive(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(third.sequence_number, 3);
        assert!(receiver.receive(Duration::from_secs(1)).await.unwrap().is_none());
        assert_eq!(*link.fetch_sizes.lock().unwrap(), vec![2, 2, 2]);
    }

    #[tokio::test]
    async fn zero_prefetch_fetches_one_at_a_time_and_close_is_idempotent() {
        let link = ScriptedLink::default();
        link.pending.lock().unwrap().push_back(received(1));
        let mut receiver =
            PrefetchingReceiver::new(link.clone(), "0".to_string(), OffsetDateTime::now_utc(), 0);
        receiver.receive(Duration::from_secs(1)).await.unwrap();
        assert_eq!(*link.fetch_sizes.lock().unwrap(), vec![1]);

        receiver.close().await.unwrap();
        receiver.close().await.unwrap();
        assert_eq!(link.releases.load(Ordering::SeqCst), 1);
        assert!(receiver.receive(Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn failed_release_is_retried_on_the_next_close() {
        let link = ScriptedLink::default();
        link.failed_releases.store(1, Ordering::SeqCst);
        link.pending.lock().unwrap().push_back(received(1));
        let mut receiver =
            PrefetchingReceiver::new(link.clone(), "0".to_string(), OffsetDateTime::now_utc(), 2);
        receiver.receive(Duration::from_secs(1)).await.unwrap();

        assert!(matches!(receiver.close().await, Err(ProbeError::Http(_))));
        receiver.close().await.unwrap();
        receiver.close().await.unwrap();
        assert_eq!(link.releases.load(Ordering::SeqCst), 2);
        assert!(receiver.receive(Duration::from_secs(1)).await.is_err());
    }
}
