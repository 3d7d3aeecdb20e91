use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::domains::message::{Envelope, SessionMessage};
use crate::error::Result;
use crate::interfaces::broker::{MessageSender, MAX_BATCH_MESSAGES};

/// Maps a message index to the session number it is sent under.
#[derive(Clone)]
pub struct SessionAssignment {
    label: String,
    assign: Arc<dyn Fn(usize) -> i64 + Send + Sync>,
}

impl SessionAssignment {
    pub fn fixed(session_number: i64) -> Self {
        Self {
            label: format!("fixed({session_number})"),
            assign: Arc::new(move |_| session_number),
        }
    }

    pub fn round_robin(sessions: u32) -> Self {
        let sessions = sessions.max(1) as usize;
        Self {
            label: format!("round-robin({sessions})"),
            assign: Arc::new(move |index| (index % sessions) as i64),
        }
    }

    pub fn one_per_message() -> Self {
        Self {
            label: "one-per-message".to_string(),
            assign: Arc::new(|index| index as i64),
        }
    }

    pub fn custom<F>(label: impl Into<String>, assign: F) -> Self
    where
        F: Fn(usize) -> i64 + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            assign: Arc::new(assign),
        }
    }

    pub fn session_for(&self, index: usize) -> i64 {
        (self.assign)(index)
    }
}

impl Default for SessionAssignment {
    fn default() -> Self {
        Self::fixed(0)
    }
}

impl fmt::Debug for SessionAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SessionAssignment").field(&self.label).finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SendReport {
    pub messages: usize,
    pub batches: usize,
    pub elapsed: Duration,
    pub messages_per_sec: f64,
}

/// Sends messages in batches of at most [`MAX_BATCH_MESSAGES`].
///
/// A failing batch aborts the run; batches already sent stay sent.
pub struct BatchSender {
    sender: Box<dyn MessageSender>,
    correlation_id: Uuid,
    max_batch: usize,
}

impl BatchSender {
    pub fn new(sender: Box<dyn MessageSender>, correlation_id: Uuid) -> Self {
        Self {
            sender,
            correlation_id,
            max_batch: MAX_BATCH_MESSAGES,
        }
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn build(&self, count: usize, assignment: &SessionAssignment) -> Result<Vec<Envelope>> {
        (0..count)
            .map(|index| {
                SessionMessage::new(assignment.session_for(index), format!("message {index}"))
                    .to_envelope(self.correlation_id)
            })
            .collect()
    }

    pub async fn send_messages(
        &self,
        count: usize,
        assignment: &SessionAssignment,
    ) -> Result<SendReport> {
        let envelopes = self.build(count, assignment)?;
        self.send_envelopes(&envelopes).await
    }

    pub async fn send_envelopes(&self, envelopes: &[Envelope]) -> Result<SendReport> {
        let started = Instant::now();
        let mut batches = 0;
        for batch in envelopes.chunks(self.max_batch) {
            self.sender.send_batch(batch).await?;
            batches += 1;
            tracing::debug!(
                queue = self.sender.queue_name(),
                batch = batches,
                size = batch.len(),
                "batch sent"
            );
        }
        let elapsed = started.elapsed();
        let messages_per_sec = if elapsed.is_zero() {
            0.0
        } else {
            envelopes.len() as f64 / elapsed.as_secs_f64()
        };
        tracing::info!(
            queue = self.sender.queue_name(),
            messages = envelopes.len(),
            batches,
            elapsed_ms = elapsed.as_millis() as u64,
            messages_per_sec,
            correlation_id = %self.correlation_id,
            "messages sent"
        );
        Ok(SendReport {
            messages: envelopes.len(),
            batches,
            elapsed,
            messages_per_sec,
        })
    }

    pub async fn close(&self) -> Result<()> {
        self.sender.close().await
    }
}
