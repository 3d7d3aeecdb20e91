//! Lock-expiry probe.
//!
//! Accepts a session, takes one message, sleeps until the lease's advertised
//! expiry plus a grace period, then tries to complete the message. A compliant
//! broker rejects that completion with a lock-lost error. If it succeeds, the
//! probe keeps draining the session; running out of messages without ever
//! seeing a lock-lost error means the lease outlived its expiry although the
//! client never asked for a renewal.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;

use crate::clock::Clock;
use crate::domains::message::ReceivedMessage;
use crate::error::{ProbeError, Result};
use crate::interfaces::broker::{Broker, SessionReceiver, SessionReceiverOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Idle,
    SessionAccepted,
    MessageReceived,
    AwaitingExpiry,
    AwaitingGracePeriod,
    CompletionAttempted,
    ExpectedLockLost,
    UnexpectedSuccess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOptions {
    pub prefetch_count: u32,
    pub accept_timeout: Duration,
    pub receive_timeout: Duration,
    pub grace_period: Duration,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            prefetch_count: 2,
            accept_timeout: Duration::from_secs(5),
            receive_timeout: Duration::from_secs(1),
            grace_period: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The broker rejected a completion after the lease expired.
    LockLost {
        /// Completions that succeeded before the rejection.
        completed_before: usize,
    },
    /// Every completion succeeded and the session ran dry.
    LeaseOutlivedExpiry { completed: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub session_id: String,
    pub locked_until: OffsetDateTime,
    pub expiry_delay: Duration,
    pub grace_period: Duration,
    pub outcome: ProbeOutcome,
    pub trace: Vec<ProbeState>,
}

impl ProbeReport {
    pub fn is_conformant(&self) -> bool {
        matches!(self.outcome, ProbeOutcome::LockLost { .. })
    }

    /// True when the very first late completion was rejected.
    pub fn first_completion_rejected(&self) -> bool {
        matches!(
            self.outcome,
            ProbeOutcome::LockLost {
                completed_before: 0
            }
        )
    }

    pub fn final_state(&self) -> ProbeState {
        self.trace.last().copied().unwrap_or(ProbeState::Idle)
    }
}

/// Time left until `locked_until`, clamped at zero.
pub fn lock_delay(locked_until: OffsetDateTime, now: OffsetDateTime) -> Duration {
    Duration::try_from(locked_until - now).unwrap_or(Duration::ZERO)
}

pub struct LockExpiryProbe {
    broker: Arc<dyn Broker>,
    clock: Arc<dyn Clock>,
    options: ProbeOptions,
    trace: Vec<ProbeState>,
}

impl LockExpiryProbe {
    pub fn new(broker: Arc<dyn Broker>, clock: Arc<dyn Clock>, options: ProbeOptions) -> Self {
        Self {
            broker,
            clock,
            options,
            trace: vec![ProbeState::Idle],
        }
    }

    fn transition(&mut self, next: ProbeState) {
        let from = self.trace.last().copied().unwrap_or(ProbeState::Idle);
        tracing::debug!(?from, to = ?next, "probe transition");
        self.trace.push(next);
    }

    pub async fn run(mut self, queue: &str) -> Result<ProbeReport> {
        let options = SessionReceiverOptions {
            prefetch_count: self.options.prefetch_count,
            max_wait: self.options.accept_timeout,
        };
        let mut receiver = self.broker.accept_next_session(queue, options).await?;
        self.transition(ProbeState::SessionAccepted);
        tracing::info!(
            queue,
            session_id = receiver.session_id(),
            locked_until = %receiver.locked_until(),
            prefetch = self.options.prefetch_count,
            "session accepted"
        );

        let observed = self.observe(receiver.as_mut()).await;
        let closed = receiver.close().await;
        match (observed, closed) {
            (Ok(report), Ok(())) => Ok(report),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(close_err)) => {
                tracing::warn!(error = %close_err, "failed to close session receiver");
                Err(err)
            }
        }
    }

    async fn observe(&mut self, receiver: &mut dyn SessionReceiver) -> Result<ProbeReport> {
        let session_id = receiver.session_id().to_string();
        let locked_until = receiver.locked_until();

        let Some(first) = receiver.receive(self.options.receive_timeout).await? else {
            return Err(ProbeError::Setup(format!(
                "no message arrived on session '{session_id}' within {:?}",
                self.options.receive_timeout
            )));
        };
        self.transition(ProbeState::MessageReceived);

        let expiry_delay = lock_delay(locked_until, self.clock.now());
        self.transition(ProbeState::AwaitingExpiry);
        tracing::info!(
            session_id = %session_id,
            delay_ms = expiry_delay.as_millis() as u64,
            "waiting for the session lock to expire"
        );
        tokio::time::sleep(expiry_delay).await;

        self.transition(ProbeState::AwaitingGracePeriod);
        tracing::info!(
            grace_ms = self.options.grace_period.as_millis() as u64,
            "waiting out the grace period"
        );
        tokio::time::sleep(self.options.grace_period).await;

        self.transition(ProbeState::CompletionAttempted);
        let outcome = self.drain(receiver, first).await?;

        match outcome {
            ProbeOutcome::LockLost { completed_before } => {
                tracing::warn!(
                    session_id = %session_id,
                    completed_before,
                    "expected: completion after lock expiry was rejected"
                );
            }
            ProbeOutcome::LeaseOutlivedExpiry { completed } => {
                tracing::error!(
                    session_id = %session_id,
                    completed,
                    %locked_until,
                    "conformance failure: session lock was honoured past its expiry without renewal"
                );
            }
        }

        Ok(ProbeReport {
            session_id,
            locked_until,
            expiry_delay,
            grace_period: self.options.grace_period,
            outcome,
            trace: self.trace.clone(),
        })
    }

    async fn drain(
        &mut self,
        receiver: &mut dyn SessionReceiver,
        first: ReceivedMessage,
    ) -> Result<ProbeOutcome> {
        let mut completed = 0;
        let mut pending = Some(first);
        while let Some(message) = pending.take() {
            match receiver.complete(&message).await {
                Ok(()) => {
                    completed += 1;
                    if completed == 1 {
                        self.transition(ProbeState::UnexpectedSuccess);
                    }
                    tracing::warn!(
                        sequence_number = message.sequence_number,
                        completed,
                        "completion succeeded after lock expiry"
                    );
                }
                Err(ProbeError::SessionLockLost(reason)) => {
                    tracing::debug!(%reason, "completion rejected");
                    self.transition(ProbeState::ExpectedLockLost);
                    return Ok(ProbeOutcome::LockLost {
                        completed_before: completed,
                    });
                }
                Err(err) => return Err(err),
            }

            pending = match receiver.receive(self.options.receive_timeout).await {
                Ok(next) => next,
                Err(ProbeError::SessionLockLost(reason)) => {
                    tracing::debug!(%reason, "receive rejected");
                    self.transition(ProbeState::ExpectedLockLost);
                    return Ok(ProbeOutcome::LockLost {
                        completed_before: completed,
                    });
                }
                Err(err) => return Err(err),
            };
        }
        Ok(ProbeOutcome::LeaseOutlivedExpiry { completed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Mutex;
    use uuid::Uuid;

    use crate::clock::TokioClock;
    use crate::domains::message::SessionMessage;
    use crate::domains::queue::QueueDescription;
    use crate::interfaces::broker::MessageSender;

    enum Step {
        Message,
        Empty,
        Fail(fn() -> ProbeError),
    }

    struct ScriptedReceiver {
        locked_until: OffsetDateTime,
        receives: VecDeque<Step>,
        completes: VecDeque<Step>,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SessionReceiver for ScriptedReceiver {
        fn session_id(&self) -> &str {
            "0"
        }

        fn locked_until(&self) -> OffsetDateTime {
            self.locked_until
        }

        async fn receive(&mut self, _max_wait: Duration) -> Result<Option<ReceivedMessage>> {
            match self.receives.pop_front().unwrap_or(Step::Empty) {
                Step::Message => Ok(Some(ReceivedMessage {
                    envelope: SessionMessage::new(0, "m").to_envelope(Uuid::new_v4())?,
                    lock_token: Uuid::new_v4(),
                    sequence_number: 1,
                    delivery_count: 1,
                })),
                Step::Empty => Ok(None),
                Step::Fail(make) => Err(make()),
            }
        }

        async fn complete(&mut self, _message: &ReceivedMessage) -> Result<()> {
            match self.completes.pop_front().unwrap_or(Step::Empty) {
                Step::Fail(make) => Err(make()),
                _ => Ok(()),
            }
        }

        async fn close(&mut self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct ScriptedBroker {
        receiver: Mutex<Option<ScriptedReceiver>>,
    }

    #[async_trait]
    impl Broker for ScriptedBroker {
        async fn get_queue(&self, name: &str) -> Result<QueueDescription> {
            Ok(QueueDescription::new(name))
        }

        async fn create_queue(&self, description: &QueueDescription) -> Result<QueueDescription> {
            Ok(description.clone())
        }

        async fn delete_queue(&self, _name: &str) -> Result<()> {
            Ok(())
        }

        async fn create_sender(&self, _queue: &str) -> Result<Box<dyn MessageSender>> {
            Err(ProbeError::Runtime("unused".to_string()))
        }

        async fn accept_next_session(
            &self,
            _queue: &str,
            _options: SessionReceiverOptions,
        ) -> Result<Box<dyn SessionReceiver>> {
            let receiver = self
                .receiver
                .lock()
                .await
                .take()
                .ok_or_else(|| ProbeError::NoSessionAvailable("q".to_string()))?;
            Ok(Box::new(receiver))
        }
    }

    fn lock_lost() -> ProbeError {
        ProbeError::SessionLockLost("expired".to_string())
    }

    fn broken_pipe() -> ProbeError {
        ProbeError::Http("broken pipe".to_string())
    }

    fn probe(
        clock: Arc<TokioClock>,
        lease: Duration,
        receives: Vec<Step>,
        completes: Vec<Step>,
    ) -> (LockExpiryProbe, Arc<AtomicUsize>) {
        let closes = Arc::new(AtomicUsize::new(0));
        let receiver = ScriptedReceiver {
            locked_until: clock.now() + lease,
            receives: receives.into(),
            completes: completes.into(),
            closes: closes.clone(),
        };
        let broker = Arc::new(ScriptedBroker {
            receiver: Mutex::new(Some(receiver)),
        });
        let options = ProbeOptions {
            grace_period: Duration::from_secs(30),
            ..ProbeOptions::default()
        };
        (LockExpiryProbe::new(broker, clock, options), closes)
    }

    #[test]
    fn delay_never_goes_negative() {
        let now = OffsetDateTime::now_utc();
        assert_eq!(lock_delay(now - Duration::from_secs(5), now), Duration::ZERO);
        assert_eq!(lock_delay(now, now), Duration::ZERO);
        assert_eq!(
            lock_delay(now + Duration::from_millis(1500), now),
            Duration::from_millis(1500)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_first_completion_is_expected() {
        let clock = Arc::new(TokioClock::new());
        let (probe, closes) = probe(
            clock.clone(),
            Duration::from_secs(15),
            vec![Step::Message],
            vec![Step::Fail(lock_lost)],
        );
        let started = tokio::time::Instant::now();
        let report = probe.run("q").await.unwrap();

        assert!(report.is_conformant());
        assert!(report.first_completion_rejected());
        assert_eq!(report.expiry_delay, Duration::from_secs(15));
        assert!(started.elapsed() >= Duration::from_secs(45));
        assert_eq!(
            report.trace,
            vec![
                ProbeState::Idle,
                ProbeState::SessionAccepted,
                ProbeState::MessageReceived,
                ProbeState::AwaitingExpiry,
                ProbeState::AwaitingGracePeriod,
                ProbeState::CompletionAttempted,
                ProbeState::ExpectedLockLost,
            ]
        );
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drained_session_without_rejection_is_a_conformance_failure() {
        let clock = Arc::new(TokioClock::new());
        let (probe, closes) = probe(
            clock,
            Duration::from_secs(15),
            vec![Step::Message, Step::Message, Step::Empty],
            vec![Step::Message, Step::Message],
        );
        let report = probe.run("q").await.unwrap();

        assert!(!report.is_conformant());
        assert_eq!(report.outcome, ProbeOutcome::LeaseOutlivedExpiry { completed: 2 });
        assert_eq!(report.final_state(), ProbeState::UnexpectedSuccess);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lock_lost_during_drain_still_counts_as_expected() {
        let clock = Arc::new(TokioClock::new());
        let (probe, _) = probe(
            clock,
            Duration::from_secs(15),
            vec![Step::Message, Step::Fail(lock_lost)],
            vec![Step::Message],
        );
        let report = probe.run("q").await.unwrap();

        assert!(report.is_conformant());
        assert!(!report.first_completion_rejected());
        assert_eq!(report.outcome, ProbeOutcome::LockLost { completed_before: 1 });
        assert_eq!(report.final_state(), ProbeState::ExpectedLockLost);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_skips_the_first_delay() {
        let clock = Arc::new(TokioClock::new());
        let closes = Arc::new(AtomicUsize::new(0));
        let receiver = ScriptedReceiver {
            locked_until: clock.now() - Duration::from_secs(10),
            receives: vec![Step::Message].into(),
            completes: vec![Step::Fail(lock_lost)].into(),
            closes,
        };
        let broker = Arc::new(ScriptedBroker {
            receiver: Mutex::new(Some(receiver)),
        });
        let report = LockExpiryProbe::new(broker, clock, ProbeOptions::default())
            .run("q")
            .await
            .unwrap();
        assert_eq!(report.expiry_delay, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_first_message_is_a_setup_error() {
        let clock = Arc::new(TokioClock::new());
        let (probe, closes) = probe(clock, Duration::from_secs(15), vec![Step::Empty], vec![]);
        let err = probe.run("q").await.unwrap_err();
        assert!(matches!(err, ProbeError::Setup(_)));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_errors_propagate_and_close_the_receiver() {
        let clock = Arc::new(TokioClock::new());
        let (probe, closes) = probe(
            clock,
            Duration::from_secs(15),
            vec![Step::Message],
            vec![Step::Fail(broken_pipe)],
        );
        let err = probe.run("q").await.unwrap_err();
        assert!(matches!(err, ProbeError::Http(_)));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
