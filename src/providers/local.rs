//! In-process broker with session leases.
//!
//! Leases are granted for the queue's lock duration when a session is accepted
//! and are never extended: there is no renewal operation. Under
//! [`LeasePolicy::Strict`] a lease stops authorizing receive and complete calls
//! at `locked_until`, and the messages it held return to the head of their
//! session for redelivery. [`LeasePolicy::NeverExpire`] keeps leases valid
//! until the receiver closes, which reproduces the lease-outlives-expiry
//! symptom the probe looks for.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::clock::Clock;
use crate::domains::gateway::AcceptedSession;
use crate::domains::message::{Envelope, ReceivedMessage};
use crate::domains::queue::QueueDescription;
use crate::error::{ProbeError, Result};
use crate::interfaces::broker::{
    Broker, MessageSender, SessionReceiver, SessionReceiverOptions, MAX_BATCH_MESSAGES,
};
use crate::interfaces::transport::SessionLink;
use crate::providers::prefetch::PrefetchingReceiver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum LeasePolicy {
    #[default]
    Strict,
    NeverExpire,
}

#[derive(Clone)]
pub struct LocalBroker {
    inner: Arc<Namespace>,
}

struct Namespace {
    state: Mutex<NamespaceState>,
    activity: Notify,
    clock: Arc<dyn Clock>,
    policy: LeasePolicy,
}

#[derive(Default)]
struct NamespaceState {
    queues: HashMap<String, QueueState>,
    receivers: HashMap<Uuid, Binding>,
}

impl NamespaceState {
    fn queue_mut(&mut self, name: &str) -> Result<&mut QueueState> {
        self.queues
            .get_mut(name)
            .ok_or_else(|| ProbeError::EntityNotFound(format!("queue '{name}'")))
    }

    fn binding(&self, receiver_id: Uuid) -> Result<(String, String)> {
        self.receivers
            .get(&receiver_id)
            .map(|binding| (binding.queue.clone(), binding.session_id.clone()))
            .ok_or_else(|| {
                ProbeError::SessionLockLost(format!(
                    "receiver {receiver_id} holds no session lease"
                ))
            })
    }
}

struct Binding {
    queue: String,
    session_id: String,
}

struct QueueState {
    description: QueueDescription,
    sessions: BTreeMap<String, VecDeque<StoredMessage>>,
    leases: HashMap<String, Lease>,
    size_bytes: u64,
    next_sequence: u64,
}

#[derive(Clone)]
struct StoredMessage {
    envelope: Envelope,
    sequence_number: u64,
    delivery_count: u32,
    expires_at: OffsetDateTime,
}

impl StoredMessage {
    fn size(&self) -> u64 {
        self.envelope.body.len() as u64
    }
}

struct Lease {
    receiver_id: Uuid,
    locked_until: OffsetDateTime,
    locked: HashMap<Uuid, StoredMessage>,
}

impl Lease {
    fn is_live(&self, now: OffsetDateTime, policy: LeasePolicy) -> bool {
        match policy {
            LeasePolicy::Strict => now < self.locked_until,
            LeasePolicy::NeverExpire => true,
        }
    }
}

impl QueueState {
    fn new(description: QueueDescription) -> Self {
        Self {
            description,
            sessions: BTreeMap::new(),
            leases: HashMap::new(),
            size_bytes: 0,
            next_sequence: 1,
        }
    }

    fn snapshot(&self) -> QueueDescription {
        let queued: usize = self.sessions.values().map(VecDeque::len).sum();
        let locked: usize = self.leases.values().map(|lease| lease.locked.len()).sum();
        let mut description = self.description.clone();
        description.message_count = (queued + locked) as u64;
        description
    }

    fn enqueue(&mut self, envelope: Envelope, expires_at: OffsetDateTime) {
        let message = StoredMessage {
            expires_at,
            sequence_number: self.next_sequence,
            delivery_count: 0,
            envelope,
        };
        self.next_sequence += 1;
        self.size_bytes += message.size();
        self.sessions
            .entry(message.envelope.session_id.clone())
            .or_default()
            .push_back(message);
    }

    fn purge_expired(&mut self, now: OffsetDateTime) {
        let mut dropped = 0u64;
        for messages in self.sessions.values_mut() {
            messages.retain(|message| {
                let keep = message.expires_at > now;
                if !keep {
                    dropped += message.size();
                }
                keep
            });
        }
        self.sessions.retain(|_, messages| !messages.is_empty());
        self.size_bytes = self.size_bytes.saturating_sub(dropped);
    }

    fn restore(&mut self, session_id: &str, mut messages: Vec<StoredMessage>) {
        if messages.is_empty() {
            return;
        }
        messages.sort_by_key(|message| std::cmp::Reverse(message.sequence_number));
        let queue = self.sessions.entry(session_id.to_string()).or_default();
        for message in messages {
            queue.push_front(message);
        }
    }

    /// Drop leases that are no longer live and return the receivers that held them.
    fn reclaim_expired_leases(&mut self, now: OffsetDateTime, policy: LeasePolicy) -> Vec<Uuid> {
        let expired: Vec<String> = self
            .leases
            .iter()
            .filter(|(_, lease)| !lease.is_live(now, policy))
            .map(|(session_id, _)| session_id.clone())
            .collect();
        let mut holders = Vec::with_capacity(expired.len());
        for session_id in expired {
            if let Some(lease) = self.leases.remove(&session_id) {
                holders.push(lease.receiver_id);
                tracing::debug!(
                    queue = %self.description.name,
                    session_id = %session_id,
                    returned = lease.locked.len(),
                    "session lease expired"
                );
                self.restore(&session_id, lease.locked.into_values().collect());
            }
        }
        holders
    }

    fn release(&mut self, session_id: &str, receiver_id: Uuid) {
        let owned = self
            .leases
            .get(session_id)
            .is_some_and(|lease| lease.receiver_id == receiver_id);
        if !owned {
            return;
        }
        if let Some(lease) = self.leases.remove(session_id) {
            self.restore(session_id, lease.locked.into_values().collect());
        }
    }

    fn next_lease_expiry(&self) -> Option<OffsetDateTime> {
        self.leases.values().map(|lease| lease.locked_until).min()
    }

    fn accept(
        &mut self,
        now: OffsetDateTime,
        receiver_id: Uuid,
    ) -> Result<Option<(String, OffsetDateTime)>> {
        let Some(session_id) = self
            .sessions
            .iter()
            .find(|(session_id, messages)| {
                !messages.is_empty() && !self.leases.contains_key(session_id.as_str())
            })
            .map(|(session_id, _)| session_id.clone())
        else {
            return Ok(None);
        };
        let locked_until = later(now, self.description.lock_duration)?;
        self.leases.insert(
            session_id.clone(),
            Lease {
                receiver_id,
                locked_until,
                locked: HashMap::new(),
            },
        );
        Ok(Some((session_id, locked_until)))
    }

    fn take_locked(
        &mut self,
        session_id: &str,
        receiver_id: Uuid,
        max_messages: u32,
        now: OffsetDateTime,
        policy: LeasePolicy,
    ) -> Result<Vec<ReceivedMessage>> {
        let lease = match self.leases.get_mut(session_id) {
            Some(lease) if lease.receiver_id == receiver_id && lease.is_live(now, policy) => lease,
            _ => return Err(lock_lost(session_id)),
        };
        let Some(queue) = self.sessions.get_mut(session_id) else {
            return Ok(Vec::new());
        };
        let mut received = Vec::new();
        while received.len() < max_messages as usize {
            let Some(mut message) = queue.pop_front() else {
                break;
            };
            message.delivery_count += 1;
            let lock_token = Uuid::new_v4();
            received.push(ReceivedMessage {
                envelope: message.envelope.clone(),
                lock_token,
                sequence_number: message.sequence_number,
                delivery_count: message.delivery_count,
            });
            lease.locked.insert(lock_token, message);
        }
        if queue.is_empty() {
            self.sessions.remove(session_id);
        }
        Ok(received)
    }
}

fn lock_lost(session_id: &str) -> ProbeError {
    ProbeError::SessionLockLost(format!(
        "the lock on session '{session_id}' expired or was released"
    ))
}

fn later(now: OffsetDateTime, after: Duration) -> Result<OffsetDateTime> {
    time::Duration::try_from(after)
        .ok()
        .and_then(|after| now.checked_add(after))
        .ok_or_else(|| ProbeError::Broker(format!("{after:?} after {now} is out of range")))
}

fn wake_at(now: OffsetDateTime, at: OffsetDateTime) -> Instant {
    let remaining = Duration::try_from(at - now).unwrap_or(Duration::ZERO);
    Instant::now() + remaining
}

impl LocalBroker {
    pub fn new(clock: Arc<dyn Clock>, policy: LeasePolicy) -> Self {
        Self {
            inner: Arc::new(Namespace {
                state: Mutex::new(NamespaceState::default()),
                activity: Notify::new(),
                clock,
                policy,
            }),
        }
    }

    pub fn policy(&self) -> LeasePolicy {
        self.inner.policy
    }

    pub async fn send(&self, queue: &str, batch: &[Envelope]) -> Result<()> {
        if batch.len() > MAX_BATCH_MESSAGES {
            return Err(ProbeError::Broker(format!(
                "batch of {} messages exceeds the limit of {MAX_BATCH_MESSAGES}",
                batch.len()
            )));
        }
        let now = self.inner.clock.now();
        {
            let mut state = self.inner.state.lock().await;
            let queue_state = state.queue_mut(queue)?;
            queue_state.purge_expired(now);
            if queue_state.description.requires_session
                && batch.iter().any(|envelope| envelope.session_id.is_empty())
            {
                return Err(ProbeError::Broker(format!(
                    "queue '{queue}' requires a session id on every message"
                )));
            }
            let incoming: u64 = batch.iter().map(|envelope| envelope.body.len() as u64).sum();
            if queue_state.size_bytes + incoming > queue_state.description.max_size_bytes() {
                return Err(ProbeError::QuotaExceeded(format!(
                    "queue '{queue}' is limited to {} MB",
                    queue_state.description.max_size_in_megabytes
                )));
            }
            let expires_at = later(now, queue_state.description.default_message_time_to_live)?;
            for envelope in batch {
                queue_state.enqueue(envelope.clone(), expires_at);
            }
        }
        self.inner.activity.notify_waiters();
        Ok(())
    }

    /// Lock the first session that has messages and no live lease.
    pub async fn accept_session(&self, queue: &str, max_wait: Duration) -> Result<AcceptedSession> {
        let deadline = Instant::now() + max_wait;
        loop {
            let activity = self.inner.activity.notified();
            let wake = {
                let mut state = self.inner.state.lock().await;
                let now = self.inner.clock.now();
                let receiver_id = Uuid::new_v4();
                let queue_state = state.queue_mut(queue)?;
                if !queue_state.description.requires_session {
                    return Err(ProbeError::Broker(format!(
                        "queue '{queue}' does not require sessions"
                    )));
                }
                queue_state.purge_expired(now);
                let reclaimed = queue_state.reclaim_expired_leases(now, self.inner.policy);
                let accepted = queue_state.accept(now, receiver_id);
                let next_expiry = match self.inner.policy {
                    LeasePolicy::Strict => queue_state.next_lease_expiry(),
                    LeasePolicy::NeverExpire => None,
                };
                for holder in reclaimed {
                    state.receivers.remove(&holder);
                }
                let accepted = accepted?;
                if let Some((session_id, locked_until)) = accepted {
                    state.receivers.insert(
                        receiver_id,
                        Binding {
                            queue: queue.to_string(),
                            session_id: session_id.clone(),
                        },
                    );
                    tracing::debug!(
                        queue,
                        session_id = %session_id,
                        %receiver_id,
                        %locked_until,
                        "session accepted"
                    );
                    return Ok(AcceptedSession {
                        receiver_id,
                        session_id,
                        locked_until,
                    });
                }
                next_expiry
                    .map(|at| wake_at(now, at).min(deadline))
                    .unwrap_or(deadline)
            };
            let woke = tokio::time::timeout_at(wake, activity).await.is_ok();
            if !woke && Instant::now() >= deadline {
                return Err(ProbeError::NoSessionAvailable(format!(
                    "no session became available on '{queue}' within {max_wait:?}"
                )));
            }
        }
    }

    /// Lock up to `max_messages` from the receiver's session.
    ///
    /// Returns an empty batch when nothing arrives within `max_wait`.
    pub async fn fetch(
        &self,
        receiver_id: Uuid,
        max_messages: u32,
        max_wait: Duration,
    ) -> Result<Vec<ReceivedMessage>> {
        let deadline = Instant::now() + max_wait;
        loop {
            let activity = self.inner.activity.notified();
            {
                let mut state = self.inner.state.lock().await;
                let now = self.inner.clock.now();
                let (queue, session_id) = state.binding(receiver_id)?;
                let queue_state = state.queue_mut(&queue)?;
                queue_state.purge_expired(now);
                let received = queue_state.take_locked(
                    &session_id,
                    receiver_id,
                    max_messages,
                    now,
                    self.inner.policy,
                )?;
                if !received.is_empty() {
                    return Ok(received);
                }
            }
            if tokio::time::timeout_at(deadline, activity).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    pub async fn complete(&self, receiver_id: Uuid, lock_token: Uuid) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let now = self.inner.clock.now();
        let (queue, session_id) = state.binding(receiver_id)?;
        let queue_state = state.queue_mut(&queue)?;
        let lease = match queue_state.leases.get_mut(&session_id) {
            Some(lease)
                if lease.receiver_id == receiver_id && lease.is_live(now, self.inner.policy) =>
            {
                lease
            }
            _ => return Err(lock_lost(&session_id)),
        };
        let Some(message) = lease.locked.remove(&lock_token) else {
            return Err(ProbeError::SessionLockLost(format!(
                "lock token {lock_token} is not held under session '{session_id}'"
            )));
        };
        queue_state.size_bytes = queue_state.size_bytes.saturating_sub(message.size());
        Ok(())
    }

    pub async fn release(&self, receiver_id: Uuid) -> Result<()> {
        {
            let mut state = self.inner.state.lock().await;
            let Some(binding) = state.receivers.remove(&receiver_id) else {
                return Ok(());
            };
            if let Some(queue_state) = state.queues.get_mut(&binding.queue) {
                queue_state.release(&binding.session_id, receiver_id);
            }
        }
        self.inner.activity.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl Broker for LocalBroker {
    async fn get_queue(&self, name: &str) -> Result<QueueDescription> {
        let mut state = self.inner.state.lock().await;
        let now = self.inner.clock.now();
        let queue_state = state.queue_mut(name)?;
        queue_state.purge_expired(now);
        Ok(queue_state.snapshot())
    }

    async fn create_queue(&self, description: &QueueDescription) -> Result<QueueDescription> {
        if description.name.trim().is_empty() {
            return Err(ProbeError::Broker("queue name must not be empty".to_string()));
        }
        description.check_limits()?;
        let mut state = self.inner.state.lock().await;
        if state.queues.contains_key(&description.name) {
            return Err(ProbeError::EntityAlreadyExists(format!(
                "queue '{}'",
                description.name
            )));
        }
        let mut stored = description.clone();
        stored.message_count = 0;
        let queue_state = QueueState::new(stored);
        let created = queue_state.snapshot();
        state.queues.insert(description.name.clone(), queue_state);
        Ok(created)
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        {
            let mut state = self.inner.state.lock().await;
            if state.queues.remove(name).is_none() {
                return Err(ProbeError::EntityNotFound(format!("queue '{name}'")));
            }
            state.receivers.retain(|_, binding| binding.queue != name);
        }
        self.inner.activity.notify_waiters();
        Ok(())
    }

    async fn create_sender(&self, queue: &str) -> Result<Box<dyn MessageSender>> {
        Ok(Box::new(LocalSender {
            broker: self.clone(),
            queue: queue.to_string(),
        }))
    }

    async fn accept_next_session(
        &self,
        queue: &str,
        options: SessionReceiverOptions,
    ) -> Result<Box<dyn SessionReceiver>> {
        let accepted = self.accept_session(queue, options.max_wait).await?;
        let link = LocalLink {
            broker: self.clone(),
            receiver_id: accepted.receiver_id,
        };
        Ok(Box::new(PrefetchingReceiver::new(
            link,
            accepted.session_id,
            accepted.locked_until,
            options.prefetch_count,
        )))
    }
}

pub struct LocalSender {
    broker: LocalBroker,
    queue: String,
}

#[async_trait]
impl MessageSender for LocalSender {
    fn queue_name(&self) -> &str {
        &self.queue
    }

    async fn send_batch(&self, batch: &[Envelope]) -> Result<()> {
        self.broker.send(&self.queue, batch).await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct LocalLink {
    broker: LocalBroker,
    receiver_id: Uuid,
}

#[async_trait]
impl SessionLink for LocalLink {
    async fn fetch(&self, max_messages: u32, max_wait: Duration) -> Result<Vec<ReceivedMessage>> {
        self.broker
            .fetch(self.receiver_id, max_messages, max_wait)
            .await
    }

    async fn settle(&self, lock_token: Uuid) -> Result<()> {
        self.broker.complete(self.receiver_id, lock_token).await
    }

    async fn release(&self) -> Result<()> {
        self.broker.release(self.receiver_id).await
    }
}
