#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use session_lock_probe::clock::{Clock, TokioClock};
use session_lock_probe::client::{Scenario, ScenarioRunner};
use session_lock_probe::config::ProbeSettings;
use session_lock_probe::domains::message::Envelope;
use session_lock_probe::domains::queue::QueueDescription;
use session_lock_probe::error::Result;
use session_lock_probe::interfaces::broker::{
    Broker, MessageSender, SessionReceiver, SessionReceiverOptions,
};
use session_lock_probe::providers::local::{LeasePolicy, LocalBroker};

pub const KEY_NAME: &str = "RootManageSharedAccessKey";
pub const KEY: &str = "c2VjcmV0LWtleS1mb3ItdGVzdHM=";

/// Wraps a broker and counts `send_batch` calls made through its senders.
pub struct CountingBroker {
    inner: Arc<dyn Broker>,
    pub batches: Arc<AtomicUsize>,
}

impl CountingBroker {
    pub fn new(inner: Arc<dyn Broker>) -> Self {
        Self {
            inner,
            batches: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn batch_count(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }
}

struct CountingSender {
    inner: Box<dyn MessageSender>,
    batches: Arc<AtomicUsize>,
}

#[async_trait]
impl MessageSender for CountingSender {
    fn queue_name(&self) -> &str {
        self.inner.queue_name()
    }

    async fn send_batch(&self, batch: &[Envelope]) -> Result<()> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        self.inner.send_batch(batch).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

#[async_trait]
impl Broker for CountingBroker {
    async fn get_queue(&self, name: &str) -> Result<QueueDescription> {
        self.inner.get_queue(name).await
    }

    async fn create_queue(&self, description: &QueueDescription) -> Result<QueueDescription> {
        self.inner.create_queue(description).await
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        self.inner.delete_queue(name).await
    }

    async fn create_sender(&self, queue: &str) -> Result<Box<dyn MessageSender>> {
        Ok(Box::new(CountingSender {
            inner: self.inner.create_sender(queue).await?,
            batches: self.batches.clone(),
        }))
    }

    async fn accept_next_session(
        &self,
        queue: &str,
        options: SessionReceiverOptions,
    ) -> Result<Box<dyn SessionReceiver>> {
        self.inner.accept_next_session(queue, options).await
    }
}

pub fn local_broker(policy: LeasePolicy) -> (LocalBroker, Arc<dyn Clock>) {
    let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
    (LocalBroker::new(clock.clone(), policy), clock)
}

pub fn settings(message_count: u32, prefetch_count: u32) -> ProbeSettings {
    ProbeSettings {
        connection_string: Some("Endpoint=local://tests".to_string()),
        message_count,
        prefetch_count,
        ..ProbeSettings::default()
    }
}

pub fn runner(
    broker: Arc<dyn Broker>,
    clock: Arc<dyn Clock>,
    settings: &ProbeSettings,
) -> ScenarioRunner {
    ScenarioRunner::new(broker, clock, Scenario::from_settings(settings))
}

/// One-second lease with no grace period, for runs against real time.
pub fn short_lock(settings: ProbeSettings) -> ProbeSettings {
    ProbeSettings {
        lock_duration_secs: 1,
        grace_secs: 0,
        receive_timeout_ms: 200,
        ..settings
    }
}
