use std::sync::Arc;

use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::{ProbeSettings, SessionStrategyKind};
use crate::domains::queue::QueueDescription;
use crate::error::Result;
use crate::factories::broker_factory::BrokerFactory;
use crate::interfaces::broker::Broker;
use crate::services::bootstrap::QueueBootstrapper;
use crate::services::probe::{LockExpiryProbe, ProbeOptions, ProbeReport};
use crate::services::sender::{BatchSender, SendReport, SessionAssignment};

/// One bootstrap, send and probe run.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub queue: QueueDescription,
    pub message_count: usize,
    pub assignment: SessionAssignment,
    pub probe: ProbeOptions,
}

impl Scenario {
    pub fn from_settings(settings: &ProbeSettings) -> Self {
        let assignment = match settings.session_strategy {
            SessionStrategyKind::Fixed => SessionAssignment::fixed(0),
            SessionStrategyKind::RoundRobin => SessionAssignment::round_robin(settings.sessions),
            SessionStrategyKind::OnePerMessage => SessionAssignment::one_per_message(),
        };
        Self {
            queue: QueueDescription::new(settings.queue.clone())
                .requiring_session()
                .with_lock_duration(settings.lock_duration())
                .with_max_size_mb(settings.max_size_mb)
                .with_time_to_live(settings.time_to_live()),
            message_count: settings.message_count as usize,
            assignment,
            probe: ProbeOptions {
                prefetch_count: settings.prefetch_count,
                accept_timeout: settings.accept_timeout(),
                receive_timeout: settings.receive_timeout(),
                grace_period: settings.grace_period(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScenarioReport {
    pub queue: QueueDescription,
    pub correlation_id: Uuid,
    pub send: SendReport,
    pub probe: ProbeReport,
}

impl ScenarioReport {
    pub fn is_conformant(&self) -> bool {
        self.probe.is_conformant()
    }
}

pub struct ScenarioRunner {
    broker: Arc<dyn Broker>,
    clock: Arc<dyn Clock>,
    scenario: Scenario,
}

impl ScenarioRunner {
    pub fn new(broker: Arc<dyn Broker>, clock: Arc<dyn Clock>, scenario: Scenario) -> Self {
        Self {
            broker,
            clock,
            scenario,
        }
    }

    /// Validate settings and connect to the broker they name.
    pub fn from_settings(settings: &ProbeSettings) -> Result<Self> {
        let connection = settings.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let broker = BrokerFactory::create(&connection, clock.clone())?;
        Ok(Self::new(broker, clock, Scenario::from_settings(settings)))
    }

    pub fn scenario(&self) -> &Scenario {
        &self.scenario
    }

    pub async fn run(&self) -> Result<ScenarioReport> {
        let scenario = &self.scenario;
        let queue = QueueBootstrapper::new(self.broker.clone())
            .reset(&scenario.queue)
            .await?;

        let correlation_id = Uuid::new_v4();
        let sender = BatchSender::new(
            self.broker.create_sender(&scenario.queue.name).await?,
            correlation_id,
        );
        let send = sender
            .send_messages(scenario.message_count, &scenario.assignment)
            .await;
        let closed = sender.close().await;
        let send = send?;
        closed?;

        let probe = LockExpiryProbe::new(self.broker.clone(), self.clock.clone(), scenario.probe)
            .run(&scenario.queue.name)
            .await?;

        if probe.first_completion_rejected() {
            tracing::info!(
                messages = scenario.message_count,
                prefetch = scenario.probe.prefetch_count,
                "scenario OK: lock expiry was enforced"
            );
        } else if probe.is_conformant() {
            tracing::warn!(
                messages = scenario.message_count,
                prefetch = scenario.probe.prefetch_count,
                "lock loss was observed only after stale completions succeeded"
            );
        } else {
            tracing::error!(
                messages = scenario.message_count,
                prefetch = scenario.probe.prefetch_count,
                "anomaly reproduced: session lock outlived its advertised expiry"
            );
        }

        Ok(ScenarioReport {
            queue,
            correlation_id,
            send,
            probe,
        })
    }
}
