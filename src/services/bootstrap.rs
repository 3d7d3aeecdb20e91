use std::sync::Arc;

use crate::domains::queue::QueueDescription;
use crate::error::{ProbeError, Result};
use crate::interfaces::broker::Broker;

/// Puts a session-enabled queue into a known, empty state.
pub struct QueueBootstrapper {
    broker: Arc<dyn Broker>,
}

impl QueueBootstrapper {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Delete the queue if it exists, then create it from `description`.
    ///
    /// Safe to call repeatedly. Every failure other than "not found" on delete
    /// is a setup error and is not retried.
    pub async fn reset(&self, description: &QueueDescription) -> Result<QueueDescription> {
        let name = description.name.as_str();
        match self.broker.delete_queue(name).await {
            Ok(()) => tracing::info!(queue = name, "deleted existing queue"),
            Err(ProbeError::EntityNotFound(_)) => {
                tracing::debug!(queue = name, "queue did not exist")
            }
            Err(err) => {
                return Err(ProbeError::Setup(format!(
                    "failed to delete queue '{name}': {err}"
                )))
            }
        }

        let created = self
            .broker
            .create_queue(description)
            .await
            .map_err(|e| ProbeError::Setup(format!("failed to create queue '{name}': {e}")))?;
        if created.name != description.name
            || created.requires_session != description.requires_session
            || created.lock_duration != description.lock_duration
        {
            return Err(ProbeError::Setup(format!(
                "queue '{name}' was created with unexpected settings: {created:?}"
            )));
        }
        tracing::info!(
            queue = name,
            requires_session = created.requires_session,
            lock_duration = ?created.lock_duration,
            max_size_mb = created.max_size_in_megabytes,
            "queue created"
        );
        Ok(created)
    }
}
