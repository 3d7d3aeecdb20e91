use std::sync::Arc;

use crate::clock::Clock;
use crate::connection::{ConnectionString, Endpoint};
use crate::error::Result;
use crate::interfaces::broker::Broker;
use crate::providers::http::HttpBroker;
use crate::providers::local::{LeasePolicy, LocalBroker};

pub struct BrokerFactory;

impl BrokerFactory {
    /// Build the broker backend named by the connection string's endpoint.
    pub fn create(connection: &ConnectionString, clock: Arc<dyn Clock>) -> Result<Arc<dyn Broker>> {
        match connection.endpoint()? {
            Endpoint::Local(name) => {
                tracing::info!(namespace = %name, "using in-process broker");
                Ok(Arc::new(LocalBroker::new(clock, LeasePolicy::Strict)))
            }
            Endpoint::Http(base_url) => {
                let signer = connection.signer()?;
                tracing::info!(endpoint = %base_url, key_name = signer.key_name(), "using broker gateway");
                Ok(Arc::new(HttpBroker::new(base_url, signer)?))
            }
        }
    }
}
