pub mod client;
pub mod clock;
pub mod config;
pub mod connection;
pub mod daemon;
pub mod domains;
pub mod error;
pub mod factories;
pub mod interfaces;
pub mod providers;
pub mod services;

pub use crate::client::{Scenario, ScenarioReport, ScenarioRunner};
pub use crate::config::ProbeSettings;
pub use crate::error::{ProbeError, Result};
pub use crate::interfaces::broker::{Broker, MessageSender, SessionReceiver};
pub use crate::services::probe::{ProbeOutcome, ProbeReport, ProbeState};
