use std::sync::Arc;

use clap::Parser;
use session_lock_probe::clock::SystemClock;
use session_lock_probe::connection::{SasSigner, DEFAULT_KEY_NAME};
use session_lock_probe::daemon::{self, AppState};
use session_lock_probe::error::{ProbeError, Result};
use session_lock_probe::providers::local::{LeasePolicy, LocalBroker};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "session-lock-brokerd")]
#[command(about = "Session-aware broker gateway backed by the in-process broker")]
struct Cli {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 7979)]
    port: u16,

    #[arg(long, default_value = DEFAULT_KEY_NAME)]
    key_name: String,

    #[arg(long, env = "SESSION_LOCK_BROKERD_KEY", hide_env_values = true)]
    key: String,

    #[arg(long, value_enum, default_value_t = LeasePolicy::Strict)]
    lease_policy: LeasePolicy,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,session_lock_probe=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let cli = Cli::parse();
    if cli.key.trim().is_empty() {
        return Err(ProbeError::Config(
            "a shared access key is required".to_string(),
        ));
    }

    let state = AppState {
        broker: LocalBroker::new(Arc::new(SystemClock), cli.lease_policy),
        signer: SasSigner::new(cli.key_name, cli.key),
    };
    daemon::run(&cli.host, cli.port, state).await
}
