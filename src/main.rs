use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use session_lock_probe::client::ScenarioRunner;
use session_lock_probe::config::{ProbeSettings, SessionStrategyKind};
use session_lock_probe::error::Result;

#[derive(Parser, Debug)]
#[command(name = "session-lock-probe")]
#[command(about = "Checks that a broker rejects completions after a session lock expires")]
struct Cli {
    #[arg(long, env = "SESSION_LOCK_PROBE_CONNECTION_STRING", hide_env_values = true)]
    connection_string: Option<String>,

    #[arg(long, help = "JSON settings file; flags given here take precedence")]
    config: Option<PathBuf>,

    #[arg(long)]
    message_count: Option<u32>,

    #[arg(long)]
    prefetch: Option<u32>,

    #[arg(long)]
    queue: Option<String>,

    #[arg(long)]
    lock_duration_secs: Option<u64>,

    #[arg(long)]
    grace_secs: Option<u64>,

    #[arg(long)]
    receive_timeout_ms: Option<u64>,

    #[arg(long)]
    max_size_mb: Option<u64>,

    #[arg(long)]
    ttl_secs: Option<u64>,

    #[arg(long, value_enum)]
    session_strategy: Option<SessionStrategyKind>,

    #[arg(long)]
    sessions: Option<u32>,

    #[arg(
        long,
        default_value_t = false,
        help = "Exit with a failure status when the anomaly is reproduced"
    )]
    strict: bool,
}

impl Cli {
    fn settings(&self) -> Result<ProbeSettings> {
        let mut settings = match &self.config {
            Some(path) => ProbeSettings::from_file(path)?,
            None => ProbeSettings::default(),
        };
        if let Some(value) = &self.connection_string {
            settings.connection_string = Some(value.clone());
        }
        if let Some(value) = self.message_count {
            settings.message_count = value;
        }
        if let Some(value) = self.prefetch {
            settings.prefetch_count = value;
        }
        if let Some(value) = &self.queue {
            settings.queue = value.clone();
        }
        if let Some(value) = self.lock_duration_secs {
            settings.lock_duration_secs = value;
        }
        if let Some(value) = self.grace_secs {
            settings.grace_secs = value;
        }
        if let Some(value) = self.receive_timeout_ms {
            settings.receive_timeout_ms = value;
        }
        if let Some(value) = self.max_size_mb {
            settings.max_size_mb = value;
        }
        if let Some(value) = self.ttl_secs {
            settings.ttl_secs = value;
        }
        if let Some(value) = self.session_strategy {
            settings.session_strategy = value;
        }
        if let Some(value) = self.sessions {
            settings.sessions = value;
        }
        Ok(settings)
    }
}

async fn run(cli: &Cli) -> Result<bool> {
    let settings = cli.settings()?;
    let runner = ScenarioRunner::from_settings(&settings)?;
    tracing::info!(
        queue = %settings.queue,
        messages = settings.message_count,
        prefetch = settings.prefetch_count,
        lock_duration_secs = settings.lock_duration_secs,
        grace_secs = settings.grace_secs,
        "starting session lock probe"
    );
    let report = runner.run().await?;
    tracing::info!(
        session_id = %report.probe.session_id,
        outcome = ?report.probe.outcome,
        batches = report.send.batches,
        correlation_id = %report.correlation_id,
        "probe finished"
    );
    Ok(report.is_conformant())
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,session_lock_probe=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    match run(&cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) if cli.strict => ExitCode::FAILURE,
        Ok(false) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "session lock probe failed");
            ExitCode::FAILURE
        }
    }
}
