//! OPC UA <-> MQTT gateway binary.
//!
//! Loads `config.toml` (or `$OPCUA_MQTT_GATEWAY_CONFIG`), opens both
//! connections, bridges the configured metrics until SIGINT/SIGTERM, then
//! closes everything and exits 0. Any startup failure exits non-zero.

use anyhow::{Context, Result};
use opcua_mqtt_gateway::config::{config_path_from_env, load_config};
use opcua_mqtt_gateway::shutdown::TerminationSignal;
use opcua_mqtt_gateway::{FatalError, Gateway};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}

/// Fatal gateway errors carry their own status; anything else is a plain failure.
fn exit_code(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<FatalError>()
        .map(FatalError::exit_code)
        .unwrap_or(1)
}

async fn run() -> Result<()> {
    let path = config_path_from_env();
    let config = load_config(&path)
        .await
        .map_err(FatalError::from)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    info!(metrics = config.metrics.len(), "configuration loaded successfully");

    let termination =
        TerminationSignal::install().context("failed to register termination signal handlers")?;

    let gateway = Gateway::from_config(config)?;
    let running = gateway
        .start()
        .await
        .context("error occurred while connecting or creating session")?;

    let report = running.run_until(termination.recv()).await;
    if !report.is_clean() {
        info!(issues = report.issues.len(), "exiting after shutdown errors");
    }
    Ok(())
}
