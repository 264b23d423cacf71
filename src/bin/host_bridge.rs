//! Headless host bridge binary for stdin/stdout JSON communication.
//!
//! Reads `CommandEnvelope` messages as newline-delimited JSON from stdin and
//! writes `ResponseEnvelope` and `EventEnvelope` messages to stdout.
//!
//! Usage: `cadence-host [config.toml]`. Without an argument the default
//! config path is used when it exists, otherwise built-in defaults.
//!
//! All tracing/diagnostic output goes to stderr so that stdout remains a
//! clean JSON protocol channel.

use std::path::PathBuf;

use cadence::config::AgentConfig;
use cadence::host::stdio::run_stdio_bridge;

fn load_config() -> anyhow::Result<AgentConfig> {
    let explicit = std::env::args_os().nth(1).map(PathBuf::from);
    let path = match explicit {
        Some(path) => path,
        None => {
            let default = AgentConfig::default_config_path();
            if !default.exists() {
                tracing::info!("no config file found; using defaults");
                return Ok(AgentConfig::default());
            }
            default
        }
    };
    tracing::info!(path = %path.display(), "loading config");
    AgentConfig::from_file(&path)
        .map_err(|e| anyhow::anyhow!("failed to load config {}: {e}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Stdout is reserved for the JSON protocol.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("cadence-host starting");
    let config = load_config()?;

    run_stdio_bridge(config).await.map_err(|e| {
        tracing::error!(error = %e, "cadence-host exited with error");
        anyhow::anyhow!("cadence-host failed: {e}")
    })?;

    tracing::info!("cadence-host shut down cleanly");
    Ok(())
}
