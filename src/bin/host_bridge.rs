//! Headless host bridge binary for stdin/stdout JSON communication.
//!
//! A locally spawned client writes inbound messages as newline-delimited
//! JSON to this process's stdin and reads outbound messages from its stdout.
//!
//! All tracing/diagnostic output goes to stderr so that stdout remains a
//! clean JSON protocol channel.

use clap::Parser;
use deskpet::PetConfig;
use deskpet::host::AgentServer;
use deskpet::host::stdio::run_stdio_bridge;
use deskpet::pipeline::EchoBackend;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Stdio bridge between a desktop character client and the response pipeline.
#[derive(Parser)]
#[command(name = "deskpet-host", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Stdout is reserved for the JSON protocol.
    let (stderr, _guard) = tracing_appender::non_blocking(std::io::stderr());
    tracing_subscriber::fmt()
        .with_writer(stderr)
        .with_ansi(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("deskpet=info")),
        )
        .init();

    let path = cli.config.unwrap_or_else(PetConfig::default_config_path);
    let config = PetConfig::load_or_default(&path)?;
    tracing::info!(config = %path.display(), "deskpet-host starting");

    let server = Arc::new(AgentServer::with_backend(
        config,
        Arc::new(EchoBackend::default()),
    )?);

    run_stdio_bridge(server).await.map_err(|e| {
        tracing::error!(error = %e, "deskpet-host exited with error");
        anyhow::anyhow!("deskpet-host failed: {e}")
    })?;

    tracing::info!("deskpet-host shut down cleanly");
    Ok(())
}
