//! WebSocket server binary.

use clap::Parser;
use deskpet::PetConfig;
use deskpet::host::AgentServer;
use deskpet::host::ws;
use deskpet::pipeline::EchoBackend;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Serve the response pipeline to desktop character clients over WebSocket.
#[derive(Parser)]
#[command(name = "deskpet-server", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address; overrides `server.bind_addr`.
    #[arg(short, long)]
    bind: Option<String>,

    /// Send replies whole instead of streaming them word by word.
    #[arg(long)]
    no_stream: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (stderr, _guard) = tracing_appender::non_blocking(std::io::stderr());
    tracing_subscriber::fmt()
        .with_writer(stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("deskpet=info")),
        )
        .init();

    let path = cli.config.unwrap_or_else(PetConfig::default_config_path);
    let mut config = PetConfig::load_or_default(&path)?;
    if let Some(bind) = cli.bind {
        config.server.bind_addr = bind;
    }
    let bind_addr = config.server.bind_addr.clone();
    info!(config = %path.display(), bind = %bind_addr, "deskpet-server starting");

    let backend = EchoBackend {
        stream: !cli.no_stream,
        ..EchoBackend::default()
    };
    let server = Arc::new(AgentServer::with_backend(config, Arc::new(backend))?);

    tokio::select! {
        result = ws::serve(server, &bind_addr) => result?,
        _ = tokio::signal::ctrl_c() => info!("interrupt received; shutting down"),
    }
    Ok(())
}
