//! stratus-agent — runs on every VM.
//!
//! # Usage
//!
//! ```text
//! stratus-agent --port 6868 --state-file /var/vcap/bosh/state.json
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use stratus_agent::{ApplyHandler, build_router};

#[derive(Parser)]
#[command(name = "stratus-agent", about = "Stratus VM agent")]
struct Cli {
    /// Port to listen on.
    #[arg(long, default_value = "6868")]
    port: u16,

    /// Where the applied spec is persisted.
    #[arg(long, default_value = "/var/lib/stratus-agent/state.json")]
    state_file: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,stratus_agent=debug")),
        )
        .init();

    let cli = Cli::parse();
    let handler = Arc::new(ApplyHandler::new(cli.state_file));
    info!(path = ?handler.state_path(), "apply handler ready");

    let router = build_router(handler);
    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "agent listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    info!("agent stopped");
    Ok(())
}
