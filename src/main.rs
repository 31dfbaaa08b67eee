//! Debug adapter for the Glint engine's embedded Lua VM.
//!
//! Speaks the Debug Adapter Protocol over stdio and the engine's
//! binary-framed console protocol over TCP.

use anyhow::Result;
use tracing_subscriber::EnvFilter;

mod protocol;
mod server;
mod transport;

#[tokio::main]
async fn main() -> Result<()> {
    // Stdout carries the DAP stream, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("GLINT_DAP_LOG")
                .try_from_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "glint-dap starting");
    server::run(tokio::io::stdin(), tokio::io::stdout()).await?;
    tracing::info!("glint-dap session ended");
    Ok(())
}
