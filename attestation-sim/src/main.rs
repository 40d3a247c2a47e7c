//! Device simulator binary.
//!
//! Configuration comes from `SIM_*` environment variables, log filtering
//! from `RUST_LOG`.

use anyhow::Context;
use attestation_sim::{serve, SimConfig};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = SimConfig::from_env().context("loading simulator configuration")?;
    init_tracing(config.log_json);

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;

    tokio::select! {
        _ = serve(listener, Arc::new(config)) => {}
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
