use std::{net::SocketAddr, time::Duration};

use anyhow::Context;
use device_sim::{config::load_settings, device::DeviceState, run_push_loop, serve, SimState};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let state = SimState::new(DeviceState::with_sources(settings.sources.iter().map(String::as_str)));
    tokio::spawn(run_push_loop(
        state.clone(),
        Duration::from_millis(settings.push_interval_ms),
    ));

    let addr: SocketAddr = settings
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind address: {}", settings.bind_addr))?;
    info!(%addr, sources = ?settings.sources, "device simulator listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve(listener, state).await
}
