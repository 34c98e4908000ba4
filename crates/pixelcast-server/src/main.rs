mod app;
mod config;
mod core;

use std::net::SocketAddrV4;
use std::sync::Arc;

use anyhow::{Context, Result};
use app::AppState;
use config::Config;
use core::{
    Router, Supervisor, run_device_keepalive_listener, run_monitor_ingest,
    run_monitor_keepalive_listener, run_process_purge_loop, run_registration_listener,
    run_subscription_listener, run_subscription_purge_loop,
};
use pixelcast_helpers::{logging, shutdown};
use tokio::net::{TcpListener, UdpSocket, UnixDatagram};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    logging::init_logging(
        "pixelcast_server=info,tokio=warn",
        "PIXELCAST_LOG",
        "pixelcast-server",
    );

    let config = Config::load().context("failed to load configuration")?;

    // Bind the monitor keepalive socket before the router so its resolved
    // port (the config value may be `0`, letting the OS choose) is known
    // ahead of the first `conn` response that hands it out.
    let monitor_keepalive_socket = UdpSocket::bind(SocketAddrV4::new(
        config.address,
        config.monitor_keepalive_udp_port,
    ))
    .await
    .context("failed to bind monitor keepalive listener")?;
    let monitor_keepalive_port = monitor_keepalive_socket
        .local_addr()
        .context("failed to read monitor keepalive listener address")?
        .port();

    let registration_listener = TcpListener::bind(SocketAddrV4::new(config.address, config.port))
        .await
        .context("failed to bind registration listener")?;
    let device_keepalive_socket = UdpSocket::bind(SocketAddrV4::new(config.address, config.udp_port))
        .await
        .context("failed to bind device keepalive listener")?;
    let subscription_listener =
        TcpListener::bind(SocketAddrV4::new(config.address, config.subscription_port))
            .await
            .context("failed to bind subscription control listener")?;

    let _ = std::fs::remove_file(&config.unix_socket);
    let monitor_ingest_socket = UnixDatagram::bind(&config.unix_socket).with_context(|| {
        format!("failed to bind monitoring ingest socket {}", config.unix_socket.display())
    })?;

    let supervisor = Arc::new(Supervisor::new(config.devices.clone(), config.device_timeout()));
    let router = Arc::new(
        Router::bind(config.address, monitor_keepalive_port, config.subscription_timeout())
            .await
            .context("failed to bind monitoring router")?,
    );

    let state = AppState { supervisor: supervisor.clone(), router: router.clone(), shutdown: CancellationToken::new() };

    info!(
        "server starting: address={}, registration_port={}, keepalive_port={}, subscription_port={}, \
         monitor_keepalive_port={}, unix_socket={}",
        config.address,
        config.port,
        config.udp_port,
        config.subscription_port,
        monitor_keepalive_port,
        config.unix_socket.display(),
    );

    tokio::spawn(shutdown::listen_shutdown(state.shutdown.clone()));

    tokio::spawn(run_registration_listener(
        state.supervisor.clone(),
        registration_listener,
        config.udp_port,
        state.shutdown.clone(),
    ));

    tokio::spawn(run_device_keepalive_listener(
        state.supervisor.clone(),
        device_keepalive_socket,
        state.shutdown.clone(),
    ));

    tokio::spawn(run_monitor_ingest(
        state.router.clone(),
        monitor_ingest_socket,
        config.unix_socket.clone(),
        state.shutdown.clone(),
    ));

    tokio::spawn(run_subscription_listener(
        state.router.clone(),
        subscription_listener,
        state.shutdown.clone(),
    ));

    tokio::spawn(run_monitor_keepalive_listener(
        state.router.clone(),
        monitor_keepalive_socket,
        state.shutdown.clone(),
    ));

    {
        let supervisor = state.supervisor.clone();
        let shutdown = state.shutdown.clone();
        tokio::spawn(async move {
            run_process_purge_loop(&supervisor, shutdown).await;
        });
    }

    {
        let router = state.router.clone();
        let shutdown = state.shutdown.clone();
        tokio::spawn(async move {
            run_subscription_purge_loop(&router, shutdown).await;
        });
    }

    state.shutdown.cancelled().await;
    info!("shutdown signal observed, cleaning up surviving renderers");
    supervisor.cleanup().await;

    Ok(())
}
