use std::net::{Ipv4Addr, SocketAddr};

use anyhow::Result;
use pixelcast_proto::{encode_registration_response, read_registration_frame_async};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::supervisor::Supervisor;

/// Runs the device registration TCP listener on an already-bound listener:
/// one registration frame per connection, a launch attempt, a port
/// acknowledgement, then close. The caller binds `listener` so a bind
/// failure surfaces at startup instead of inside a detached task.
pub async fn run_registration_listener(
    supervisor: std::sync::Arc<Supervisor>,
    listener: TcpListener,
    keepalive_udp_port: u16,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(
        "registration listener ready: port={}",
        listener.local_addr().map(|addr| addr.port()).unwrap_or_default()
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("registration listener stopping");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!("registration accept failed: error={err}");
                        continue;
                    }
                };
                let supervisor = supervisor.clone();
                tokio::spawn(async move {
                    handle_registration_connection(stream, peer, supervisor, keepalive_udp_port).await;
                });
            }
        }
    }

    Ok(())
}

/// Reads one registration frame, launches (or replaces) the device's
/// renderer, and writes back the keepalive port. Any read error (bad UTF-8,
/// no terminator before the peer disconnects) is discarded silently — the
/// connection is simply dropped with no reply.
async fn handle_registration_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    supervisor: std::sync::Arc<Supervisor>,
    keepalive_udp_port: u16,
) {
    let Some(peer_ip) = peer_ipv4(peer) else {
        return;
    };

    let frame = match read_registration_frame_async(&mut stream).await {
        Ok(frame) => frame,
        Err(err) => {
            warn!("malformed registration frame: peer={peer_ip}, error={err}");
            return;
        }
    };

    supervisor.launch_for(&frame.device_id, peer_ip, frame.port).await;

    let response = encode_registration_response(keepalive_udp_port);
    if let Err(err) = stream.write_all(&response).await {
        warn!("failed to write registration response: peer={peer_ip}, error={err}");
    }
}

fn peer_ipv4(addr: SocketAddr) -> Option<Ipv4Addr> {
    match addr.ip() {
        std::net::IpAddr::V4(v4) => Some(v4),
        std::net::IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}
