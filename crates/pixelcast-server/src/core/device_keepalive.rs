use std::net::{Ipv4Addr, SocketAddr};

use anyhow::Result;
use pixelcast_proto::parse_device_keepalive;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::supervisor::Supervisor;

const MAX_DATAGRAM_BYTES: usize = 512;

/// Runs the device keepalive UDP listener on an already-bound socket: each
/// datagram refreshes the RegisteredProcess owning the sender's IP, if any.
pub async fn run_device_keepalive_listener(
    supervisor: std::sync::Arc<Supervisor>,
    socket: UdpSocket,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(
        "device keepalive listening: port={}",
        socket.local_addr().map(|addr| addr.port()).unwrap_or_default()
    );

    let mut buf = [0_u8; MAX_DATAGRAM_BYTES];

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("device keepalive listener stopping");
                break;
            }
            recv = socket.recv_from(&mut buf) => {
                let (len, peer) = match recv {
                    Ok(recv) => recv,
                    Err(err) => {
                        warn!("device keepalive recv failed: error={err}");
                        continue;
                    }
                };
                handle_datagram(&supervisor, &buf[..len], peer);
            }
        }
    }

    Ok(())
}

fn handle_datagram(supervisor: &Supervisor, datagram: &[u8], peer: SocketAddr) {
    let keepalive = match parse_device_keepalive(datagram) {
        Ok(keepalive) => keepalive,
        Err(err) => {
            debug!("dropping malformed device keepalive: peer={peer}, error={err}");
            return;
        }
    };

    let Some(peer_ip) = peer_ipv4(peer) else {
        return;
    };

    supervisor.response_from(peer_ip);

    if keepalive.frames > 0 {
        let rate = keepalive.rendered as f64 / keepalive.frames as f64;
        debug!(
            "device keepalive: peer={peer_ip}, frames={}, rendered={}, rate={rate:.3}",
            keepalive.frames, keepalive.rendered
        );
    }
}

fn peer_ipv4(addr: SocketAddr) -> Option<Ipv4Addr> {
    match addr.ip() {
        std::net::IpAddr::V4(v4) => Some(v4),
        std::net::IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::DeviceProfile;

    #[tokio::test]
    async fn keepalive_refreshes_registered_process_timestamp() {
        let supervisor = std::sync::Arc::new(Supervisor::new(
            vec![DeviceProfile {
                device_id: "dev".to_string(),
                command_template: "true".to_string(),
            }],
            Duration::from_secs(3),
        ));
        supervisor.launch_for("dev", Ipv4Addr::new(1, 2, 3, 4), 60_000).await;

        handle_datagram(&supervisor, b"10 11", SocketAddr::from((Ipv4Addr::new(1, 2, 3, 4), 60_000)));
        handle_datagram(&supervisor, b"garbage", SocketAddr::from((Ipv4Addr::new(1, 2, 3, 4), 60_000)));
        handle_datagram(&supervisor, b"1 1", SocketAddr::from((Ipv4Addr::new(9, 9, 9, 9), 1)));
    }

    #[tokio::test]
    async fn zero_frames_does_not_divide_by_zero() {
        let supervisor = std::sync::Arc::new(Supervisor::new(vec![], Duration::from_secs(3)));
        handle_datagram(&supervisor, b"0 0", SocketAddr::from((Ipv4Addr::new(1, 1, 1, 1), 1)));
    }
}
