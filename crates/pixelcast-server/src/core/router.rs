use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use pixelcast_proto::{Command, Response, encode_response, parse_command, parse_package};
use tokio::net::{TcpListener, TcpStream, UdpSocket, UnixDatagram};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::subscription_index::SubscriptionIndex;

const INGEST_DATAGRAM_BYTES: usize = 64 * 1024;

/// A subscribed external observer: where its keepalives refresh it and where
/// fan-out datagrams are sent.
struct MonitorClient {
    udp_port: u16,
    last_message_epoch: Instant,
}

/// Owns the MonitorClient table, the Stream/Subscription index, and the UDP
/// socket used to fan packages out to monitors. All mutation happens under a
/// plain mutex, never held across an `.await`.
pub struct Router {
    monitors: Mutex<HashMap<Ipv4Addr, MonitorClient>>,
    subscriptions: Mutex<SubscriptionIndex>,
    fanout_socket: UdpSocket,
    monitor_keepalive_port: u16,
    subscription_timeout: Duration,
}

impl Router {
    pub async fn bind(
        bind_address: Ipv4Addr,
        monitor_keepalive_port: u16,
        subscription_timeout: Duration,
    ) -> Result<Self> {
        let fanout_socket = UdpSocket::bind(SocketAddrV4::new(bind_address, 0))
            .await
            .context("failed to bind monitoring fan-out socket")?;

        Ok(Self {
            monitors: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(SubscriptionIndex::new()),
            fanout_socket,
            monitor_keepalive_port,
            subscription_timeout,
        })
    }

    /// `conn` — registers/refreshes a MonitorClient for `ip_address`,
    /// pointed at `udp_port` for fan-out datagrams.
    fn connect(&self, ip_address: Ipv4Addr, udp_port: u16) {
        self.monitors.lock().unwrap().insert(
            ip_address,
            MonitorClient { udp_port, last_message_epoch: Instant::now() },
        );
    }

    /// `sub` — adds the subscription edge. A no-op if the peer never issued
    /// `conn`.
    fn subscribe(&self, ip_address: Ipv4Addr, stream_id: &str) {
        if !self.monitors.lock().unwrap().contains_key(&ip_address) {
            return;
        }
        self.subscriptions.lock().unwrap().subscribe(ip_address, stream_id);
    }

    /// `unsub` — removes the subscription edge. A silent no-op if absent.
    fn unsubscribe(&self, ip_address: Ipv4Addr, stream_id: &str) {
        self.subscriptions.lock().unwrap().unsubscribe(ip_address, stream_id);
    }

    /// Monitor keepalive: refreshes an existing MonitorClient. Never creates
    /// one — a keepalive from a peer that never issued `conn` is dropped.
    fn monitor_keepalive(&self, ip_address: Ipv4Addr) {
        if let Some(client) = self.monitors.lock().unwrap().get_mut(&ip_address) {
            client.last_message_epoch = Instant::now();
        }
    }

    /// Forwards the raw ingest datagram to every subscriber of its
    /// `stream_id`, verbatim. Per-datagram send errors are swallowed.
    async fn fan_out(&self, datagram: &[u8]) {
        let package = match parse_package(datagram) {
            Ok(package) => package,
            Err(err) => {
                debug!("dropping malformed monitoring package: error={err}");
                return;
            }
        };

        let targets: Vec<SocketAddrV4> = {
            let monitors = self.monitors.lock().unwrap();
            let subscriptions = self.subscriptions.lock().unwrap();
            subscriptions
                .subscribers_of(package.stream_id)
                .filter_map(|ip| monitors.get(&ip).map(|client| SocketAddrV4::new(ip, client.udp_port)))
                .collect()
        };

        for target in targets {
            // A send error here (e.g. ECONNREFUSED from a gone monitor) is
            // dropped silently: no log, no subscription removal. The
            // monitor is reaped by the keepalive-timeout purger instead.
            let _ = self.fanout_socket.send_to(datagram, target).await;
        }
    }

    /// Evicts monitors that have gone `subscription_timeout` without a
    /// keepalive, cascading removal of all of their subscriptions.
    fn purge_subscriptions(&self) {
        let now = Instant::now();
        let expired: Vec<Ipv4Addr> = {
            let monitors = self.monitors.lock().unwrap();
            monitors
                .iter()
                .filter(|(_, c)| now.duration_since(c.last_message_epoch) > self.subscription_timeout)
                .map(|(ip, _)| *ip)
                .collect()
        };

        if expired.is_empty() {
            return;
        }

        let mut monitors = self.monitors.lock().unwrap();
        let mut subscriptions = self.subscriptions.lock().unwrap();
        for ip_address in expired {
            info!("evicting monitor: ip={ip_address}");
            monitors.remove(&ip_address);
            subscriptions.remove_monitor(ip_address);
        }
    }
}

fn peer_ipv4(addr: SocketAddr) -> Option<Ipv4Addr> {
    match addr.ip() {
        std::net::IpAddr::V4(v4) => Some(v4),
        std::net::IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}

/// Runs the local-IPC monitoring ingest loop on an already-bound
/// Unix-domain datagram socket, fanning each parsed Package out. The caller
/// binds the socket (and removes any stale file at `unix_socket_path`
/// first) so a bind failure surfaces at startup instead of inside a
/// detached task; this function removes the socket file again on exit.
pub async fn run_monitor_ingest(
    router: std::sync::Arc<Router>,
    socket: UnixDatagram,
    unix_socket_path: std::path::PathBuf,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("monitoring ingest ready: path={}", unix_socket_path.display());

    let mut buf = vec![0_u8; INGEST_DATAGRAM_BYTES];

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("monitoring ingest stopping");
                break;
            }
            recv = socket.recv(&mut buf) => {
                let len = match recv {
                    Ok(len) => len,
                    Err(err) => {
                        warn!("monitoring ingest recv failed: error={err}");
                        continue;
                    }
                };
                if len == 0 {
                    continue;
                }
                router.fan_out(&buf[..len]).await;
            }
        }
    }

    let _ = std::fs::remove_file(&unix_socket_path);
    Ok(())
}

/// Runs the monitor subscription-control TCP listener on an already-bound
/// listener: one command per connection, response, then close.
pub async fn run_subscription_listener(
    router: std::sync::Arc<Router>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(
        "subscription control listening: port={}",
        listener.local_addr().map(|addr| addr.port()).unwrap_or_default()
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("subscription control stopping");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!("subscription accept failed: error={err}");
                        continue;
                    }
                };
                let router = router.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_subscription_connection(stream, peer, router).await {
                        warn!("subscription client failed: peer={peer}, error={err}");
                    }
                });
            }
        }
    }

    Ok(())
}

async fn handle_subscription_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    router: std::sync::Arc<Router>,
) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let Some(peer_ip) = peer_ipv4(peer) else {
        return Ok(());
    };

    let mut line = Vec::new();
    let mut byte = [0_u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Ok(());
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > 4096 {
            break;
        }
    }

    let response = match std::str::from_utf8(&line) {
        Ok(text) => match parse_command(text) {
            Ok(Command::Conn(udp_port)) => {
                router.connect(peer_ip, udp_port);
                Response::Acc(router.monitor_keepalive_port.to_string())
            }
            Ok(Command::Sub(stream_id)) => {
                router.subscribe(peer_ip, &stream_id);
                Response::Acc("acc".to_string())
            }
            Ok(Command::Unsub(stream_id)) => {
                router.unsubscribe(peer_ip, &stream_id);
                Response::Acc("acc".to_string())
            }
            Err(err) => Response::Err(err.to_string()),
        },
        Err(_) => Response::Err("command is not valid UTF-8".to_string()),
    };

    stream.write_all(&encode_response(&response)).await?;
    Ok(())
}

/// Runs the monitor keepalive UDP listener on an already-bound socket. The
/// socket is bound ahead of time by the caller so its resolved port (which
/// may differ from the configured port when it was `0`, letting the OS
/// choose) is known before the subscription listener starts handing it out
/// in `conn` responses.
pub async fn run_monitor_keepalive_listener(
    router: std::sync::Arc<Router>,
    socket: UdpSocket,
    shutdown: CancellationToken,
) -> Result<()> {
    let port = socket.local_addr().map(|addr| addr.port()).unwrap_or_default();

    info!("monitor keepalive listening: port={port}");

    let mut buf = [0_u8; 512];
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("monitor keepalive listener stopping");
                break;
            }
            recv = socket.recv_from(&mut buf) => {
                let (_, peer) = match recv {
                    Ok(recv) => recv,
                    Err(err) => {
                        warn!("monitor keepalive recv failed: error={err}");
                        continue;
                    }
                };
                if let Some(peer_ip) = peer_ipv4(peer) {
                    router.monitor_keepalive(peer_ip);
                }
            }
        }
    }

    Ok(())
}

/// Runs `purge_subscriptions` every `subscription_timeout / 4`.
pub async fn run_subscription_purge_loop(router: &Router, shutdown: CancellationToken) {
    let cadence = (router.subscription_timeout / 4).max(Duration::from_millis(1));
    let mut ticker = interval(cadence);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("subscription purge loop stopping");
                break;
            }
            _ = ticker.tick() => {
                router.purge_subscriptions();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pixelcast_proto::encode_package;

    fn ip(last_octet: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, last_octet)
    }

    async fn test_router() -> Router {
        Router::bind(Ipv4Addr::LOCALHOST, 9999, Duration::from_secs(3)).await.unwrap()
    }

    #[tokio::test]
    async fn subscribe_without_prior_conn_is_a_noop() {
        let router = test_router().await;
        router.subscribe(ip(1), "fft");
        assert_eq!(router.subscriptions.lock().unwrap().subscribers_of("fft").count(), 0);
    }

    #[tokio::test]
    async fn conn_then_sub_creates_an_edge() {
        let router = test_router().await;
        router.connect(ip(1), 54_321);
        router.subscribe(ip(1), "fft");
        assert_eq!(router.subscriptions.lock().unwrap().subscribers_of("fft").count(), 1);
    }

    #[tokio::test]
    async fn monitor_keepalive_never_creates_a_client() {
        let router = test_router().await;
        router.monitor_keepalive(ip(1));
        assert!(!router.monitors.lock().unwrap().contains_key(&ip(1)));
    }

    #[tokio::test]
    async fn monitor_keepalive_refreshes_an_existing_client() {
        let router = test_router().await;
        router.connect(ip(1), 1);
        let before = router.monitors.lock().unwrap().get(&ip(1)).unwrap().last_message_epoch;
        tokio::time::sleep(Duration::from_millis(5)).await;
        router.monitor_keepalive(ip(1));
        let after = router.monitors.lock().unwrap().get(&ip(1)).unwrap().last_message_epoch;
        assert!(after > before);
    }

    #[tokio::test]
    async fn purge_removes_expired_monitor_and_its_subscriptions() {
        let router = Router::bind(Ipv4Addr::LOCALHOST, 9999, Duration::from_millis(10))
            .await
            .unwrap();
        router.connect(ip(1), 1);
        router.subscribe(ip(1), "fft");

        tokio::time::sleep(Duration::from_millis(30)).await;
        router.purge_subscriptions();

        assert!(!router.monitors.lock().unwrap().contains_key(&ip(1)));
        assert_eq!(router.subscriptions.lock().unwrap().subscribers_of("fft").count(), 0);
    }

    #[tokio::test]
    async fn fan_out_sends_to_every_subscriber_of_the_packages_stream() {
        let router = test_router().await;

        // bind two ephemeral UDP sockets to stand in for monitors
        let monitor_a = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let monitor_b = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).await.unwrap();

        let port_a = monitor_a.local_addr().unwrap().port();
        let port_b = monitor_b.local_addr().unwrap().port();

        // two distinct source IPs so each gets its own MonitorClient entry;
        // only ip(1) subscribes to "fft".
        router.connect(ip(1), port_a);
        router.subscribe(ip(1), "fft");
        router.connect(ip(2), port_b);

        let datagram = encode_package("fft", &[1, 2, 3]);
        router.fan_out(&datagram).await;

        let mut buf = [0_u8; 1024];
        let (len, _) = tokio::time::timeout(Duration::from_secs(1), monitor_a.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], datagram.as_slice());

        let empty = tokio::time::timeout(Duration::from_millis(100), monitor_b.recv_from(&mut buf)).await;
        assert!(empty.is_err());
    }

    #[tokio::test]
    async fn fan_out_drops_malformed_packages() {
        let router = test_router().await;
        router.fan_out(b"no-terminator").await;
    }

    #[tokio::test]
    async fn fan_out_on_unknown_stream_emits_nothing() {
        let router = test_router().await;
        router.connect(ip(1), 1);
        router.subscribe(ip(1), "fft");
        let datagram = encode_package("other-stream", &[9]);
        router.fan_out(&datagram).await;
    }
}
