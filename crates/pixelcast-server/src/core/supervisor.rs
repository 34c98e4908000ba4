use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::DeviceProfile;

/// A live renderer child process and the device it was launched for.
struct RegisteredProcess {
    child: Child,
    device_id: String,
    last_response_epoch: Instant,
}

#[derive(Debug, Error, PartialEq, Eq)]
enum TemplateError {
    #[error("command template is empty")]
    Empty,
    #[error("unbalanced `{{` in command template")]
    UnbalancedBrace,
    #[error("unknown placeholder `{{{0}}}` in command template")]
    UnknownPlaceholder(String),
}

/// Owns every [`RegisteredProcess`] and enforces the one-process-per-IP
/// invariant. Mutations happen under a plain `std::sync::Mutex` that is never
/// held across an `.await` point, matching the single-threaded-cooperative
/// ordering guarantees the wider design assumes.
pub struct Supervisor {
    profiles: HashMap<String, DeviceProfile>,
    processes: Mutex<HashMap<Ipv4Addr, RegisteredProcess>>,
    device_timeout: Duration,
}

impl Supervisor {
    pub fn new(devices: Vec<DeviceProfile>, device_timeout: Duration) -> Self {
        let profiles = devices.into_iter().map(|d| (d.device_id.clone(), d)).collect();
        Self { profiles, processes: Mutex::new(HashMap::new()), device_timeout }
    }

    /// Launches (or replaces) the renderer for `device_id` at `ip_address`.
    /// Fails open: an unknown device id, a bad template, or a spawn failure
    /// is warn-logged and leaves no RegisteredProcess behind.
    pub async fn launch_for(&self, device_id: &str, ip_address: Ipv4Addr, port: u16) {
        let Some(profile) = self.profiles.get(device_id) else {
            warn!("no process configured for device id: device_id={device_id}");
            return;
        };

        let argv = match substitute_template(&profile.command_template, ip_address, port) {
            Ok(argv) => argv,
            Err(err) => {
                warn!(
                    "invalid command template for device {device_id}: error={err}"
                );
                return;
            }
        };

        let Some((program, args)) = argv.split_first() else {
            warn!("command template for device {device_id} produced an empty command line");
            return;
        };

        // At most one RegisteredProcess per ip_address: tear down any prior
        // renderer before spawning the replacement.
        self.teardown(ip_address).await;

        let mut command = Command::new(program);
        command.args(args);
        command.kill_on_drop(true);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(
                    "failed to spawn renderer: device_id={device_id}, ip={ip_address}, error={err}"
                );
                return;
            }
        };

        info!(
            "renderer launched: device_id={device_id}, ip={ip_address}, port={port}"
        );

        self.processes.lock().unwrap().insert(
            ip_address,
            RegisteredProcess {
                child,
                device_id: device_id.to_string(),
                last_response_epoch: Instant::now(),
            },
        );
    }

    /// Refreshes the last-response timestamp for `ip_address`. A no-op if no
    /// RegisteredProcess is registered for it.
    pub fn response_from(&self, ip_address: Ipv4Addr) {
        if let Some(process) = self.processes.lock().unwrap().get_mut(&ip_address) {
            process.last_response_epoch = Instant::now();
        }
    }

    /// Kills and reaps every RegisteredProcess that has gone `device_timeout`
    /// without a keepalive.
    pub async fn purge_processes(&self) {
        let now = Instant::now();
        let expired: Vec<Ipv4Addr> = {
            let processes = self.processes.lock().unwrap();
            processes
                .iter()
                .filter(|(_, p)| now.duration_since(p.last_response_epoch) >= self.device_timeout)
                .map(|(ip, _)| *ip)
                .collect()
        };

        for ip_address in expired {
            info!("purging renderer: ip={ip_address}");
            self.teardown(ip_address).await;
        }
    }

    /// Kills and reaps every surviving renderer. Must run on orderly shutdown
    /// so no child process leaks past the parent's own exit.
    pub async fn cleanup(&self) {
        let remaining: Vec<(Ipv4Addr, RegisteredProcess)> =
            self.processes.lock().unwrap().drain().collect();

        for (ip_address, mut process) in remaining {
            info!(
                "cleanup: killing renderer: device_id={}, ip={ip_address}",
                process.device_id
            );
            kill_and_reap(&mut process.child).await;
        }
    }

    async fn teardown(&self, ip_address: Ipv4Addr) {
        let removed = self.processes.lock().unwrap().remove(&ip_address);
        if let Some(mut process) = removed {
            kill_and_reap(&mut process.child).await;
        }
    }

    #[cfg(test)]
    fn has_process(&self, ip_address: Ipv4Addr) -> bool {
        self.processes.lock().unwrap().contains_key(&ip_address)
    }
}

async fn kill_and_reap(child: &mut Child) {
    let _ = child.kill().await;
    let _ = child.wait().await;
}

/// Splits the template on whitespace into argv tokens, then substitutes
/// `{ip_address}`/`{port}` placeholders inside each token. Mirrors the
/// upstream reference implementation, which tokenizes before substituting so
/// a placeholder may appear anywhere within an argv element.
fn substitute_template(
    template: &str,
    ip_address: Ipv4Addr,
    port: u16,
) -> Result<Vec<String>, TemplateError> {
    if template.trim().is_empty() {
        return Err(TemplateError::Empty);
    }

    template
        .split_whitespace()
        .map(|token| substitute_token(token, ip_address, port))
        .collect()
}

fn substitute_token(
    token: &str,
    ip_address: Ipv4Addr,
    port: u16,
) -> Result<String, TemplateError> {
    let mut output = String::with_capacity(token.len());
    let mut rest = token;

    loop {
        match rest.find('{') {
            None => {
                output.push_str(rest);
                return Ok(output);
            }
            Some(start) => {
                output.push_str(&rest[..start]);
                let after_brace = &rest[start + 1..];
                let end = after_brace.find('}').ok_or(TemplateError::UnbalancedBrace)?;
                let name = &after_brace[..end];
                match name {
                    "ip_address" => output.push_str(&ip_address.to_string()),
                    "port" => output.push_str(&port.to_string()),
                    other => return Err(TemplateError::UnknownPlaceholder(other.to_string())),
                }
                rest = &after_brace[end + 1..];
            }
        }
    }
}

/// Runs `purge_processes` every `device_timeout / 4`, cancellable at its
/// sleep point.
pub async fn run_process_purge_loop(supervisor: &Supervisor, shutdown: CancellationToken) {
    let cadence = (supervisor.device_timeout / 4).max(Duration::from_millis(1));
    let mut ticker = interval(cadence);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("process purge loop stopping");
                break;
            }
            _ = ticker.tick() => {
                supervisor.purge_processes().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip() -> Ipv4Addr {
        Ipv4Addr::new(1, 2, 3, 4)
    }

    #[test]
    fn substitutes_both_placeholders_anywhere_in_a_token() {
        let argv = substitute_template(
            "some command {ip_address} {port}",
            ip(),
            60_000,
        )
        .unwrap();
        assert_eq!(argv, vec!["some", "command", "1.2.3.4", "60000"]);
    }

    #[test]
    fn substitutes_placeholder_embedded_in_a_larger_token() {
        let argv = substitute_template("cmd --target={ip_address}:{port}", ip(), 42).unwrap();
        assert_eq!(argv, vec!["cmd", "--target=1.2.3.4:42"]);
    }

    #[test]
    fn rejects_unknown_placeholder() {
        let err = substitute_template("cmd {bogus}", ip(), 1).unwrap_err();
        assert_eq!(err, TemplateError::UnknownPlaceholder("bogus".to_string()));
    }

    #[test]
    fn rejects_unbalanced_brace() {
        let err = substitute_template("cmd {ip_address", ip(), 1).unwrap_err();
        assert_eq!(err, TemplateError::UnbalancedBrace);
    }

    #[tokio::test]
    async fn launch_for_unknown_device_is_a_noop() {
        let supervisor = Supervisor::new(vec![], Duration::from_secs(3));
        supervisor.launch_for("ghost", ip(), 1).await;
        assert!(!supervisor.has_process(ip()));
    }

    #[tokio::test]
    async fn launch_for_spawns_and_response_from_refreshes_timestamp() {
        let supervisor = Supervisor::new(
            vec![DeviceProfile {
                device_id: "dev".to_string(),
                command_template: "true".to_string(),
            }],
            Duration::from_secs(3),
        );

        supervisor.launch_for("dev", ip(), 60_000).await;
        assert!(supervisor.has_process(ip()));

        supervisor.response_from(ip());
        assert!(supervisor.has_process(ip()));

        supervisor.response_from(Ipv4Addr::new(9, 9, 9, 9));
    }

    #[tokio::test]
    async fn purge_evicts_only_expired_processes() {
        let supervisor =
            Supervisor::new(
                vec![DeviceProfile {
                    device_id: "dev".to_string(),
                    command_template: "sleep 5".to_string(),
                }],
                Duration::from_millis(20),
            );

        supervisor.launch_for("dev", ip(), 1).await;
        assert!(supervisor.has_process(ip()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        supervisor.purge_processes().await;
        assert!(!supervisor.has_process(ip()));
    }

    #[tokio::test]
    async fn re_registering_the_same_ip_replaces_the_prior_process() {
        let supervisor = Supervisor::new(
            vec![DeviceProfile {
                device_id: "dev".to_string(),
                command_template: "sleep 5".to_string(),
            }],
            Duration::from_secs(3),
        );

        supervisor.launch_for("dev", ip(), 60_000).await;
        assert!(supervisor.has_process(ip()));
        supervisor.launch_for("dev", ip(), 256).await;
        assert!(supervisor.has_process(ip()));
        assert_eq!(supervisor.processes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cleanup_drains_every_surviving_process() {
        let supervisor = Supervisor::new(
            vec![DeviceProfile {
                device_id: "dev".to_string(),
                command_template: "sleep 5".to_string(),
            }],
            Duration::from_secs(3),
        );

        supervisor.launch_for("dev", ip(), 1).await;
        supervisor.cleanup().await;
        assert!(!supervisor.has_process(ip()));
    }
}
