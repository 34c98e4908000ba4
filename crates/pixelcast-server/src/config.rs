use std::env;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_address")]
    pub address: Ipv4Addr,
    pub port: u16,
    pub udp_port: u16,
    #[serde(default)]
    pub devices: Vec<DeviceProfile>,
    pub unix_socket: PathBuf,
    pub subscription_port: u16,
    #[serde(default)]
    pub monitor_keepalive_udp_port: u16,
    #[serde(
        default,
        deserialize_with = "pixelcast_helpers::de::deserialize_optional_duration"
    )]
    pub device_timeout: Option<Duration>,
    #[serde(
        default,
        deserialize_with = "pixelcast_helpers::de::deserialize_optional_duration"
    )]
    pub subscription_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceProfile {
    pub device_id: String,
    pub command_template: String,
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = parse_config_path_arg(env::args().skip(1))?
            .or_else(resolve_server_config_path)
            .context(
                "server config path not found (PIXELCAST_CONFIG_PATH or pixelcast.yaml/pixelcast.yml)",
            )?;

        let mut config = load_config_yaml(&config_path)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    pub fn device_timeout(&self) -> Duration {
        self.device_timeout.unwrap_or(default_timeout())
    }

    pub fn subscription_timeout(&self) -> Duration {
        self.subscription_timeout.unwrap_or(default_timeout())
    }

    fn normalize(&mut self) {
        let floor = Duration::from_secs(1);
        self.device_timeout = Some(self.device_timeout.unwrap_or(default_timeout()).max(floor));
        self.subscription_timeout =
            Some(self.subscription_timeout.unwrap_or(default_timeout()).max(floor));

        for device in &mut self.devices {
            device.device_id = device.device_id.trim().to_string();
            device.command_template = device.command_template.trim().to_string();
        }
    }

    fn validate(&self) -> Result<()> {
        if self.unix_socket.as_os_str().is_empty() {
            bail!("server config missing `unix_socket`");
        }

        for device in &self.devices {
            if device.device_id.is_empty() {
                bail!("server config has a device entry with an empty `device_id`");
            }
            if device.command_template.is_empty() {
                bail!(
                    "server config device `{}` has an empty `command_template`",
                    device.device_id
                );
            }
        }

        let mut seen = std::collections::HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.device_id.as_str()) {
                bail!("server config has duplicate device_id `{}`", device.device_id);
            }
        }

        Ok(())
    }
}

fn parse_config_path_arg<I>(mut args: I) -> Result<Option<PathBuf>>
where
    I: Iterator<Item = String>,
{
    let first = args.next();
    let second = args.next();

    if let Some(arg) = second {
        bail!(
            "too many arguments: {arg} (usage: pixelcast-server [config-path])"
        );
    }

    if matches!(first.as_deref(), Some("-h" | "--help")) {
        bail!("usage: pixelcast-server [config-path]");
    }

    Ok(first.map(PathBuf::from))
}

fn load_config_yaml(path: &Path) -> Result<Config> {
    let raw = std::fs::read(path).with_context(|| {
        format!("failed to read config file {}", path.display())
    })?;
    serde_yaml::from_slice(&raw).with_context(|| {
        format!("failed to parse YAML config {}", path.display())
    })
}

fn resolve_server_config_path() -> Option<PathBuf> {
    if let Some(path) = non_empty_env("PIXELCAST_CONFIG_PATH") {
        return Some(PathBuf::from(path));
    }

    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let cwd_yaml = cwd.join("pixelcast.yaml");
    if cwd_yaml.exists() {
        return Some(cwd_yaml);
    }

    let cwd_yml = cwd.join("pixelcast.yml");
    if cwd_yml.exists() {
        return Some(cwd_yml);
    }

    None
}

fn default_address() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

fn default_timeout() -> Duration {
    Duration::from_secs(3)
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
    })
}
