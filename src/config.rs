use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::types::{RestartPolicyKind, Workload};

const DEFAULT_CONFIG_FILE: &str = "/etc/hostwarden/hostwarden.toml";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub docker_socket: PathBuf,
    pub proc_root: PathBuf,
    pub update_interval_secs: u64,
    pub max_backoff_secs: u64,
    pub fetch_retries: u32,
    pub self_update_url: String,
    pub port_mappings_url: String,
    pub install_path: PathBuf,
    pub unit_path: PathBuf,
    pub unit_name: String,
    pub secret_path: PathBuf,
    pub tunnel_token_env: String,
    pub harden: bool,
    pub journald_dropin: PathBuf,
    /// Whether plain host processes squatting on a broker port get SIGKILL.
    pub kill_unmanaged: bool,
    pub tunnel: Workload,
    pub broker: Workload,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            docker_socket: "/var/run/docker.sock".into(),
            proc_root: "/proc".into(),
            update_interval_secs: 60,
            max_backoff_secs: 900,
            fetch_retries: 2,
            self_update_url: String::new(),
            port_mappings_url: String::new(),
            install_path: "/usr/local/bin/hostwarden".into(),
            unit_path: "/etc/systemd/system/hostwarden.service".into(),
            unit_name: "hostwarden.service".into(),
            secret_path: "/etc/hostwarden/tunnel.token".into(),
            tunnel_token_env: "TUNNEL_TOKEN".into(),
            harden: true,
            journald_dropin: "/etc/systemd/journald.conf.d/hostwarden.conf".into(),
            kill_unmanaged: true,
            tunnel: Workload {
                name: "tunnel".into(),
                image: "cloudflare/cloudflared:latest".into(),
                command: vec!["tunnel".into(), "--no-autoupdate".into(), "run".into()],
                binds: Vec::new(),
                env: Vec::new(),
                network_mode: Some("host".into()),
                restart_policy: RestartPolicyKind::UnlessStopped,
            },
            broker: Workload {
                name: "broker".into(),
                image: "eclipse-mosquitto:2".into(),
                command: Vec::new(),
                binds: Vec::new(),
                env: Vec::new(),
                network_mode: None,
                restart_policy: RestartPolicyKind::UnlessStopped,
            },
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let file = std::env::var("HOSTWARDEN_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.into());
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(file))
            .merge(Json::file("hostwarden.json"))
            .merge(Env::prefixed("HOSTWARDEN_").ignore(&["config"]).split("__"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.self_update_url.trim().is_empty() {
            anyhow::bail!("self_update_url must be set");
        }
        if self.port_mappings_url.trim().is_empty() {
            anyhow::bail!("port_mappings_url must be set");
        }
        if self.tunnel.name == self.broker.name {
            anyhow::bail!(
                "tunnel and broker must have distinct names (both are {:?})",
                self.tunnel.name
            );
        }
        if self.update_interval_secs == 0 {
            anyhow::bail!("update_interval_secs must be greater than zero");
        }
        Ok(())
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs.max(self.update_interval_secs))
    }
}
