//! Data structures used throughout the warden daemon.
//!
//! A [`Workload`] is the persisted, serialisable description of one managed
//! container.  Everything that must only exist at container start time (the
//! tunnel token, the broker's current port list) travels separately in
//! [`LaunchExtras`] so that it is rebuilt on every start and never stored.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Restart policy handed to the container engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicyKind {
    No,
    Always,
    UnlessStopped,
    OnFailure,
}

/// Descriptor of a managed workload.
///
/// Identity is `name`; the container engine enforces uniqueness.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Workload {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    /// Bind mounts in engine syntax, `host:container[:mode]`.
    #[serde(default)]
    pub binds: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
    pub restart_policy: RestartPolicyKind,
}

/// One `host:container` publish pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
}

/// Whoever currently holds a host port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortOccupant {
    pub port: u16,
    /// Listening process, if a host socket is bound.  Ports forwarded by the
    /// engine without a userland proxy have none.
    pub pid: Option<u32>,
    /// Name of the container whose forwarding table claims the port.
    pub owner: Option<String>,
}

impl PortOccupant {
    pub fn is_owned_by(&self, name: &str) -> bool {
        self.owner.as_deref() == Some(name)
    }
}

/// The tunnel authentication token.
///
/// Not serialisable; `Debug` output is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Start-time arguments layered on top of a [`Workload`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchExtras {
    pub ports: Vec<PortMapping>,
    /// Environment variable name and value injected at container creation.
    pub secret_env: Option<(String, Secret)>,
}

/// A workload descriptor together with the arguments for one start.
#[derive(Debug, Clone)]
pub struct LaunchSpec<'a> {
    pub workload: &'a Workload,
    pub extras: LaunchExtras,
}

impl LaunchSpec<'_> {
    /// Full environment for the container, secret included.
    pub fn environment(&self) -> Vec<String> {
        let mut env = self.workload.env.clone();
        if let Some((key, secret)) = &self.extras.secret_env {
            env.push(format!("{}={}", key, secret.expose()));
        }
        env
    }
}
