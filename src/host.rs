//! Host provisioning: files that are written only when their content
//! changes, the service-manager unit, the tunnel secret and hardening.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::process::Command;

use crate::error::{Error, Result};

const JOURNALD_UNIT: &str = "systemd-journald.service";
const JOURNALD_VOLATILE: &str = "[Journal]\nStorage=volatile\n";
const RESTART_DELAY_SECS: u32 = 10;

/// Write `content` to `path` with `mode` unless it already holds exactly
/// that content.  The write goes through a sibling temp file and a rename,
/// so a running executable can be replaced.  Returns whether it wrote.
pub fn write_if_changed(path: &Path, content: &[u8], mode: u32) -> Result<bool> {
    match fs::read(path) {
        Ok(existing) if existing == content => return Ok(false),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::io(path, e)),
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.new", file_name));

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(&tmp)
        .map_err(|e| Error::io(&tmp, e))?;
    file.write_all(content).map_err(|e| Error::io(&tmp, e))?;
    file.sync_all().map_err(|e| Error::io(&tmp, e))?;
    drop(file);

    fs::set_permissions(&tmp, fs::Permissions::from_mode(mode)).map_err(|e| Error::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| Error::io(path, e))?;
    Ok(true)
}

/// Copy the running build to `install_path` if it is absent or different.
pub fn install_self(running: &[u8], install_path: &Path) -> Result<bool> {
    let written = write_if_changed(install_path, running, 0o755)?;
    if written {
        info!("Installed current build to {}", install_path.display());
    }
    Ok(written)
}

/// The service unit that keeps the daemon alive.
pub fn render_unit(exec_start: &Path) -> String {
    format!(
        "[Unit]\n\
         Description=Host warden for the tunnel and broker containers\n\
         After=docker.service\n\
         Requires=docker.service\n\
         \n\
         [Service]\n\
         ExecStart={}\n\
         Restart=always\n\
         RestartSec={}\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        exec_start.display(),
        RESTART_DELAY_SECS
    )
}

/// Outcome of bootstrapping the tunnel secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretStatus {
    Existing,
    Written,
}

/// Make sure the secret file exists, writing `bootstrap` (owner-only) if
/// it does not.  An existing file is never overwritten.
pub fn ensure_secret(path: &Path, bootstrap: Option<&str>) -> Result<SecretStatus> {
    if path.exists() {
        if bootstrap.is_some() {
            debug!("Secret file {} exists, ignoring bootstrap argument", path.display());
        }
        return Ok(SecretStatus::Existing);
    }
    let token = bootstrap
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| Error::MissingSecret(path.to_path_buf()))?;
    write_if_changed(path, token.as_bytes(), 0o600)?;
    info!("Wrote tunnel secret to {}", path.display());
    Ok(SecretStatus::Written)
}

/// Keep logs off disk and the host firewall out of the way.
///
/// The firewall and journald restarts are best-effort.
pub async fn harden(journald_dropin: &Path, services: &dyn ServiceManager) -> Result<()> {
    if write_if_changed(journald_dropin, JOURNALD_VOLATILE.as_bytes(), 0o644)? {
        info!("Journald set to volatile storage");
        if let Err(e) = services.restart(JOURNALD_UNIT).await {
            warn!("Failed to restart {}: {}", JOURNALD_UNIT, e);
        }
    }
    if let Err(e) = services.disable_firewall().await {
        debug!("Firewall not disabled: {}", e);
    }
    Ok(())
}

#[async_trait]
pub trait ServiceManager: Send + Sync {
    async fn daemon_reload(&self) -> Result<()>;
    async fn enable(&self, unit: &str) -> Result<()>;
    async fn restart(&self, unit: &str) -> Result<()>;
    async fn disable_firewall(&self) -> Result<()>;
    /// Whether this process was started by the service manager.
    fn supervises_us(&self) -> bool;
}

pub struct Systemd;

impl Systemd {
    async fn run(program: &str, args: &[&str]) -> Result<()> {
        let command = format!("{} {}", program, args.join(" "));
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Command {
                command: command.clone(),
                detail: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(Error::Command {
                command,
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ServiceManager for Systemd {
    async fn daemon_reload(&self) -> Result<()> {
        Self::run("systemctl", &["daemon-reload"]).await
    }

    async fn enable(&self, unit: &str) -> Result<()> {
        Self::run("systemctl", &["enable", unit]).await
    }

    async fn restart(&self, unit: &str) -> Result<()> {
        Self::run("systemctl", &["restart", unit]).await
    }

    async fn disable_firewall(&self) -> Result<()> {
        Self::run("ufw", &["disable"]).await
    }

    fn supervises_us(&self) -> bool {
        std::env::var_os("INVOCATION_ID").is_some()
    }
}
