//! Resolution of who holds a host port.
//!
//! Two sources are combined:
//!
//! * the host's listening TCP sockets, read from `<proc>/net/tcp` and
//!   `<proc>/net/tcp6` and mapped back to a pid through the socket inodes
//!   found under `<proc>/<pid>/fd`;
//! * the container engine's forwarding table, which names the container a
//!   published port belongs to.
//!
//! Containers on the host network publish nothing, so a listener without a
//! forwarding entry is matched to a running container through the container
//! id in `<proc>/<pid>/cgroup`.
//!
//! Both IPv4 and IPv6 tables are scanned since many services bind `::` only.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use log::trace;

use crate::error::{Error, Result};
use crate::runtime::ContainerRuntime;
use crate::types::PortOccupant;

/// TCP state code for LISTEN in the proc tables.
const TCP_LISTEN: u8 = 0x0A;

#[async_trait]
pub trait PortInspector: Send + Sync {
    /// Current occupant of `port`, or `None` if nothing holds it.
    async fn occupant(&self, port: u16) -> Result<Option<PortOccupant>>;
}

/// Inspector backed by procfs and the container engine.
pub struct HostPortInspector {
    proc_root: PathBuf,
    runtime: Arc<dyn ContainerRuntime>,
}

impl HostPortInspector {
    pub fn new(proc_root: impl Into<PathBuf>, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            proc_root: proc_root.into(),
            runtime,
        }
    }

    fn listener_pid(&self, port: u16) -> Result<Option<u32>> {
        let mut inodes = HashSet::new();
        for table in ["net/tcp", "net/tcp6"] {
            let path = self.proc_root.join(table);
            if !path.exists() {
                continue;
            }
            let content = fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
            inodes.extend(listening_inodes(&content, port, &path)?);
        }
        // Inode 0 belongs to sockets in a transitional state; no fd points at it.
        inodes.remove(&0);

        if inodes.is_empty() {
            return Ok(None);
        }
        find_socket_owner(&self.proc_root, &inodes)
    }

    /// Running container whose cgroup holds `pid`, if any.
    async fn container_of(&self, pid: u32) -> Result<Option<String>> {
        let path = self.proc_root.join(pid.to_string()).join("cgroup");
        let Ok(cgroup) = fs::read_to_string(&path) else {
            trace!("Skipping unreadable {}", path.display());
            return Ok(None);
        };

        Ok(self
            .runtime
            .running_containers()
            .await?
            .into_iter()
            .find(|c| in_container_cgroup(&cgroup, &c.id))
            .map(|c| c.name))
    }
}

#[async_trait]
impl PortInspector for HostPortInspector {
    async fn occupant(&self, port: u16) -> Result<Option<PortOccupant>> {
        let owner = self
            .runtime
            .published_ports()
            .await?
            .into_iter()
            .find(|p| p.host_port == port)
            .map(|p| p.container);
        let pid = self.listener_pid(port)?;
        let owner = match (owner, pid) {
            (None, Some(pid)) => self.container_of(pid).await?,
            (owner, _) => owner,
        };

        if owner.is_none() && pid.is_none() {
            return Ok(None);
        }
        Ok(Some(PortOccupant { port, pid, owner }))
    }
}

/// Socket inodes listening on `port` in a `/proc/net/tcp{,6}` table.
///
/// Each line after the header looks like
/// ```text
///    0: 00000000:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12345 ...
/// ```
/// The port after the colon of `local_address` is big-endian hex; the
/// address part is irrelevant here, any bind address counts.
fn listening_inodes(content: &str, port: u16, path: &Path) -> Result<Vec<u64>> {
    let parse_err = |detail: String| Error::ProcParse {
        path: path.to_path_buf(),
        detail,
    };
    let mut inodes = Vec::new();

    for line in content.lines().skip(1) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 10 {
            continue;
        }

        let local_port = parts[1]
            .rsplit_once(':')
            .and_then(|(_, p)| u16::from_str_radix(p, 16).ok())
            .ok_or_else(|| parse_err(format!("invalid local address {}", parts[1])))?;
        if local_port != port {
            continue;
        }

        let state = u8::from_str_radix(parts[3], 16)
            .map_err(|_| parse_err(format!("invalid state {}", parts[3])))?;
        if state != TCP_LISTEN {
            continue;
        }

        let inode = parts[9]
            .parse()
            .map_err(|_| parse_err(format!("invalid inode {}", parts[9])))?;
        inodes.push(inode);
    }

    Ok(inodes)
}

/// Lowest pid holding a file descriptor for any of `inodes`.
fn find_socket_owner(proc_root: &Path, inodes: &HashSet<u64>) -> Result<Option<u32>> {
    let entries = fs::read_dir(proc_root).map_err(|e| Error::io(proc_root, e))?;
    let mut pids: Vec<u32> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
        .collect();
    pids.sort_unstable();

    for pid in pids {
        let fd_dir = proc_root.join(pid.to_string()).join("fd");
        // Processes vanish and foreign fd tables are unreadable without
        // privileges; neither is an error.
        let Ok(fds) = fs::read_dir(&fd_dir) else {
            trace!("Skipping unreadable {}", fd_dir.display());
            continue;
        };
        for fd in fds.filter_map(|fd| fd.ok()) {
            let Ok(target) = fs::read_link(fd.path()) else {
                continue;
            };
            if let Some(inode) = socket_inode(&target) {
                if inodes.contains(&inode) {
                    return Ok(Some(pid));
                }
            }
        }
    }
    Ok(None)
}

/// Whether a `/proc/<pid>/cgroup` listing places the process inside the
/// container `id`.
///
/// cgroup v1 lines end in `/docker/<id>`, v2 lines in
/// `/system.slice/docker-<id>.scope`; both contain the full id as one path
/// component or its suffix.
fn in_container_cgroup(cgroup: &str, id: &str) -> bool {
    if id.is_empty() {
        return false;
    }
    cgroup
        .lines()
        .filter_map(|line| line.splitn(3, ':').nth(2))
        .flat_map(|path| path.split('/'))
        .any(|component| {
            let component = component.strip_suffix(".scope").unwrap_or(component);
            component == id || component.ends_with(&format!("-{}", id))
        })
}

/// Inode from an fd link target of the form `socket:[12345]`.
fn socket_inode(target: &Path) -> Option<u64> {
    target
        .to_str()?
        .strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}
