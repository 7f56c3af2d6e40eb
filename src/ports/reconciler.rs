use std::collections::BTreeSet;
use std::sync::Arc;

use log::{debug, info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use super::inspector::PortInspector;
use super::mapping::PortMappingSet;
use crate::error::{Error, Result};
use crate::fetch::Fetcher;
use crate::runtime::ContainerRuntime;
use crate::types::PortOccupant;

/// Delivers a forceful termination to a host process.
pub trait ProcessKiller: Send + Sync {
    fn kill(&self, pid: u32) -> Result<()>;
}

/// SIGKILL via `kill(2)`.
pub struct SigKill;

impl ProcessKiller for SigKill {
    fn kill(&self, pid: u32) -> Result<()> {
        kill(Pid::from_raw(pid as i32), Signal::SIGKILL).map_err(|source| Error::Signal { pid, source })
    }
}

/// What to do with host ports claimed by someone other than the managed
/// workloads.
#[derive(Debug, Clone)]
pub struct EvictionPolicy {
    /// Container names that are never evicted.
    pub protected: Vec<String>,
    /// Whether non-container processes are killed.
    pub kill_unmanaged: bool,
}

impl EvictionPolicy {
    fn protects(&self, occupant: &PortOccupant) -> bool {
        self.protected.iter().any(|name| occupant.is_owned_by(name))
    }
}

/// Fetches the port-mapping document and clears required host ports.
pub struct PortReconciler {
    url: String,
    fetcher: Arc<dyn Fetcher>,
    inspector: Arc<dyn PortInspector>,
    runtime: Arc<dyn ContainerRuntime>,
    killer: Arc<dyn ProcessKiller>,
    policy: EvictionPolicy,
}

impl PortReconciler {
    pub fn new(
        url: impl Into<String>,
        fetcher: Arc<dyn Fetcher>,
        inspector: Arc<dyn PortInspector>,
        runtime: Arc<dyn ContainerRuntime>,
        killer: Arc<dyn ProcessKiller>,
        policy: EvictionPolicy,
    ) -> Self {
        Self {
            url: url.into(),
            fetcher,
            inspector,
            runtime,
            killer,
            policy,
        }
    }

    pub async fn fetch_mappings(&self) -> Result<PortMappingSet> {
        let body = self.fetcher.fetch(&self.url).await?;
        let set = PortMappingSet::parse(&String::from_utf8_lossy(&body));
        debug!(
            "Fetched {} port mappings ({} invalid lines) from {}",
            set.mappings().len(),
            set.invalid_lines().len(),
            self.url
        );
        Ok(set)
    }

    pub async fn occupant(&self, port: u16) -> Result<Option<PortOccupant>> {
        self.inspector.occupant(port).await
    }

    /// Evict whatever holds each of `ports`, except the managed workloads.
    ///
    /// Evictions are best-effort: failures are logged and the next port is
    /// processed.  Returns the number of occupants acted upon.
    pub async fn free_ports(&self, ports: &BTreeSet<u16>) -> Result<usize> {
        let mut evicted = 0;

        for &port in ports {
            let Some(occupant) = self.inspector.occupant(port).await? else {
                debug!("Port {} is free", port);
                continue;
            };

            if self.policy.protects(&occupant) {
                debug!(
                    "Port {} held by managed workload {}, leaving it",
                    occupant.port,
                    occupant.owner.as_deref().unwrap_or_default()
                );
                continue;
            }

            if let Some(owner) = &occupant.owner {
                warn!("Evicting container {} from port {}", owner, port);
                if let Err(e) = self.runtime.stop_container(owner).await {
                    warn!("Failed to stop container {}: {}", owner, e);
                }
                if let Err(e) = self.runtime.remove_container(owner).await {
                    warn!("Failed to remove container {}: {}", owner, e);
                }
                evicted += 1;
                continue;
            }

            let Some(pid) = occupant.pid else {
                continue;
            };
            if pid == std::process::id() {
                warn!("Port {} is held by this daemon itself, not killing", port);
                continue;
            }
            if !self.policy.kill_unmanaged {
                warn!(
                    "Port {} held by unmanaged pid {}; killing is disabled by policy",
                    port, pid
                );
                continue;
            }

            warn!("Killing pid {} holding port {}", pid, port);
            match self.killer.kill(pid) {
                Ok(()) => info!("Sent SIGKILL to pid {}", pid),
                Err(e) => warn!("{}", e),
            }
            evicted += 1;
        }

        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::HostPortInspector;
    use crate::supervisor::WorkloadSupervisor;
    use crate::testing::{tunnel_workload, Action, FakeHost};
    use crate::types::LaunchExtras;
    use std::fs;
    use std::os::unix::fs::symlink;

    const URL: &str = "https://config.example.test/ports.conf";

    fn reconciler(host: &FakeHost, kill_unmanaged: bool) -> PortReconciler {
        PortReconciler::new(
            URL,
            host.fetcher(),
            host.inspector(),
            host.runtime(),
            host.killer(),
            EvictionPolicy {
                protected: vec!["tunnel".into(), "broker".into()],
                kill_unmanaged,
            },
        )
    }

    #[tokio::test]
    async fn fetch_parses_remote_document() {
        let host = FakeHost::new();
        host.serve(URL, "# comment\n8080:80\nbad-line\n9090:9090\n");

        let set = reconciler(&host, true).fetch_mappings().await.unwrap();
        assert_eq!(set.host_ports(), BTreeSet::from([8080, 9090]));
        assert_eq!(set.invalid_lines().len(), 1);
    }

    #[tokio::test]
    async fn fetch_failure_propagates() {
        let host = FakeHost::new();
        host.fail(URL, 503);

        let err = reconciler(&host, true).fetch_mappings().await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn managed_owners_are_never_evicted() {
        let host = FakeHost::new();
        host.add_container("broker", &[9090]);
        host.add_container("tunnel", &[8080]);

        let evicted = reconciler(&host, true)
            .free_ports(&BTreeSet::from([8080, 9090]))
            .await
            .unwrap();

        assert_eq!(evicted, 0);
        assert!(host.actions().is_empty());
    }

    #[tokio::test]
    async fn foreign_container_is_stopped_and_removed_once() {
        let host = FakeHost::new();
        host.add_container("other", &[9090, 9091]);

        reconciler(&host, true)
            .free_ports(&BTreeSet::from([9090, 9091]))
            .await
            .unwrap();

        assert_eq!(
            host.actions(),
            vec![Action::Stop("other".into()), Action::Remove("other".into())]
        );
    }

    #[tokio::test]
    async fn unmanaged_process_gets_one_signal() {
        let host = FakeHost::new();
        host.add_listener(8080, 4242);

        let evicted = reconciler(&host, true)
            .free_ports(&BTreeSet::from([8080]))
            .await
            .unwrap();

        assert_eq!(evicted, 1);
        assert_eq!(host.actions(), vec![Action::Kill(4242)]);
    }

    #[tokio::test]
    async fn policy_can_spare_unmanaged_processes() {
        let host = FakeHost::new();
        host.add_listener(8080, 4242);

        let evicted = reconciler(&host, false)
            .free_ports(&BTreeSet::from([8080]))
            .await
            .unwrap();

        assert_eq!(evicted, 0);
        assert!(host.actions().is_empty());
    }

    #[tokio::test]
    async fn ports_outside_the_request_are_untouched() {
        let host = FakeHost::new();
        host.add_container("other", &[7000]);
        host.add_listener(7001, 5151);

        reconciler(&host, true)
            .free_ports(&BTreeSet::from([9090]))
            .await
            .unwrap();

        assert!(host.actions().is_empty());
    }

    #[tokio::test]
    async fn failed_stop_does_not_abort_eviction() {
        let host = FakeHost::new();
        host.add_container("other", &[9090]);
        host.add_listener(8080, 4242);
        host.fail_stop("other");

        reconciler(&host, true)
            .free_ports(&BTreeSet::from([8080, 9090]))
            .await
            .unwrap();

        assert_eq!(
            host.actions(),
            vec![Action::Kill(4242), Action::Remove("other".into())]
        );
    }

    #[tokio::test]
    async fn host_network_tunnel_keeps_its_listener() {
        struct NoExtras;
        impl crate::supervisor::LaunchSource for NoExtras {
            fn launch_extras(&self) -> Result<LaunchExtras> {
                Ok(LaunchExtras::default())
            }
        }

        let host = FakeHost::new();
        WorkloadSupervisor::new(host.runtime(), tunnel_workload())
            .ensure_running(&NoExtras)
            .await
            .unwrap();
        let id = host.container_id("tunnel").unwrap();

        // cloudflared as pid 777 listening on 127.0.0.1:20241 inside the
        // tunnel's cgroup, plus an unrelated squatter on 20242.
        let proc = tempfile::tempdir().unwrap();
        fs::create_dir_all(proc.path().join("net")).unwrap();
        fs::write(
            proc.path().join("net/tcp"),
            "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:4F11 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 7001 1 0000000000000000 100 0 0 10 0
   1: 0100007F:4F12 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 7002 1 0000000000000000 100 0 0 10 0
",
        )
        .unwrap();
        for (pid, inode, cgroup) in [
            (777, 7001, format!("0::/system.slice/docker-{}.scope\n", id)),
            (888, 7002, "0::/user.slice/session-3.scope\n".to_string()),
        ] {
            let dir = proc.path().join(pid.to_string());
            fs::create_dir_all(dir.join("fd")).unwrap();
            symlink(format!("socket:[{}]", inode), dir.join("fd/3")).unwrap();
            fs::write(dir.join("cgroup"), cgroup).unwrap();
        }
        host.clear_actions();

        let reconciler = PortReconciler::new(
            URL,
            host.fetcher(),
            Arc::new(HostPortInspector::new(proc.path(), host.runtime())),
            host.runtime(),
            host.killer(),
            EvictionPolicy {
                protected: vec!["tunnel".into(), "broker".into()],
                kill_unmanaged: true,
            },
        );
        let evicted = reconciler
            .free_ports(&BTreeSet::from([20241, 20242]))
            .await
            .unwrap();

        assert_eq!(evicted, 1);
        assert_eq!(host.actions(), vec![Action::Kill(888)]);
        assert!(host.is_running("tunnel"));
    }
}
