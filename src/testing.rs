//! In-memory host used by the unit tests.
//!
//! `FakeHost` plays container engine, port inspector, process killer and
//! remote fetcher at once, sharing one state so that evicting a container
//! also frees its ports.  Every mutating call is recorded as an [`Action`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::fetch::Fetcher;
use crate::host::ServiceManager;
use crate::ports::{PortInspector, ProcessKiller};
use crate::runtime::{ContainerRuntime, PublishedPort, PullOutcome, RunningContainer};
use crate::types::{LaunchSpec, PortOccupant, RestartPolicyKind, Workload};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Pull(String),
    Stop(String),
    Remove(String),
    Start(String),
    Kill(u32),
    ServiceReload,
    ServiceEnable(String),
    ServiceRestart(String),
}

#[derive(Debug, Default)]
struct Container {
    id: String,
    running: bool,
    ports: Vec<u16>,
    env: Vec<String>,
}

#[derive(Debug, Default)]
struct State {
    local_images: HashMap<String, u32>,
    remote_images: HashMap<String, u32>,
    containers: BTreeMap<String, Container>,
    listeners: HashMap<u16, u32>,
    documents: HashMap<String, std::result::Result<Vec<u8>, u16>>,
    failing_stops: HashSet<String>,
    unsupervised: bool,
    next_id: u64,
    actions: Vec<Action>,
}

impl State {
    /// Engine-style 64 hex digit container id.
    fn allocate_id(&mut self) -> String {
        self.next_id += 1;
        format!("{:064x}", self.next_id)
    }
}

#[derive(Clone, Default)]
pub struct FakeHost {
    state: Arc<Mutex<State>>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn runtime(&self) -> Arc<dyn ContainerRuntime> {
        Arc::new(self.clone())
    }

    pub fn inspector(&self) -> Arc<dyn PortInspector> {
        Arc::new(self.clone())
    }

    pub fn killer(&self) -> Arc<dyn ProcessKiller> {
        Arc::new(self.clone())
    }

    pub fn fetcher(&self) -> Arc<dyn Fetcher> {
        Arc::new(self.clone())
    }

    /// Make `version` the latest image available from the registry.
    pub fn publish_image(&self, image: &str, version: u32) {
        self.state().remote_images.insert(image.to_string(), version);
    }

    /// A running container that was not started through a supervisor.
    pub fn add_container(&self, name: &str, ports: &[u16]) {
        let mut state = self.state();
        let id = state.allocate_id();
        state.containers.insert(
            name.to_string(),
            Container {
                id,
                running: true,
                ports: ports.to_vec(),
                env: Vec::new(),
            },
        );
    }

    /// A plain host process listening on `port`.
    pub fn add_listener(&self, port: u16, pid: u32) {
        self.state().listeners.insert(port, pid);
    }

    /// Simulate a container exiting on its own.
    pub fn halt(&self, name: &str) {
        if let Some(c) = self.state().containers.get_mut(name) {
            c.running = false;
        }
    }

    pub fn fail_stop(&self, name: &str) {
        self.state().failing_stops.insert(name.to_string());
    }

    /// Pretend the daemon was launched by hand rather than by the unit.
    pub fn set_unsupervised(&self) {
        self.state().unsupervised = true;
    }

    pub fn serve(&self, url: &str, body: impl Into<Vec<u8>>) {
        self.state().documents.insert(url.to_string(), Ok(body.into()));
    }

    pub fn fail(&self, url: &str, status: u16) {
        self.state().documents.insert(url.to_string(), Err(status));
    }

    pub fn actions(&self) -> Vec<Action> {
        self.state().actions.clone()
    }

    /// Recorded actions minus image pulls.
    pub fn corrective_actions(&self) -> Vec<Action> {
        self.actions()
            .into_iter()
            .filter(|a| !matches!(a, Action::Pull(_)))
            .collect()
    }

    pub fn clear_actions(&self) {
        self.state().actions.clear();
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.state().containers.get(name).is_some_and(|c| c.running)
    }

    pub fn container_id(&self, name: &str) -> Option<String> {
        self.state().containers.get(name).map(|c| c.id.clone())
    }

    pub fn ports_of(&self, name: &str) -> Vec<u16> {
        self.state()
            .containers
            .get(name)
            .map(|c| c.ports.clone())
            .unwrap_or_default()
    }

    pub fn env_of(&self, name: &str) -> Vec<String> {
        self.state()
            .containers
            .get(name)
            .map(|c| c.env.clone())
            .unwrap_or_default()
    }
}

fn no_such_container(name: &str) -> Error {
    Error::Engine {
        subject: name.to_string(),
        reason: "no such container".into(),
    }
}

#[async_trait]
impl ContainerRuntime for FakeHost {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn image_present(&self, image: &str) -> Result<bool> {
        Ok(self.state().local_images.contains_key(image))
    }

    async fn pull_image(&self, image: &str) -> Result<PullOutcome> {
        let mut state = self.state();
        state.actions.push(Action::Pull(image.to_string()));
        let Some(&latest) = state.remote_images.get(image) else {
            return Err(Error::Engine {
                subject: image.to_string(),
                reason: "manifest unknown".into(),
            });
        };
        if state.local_images.insert(image.to_string(), latest) == Some(latest) {
            Ok(PullOutcome::Current)
        } else {
            Ok(PullOutcome::Updated)
        }
    }

    async fn container_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state().containers.contains_key(name))
    }

    async fn is_running(&self, name: &str) -> Result<bool> {
        Ok(FakeHost::is_running(self, name))
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        if state.failing_stops.contains(name) {
            return Err(Error::Engine {
                subject: name.to_string(),
                reason: "stop timed out".into(),
            });
        }
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| no_such_container(name))?;
        container.running = false;
        state.actions.push(Action::Stop(name.to_string()));
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        state
            .containers
            .remove(name)
            .ok_or_else(|| no_such_container(name))?;
        state.actions.push(Action::Remove(name.to_string()));
        Ok(())
    }

    async fn run_container(&self, spec: &LaunchSpec<'_>) -> Result<()> {
        let name = spec.workload.name.clone();
        let mut state = self.state();
        if state.containers.contains_key(&name) {
            return Err(Error::Engine {
                subject: name,
                reason: "name already in use".into(),
            });
        }
        let id = state.allocate_id();
        state.containers.insert(
            name.clone(),
            Container {
                id,
                running: true,
                ports: spec.extras.ports.iter().map(|m| m.host_port).collect(),
                env: spec.environment(),
            },
        );
        state.actions.push(Action::Start(name));
        Ok(())
    }

    async fn published_ports(&self) -> Result<Vec<PublishedPort>> {
        Ok(self
            .state()
            .containers
            .iter()
            .filter(|(_, c)| c.running)
            .flat_map(|(name, c)| {
                c.ports.iter().map(move |&host_port| PublishedPort {
                    container: name.clone(),
                    host_port,
                })
            })
            .collect())
    }

    async fn running_containers(&self) -> Result<Vec<RunningContainer>> {
        Ok(self
            .state()
            .containers
            .iter()
            .filter(|(_, c)| c.running)
            .map(|(name, c)| RunningContainer {
                id: c.id.clone(),
                name: name.clone(),
            })
            .collect())
    }
}

#[async_trait]
impl PortInspector for FakeHost {
    async fn occupant(&self, port: u16) -> Result<Option<PortOccupant>> {
        let owner = self
            .published_ports()
            .await?
            .into_iter()
            .find(|p| p.host_port == port)
            .map(|p| p.container);
        let pid = self.state().listeners.get(&port).copied();
        if owner.is_none() && pid.is_none() {
            return Ok(None);
        }
        Ok(Some(PortOccupant { port, pid, owner }))
    }
}

impl ProcessKiller for FakeHost {
    fn kill(&self, pid: u32) -> Result<()> {
        let mut state = self.state();
        state.listeners.retain(|_, p| *p != pid);
        state.actions.push(Action::Kill(pid));
        Ok(())
    }
}

#[async_trait]
impl Fetcher for FakeHost {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        match self.state().documents.get(url) {
            Some(Ok(body)) => Ok(body.clone()),
            Some(Err(status)) => Err(Error::FetchStatus {
                url: url.to_string(),
                status: *status,
            }),
            None => Err(Error::FetchStatus {
                url: url.to_string(),
                status: 404,
            }),
        }
    }
}

#[async_trait]
impl ServiceManager for FakeHost {
    async fn daemon_reload(&self) -> Result<()> {
        self.state().actions.push(Action::ServiceReload);
        Ok(())
    }

    async fn enable(&self, unit: &str) -> Result<()> {
        self.state().actions.push(Action::ServiceEnable(unit.to_string()));
        Ok(())
    }

    async fn restart(&self, unit: &str) -> Result<()> {
        self.state().actions.push(Action::ServiceRestart(unit.to_string()));
        Ok(())
    }

    async fn disable_firewall(&self) -> Result<()> {
        Ok(())
    }

    fn supervises_us(&self) -> bool {
        !self.state().unsupervised
    }
}

pub fn tunnel_workload() -> Workload {
    Workload {
        name: "tunnel".into(),
        image: "cloudflare/cloudflared:latest".into(),
        command: vec!["tunnel".into(), "--no-autoupdate".into(), "run".into()],
        binds: Vec::new(),
        env: Vec::new(),
        network_mode: Some("host".into()),
        restart_policy: RestartPolicyKind::UnlessStopped,
    }
}

pub fn broker_workload() -> Workload {
    Workload {
        name: "broker".into(),
        image: "eclipse-mosquitto:2".into(),
        command: Vec::new(),
        binds: Vec::new(),
        env: Vec::new(),
        network_mode: None,
        restart_policy: RestartPolicyKind::UnlessStopped,
    }
}
