//! Keeps one named workload present, current and running.
//!
//! The supervisor is generic over the workload; arguments that change between
//! starts are supplied by a [`LaunchSource`] at the moment of starting, so a
//! restart always sees the latest token or port list.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::error::Result;
use crate::runtime::{ContainerRuntime, PullOutcome};
use crate::types::{LaunchExtras, LaunchSpec, Workload};

mod broker;
mod tunnel;

pub use tunnel::TunnelToken;

/// Provides the start-time arguments for a workload.
pub trait LaunchSource {
    fn launch_extras(&self) -> Result<LaunchExtras>;
}

/// What a reconciliation step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    Unchanged,
    /// A new instance was started where none was running.
    Started,
    /// The existing instance was torn down and started afresh.
    Replaced,
}

pub struct WorkloadSupervisor {
    runtime: Arc<dyn ContainerRuntime>,
    workload: Workload,
}

impl WorkloadSupervisor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, workload: Workload) -> Self {
        Self { runtime, workload }
    }

    pub fn workload(&self) -> &Workload {
        &self.workload
    }

    pub fn name(&self) -> &str {
        &self.workload.name
    }

    /// Pull the workload's image and roll the instance if it changed.
    pub async fn reconcile_image(&self, source: &dyn LaunchSource) -> Result<Reconciled> {
        let image = &self.workload.image;
        if !self.runtime.image_present(image).await? {
            info!("Image {} not present locally, pulling", image);
        }

        match self.runtime.pull_image(image).await? {
            PullOutcome::Updated => {
                info!("New image for {}, replacing instance", self.name());
                self.replace(source).await?;
                Ok(Reconciled::Replaced)
            }
            PullOutcome::Current => self.ensure_running(source).await,
        }
    }

    /// Start the workload if no instance with its name is running.
    pub async fn ensure_running(&self, source: &dyn LaunchSource) -> Result<Reconciled> {
        if self.runtime.is_running(self.name()).await? {
            debug!("{} is running", self.name());
            return Ok(Reconciled::Unchanged);
        }
        info!("{} is not running, starting it", self.name());
        self.start(source).await?;
        Ok(Reconciled::Started)
    }

    /// Stop and remove the current instance (best-effort), then start anew.
    async fn replace(&self, source: &dyn LaunchSource) -> Result<()> {
        let name = self.name();
        if let Err(e) = self.runtime.stop_container(name).await {
            warn!("Failed to stop {}: {}", name, e);
        }
        if let Err(e) = self.runtime.remove_container(name).await {
            warn!("Failed to remove {}: {}", name, e);
        }
        self.start(source).await
    }

    async fn start(&self, source: &dyn LaunchSource) -> Result<()> {
        let name = self.name();
        let extras = source.launch_extras()?;

        if self.runtime.container_exists(name).await? {
            debug!("Removing stale container {}", name);
            if let Err(e) = self.runtime.remove_container(name).await {
                warn!("Failed to remove stale {}: {}", name, e);
            }
        }

        debug!(
            "Starting {} from {}",
            name,
            serde_json::to_string(&self.workload).unwrap_or_default()
        );
        let spec = LaunchSpec {
            workload: &self.workload,
            extras,
        };
        self.runtime.run_container(&spec).await?;
        info!("Started {} ({})", name, self.workload.image);
        Ok(())
    }
}
