use crate::error::Result;
use crate::types::LaunchSpec;
use async_trait::async_trait;

pub mod docker;
pub use docker::DockerRuntime;

/// Result of pulling an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    /// A different image than the one held locally was downloaded.
    Updated,
    /// The local image was already current.
    Current,
}

/// A host port forwarded into a running container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedPort {
    pub container: String,
    pub host_port: u16,
}

/// A running container as the engine identifies it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningContainer {
    /// Full hex id, as it appears in the container's cgroup path.
    pub id: String,
    pub name: String,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Check that the engine answers on its control socket.
    async fn ping(&self) -> Result<()>;

    async fn image_present(&self, image: &str) -> Result<bool>;

    /// Pull `image` and report whether anything newer arrived.
    async fn pull_image(&self, image: &str) -> Result<PullOutcome>;

    async fn container_exists(&self, name: &str) -> Result<bool>;

    async fn is_running(&self, name: &str) -> Result<bool>;

    async fn stop_container(&self, name: &str) -> Result<()>;

    async fn remove_container(&self, name: &str) -> Result<()>;

    /// Create and start a container from `spec`.
    async fn run_container(&self, spec: &LaunchSpec<'_>) -> Result<()>;

    /// Host ports published by running containers.
    async fn published_ports(&self) -> Result<Vec<PublishedPort>>;

    async fn running_containers(&self) -> Result<Vec<RunningContainer>>;
}
