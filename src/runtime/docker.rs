use super::{ContainerRuntime, PublishedPort, PullOutcome, RunningContainer};
use crate::error::{Error, Result};
use crate::types::{LaunchSpec, RestartPolicyKind};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{
    ContainerSummary, HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum,
};
use bollard::Docker;
use futures_util::stream::StreamExt;
use log::{debug, info};
use std::collections::HashMap;
use std::path::Path;

/// Seconds the engine waits for a graceful stop before killing.
const STOP_TIMEOUT_SECS: i64 = 10;
const CLIENT_TIMEOUT_SECS: u64 = 120;

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect(socket: &Path) -> Result<Self> {
        let docker = Docker::connect_with_socket(
            &socket.to_string_lossy(),
            CLIENT_TIMEOUT_SECS,
            bollard::API_DEFAULT_VERSION,
        )?;
        Ok(Self { docker })
    }

    async fn image_id(&self, image: &str) -> Result<Option<String>> {
        match self.docker.inspect_image(image).await {
            Ok(detail) => Ok(detail.id),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_running(&self) -> Result<Vec<ContainerSummary>> {
        let opts = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        Ok(self.docker.list_containers(Some(opts)).await?)
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<()> {
        self.docker.ping().await?;
        Ok(())
    }

    async fn image_present(&self, image: &str) -> Result<bool> {
        Ok(self.image_id(image).await?.is_some())
    }

    async fn pull_image(&self, image: &str) -> Result<PullOutcome> {
        let before = self.image_id(image).await?;

        let opts = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(opts), None, None);
        while let Some(progress) = stream.next().await {
            let info = progress?;
            if let Some(status) = info.status {
                debug!("Pull {}: {}", image, status);
            }
        }

        let Some(after) = self.image_id(image).await? else {
            return Err(Error::Engine {
                subject: image.to_string(),
                reason: "image missing after pull".into(),
            });
        };
        if before.as_deref() != Some(after.as_str()) {
            info!(
                "Pulled newer image for {} ({} -> {})",
                image,
                before.as_deref().unwrap_or("none"),
                after
            );
            Ok(PullOutcome::Updated)
        } else {
            Ok(PullOutcome::Current)
        }
    }

    async fn container_exists(&self, name: &str) -> Result<bool> {
        match self.docker.inspect_container(name, None).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn is_running(&self, name: &str) -> Result<bool> {
        match self.docker.inspect_container(name, None).await {
            Ok(detail) => Ok(detail
                .state
                .and_then(|s| s.running)
                .unwrap_or(false)),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        self.docker
            .stop_container(name, Some(StopContainerOptions { t: STOP_TIMEOUT_SECS }))
            .await?;
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        let opts = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker.remove_container(name, Some(opts)).await?;
        Ok(())
    }

    async fn run_container(&self, spec: &LaunchSpec<'_>) -> Result<()> {
        let workload = spec.workload;

        let mut bindings: HashMap<String, Vec<PortBinding>> = HashMap::new();
        for m in &spec.extras.ports {
            bindings
                .entry(format!("{}/tcp", m.container_port))
                .or_default()
                .push(PortBinding {
                    host_ip: None,
                    host_port: Some(m.host_port.to_string()),
                });
        }
        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> =
            bindings.into_iter().map(|(k, v)| (k, Some(v))).collect();
        let exposed_ports: HashMap<String, HashMap<(), ()>> = port_bindings
            .keys()
            .map(|k| (k.clone(), HashMap::new()))
            .collect();

        let host_config = HostConfig {
            binds: (!workload.binds.is_empty()).then(|| workload.binds.clone()),
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            network_mode: workload.network_mode.clone(),
            restart_policy: Some(RestartPolicy {
                name: Some(restart_policy_name(workload.restart_policy)),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };

        let env = spec.environment();
        let config = Config {
            image: Some(workload.image.clone()),
            cmd: (!workload.command.is_empty()).then(|| workload.command.clone()),
            env: (!env.is_empty()).then_some(env),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let opts = CreateContainerOptions {
            name: workload.name.clone(),
            platform: None,
        };
        let created = self.docker.create_container(Some(opts), config).await?;
        for warning in created.warnings {
            debug!("Create {}: {}", workload.name, warning);
        }

        self.docker
            .start_container(&workload.name, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn published_ports(&self) -> Result<Vec<PublishedPort>> {
        let mut published = Vec::new();
        for c in self.list_running().await? {
            let Some(name) = container_name(&c) else {
                continue;
            };
            for port in c.ports.unwrap_or_default() {
                if let Some(host_port) = port.public_port {
                    published.push(PublishedPort {
                        container: name.clone(),
                        host_port,
                    });
                }
            }
        }
        Ok(published)
    }

    async fn running_containers(&self) -> Result<Vec<RunningContainer>> {
        Ok(self
            .list_running()
            .await?
            .into_iter()
            .filter_map(|c| {
                let name = container_name(&c)?;
                Some(RunningContainer { id: c.id?, name })
            })
            .collect())
    }
}

/// First name of a listed container without the leading slash, or its id.
fn container_name(c: &ContainerSummary) -> Option<String> {
    c.names
        .as_ref()
        .and_then(|n| n.first())
        .map(|n| n.trim_start_matches('/').to_string())
        .or_else(|| c.id.clone())
}

fn is_not_found(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn restart_policy_name(kind: RestartPolicyKind) -> RestartPolicyNameEnum {
    match kind {
        RestartPolicyKind::No => RestartPolicyNameEnum::NO,
        RestartPolicyKind::Always => RestartPolicyNameEnum::ALWAYS,
        RestartPolicyKind::UnlessStopped => RestartPolicyNameEnum::UNLESS_STOPPED,
        RestartPolicyKind::OnFailure => RestartPolicyNameEnum::ON_FAILURE,
    }
}
