//! Hostwarden daemon entry point.

use std::os::unix::process::CommandExt;
use std::process::Command;
use std::sync::Arc;

use anyhow::Context;
use log::{error, info};

mod config;
mod daemon;
mod error;
mod fetch;
mod host;
mod ports;
mod runtime;
mod selfupdate;
mod supervisor;
mod types;

#[cfg(test)]
mod testing;

use config::Config;
use daemon::{Daemon, Exit, HostLayout, Schedule};
use fetch::HttpFetcher;
use host::Systemd;
use ports::{EvictionPolicy, HostPortInspector, PortReconciler, SigKill};
use runtime::{ContainerRuntime, DockerRuntime};
use selfupdate::SelfUpdater;
use supervisor::{TunnelToken, WorkloadSupervisor};

const USAGE: &str = "usage: hostwarden <TUNNEL_TOKEN> (required until the secret file exists)";

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting hostwarden with config: {:?}", cfg);

    if !cfg.docker_socket.exists() {
        error!("Container runtime socket {} not found", cfg.docker_socket.display());
        anyhow::bail!("missing container runtime socket {}", cfg.docker_socket.display());
    }

    // The only positional argument is the tunnel token, needed on first run.
    let bootstrap = std::env::args_os()
        .nth(1)
        .map(|arg| arg.into_string())
        .transpose()
        .map_err(|arg| anyhow::anyhow!("token argument is not valid UTF-8: {:?}", arg))
        .context(USAGE)?;
    host::ensure_secret(&cfg.secret_path, bootstrap.as_deref()).context(USAGE)?;

    let docker: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect(&cfg.docker_socket)?);
    docker
        .ping()
        .await
        .context("container runtime did not answer")?;

    let daemon = build_daemon(&cfg, docker)?;
    if let Some(Exit::HandedOff) = daemon.setup().await? {
        info!("Handed off to {}", cfg.unit_name);
        return Ok(());
    }

    let schedule = Schedule::new(cfg.update_interval(), cfg.max_backoff());
    match daemon.run(schedule).await? {
        Exit::Restart(path) => {
            info!("Restarting into {}", path.display());
            let err = Command::new(&path).args(std::env::args_os().skip(1)).exec();
            Err(anyhow::anyhow!("Failed to exec {}: {}", path.display(), err))
        }
        Exit::HandedOff => Ok(()),
    }
}

fn build_daemon(cfg: &Config, docker: Arc<dyn ContainerRuntime>) -> anyhow::Result<Daemon> {
    let fetcher = Arc::new(HttpFetcher::new(cfg.fetch_retries));
    let running_exe = cfg.proc_root.join("self/exe");
    let updater = SelfUpdater::new(
        cfg.self_update_url.clone(),
        cfg.install_path.clone(),
        &running_exe,
        fetcher.clone(),
    )?;

    let inspector = Arc::new(HostPortInspector::new(cfg.proc_root.clone(), docker.clone()));
    let reconciler = PortReconciler::new(
        cfg.port_mappings_url.clone(),
        fetcher,
        inspector,
        docker.clone(),
        Arc::new(SigKill),
        EvictionPolicy {
            protected: vec![cfg.tunnel.name.clone(), cfg.broker.name.clone()],
            kill_unmanaged: cfg.kill_unmanaged,
        },
    );

    Ok(Daemon::new(
        HostLayout::from_config(cfg),
        Arc::new(Systemd),
        updater,
        reconciler,
        WorkloadSupervisor::new(docker.clone(), cfg.tunnel.clone()),
        TunnelToken::new(cfg.secret_path.clone(), cfg.tunnel_token_env.clone()),
        WorkloadSupervisor::new(docker, cfg.broker.clone()),
    ))
}
