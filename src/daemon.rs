//! The reconciliation loop.
//!
//! Setup runs once; afterwards every tick performs, strictly in order:
//! self-update check, hardening, tunnel image/run reconciliation, broker
//! image/run reconciliation and broker port recovery, then sleeps.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::time::sleep;

use crate::config::Config;
use crate::error::Result;
use crate::host::{self, ServiceManager};
use crate::ports::PortReconciler;
use crate::selfupdate::{SelfUpdater, UpdateCheck};
use crate::supervisor::{TunnelToken, WorkloadSupervisor};

/// Why the loop handed control back to `main`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exit {
    /// Re-execute the build installed at this path.
    Restart(PathBuf),
    /// The freshly installed unit took over; this instance should exit.
    HandedOff,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    Restart(PathBuf),
}

/// Fixed-period tick with exponential backoff after transient failures.
#[derive(Debug, Clone)]
pub struct Schedule {
    interval: Duration,
    max_backoff: Duration,
    failures: u32,
}

impl Schedule {
    pub fn new(interval: Duration, max_backoff: Duration) -> Self {
        Self {
            interval,
            max_backoff,
            failures: 0,
        }
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
    }

    pub fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    pub fn next_delay(&self) -> Duration {
        let factor = 1u32.checked_shl(self.failures).unwrap_or(u32::MAX);
        self.interval
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff.max(self.interval))
    }
}

/// Paths and names the daemon provisions on the host.
#[derive(Debug, Clone)]
pub struct HostLayout {
    pub install_path: PathBuf,
    pub unit_path: PathBuf,
    pub unit_name: String,
    pub journald_dropin: Option<PathBuf>,
}

impl HostLayout {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            install_path: cfg.install_path.clone(),
            unit_path: cfg.unit_path.clone(),
            unit_name: cfg.unit_name.clone(),
            journald_dropin: cfg.harden.then(|| cfg.journald_dropin.clone()),
        }
    }
}

pub struct Daemon {
    layout: HostLayout,
    services: Arc<dyn ServiceManager>,
    updater: SelfUpdater,
    reconciler: PortReconciler,
    tunnel: WorkloadSupervisor,
    tunnel_token: TunnelToken,
    broker: WorkloadSupervisor,
}

impl Daemon {
    pub fn new(
        layout: HostLayout,
        services: Arc<dyn ServiceManager>,
        updater: SelfUpdater,
        reconciler: PortReconciler,
        tunnel: WorkloadSupervisor,
        tunnel_token: TunnelToken,
        broker: WorkloadSupervisor,
    ) -> Self {
        Self {
            layout,
            services,
            updater,
            reconciler,
            tunnel,
            tunnel_token,
            broker,
        }
    }

    /// One-time host setup.  Returns `Some(Exit::HandedOff)` when a
    /// hand-started instance passed control to the newly installed unit.
    pub async fn setup(&self) -> Result<Option<Exit>> {
        self.harden().await?;
        host::install_self(self.updater.running_bytes(), &self.layout.install_path)?;

        let unit = host::render_unit(&self.layout.install_path);
        if !host::write_if_changed(&self.layout.unit_path, unit.as_bytes(), 0o644)? {
            debug!("Unit {} is current", self.layout.unit_path.display());
            return Ok(None);
        }

        info!("Installed unit {}", self.layout.unit_path.display());
        if let Err(e) = self.services.daemon_reload().await {
            warn!("Service manager reload failed: {}", e);
        }
        if let Err(e) = self.services.enable(&self.layout.unit_name).await {
            warn!("Failed to enable {}: {}", self.layout.unit_name, e);
        }
        if self.services.supervises_us() {
            return Ok(None);
        }

        match self.services.restart(&self.layout.unit_name).await {
            Ok(()) => {
                info!("{} started, handing off", self.layout.unit_name);
                Ok(Some(Exit::HandedOff))
            }
            Err(e) => {
                warn!(
                    "Could not start {}, continuing in the foreground: {}",
                    self.layout.unit_name, e
                );
                Ok(None)
            }
        }
    }

    async fn harden(&self) -> Result<()> {
        match &self.layout.journald_dropin {
            Some(dropin) => host::harden(dropin, self.services.as_ref()).await,
            None => Ok(()),
        }
    }

    /// One full reconciliation pass.
    pub async fn tick(&self) -> Result<TickOutcome> {
        if let UpdateCheck::Available(path) = self.updater.check().await? {
            return Ok(TickOutcome::Restart(path));
        }

        self.harden().await?;

        let outcome = self.tunnel.reconcile_image(&self.tunnel_token).await?;
        debug!("{}: {:?}", self.tunnel.workload().image, outcome);
        self.tunnel.ensure_running(&self.tunnel_token).await?;

        let mappings = self.reconciler.fetch_mappings().await?;
        let outcome = self.broker.reconcile_image(&mappings).await?;
        debug!("{}: {:?}", self.broker.workload().image, outcome);
        self.broker.ensure_running(&mappings).await?;
        self.broker.recover_ports(&mappings, &self.reconciler).await?;

        Ok(TickOutcome::Continue)
    }

    /// Tick forever.  Only returns to request a restart or on an error that
    /// is not transient.
    pub async fn run(&self, mut schedule: Schedule) -> Result<Exit> {
        loop {
            match self.tick().await {
                Ok(TickOutcome::Restart(path)) => return Ok(Exit::Restart(path)),
                Ok(TickOutcome::Continue) => schedule.record_success(),
                Err(e) if e.is_transient() => {
                    schedule.record_failure();
                    warn!("Tick failed: {}", e);
                }
                Err(e) => {
                    error!("Tick failed with unrecoverable error: {}", e);
                    return Err(e);
                }
            }

            let delay = schedule.next_delay();
            debug!("Next tick in {:?}", delay);
            sleep(delay).await;
        }
    }
}
