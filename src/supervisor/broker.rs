use log::{debug, info, warn};

use super::{Reconciled, WorkloadSupervisor};
use crate::error::Result;
use crate::ports::{PortMappingSet, PortReconciler};

impl WorkloadSupervisor {
    /// Make sure every required host port is held by this workload.
    ///
    /// If any port is held by someone else, or by nobody, all required ports
    /// are freed and the workload is restarted with the current publish list.
    ///
    /// Nothing reserves a port between freeing it and the engine binding it,
    /// so a process grabbing it in that window makes the start fail; the next
    /// tick retries.
    pub async fn recover_ports(
        &self,
        mappings: &PortMappingSet,
        reconciler: &PortReconciler,
    ) -> Result<Reconciled> {
        if mappings.is_empty() {
            debug!("No ports required for {}", self.name());
            return Ok(Reconciled::Unchanged);
        }
        let required = mappings.host_ports();

        let mut foreign = Vec::new();
        for &port in &required {
            match reconciler.occupant(port).await? {
                Some(occupant) if occupant.is_owned_by(self.name()) => {}
                Some(occupant) => {
                    debug!("Port {} held by {:?}", port, occupant);
                    foreign.push(port);
                }
                None => {
                    debug!("Port {} not bound by {}", port, self.name());
                    foreign.push(port);
                }
            }
        }
        if foreign.is_empty() {
            return Ok(Reconciled::Unchanged);
        }

        warn!(
            "Ports {:?} are not held by {}, reclaiming {:?}",
            foreign,
            self.name(),
            required
        );
        reconciler.free_ports(&required).await?;

        for &port in &foreign {
            if let Some(occupant) = reconciler.occupant(port).await? {
                if !occupant.is_owned_by(self.name()) {
                    warn!("Port {} still held after eviction: {:?}", port, occupant);
                }
            }
        }

        self.replace(mappings).await?;
        info!("Restarted {} with {} published ports", self.name(), mappings.mappings().len());
        Ok(Reconciled::Replaced)
    }
}
