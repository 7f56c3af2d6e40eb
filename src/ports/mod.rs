//! Host port bookkeeping for the broker.

pub mod inspector;
pub mod mapping;
pub mod reconciler;

pub use inspector::{HostPortInspector, PortInspector};
pub use mapping::PortMappingSet;
pub use reconciler::{EvictionPolicy, PortReconciler, ProcessKiller, SigKill};
