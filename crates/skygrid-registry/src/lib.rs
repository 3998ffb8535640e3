//! skygrid-registry — the fleet registry.
//!
//! Holds every [`WorkUnit`] and owns the rules for changing one:
//!
//! - status moves only along the graph in [`status`], or into `Error`
//! - a job is bound to at most one unit, and only an `Idle`, connected,
//!   charged unit can take one
//! - release always hands the unit back, whatever state it is in
//!
//! [`LinkMonitor`] brings units online and keeps their telemetry flowing
//! into the registry.

pub mod error;
pub mod monitor;
pub mod registry;
pub mod status;

pub use error::{RegistryError, RegistryResult};
pub use monitor::LinkMonitor;
pub use registry::{FleetRegistry, FleetStatistics, WorkUnit};
pub use status::{TransitionCause, UnitStatus, UnitTransition};
