//! skygrid-scheduler — job dispatch.
//!
//! Each cycle the [`JobScheduler`] checks for a free unit, picks the next
//! job from the store, and hands it to the mission executor:
//!
//! ```text
//! JobScheduler
//!   ├── JobStore (read Pending / Scheduled, write status)
//!   ├── FleetRegistry (is any unit available?)
//!   └── MissionExecutor (bind unit, start flow)
//! ```
//!
//! A job the executor could not place, or whose route the offered unit
//! lacks the battery for, stays `Scheduled` and is retried first on later
//! cycles, until its retry budget runs out. A slower scan reports jobs
//! that have stayed unfinished too long.

pub mod error;
pub mod scheduler;

pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::{DISPATCH_EXHAUSTED, DispatchStats, JobScheduler, OverdueAlert, QueueStatus, route_battery};
