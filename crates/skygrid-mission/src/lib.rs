//! skygrid-mission — the mission executor.
//!
//! Turns a dispatched job into a validated waypoint [`Task`](sky_core::Task),
//! drives it through the unit's vehicle link, and resolves the job in the
//! store when the task ends. One independent flow runs per job.

pub mod error;
pub mod executor;

pub use error::{MissionError, MissionResult};
pub use executor::MissionExecutor;
