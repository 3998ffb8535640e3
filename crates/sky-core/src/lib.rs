//! sky-core — shared types for the SkyGrid fleet orchestrator.
//!
//! Everything the other crates agree on lives here: geographic primitives,
//! the waypoint task model handed to vehicle links, telemetry samples,
//! `skygrid.toml` configuration, the notification sink, and the periodic
//! loop runner used by every background task.

pub mod config;
pub mod error;
pub mod geo;
pub mod notify;
pub mod periodic;
pub mod task;
pub mod telemetry;

pub use config::SkyConfig;
pub use error::ValidationError;
pub use geo::{Coordinates, Position};
pub use notify::{BroadcastNotifier, Notification, Notifier, NullNotifier, SharedNotifier, Topic};
pub use periodic::{Shutdown, ShutdownSignal, spawn_periodic};
pub use task::{Task, TaskParams, TaskStatus, Waypoint, WaypointKind};
pub use telemetry::{TelemetrySample, Velocity};

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Current Unix epoch in milliseconds.
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
