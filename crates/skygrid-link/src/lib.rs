//! skygrid-link — the per-unit vehicle link.
//!
//! The rest of SkyGrid talks to vehicles only through [`VehicleLink`]:
//!
//! ```text
//!   registry ── connect / telemetry_stream ──┐
//!                                            ├──▶ dyn VehicleLink ──▶ vehicle
//!   executor ── upload / arm / start / abort ┘        ▲
//!                                                     │
//!                                      LinkFactory (injected per unit)
//! ```
//!
//! Two implementations ship here: [`SimulatedLink`] flies routes in
//! simulated time, and [`ScriptedLink`] answers however it is told.

pub mod error;
pub mod link;
pub mod scripted;
pub mod simulated;

pub use error::{LinkError, LinkResult};
pub use link::{LinkFactory, MissionProgress, SharedLink, TelemetryStream, VehicleLink};
pub use scripted::{Command, Reply, ScriptedLink, ScriptedLinkFactory};
pub use simulated::{SimulatedLink, SimulatedLinkFactory};
