//! skygrid-control — the orchestrator.
//!
//! Builds one of every component from a [`SkyConfig`](sky_core::SkyConfig)
//! and wires them together explicitly:
//!
//! ```text
//!                     ┌──────────── Orchestrator ────────────┐
//!   JobStore ◀──────── JobScheduler ──▶ MissionExecutor       │
//!                     │      │                 │              │
//!                     │      ▼                 ▼              │
//!   ResourcePool ──▶ FleetRegistry ◀── LinkMonitor ◀── VehicleLink (per unit)
//!                     │      │                                │
//!                     │      ▼                                │
//!                     │  TelemetryAggregator ──▶ notifier ────┼──▶ subscribers
//!                     └───────────────────────────────────────┘
//! ```
//!
//! The admin surface in [`admin`] is what the daemon (or any transport
//! put in front of it) calls.

pub mod admin;
pub mod error;
pub mod orchestrator;

pub use admin::{RepairOutcome, UnitDetail};
pub use error::{ControlError, ControlResult};
pub use orchestrator::Orchestrator;
