//! skygrid-telemetry — fleet telemetry aggregation.
//!
//! ```text
//!   link streams ──► LinkMonitor ──► FleetRegistry (latest sample per unit)
//!                                          │
//!        ┌───────────────┬─────────────────┤
//!        ▼               ▼                 ▼
//!    collect loop    health loop       fleet loop
//!    (history)       (HealthMetric)    (FleetSnapshot)
//!        │               │                 │
//!        └───────────────┴──── notifier ───┘
//! ```

pub mod aggregator;
pub mod error;
pub mod fleet;
pub mod health;

pub use aggregator::{LoopKind, TelemetryAggregator, TelemetryRecord, TelemetryStatistics};
pub use error::{TelemetryError, TelemetryResult};
pub use fleet::{FleetSnapshot, FleetStatus, UnitPosition, aggregate};
pub use health::{CRITICAL_BATTERY, HealthMetric, LOW_BATTERY, assess};
