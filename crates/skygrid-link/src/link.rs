//! The vehicle link capability.
//!
//! One link per work unit. Command methods return `Ok(false)` when the
//! vehicle refuses a command and `Err` when the link itself fails; the
//! executor treats the two differently (refusal fails the task, a link
//! fault also puts the unit in `Error`).

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use sky_core::{Position, Task, TelemetrySample};

use crate::error::LinkResult;

/// Lazy, infinite sequence of telemetry samples. Ends only when the link
/// drops; call [`VehicleLink::telemetry_stream`] again after reconnecting.
pub type TelemetryStream = BoxStream<'static, TelemetrySample>;

/// Waypoint progress reported by the vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MissionProgress {
    /// Waypoints reached so far.
    pub current: usize,
    pub total: usize,
}

impl MissionProgress {
    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.current >= self.total
    }
}

#[async_trait]
pub trait VehicleLink: Send + Sync {
    /// Open the link at `address`. Returns false if the vehicle did not answer.
    async fn connect(&self, address: &str) -> LinkResult<bool>;

    fn is_connected(&self) -> bool;

    fn telemetry_stream(&self) -> TelemetryStream;

    async fn upload_task(&self, task: &Task) -> LinkResult<bool>;

    async fn arm(&self) -> LinkResult<bool>;

    async fn start(&self) -> LinkResult<bool>;

    /// Abandon the current task and return home.
    async fn abort(&self) -> LinkResult<bool>;

    async fn mission_progress(&self) -> LinkResult<MissionProgress>;
}

pub type SharedLink = Arc<dyn VehicleLink>;

/// Builds the link for a unit. Injected so the orchestrator never chooses
/// between simulated and real transports itself.
pub trait LinkFactory: Send + Sync {
    fn create(&self, unit_id: &str, home: Position) -> SharedLink;
}
