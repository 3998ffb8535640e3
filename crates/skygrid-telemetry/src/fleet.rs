//! Fleet-wide aggregation.

use serde::{Deserialize, Serialize};

use sky_core::Position;
use skygrid_registry::{UnitStatus, WorkUnit};

/// Coarse fleet state. Active missions outrank connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FleetStatus {
    ActiveMissions,
    AllOnline,
    PartialOnline,
    Offline,
}

impl FleetStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FleetStatus::ActiveMissions => "active_missions",
            FleetStatus::AllOnline => "all_online",
            FleetStatus::PartialOnline => "partial_online",
            FleetStatus::Offline => "offline",
        }
    }
}

/// One row of the snapshot's position table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitPosition {
    pub unit_id: String,
    pub status: UnitStatus,
    pub battery: f64,
    pub position: Option<Position>,
    pub job_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetSnapshot {
    pub timestamp_ms: u64,
    pub total_units: usize,
    pub connected_units: usize,
    pub executing_tasks: usize,
    pub average_battery: f64,
    pub fleet_status: FleetStatus,
    pub units: Vec<UnitPosition>,
}

/// Summarise `units` given how many tasks are currently executing.
pub fn aggregate(units: &[WorkUnit], executing_tasks: usize, timestamp_ms: u64) -> FleetSnapshot {
    let total = units.len();
    let connected = units.iter().filter(|u| u.connected).count();
    let average_battery = if total > 0 {
        units.iter().map(|u| u.battery).sum::<f64>() / total as f64
    } else {
        0.0
    };

    let fleet_status = if executing_tasks > 0 {
        FleetStatus::ActiveMissions
    } else if total > 0 && connected == total {
        FleetStatus::AllOnline
    } else if connected > 0 {
        FleetStatus::PartialOnline
    } else {
        FleetStatus::Offline
    };

    FleetSnapshot {
        timestamp_ms,
        total_units: total,
        connected_units: connected,
        executing_tasks,
        average_battery,
        fleet_status,
        units: units
            .iter()
            .map(|u| UnitPosition {
                unit_id: u.id.clone(),
                status: u.status,
                battery: u.battery,
                position: u.last_position,
                job_id: u.current_job_id.clone(),
            })
            .collect(),
    }
}
