//! Per-unit health assessment.
//!
//! A [`HealthMetric`] is derived from the unit record and the timestamp of
//! its newest telemetry sample; it is recomputed every health cycle and
//! never edited. A unit is healthy iff it has no error conditions.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use skygrid_registry::{UnitStatus, WorkUnit};

pub const LOW_BATTERY: f64 = 0.2;
pub const CRITICAL_BATTERY: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthMetric {
    pub unit_id: String,
    pub healthy: bool,
    pub battery: f64,
    pub battery_low: bool,
    pub battery_critical: bool,
    pub connected: bool,
    pub stale: bool,
    pub status: UnitStatus,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    /// Timestamp of the newest telemetry sample, epoch ms.
    pub last_update_ms: Option<u64>,
    pub assessed_at_ms: u64,
}

impl HealthMetric {
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Assess `unit` at `now_ms`. `last_sample_ms` is the newest telemetry
/// timestamp in the unit's history, if it has any.
pub fn assess(
    unit: &WorkUnit,
    last_sample_ms: Option<u64>,
    now_ms: u64,
    stale_after: Duration,
) -> HealthMetric {
    let mut warnings = Vec::new();
    let mut errors = Vec::new();
    let pct = unit.battery * 100.0;

    let battery_low = unit.battery < LOW_BATTERY;
    let battery_critical = unit.battery < CRITICAL_BATTERY;
    if battery_low {
        warnings.push(format!("low battery: {pct:.1}%"));
    }
    if battery_critical {
        errors.push(format!("critical battery: {pct:.1}%"));
    }

    if !unit.connected {
        errors.push("unit not connected".to_string());
    }

    let mut stale = false;
    match last_sample_ms {
        Some(ts) => {
            let age = Duration::from_millis(now_ms.saturating_sub(ts));
            if age > stale_after {
                stale = true;
                warnings.push(format!("stale telemetry: {:.1}s old", age.as_secs_f64()));
            }
        }
        None => warnings.push("no telemetry history".to_string()),
    }

    match unit.status {
        UnitStatus::Error => errors.push("unit in error state".to_string()),
        UnitStatus::Offline => errors.push("unit offline".to_string()),
        _ => {}
    }

    HealthMetric {
        unit_id: unit.id.clone(),
        healthy: errors.is_empty(),
        battery: unit.battery,
        battery_low,
        battery_critical,
        connected: unit.connected,
        stale,
        status: unit.status,
        warnings,
        errors,
        last_update_ms: last_sample_ms,
        assessed_at_ms: now_ms,
    }
}
