//! Raw telemetry samples produced by vehicle links.

use serde::{Deserialize, Serialize};

use crate::geo::Position;

/// NED velocity in m/s.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Velocity {
    pub north: f64,
    pub east: f64,
    pub down: f64,
}

impl Velocity {
    pub fn ground_speed(&self) -> f64 {
        (self.north * self.north + self.east * self.east).sqrt()
    }

    /// Course over ground in degrees, [0, 360).
    pub fn heading(&self) -> f64 {
        (self.east.atan2(self.north).to_degrees() + 360.0) % 360.0
    }
}

/// One reading from a unit's telemetry stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub position: Position,
    /// Remaining battery, 0.0–1.0.
    pub battery: f64,
    pub velocity: Velocity,
    /// Unix epoch milliseconds when the sample was taken.
    pub timestamp_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ground_speed_ignores_vertical() {
        let v = Velocity {
            north: 3.0,
            east: 4.0,
            down: -10.0,
        };
        assert_eq!(v.ground_speed(), 5.0);
    }

    #[test]
    fn heading_east() {
        let v = Velocity {
            north: 0.0,
            east: 2.0,
            down: 0.0,
        };
        assert!((v.heading() - 90.0).abs() < 1e-9);
    }
}
