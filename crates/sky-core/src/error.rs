//! Validation errors for tasks and waypoints.

use thiserror::Error;

/// A task or waypoint failed validation before any state was touched.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("task needs at least 2 waypoints, got {0}")]
    TooFewWaypoints(usize),

    #[error("task has no takeoff waypoint")]
    MissingTakeoff,

    #[error("task has no landing waypoint")]
    MissingLanding,

    #[error("waypoint {index}: {field} {value} outside [{min}, {max}]")]
    OutOfBounds {
        index: usize,
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("invalid task parameters: {0}")]
    Parameters(String),
}
