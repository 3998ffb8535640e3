//! Waypoint tasks: the executable decomposition of a delivery job.
//!
//! A [`Task`] is validated at construction: a task that exists is always
//! uploadable. Status only moves forward along
//! `Created → Uploaded → Executing → {Completed, Aborted, Failed}`, with
//! the two failure states reachable from any non-terminal status.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::geo::Coordinates;

/// Fixed allowance for climbing out at the first waypoint.
const TAKEOFF_ALLOWANCE: Duration = Duration::from_secs(30);
/// Fixed allowance for the descent at the last waypoint.
const LANDING_ALLOWANCE: Duration = Duration::from_secs(30);

const MAX_ALTITUDE_M: f64 = 120.0;
const MIN_FLIGHT_ALTITUDE_M: f64 = 5.0;
const MIN_SPEED_MPS: f64 = 1.0;
const MAX_SPEED_MPS: f64 = 30.0;
const MAX_DWELL_SECS: f64 = 300.0;

/// What the unit does at a waypoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaypointKind {
    Takeoff,
    Transit,
    Land,
}

/// A single point in a task's route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub lat: f64,
    pub lon: f64,
    /// Altitude in metres above home.
    pub alt: f64,
    /// Ground speed towards this waypoint in m/s.
    pub speed: Option<f64>,
    /// Time to hold at this waypoint in seconds.
    pub dwell_secs: Option<f64>,
    pub kind: WaypointKind,
}

impl Waypoint {
    pub fn new(kind: WaypointKind, at: Coordinates, alt: f64) -> Self {
        Self {
            lat: at.lat,
            lon: at.lon,
            alt,
            speed: None,
            dwell_secs: None,
            kind,
        }
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = Some(speed);
        self
    }

    pub fn with_dwell(mut self, secs: f64) -> Self {
        self.dwell_secs = Some(secs);
        self
    }

    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.lat, self.lon)
    }

    fn validate(&self, index: usize) -> Result<(), ValidationError> {
        check(index, "latitude", self.lat, -90.0, 90.0)?;
        check(index, "longitude", self.lon, -180.0, 180.0)?;
        let min_alt = match self.kind {
            WaypointKind::Land => 0.0,
            _ => MIN_FLIGHT_ALTITUDE_M,
        };
        check(index, "altitude", self.alt, min_alt, MAX_ALTITUDE_M)?;
        if let Some(speed) = self.speed {
            check(index, "speed", speed, MIN_SPEED_MPS, MAX_SPEED_MPS)?;
        }
        if let Some(dwell) = self.dwell_secs {
            check(index, "dwell", dwell, 0.0, MAX_DWELL_SECS)?;
        }
        Ok(())
    }
}

fn check(
    index: usize,
    field: &'static str,
    value: f64,
    min: f64,
    max: f64,
) -> Result<(), ValidationError> {
    if value.is_nan() || value < min || value > max {
        return Err(ValidationError::OutOfBounds {
            index,
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}

/// Execution parameters carried by every task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskParams {
    /// Cruise ground speed in m/s.
    pub cruise_speed: f64,
    /// Cruise altitude in metres.
    pub cruise_altitude: f64,
    /// Altitude of the initial climb in metres.
    pub takeoff_altitude: f64,
    /// Wall-clock budget for the executing phase.
    pub timeout_secs: u64,
}

impl Default for TaskParams {
    fn default() -> Self {
        Self {
            cruise_speed: 5.0,
            cruise_altitude: 20.0,
            takeoff_altitude: 20.0,
            timeout_secs: 30 * 60,
        }
    }
}

impl TaskParams {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if !(MIN_SPEED_MPS..=MAX_SPEED_MPS).contains(&self.cruise_speed) {
            return Err(ValidationError::Parameters(format!(
                "cruise speed {} m/s",
                self.cruise_speed
            )));
        }
        if self.timeout_secs == 0 {
            return Err(ValidationError::Parameters("zero timeout".to_string()));
        }
        Ok(())
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Uploaded,
    Executing,
    Completed,
    Aborted,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Failed)
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Created, Uploaded) | (Uploaded, Executing) | (Executing, Completed) => true,
            (from, Aborted | Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// A validated waypoint task bound to one job and one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub job_id: String,
    pub unit_id: String,
    pub waypoints: Vec<Waypoint>,
    pub params: TaskParams,
    pub status: TaskStatus,
    /// Fraction complete, monotonic within [0, 1].
    pub progress: f64,
    pub current_waypoint_index: usize,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
    pub failure_reason: Option<String>,
}

impl Task {
    /// Build a task from an explicit waypoint list.
    pub fn new(
        job_id: &str,
        unit_id: &str,
        waypoints: Vec<Waypoint>,
        params: TaskParams,
    ) -> Result<Self, ValidationError> {
        if waypoints.len() < 2 {
            return Err(ValidationError::TooFewWaypoints(waypoints.len()));
        }
        if !waypoints.iter().any(|w| w.kind == WaypointKind::Takeoff) {
            return Err(ValidationError::MissingTakeoff);
        }
        if !waypoints.iter().any(|w| w.kind == WaypointKind::Land) {
            return Err(ValidationError::MissingLanding);
        }
        for (index, wp) in waypoints.iter().enumerate() {
            wp.validate(index)?;
        }
        params.validate()?;

        Ok(Self {
            id: format!("task-{job_id}"),
            job_id: job_id.to_string(),
            unit_id: unit_id.to_string(),
            waypoints,
            params,
            status: TaskStatus::Created,
            progress: 0.0,
            current_waypoint_index: 0,
            created_at: crate::epoch_secs(),
            started_at: None,
            finished_at: None,
            failure_reason: None,
        })
    }

    /// The standard delivery route: take off at the origin, climb to
    /// cruise, fly to the destination, land.
    pub fn delivery(
        job_id: &str,
        unit_id: &str,
        origin: Coordinates,
        destination: Coordinates,
        params: TaskParams,
    ) -> Result<Self, ValidationError> {
        let waypoints = vec![
            Waypoint::new(WaypointKind::Takeoff, origin, params.takeoff_altitude),
            Waypoint::new(WaypointKind::Transit, origin, params.cruise_altitude)
                .with_speed(params.cruise_speed),
            Waypoint::new(WaypointKind::Transit, destination, params.cruise_altitude)
                .with_speed(params.cruise_speed),
            Waypoint::new(WaypointKind::Land, destination, 0.0),
        ];
        Self::new(job_id, unit_id, waypoints, params)
    }

    /// Sum of straight-line leg lengths in kilometres.
    pub fn total_distance_km(&self) -> f64 {
        self.waypoints
            .windows(2)
            .map(|leg| leg[0].coordinates().distance_km(&leg[1].coordinates()))
            .sum()
    }

    /// Flight time at cruise speed plus takeoff, landing, and dwell allowances.
    pub fn estimated_duration(&self) -> Duration {
        let mut secs = 0.0;
        for leg in self.waypoints.windows(2) {
            let meters = leg[0].coordinates().distance_km(&leg[1].coordinates()) * 1000.0;
            let speed = leg[1].speed.unwrap_or(self.params.cruise_speed);
            secs += meters / speed;
        }
        secs += self
            .waypoints
            .iter()
            .filter_map(|w| w.dwell_secs)
            .sum::<f64>();
        Duration::from_secs_f64(secs) + TAKEOFF_ALLOWANCE + LANDING_ALLOWANCE
    }

    /// Progress estimated from elapsed time alone. Only a stand-in for
    /// links that cannot report their waypoint index.
    pub fn time_progress(&self, elapsed: Duration) -> f64 {
        let estimate = self.estimated_duration().as_secs_f64();
        if estimate <= 0.0 {
            return 1.0;
        }
        (elapsed.as_secs_f64() / estimate).clamp(0.0, 1.0)
    }

    /// Record a progress reading; progress never moves backwards.
    pub fn record_progress(&mut self, current: usize, total: usize) {
        let fraction = if total == 0 {
            0.0
        } else {
            (current as f64 / total as f64).clamp(0.0, 1.0)
        };
        self.current_waypoint_index = self.current_waypoint_index.max(current.min(total));
        self.progress = self.progress.max(fraction);
    }

    /// Record a time-based estimate; also monotonic.
    pub fn record_estimate(&mut self, fraction: f64) {
        self.progress = self.progress.max(fraction.clamp(0.0, 1.0));
    }

    /// Move to `next`. Returns false and leaves the task untouched when the
    /// move is not a forward edge.
    pub fn transition(&mut self, next: TaskStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        match next {
            TaskStatus::Executing => self.started_at = Some(crate::epoch_secs()),
            TaskStatus::Completed => {
                self.progress = 1.0;
                self.current_waypoint_index = self.waypoints.len();
                self.finished_at = Some(crate::epoch_secs());
            }
            TaskStatus::Aborted | TaskStatus::Failed => {
                self.finished_at = Some(crate::epoch_secs());
            }
            _ => {}
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> Coordinates {
        Coordinates::new(37.7749, -122.4194)
    }

    fn destination() -> Coordinates {
        Coordinates::new(37.7849, -122.4094)
    }

    #[test]
    fn delivery_task_has_four_waypoints() {
        let task = Task::delivery("job-1", "unit-1", origin(), destination(), TaskParams::default())
            .unwrap();
        assert_eq!(task.waypoints.len(), 4);
        assert_eq!(task.waypoints[0].kind, WaypointKind::Takeoff);
        assert_eq!(task.waypoints[3].kind, WaypointKind::Land);
        assert_eq!(task.status, TaskStatus::Created);
        assert_eq!(task.id, "task-job-1");
    }

    #[test]
    fn rejects_single_waypoint() {
        let wps = vec![Waypoint::new(WaypointKind::Takeoff, origin(), 20.0)];
        let err = Task::new("j", "u", wps, TaskParams::default()).unwrap_err();
        assert_eq!(err, ValidationError::TooFewWaypoints(1));
    }

    #[test]
    fn rejects_missing_landing() {
        let wps = vec![
            Waypoint::new(WaypointKind::Takeoff, origin(), 20.0),
            Waypoint::new(WaypointKind::Transit, destination(), 20.0),
        ];
        let err = Task::new("j", "u", wps, TaskParams::default()).unwrap_err();
        assert_eq!(err, ValidationError::MissingLanding);
    }

    #[test]
    fn rejects_missing_takeoff() {
        let wps = vec![
            Waypoint::new(WaypointKind::Transit, origin(), 20.0),
            Waypoint::new(WaypointKind::Land, destination(), 0.0),
        ];
        let err = Task::new("j", "u", wps, TaskParams::default()).unwrap_err();
        assert_eq!(err, ValidationError::MissingTakeoff);
    }

    #[test]
    fn rejects_altitude_out_of_bounds() {
        let wps = vec![
            Waypoint::new(WaypointKind::Takeoff, origin(), 150.0),
            Waypoint::new(WaypointKind::Land, destination(), 0.0),
        ];
        let err = Task::new("j", "u", wps, TaskParams::default()).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::OutOfBounds { index: 0, field: "altitude", .. }
        ));
    }

    #[test]
    fn rejects_speed_out_of_bounds() {
        let wps = vec![
            Waypoint::new(WaypointKind::Takeoff, origin(), 20.0),
            Waypoint::new(WaypointKind::Transit, destination(), 20.0).with_speed(45.0),
            Waypoint::new(WaypointKind::Land, destination(), 0.0),
        ];
        let err = Task::new("j", "u", wps, TaskParams::default()).unwrap_err();
        assert!(matches!(err, ValidationError::OutOfBounds { index: 1, field: "speed", .. }));
    }

    #[test]
    fn estimated_duration_includes_allowances() {
        let task =
            Task::delivery("j", "u", origin(), origin(), TaskParams::default()).unwrap();
        assert_eq!(task.estimated_duration(), Duration::from_secs(60));
    }

    #[test]
    fn time_progress_is_clamped() {
        let task = Task::delivery("j", "u", origin(), origin(), TaskParams::default()).unwrap();
        assert_eq!(task.time_progress(Duration::from_secs(30)), 0.5);
        assert_eq!(task.time_progress(Duration::from_secs(600)), 1.0);
    }

    #[test]
    fn progress_is_monotonic() {
        let mut task =
            Task::delivery("j", "u", origin(), destination(), TaskParams::default()).unwrap();
        task.record_progress(2, 4);
        assert_eq!(task.progress, 0.5);
        task.record_progress(1, 4);
        assert_eq!(task.progress, 0.5);
        assert_eq!(task.current_waypoint_index, 2);
        task.record_estimate(0.25);
        assert_eq!(task.progress, 0.5);
    }

    #[test]
    fn status_moves_forward_only() {
        let mut task =
            Task::delivery("j", "u", origin(), destination(), TaskParams::default()).unwrap();
        assert!(!task.transition(TaskStatus::Executing));
        assert!(task.transition(TaskStatus::Uploaded));
        assert!(task.transition(TaskStatus::Executing));
        assert!(task.started_at.is_some());
        assert!(task.transition(TaskStatus::Completed));
        assert_eq!(task.progress, 1.0);
        assert!(!task.transition(TaskStatus::Failed));
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[test]
    fn failure_reachable_from_created() {
        assert!(TaskStatus::Created.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::Uploaded.can_transition_to(TaskStatus::Aborted));
        assert!(!TaskStatus::Aborted.can_transition_to(TaskStatus::Failed));
    }
}
