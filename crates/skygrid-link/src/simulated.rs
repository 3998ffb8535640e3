//! In-process vehicle simulation.
//!
//! Flies the uploaded route along straight legs at each waypoint's speed,
//! using the same takeoff and landing allowances as the task estimate, so
//! a simulated flight finishes when [`Task::estimated_duration`] says it
//! should. Time comes from `tokio::time`, which lets paused-clock tests
//! fly whole missions instantly.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use sky_core::{Position, Task, TelemetrySample, Velocity, epoch_millis};

use crate::error::{LinkError, LinkResult};
use crate::link::{LinkFactory, MissionProgress, SharedLink, TelemetryStream, VehicleLink};

const TAKEOFF_SECS: f64 = 30.0;
const LANDING_SECS: f64 = 30.0;
/// Battery fraction used per second of flight.
const DRAIN_PER_SEC: f64 = 0.0004;
/// Battery fraction regained per second on the ground.
const RECHARGE_PER_SEC: f64 = 0.002;

/// A route with the simulated time at which each waypoint is reached.
#[derive(Debug, Clone)]
struct Route {
    points: Vec<Position>,
    speeds: Vec<f64>,
    reach_secs: Vec<f64>,
}

impl Route {
    fn from_task(task: &Task) -> Self {
        let points: Vec<Position> = task
            .waypoints
            .iter()
            .map(|w| Position::new(w.lat, w.lon, w.alt))
            .collect();
        let speeds: Vec<f64> = task
            .waypoints
            .iter()
            .map(|w| w.speed.unwrap_or(task.params.cruise_speed))
            .collect();

        let mut reach_secs = Vec::with_capacity(points.len());
        let mut t = TAKEOFF_SECS;
        reach_secs.push(t);
        for i in 1..points.len() {
            let meters = points[i - 1]
                .coordinates()
                .distance_km(&points[i].coordinates())
                * 1000.0;
            t += task.waypoints[i - 1].dwell_secs.unwrap_or(0.0);
            t += meters / speeds[i];
            reach_secs.push(t);
        }
        if let Some(last) = reach_secs.last_mut() {
            *last += LANDING_SECS;
        }

        Self {
            points,
            speeds,
            reach_secs,
        }
    }

    fn reached(&self, elapsed: f64) -> usize {
        self.reach_secs.iter().filter(|&&t| t <= elapsed).count()
    }

    /// Position and velocity `elapsed` simulated seconds after start.
    fn state_at(&self, start: Position, elapsed: f64) -> (Position, Velocity) {
        let reached = self.reached(elapsed);
        if reached >= self.points.len() {
            let last = self.points[self.points.len() - 1];
            return (last, Velocity::default());
        }
        let (from, from_t) = if reached == 0 {
            (start, 0.0)
        } else {
            (self.points[reached - 1], self.reach_secs[reached - 1])
        };
        let to = self.points[reached];
        let span = self.reach_secs[reached] - from_t;
        let t = if span > 0.0 {
            ((elapsed - from_t) / span).clamp(0.0, 1.0)
        } else {
            1.0
        };

        let at = from.coordinates().lerp(&to.coordinates(), t);
        let alt = from.alt + (to.alt - from.alt) * t;

        let bearing = from.coordinates().bearing_to(&to.coordinates()).to_radians();
        let speed = if from.coordinates().distance_km(&to.coordinates()) > 0.0 {
            self.speeds[reached]
        } else {
            0.0
        };
        let velocity = Velocity {
            north: speed * bearing.cos(),
            east: speed * bearing.sin(),
            down: if span > 0.0 { (from.alt - to.alt) / span } else { 0.0 },
        };
        (Position::new(at.lat, at.lon, alt), velocity)
    }
}

#[derive(Debug)]
struct Flight {
    started: Instant,
    /// Where the unit was when the flight started.
    origin: Position,
}

#[derive(Debug)]
struct SimState {
    home: Position,
    connected: bool,
    battery: f64,
    position: Position,
    velocity: Velocity,
    route: Option<Route>,
    armed: bool,
    flight: Option<Flight>,
    last_update: Instant,
}

impl SimState {
    fn elapsed(&self, flight: &Flight, now: Instant, scale: f64) -> f64 {
        now.saturating_duration_since(flight.started).as_secs_f64() * scale
    }

    fn advance(&mut self, now: Instant, scale: f64) {
        let dt = now.saturating_duration_since(self.last_update).as_secs_f64() * scale;
        self.last_update = now;

        let in_air = match (&self.flight, &self.route) {
            (Some(flight), Some(route)) => {
                let elapsed = self.elapsed(flight, now, scale);
                let (position, velocity) = route.state_at(flight.origin, elapsed);
                self.position = position;
                self.velocity = velocity;
                route.reached(elapsed) < route.points.len()
            }
            _ => false,
        };

        if in_air {
            self.battery = (self.battery - DRAIN_PER_SEC * dt).max(0.0);
        } else {
            self.velocity = Velocity::default();
            self.battery = (self.battery + RECHARGE_PER_SEC * dt).min(1.0);
        }
    }

    fn progress(&self, now: Instant, scale: f64) -> MissionProgress {
        match (&self.route, &self.flight) {
            (None, _) => MissionProgress::default(),
            (Some(route), None) => MissionProgress {
                current: 0,
                total: route.points.len(),
            },
            (Some(route), Some(flight)) => MissionProgress {
                current: route.reached(self.elapsed(flight, now, scale)),
                total: route.points.len(),
            },
        }
    }

    fn sample(&self) -> TelemetrySample {
        TelemetrySample {
            position: self.position,
            battery: self.battery,
            velocity: self.velocity,
            timestamp_ms: epoch_millis(),
        }
    }
}

/// A simulated vehicle parked at `home`.
pub struct SimulatedLink {
    unit_id: String,
    state: Arc<Mutex<SimState>>,
    time_scale: f64,
    telemetry_interval: Duration,
}

impl SimulatedLink {
    pub fn new(unit_id: &str, home: Position) -> Self {
        Self {
            unit_id: unit_id.to_string(),
            state: Arc::new(Mutex::new(SimState {
                home,
                connected: false,
                battery: 1.0,
                position: home,
                velocity: Velocity::default(),
                route: None,
                armed: false,
                flight: None,
                last_update: Instant::now(),
            })),
            time_scale: 1.0,
            telemetry_interval: Duration::from_secs(1),
        }
    }

    /// Simulated seconds per real second.
    pub fn with_time_scale(mut self, scale: f64) -> Self {
        self.time_scale = if scale > 0.0 { scale } else { 1.0 };
        self
    }

    pub fn with_telemetry_interval(mut self, interval: Duration) -> Self {
        self.telemetry_interval = interval;
        self
    }

    pub fn with_battery(self, battery: f64) -> Self {
        lock(&self.state).battery = battery.clamp(0.0, 1.0);
        self
    }

    /// Drop the link as if the radio went silent.
    pub fn disconnect(&self) {
        lock(&self.state).connected = false;
        warn!(unit_id = %self.unit_id, "simulated link dropped");
    }

    fn connected_state(&self) -> LinkResult<MutexGuard<'_, SimState>> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(LinkError::ConnectionLost(self.unit_id.clone()));
        }
        state.advance(Instant::now(), self.time_scale);
        Ok(state)
    }
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl VehicleLink for SimulatedLink {
    async fn connect(&self, address: &str) -> LinkResult<bool> {
        if !address.starts_with("udp://") {
            warn!(unit_id = %self.unit_id, %address, "unsupported link address");
            return Ok(false);
        }
        let mut state = lock(&self.state);
        state.connected = true;
        state.last_update = Instant::now();
        info!(unit_id = %self.unit_id, %address, "simulated link connected");
        Ok(true)
    }

    fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    fn telemetry_stream(&self) -> TelemetryStream {
        let state = self.state.clone();
        let interval = self.telemetry_interval;
        let scale = self.time_scale;
        futures_util::stream::unfold(state, move |state| async move {
            tokio::time::sleep(interval).await;
            let sample = {
                let mut s = lock(&state);
                if !s.connected {
                    return None;
                }
                s.advance(Instant::now(), scale);
                s.sample()
            };
            Some((sample, state))
        })
        .boxed()
    }

    async fn upload_task(&self, task: &Task) -> LinkResult<bool> {
        let mut state = self.connected_state()?;
        let in_flight = match (&state.flight, &state.route) {
            (Some(flight), Some(route)) => {
                route.reached(state.elapsed(flight, Instant::now(), self.time_scale))
                    < route.points.len()
            }
            _ => false,
        };
        if in_flight {
            warn!(unit_id = %self.unit_id, task_id = %task.id, "upload refused while flying");
            return Ok(false);
        }
        state.route = Some(Route::from_task(task));
        state.flight = None;
        state.armed = false;
        debug!(unit_id = %self.unit_id, task_id = %task.id, waypoints = task.waypoints.len(), "task uploaded");
        Ok(true)
    }

    async fn arm(&self) -> LinkResult<bool> {
        let mut state = self.connected_state()?;
        if state.route.is_none() {
            return Ok(false);
        }
        state.armed = true;
        debug!(unit_id = %self.unit_id, "armed");
        Ok(true)
    }

    async fn start(&self) -> LinkResult<bool> {
        let mut state = self.connected_state()?;
        if !state.armed || state.route.is_none() {
            return Ok(false);
        }
        let origin = state.position;
        state.flight = Some(Flight {
            started: Instant::now(),
            origin,
        });
        debug!(unit_id = %self.unit_id, "mission started");
        Ok(true)
    }

    async fn abort(&self) -> LinkResult<bool> {
        let mut state = self.connected_state()?;
        state.flight = None;
        state.route = None;
        state.armed = false;
        state.position = state.home;
        state.velocity = Velocity::default();
        info!(unit_id = %self.unit_id, "mission aborted, returned home");
        Ok(true)
    }

    async fn mission_progress(&self) -> LinkResult<MissionProgress> {
        let state = self.connected_state()?;
        Ok(state.progress(Instant::now(), self.time_scale))
    }
}

/// Creates a [`SimulatedLink`] per unit.
#[derive(Debug, Clone)]
pub struct SimulatedLinkFactory {
    pub time_scale: f64,
    pub telemetry_interval: Duration,
}

impl Default for SimulatedLinkFactory {
    fn default() -> Self {
        Self {
            time_scale: 1.0,
            telemetry_interval: Duration::from_secs(1),
        }
    }
}

impl LinkFactory for SimulatedLinkFactory {
    fn create(&self, unit_id: &str, home: Position) -> SharedLink {
        Arc::new(
            SimulatedLink::new(unit_id, home)
                .with_time_scale(self.time_scale)
                .with_telemetry_interval(self.telemetry_interval),
        )
    }
}

#[cfg(test)]
mod tests {
    use sky_core::{Coordinates, TaskParams};

    use super::*;

    fn home() -> Position {
        Position::new(37.7749, -122.4194, 10.0)
    }

    fn task() -> Task {
        Task::delivery(
            "job-1",
            "unit-1",
            Coordinates::new(37.7749, -122.4194),
            Coordinates::new(37.7759, -122.4194),
            TaskParams::default(),
        )
        .unwrap()
    }

    async fn connected_link() -> SimulatedLink {
        let link = SimulatedLink::new("unit-1", home());
        assert!(link.connect("udp://:14540").await.unwrap());
        link
    }

    #[tokio::test]
    async fn commands_fail_before_connect() {
        let link = SimulatedLink::new("unit-1", home());
        let err = link.upload_task(&task()).await.unwrap_err();
        assert_eq!(err, LinkError::ConnectionLost("unit-1".to_string()));
        assert!(!link.connect("tcp://nowhere").await.unwrap());
    }

    #[tokio::test]
    async fn arm_requires_upload() {
        let link = connected_link().await;
        assert!(!link.arm().await.unwrap());
        assert!(!link.start().await.unwrap());
        assert!(link.upload_task(&task()).await.unwrap());
        assert!(!link.start().await.unwrap());
        assert!(link.arm().await.unwrap());
        assert!(link.start().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn flight_completes_at_estimated_duration() {
        let link = connected_link().await;
        let task = task();
        let estimate = task.estimated_duration();

        link.upload_task(&task).await.unwrap();
        link.arm().await.unwrap();
        link.start().await.unwrap();

        let progress = link.mission_progress().await.unwrap();
        assert_eq!(progress, MissionProgress { current: 0, total: 4 });

        tokio::time::advance(estimate - Duration::from_secs(1)).await;
        assert!(!link.mission_progress().await.unwrap().is_complete());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(link.mission_progress().await.unwrap().is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn time_scale_speeds_up_flight() {
        let link = SimulatedLink::new("unit-1", home()).with_time_scale(10.0);
        link.connect("udp://:14540").await.unwrap();
        let task = task();
        link.upload_task(&task).await.unwrap();
        link.arm().await.unwrap();
        link.start().await.unwrap();

        tokio::time::advance(task.estimated_duration() / 10 + Duration::from_millis(100)).await;
        assert!(link.mission_progress().await.unwrap().is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn battery_drains_in_flight() {
        let link = connected_link().await;
        link.upload_task(&task()).await.unwrap();
        link.arm().await.unwrap();
        link.start().await.unwrap();

        let mut stream = link.telemetry_stream();
        let mut last = 1.0;
        for _ in 0..5 {
            let sample = stream.next().await.unwrap();
            assert!(sample.battery < last);
            last = sample.battery;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn telemetry_stream_ends_on_disconnect() {
        let link = connected_link().await;
        let mut stream = link.telemetry_stream();
        assert!(stream.next().await.is_some());
        link.disconnect();
        assert!(stream.next().await.is_none());
        assert!(!link.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn abort_returns_home() {
        let link = connected_link().await;
        link.upload_task(&task()).await.unwrap();
        link.arm().await.unwrap();
        link.start().await.unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;

        assert!(link.abort().await.unwrap());
        assert_eq!(link.mission_progress().await.unwrap(), MissionProgress::default());
        let sample = link.telemetry_stream().next().await.unwrap();
        assert_eq!(sample.position, home());
    }

    #[tokio::test(start_paused = true)]
    async fn upload_refused_mid_flight() {
        let link = connected_link().await;
        link.upload_task(&task()).await.unwrap();
        link.arm().await.unwrap();
        link.start().await.unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!link.upload_task(&task()).await.unwrap());
    }
}
