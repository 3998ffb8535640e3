//! Fleet registry: the authoritative record of every work unit.
//!
//! All unit mutations go through here so the eligibility and transition
//! rules live in one place. The registry is a cheap-to-clone handle over a
//! single lock; no method holds the lock across a link call.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use sky_core::notify::publish_json;
use sky_core::{NullNotifier, Position, SharedNotifier, TelemetrySample, Topic, Velocity};
use sky_core::{epoch_millis, epoch_secs};
use skygrid_link::SharedLink;

use crate::error::{RegistryError, RegistryResult};
use crate::status::{TransitionCause, UnitStatus, UnitTransition};

/// Transitions kept per unit.
const TRANSITION_LOG_LEN: usize = 64;

/// A registered work unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: String,
    pub name: String,
    pub home: Position,
    pub slot: Option<u16>,
    pub link_address: Option<String>,
    pub status: UnitStatus,
    pub connected: bool,
    /// Remaining battery, 0.0–1.0.
    pub battery: f64,
    pub current_job_id: Option<String>,
    pub last_position: Option<Position>,
    pub last_velocity: Option<Velocity>,
    /// Timestamp of the newest telemetry sample, epoch ms.
    pub last_telemetry_ms: Option<u64>,
    pub registered_at: u64,
}

/// Fleet-wide counters, computed on every call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetStatistics {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    /// Units holding a job.
    pub active: usize,
    /// Units that could take a job right now.
    pub available: usize,
    pub active_missions: usize,
    pub errored: usize,
    pub average_battery: f64,
}

/// Payload published on [`Topic::UnitStatus`].
#[derive(Debug, Clone, Serialize)]
struct UnitStatusEvent<'a> {
    unit_id: &'a str,
    transition: &'a UnitTransition,
    job_id: Option<&'a str>,
}

struct UnitEntry {
    unit: WorkUnit,
    link: Option<SharedLink>,
    transitions: VecDeque<UnitTransition>,
    /// Set by shutdown; the unit accepts no further transitions.
    retired: bool,
}

impl UnitEntry {
    fn record(&mut self, to: UnitStatus, cause: TransitionCause) -> UnitTransition {
        let transition = UnitTransition {
            from: self.unit.status,
            to,
            cause,
            at_ms: epoch_millis(),
        };
        self.unit.status = to;
        if self.transitions.len() == TRANSITION_LOG_LEN {
            self.transitions.pop_front();
        }
        self.transitions.push_back(transition.clone());
        transition
    }
}

#[derive(Default)]
struct Inner {
    /// Unit ids in registration order.
    order: Vec<String>,
    units: HashMap<String, UnitEntry>,
}

impl Inner {
    fn entry_mut(&mut self, unit_id: &str) -> RegistryResult<&mut UnitEntry> {
        self.units
            .get_mut(unit_id)
            .ok_or_else(|| RegistryError::UnknownUnit(unit_id.to_string()))
    }

    fn unit_for_job(&self, job_id: &str) -> Option<String> {
        self.order
            .iter()
            .find(|id| {
                self.units
                    .get(*id)
                    .and_then(|e| e.unit.current_job_id.as_deref())
                    == Some(job_id)
            })
            .cloned()
    }
}

#[derive(Clone)]
pub struct FleetRegistry {
    inner: Arc<RwLock<Inner>>,
    /// Battery fraction a unit needs to be handed a job.
    min_dispatch_battery: f64,
    notifier: SharedNotifier,
}

impl FleetRegistry {
    pub fn new(min_dispatch_battery: f64) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            min_dispatch_battery,
            notifier: Arc::new(NullNotifier),
        }
    }

    pub fn with_notifier(mut self, notifier: SharedNotifier) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn min_dispatch_battery(&self) -> f64 {
        self.min_dispatch_battery
    }

    /// Add a unit in `Offline`.
    pub async fn register(&self, id: &str, name: &str, home: Position) -> RegistryResult<()> {
        let mut inner = self.inner.write().await;
        if inner.units.contains_key(id) {
            return Err(RegistryError::AlreadyRegistered(id.to_string()));
        }
        inner.order.push(id.to_string());
        inner.units.insert(
            id.to_string(),
            UnitEntry {
                unit: WorkUnit {
                    id: id.to_string(),
                    name: name.to_string(),
                    home,
                    slot: None,
                    link_address: None,
                    status: UnitStatus::Offline,
                    connected: false,
                    battery: 1.0,
                    current_job_id: None,
                    last_position: None,
                    last_velocity: None,
                    last_telemetry_ms: None,
                    registered_at: epoch_secs(),
                },
                link: None,
                transitions: VecDeque::new(),
                retired: false,
            },
        );
        info!(unit_id = %id, %name, "unit registered");
        Ok(())
    }

    pub async fn attach_link(&self, unit_id: &str, link: SharedLink) -> RegistryResult<()> {
        let mut inner = self.inner.write().await;
        inner.entry_mut(unit_id)?.link = Some(link);
        Ok(())
    }

    pub async fn link(&self, unit_id: &str) -> Option<SharedLink> {
        let inner = self.inner.read().await;
        inner.units.get(unit_id).and_then(|e| e.link.clone())
    }

    /// Record the unit's slot and the link address derived from it.
    pub async fn set_slot(&self, unit_id: &str, slot: Option<u16>, address: Option<String>) -> RegistryResult<()> {
        let mut inner = self.inner.write().await;
        let entry = inner.entry_mut(unit_id)?;
        entry.unit.slot = slot;
        entry.unit.link_address = address;
        debug!(%unit_id, ?slot, "unit slot updated");
        Ok(())
    }

    pub async fn unit(&self, unit_id: &str) -> Option<WorkUnit> {
        let inner = self.inner.read().await;
        inner.units.get(unit_id).map(|e| e.unit.clone())
    }

    /// Every unit, in registration order.
    pub async fn units(&self) -> Vec<WorkUnit> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.units.get(id))
            .map(|e| e.unit.clone())
            .collect()
    }

    pub async fn unit_ids(&self) -> Vec<String> {
        self.inner.read().await.order.clone()
    }

    /// Move a unit along the status graph. Illegal moves are logged and
    /// rejected without touching the unit.
    pub async fn transition(&self, unit_id: &str, to: UnitStatus) -> RegistryResult<()> {
        let mut inner = self.inner.write().await;
        let entry = inner.entry_mut(unit_id)?;
        let from = entry.unit.status;
        if entry.retired || !from.can_transition_to(to) {
            warn!(%unit_id, %from, %to, "illegal unit transition ignored");
            return Err(RegistryError::InvalidTransition {
                unit: unit_id.to_string(),
                from,
                to,
            });
        }
        if to == UnitStatus::Error || to == UnitStatus::Offline {
            entry.unit.connected = false;
        }
        let transition = entry.record(to, TransitionCause::Step);
        let job_id = entry.unit.current_job_id.clone();
        drop(inner);

        debug!(%unit_id, %from, %to, "unit transition");
        self.publish(unit_id, &transition, job_id.as_deref());
        Ok(())
    }

    pub async fn set_connected(&self, unit_id: &str, connected: bool) -> RegistryResult<()> {
        let mut inner = self.inner.write().await;
        inner.entry_mut(unit_id)?.unit.connected = connected;
        Ok(())
    }

    /// Fold a telemetry sample into the unit record.
    pub async fn record_telemetry(&self, unit_id: &str, sample: &TelemetrySample) -> RegistryResult<()> {
        let mut inner = self.inner.write().await;
        let unit = &mut inner.entry_mut(unit_id)?.unit;
        unit.battery = sample.battery.clamp(0.0, 1.0);
        unit.last_position = Some(sample.position);
        unit.last_velocity = Some(sample.velocity);
        unit.last_telemetry_ms = Some(sample.timestamp_ms);
        Ok(())
    }

    /// Bind `job_id` to `unit_id` and arm the unit.
    ///
    /// Only an `Idle`, connected unit with enough battery that is not
    /// already holding the job qualifies; anything else returns false and
    /// changes nothing.
    pub async fn assign_job(&self, job_id: &str, unit_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        if let Some(holder) = inner.unit_for_job(job_id) {
            debug!(%job_id, %holder, "job already assigned");
            return false;
        }
        let Some(entry) = inner.units.get_mut(unit_id) else {
            warn!(%unit_id, %job_id, "assign to unknown unit");
            return false;
        };
        let unit = &entry.unit;
        if entry.retired
            || unit.status != UnitStatus::Idle
            || !unit.connected
            || unit.battery < self.min_dispatch_battery
        {
            debug!(
                %unit_id,
                %job_id,
                status = %unit.status,
                connected = unit.connected,
                battery = unit.battery,
                "unit not eligible for job"
            );
            return false;
        }

        entry.unit.current_job_id = Some(job_id.to_string());
        let transition = entry.record(UnitStatus::Armed, TransitionCause::Step);
        drop(inner);

        info!(%unit_id, %job_id, "job assigned");
        self.publish(unit_id, &transition, Some(job_id));
        true
    }

    /// Hand the unit holding `job_id` back as `Idle`, from any status.
    /// Returns the unit id, or `None` if no unit holds the job.
    pub async fn release(&self, job_id: &str) -> Option<String> {
        self.release_to(job_id, UnitStatus::Idle).await
    }

    /// Like [`release`](Self::release) but leaves the unit in `Error`,
    /// for jobs that ended because the link failed.
    pub async fn release_faulted(&self, job_id: &str) -> Option<String> {
        self.release_to(job_id, UnitStatus::Error).await
    }

    async fn release_to(&self, job_id: &str, to: UnitStatus) -> Option<String> {
        let mut inner = self.inner.write().await;
        let unit_id = inner.unit_for_job(job_id)?;
        let entry = inner.units.get_mut(&unit_id)?;
        entry.unit.current_job_id = None;
        if entry.retired {
            debug!(%unit_id, %job_id, "released unit already offline");
            return Some(unit_id);
        }
        if to == UnitStatus::Error {
            entry.unit.connected = false;
        }
        let transition = entry.record(to, TransitionCause::Release);
        drop(inner);

        info!(%unit_id, %job_id, status = %to, "unit released");
        self.publish(&unit_id, &transition, Some(job_id));
        Some(unit_id)
    }

    /// First unit, in registration order, that is `Idle`, connected, and
    /// above the dispatch battery threshold.
    pub async fn get_available_unit(&self) -> Option<String> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.units.get(id))
            .find(|e| self.is_available(e))
            .map(|e| e.unit.id.clone())
    }

    fn is_available(&self, entry: &UnitEntry) -> bool {
        !entry.retired
            && entry.unit.status == UnitStatus::Idle
            && entry.unit.connected
            && entry.unit.battery > self.min_dispatch_battery
    }

    pub async fn unit_for_job(&self, job_id: &str) -> Option<String> {
        self.inner.read().await.unit_for_job(job_id)
    }

    /// The unit's recorded transitions, oldest first.
    pub async fn transitions(&self, unit_id: &str) -> RegistryResult<Vec<UnitTransition>> {
        let inner = self.inner.read().await;
        let entry = inner
            .units
            .get(unit_id)
            .ok_or_else(|| RegistryError::UnknownUnit(unit_id.to_string()))?;
        Ok(entry.transitions.iter().cloned().collect())
    }

    pub async fn statistics(&self) -> FleetStatistics {
        let inner = self.inner.read().await;
        let entries: Vec<&UnitEntry> = inner.units.values().collect();
        let total = entries.len();
        let online = entries.iter().filter(|e| e.unit.connected).count();
        let battery_sum: f64 = entries.iter().map(|e| e.unit.battery).sum();

        FleetStatistics {
            total,
            online,
            offline: total - online,
            active: entries.iter().filter(|e| e.unit.current_job_id.is_some()).count(),
            available: entries.iter().filter(|e| self.is_available(e)).count(),
            active_missions: entries
                .iter()
                .filter(|e| e.unit.status == UnitStatus::MissionActive)
                .count(),
            errored: entries
                .iter()
                .filter(|e| e.unit.status == UnitStatus::Error)
                .count(),
            average_battery: if total > 0 {
                battery_sum / total as f64
            } else {
                0.0
            },
        }
    }

    /// Take every unit offline for good.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.write().await;
        let mut changed = Vec::new();
        for entry in inner.units.values_mut() {
            entry.unit.connected = false;
            entry.unit.current_job_id = None;
            if !entry.retired && entry.unit.status != UnitStatus::Offline {
                changed.push((
                    entry.unit.id.clone(),
                    entry.record(UnitStatus::Offline, TransitionCause::Shutdown),
                ));
            }
            entry.retired = true;
        }
        drop(inner);

        for (unit_id, transition) in &changed {
            self.publish(unit_id, transition, None);
        }
        info!(units = changed.len(), "fleet shut down");
    }

    fn publish(&self, unit_id: &str, transition: &UnitTransition, job_id: Option<&str>) {
        publish_json(
            self.notifier.as_ref(),
            Topic::UnitStatus,
            &UnitStatusEvent {
                unit_id,
                transition,
                job_id,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use sky_core::BroadcastNotifier;

    use super::*;

    fn home() -> Position {
        Position::new(37.7749, -122.4194, 10.0)
    }

    async fn idle_unit(registry: &FleetRegistry, id: &str) {
        registry.register(id, id, home()).await.unwrap();
        registry.transition(id, UnitStatus::Connecting).await.unwrap();
        registry.set_connected(id, true).await.unwrap();
        registry.transition(id, UnitStatus::Idle).await.unwrap();
    }

    fn sample(battery: f64) -> TelemetrySample {
        TelemetrySample {
            position: home(),
            battery,
            velocity: Velocity::default(),
            timestamp_ms: 1_000,
        }
    }

    #[tokio::test]
    async fn test_register_twice_fails() {
        let registry = FleetRegistry::new(0.2);
        registry.register("u1", "Alpha", home()).await.unwrap();
        let err = registry.register("u1", "Alpha", home()).await.unwrap_err();
        assert_eq!(err, RegistryError::AlreadyRegistered("u1".to_string()));
        assert_eq!(registry.unit("u1").await.unwrap().status, UnitStatus::Offline);
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected() {
        let registry = FleetRegistry::new(0.2);
        registry.register("u1", "Alpha", home()).await.unwrap();
        let err = registry.transition("u1", UnitStatus::Idle).await.unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransition { .. }));
        assert_eq!(registry.unit("u1").await.unwrap().status, UnitStatus::Offline);
        assert!(registry.transitions("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_unit() {
        let registry = FleetRegistry::new(0.2);
        assert_eq!(
            registry.transition("ghost", UnitStatus::Connecting).await,
            Err(RegistryError::UnknownUnit("ghost".to_string()))
        );
        assert!(!registry.assign_job("job-1", "ghost").await);
    }

    #[tokio::test]
    async fn test_assign_job_arms_idle_unit() {
        let registry = FleetRegistry::new(0.2);
        idle_unit(&registry, "u1").await;

        assert!(registry.assign_job("job-1", "u1").await);
        let unit = registry.unit("u1").await.unwrap();
        assert_eq!(unit.status, UnitStatus::Armed);
        assert_eq!(unit.current_job_id.as_deref(), Some("job-1"));
        assert_eq!(registry.unit_for_job("job-1").await.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn test_assign_job_same_job_twice() {
        let registry = FleetRegistry::new(0.2);
        idle_unit(&registry, "u1").await;
        idle_unit(&registry, "u2").await;
        assert!(registry.assign_job("job-1", "u1").await);
        assert!(!registry.assign_job("job-1", "u2").await);
        assert_eq!(registry.unit("u2").await.unwrap().status, UnitStatus::Idle);
    }

    #[tokio::test]
    async fn test_assign_job_ineligible_no_mutation() {
        let registry = FleetRegistry::new(0.2);

        // Low battery.
        idle_unit(&registry, "low").await;
        registry.record_telemetry("low", &sample(0.1)).await.unwrap();
        // Disconnected.
        idle_unit(&registry, "dark").await;
        registry.set_connected("dark", false).await.unwrap();
        // Not idle.
        registry.register("off", "off", home()).await.unwrap();

        for id in ["low", "dark", "off"] {
            let before = registry.unit(id).await.unwrap();
            let log_before = registry.transitions(id).await.unwrap();
            assert!(!registry.assign_job("job-1", id).await, "{id}");
            assert_eq!(registry.unit(id).await.unwrap(), before);
            assert_eq!(registry.transitions(id).await.unwrap(), log_before);
        }
    }

    #[tokio::test]
    async fn test_battery_threshold_boundary() {
        let registry = FleetRegistry::new(0.2);
        idle_unit(&registry, "u1").await;
        registry.record_telemetry("u1", &sample(0.2)).await.unwrap();
        // At exactly the threshold the unit may be assigned but is not
        // offered by get_available_unit.
        assert_eq!(registry.get_available_unit().await, None);
        assert!(registry.assign_job("job-1", "u1").await);
    }

    #[tokio::test]
    async fn test_release_forces_idle() {
        let registry = FleetRegistry::new(0.2);
        idle_unit(&registry, "u1").await;
        registry.assign_job("job-1", "u1").await;
        registry.transition("u1", UnitStatus::InFlight).await.unwrap();
        registry.transition("u1", UnitStatus::MissionActive).await.unwrap();

        assert_eq!(registry.release("job-1").await.as_deref(), Some("u1"));
        let unit = registry.unit("u1").await.unwrap();
        assert_eq!(unit.status, UnitStatus::Idle);
        assert!(unit.current_job_id.is_none());
        assert_eq!(registry.release("job-1").await, None);

        let last = registry.transitions("u1").await.unwrap().pop().unwrap();
        assert_eq!(last.cause, TransitionCause::Release);
        assert_eq!(last.from, UnitStatus::MissionActive);
    }

    #[tokio::test]
    async fn test_release_faulted() {
        let registry = FleetRegistry::new(0.2);
        idle_unit(&registry, "u1").await;
        registry.assign_job("job-1", "u1").await;
        registry.release_faulted("job-1").await;
        let unit = registry.unit("u1").await.unwrap();
        assert_eq!(unit.status, UnitStatus::Error);
        assert!(!unit.connected);
    }

    #[tokio::test]
    async fn test_available_unit_registration_order() {
        let registry = FleetRegistry::new(0.2);
        idle_unit(&registry, "zulu").await;
        idle_unit(&registry, "alpha").await;
        assert_eq!(registry.get_available_unit().await.as_deref(), Some("zulu"));
        registry.assign_job("job-1", "zulu").await;
        assert_eq!(registry.get_available_unit().await.as_deref(), Some("alpha"));
    }

    #[tokio::test]
    async fn test_statistics_fresh() {
        let registry = FleetRegistry::new(0.2);
        idle_unit(&registry, "u1").await;
        idle_unit(&registry, "u2").await;
        registry.register("u3", "u3", home()).await.unwrap();
        registry.record_telemetry("u1", &sample(0.5)).await.unwrap();

        let stats = registry.statistics().await;
        assert_eq!(stats.total, 3);
        assert_eq!(stats.online, 2);
        assert_eq!(stats.offline, 1);
        assert_eq!(stats.available, 2);
        assert!((stats.average_battery - 2.5 / 3.0).abs() < 1e-9);

        registry.assign_job("job-1", "u1").await;
        let stats = registry.statistics().await;
        assert_eq!(stats.active, 1);
        assert_eq!(stats.available, 1);
    }

    #[tokio::test]
    async fn test_shutdown_is_terminal() {
        let registry = FleetRegistry::new(0.2);
        idle_unit(&registry, "u1").await;
        registry.assign_job("job-1", "u1").await;
        registry.shutdown().await;

        let unit = registry.unit("u1").await.unwrap();
        assert_eq!(unit.status, UnitStatus::Offline);
        assert!(unit.current_job_id.is_none());
        assert!(registry.transition("u1", UnitStatus::Connecting).await.is_err());
        let last = registry.transitions("u1").await.unwrap().pop().unwrap();
        assert_eq!(last.cause, TransitionCause::Shutdown);
    }

    #[tokio::test]
    async fn test_transitions_published() {
        let notifier = BroadcastNotifier::new(16);
        let mut rx = notifier.subscribe();
        let registry = FleetRegistry::new(0.2).with_notifier(Arc::new(notifier));
        registry.register("u1", "Alpha", home()).await.unwrap();
        registry.transition("u1", UnitStatus::Connecting).await.unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, Topic::UnitStatus);
        assert_eq!(msg.payload["unit_id"], "u1");
        assert_eq!(msg.payload["transition"]["to"], "connecting");
    }

    #[derive(Debug, Clone)]
    enum Action {
        Step(UnitStatus),
        Assign,
        Release,
        Fault,
    }

    fn action() -> impl Strategy<Value = Action> {
        use UnitStatus::*;
        prop_oneof![
            prop::sample::select(vec![
                Offline,
                Connecting,
                Idle,
                Armed,
                InFlight,
                MissionActive,
                Returning,
                Landing,
                Error,
            ])
            .prop_map(Action::Step),
            Just(Action::Assign),
            Just(Action::Release),
            Just(Action::Fault),
        ]
    }

    proptest! {
        #[test]
        fn recorded_transitions_are_legal(actions in proptest::collection::vec(action(), 0..48)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let log = rt.block_on(async {
                let registry = FleetRegistry::new(0.2);
                registry.register("u1", "Alpha", home()).await.unwrap();
                for action in actions {
                    match action {
                        Action::Step(to) => {
                            if to == UnitStatus::Idle {
                                let _ = registry.set_connected("u1", true).await;
                            }
                            let _ = registry.transition("u1", to).await;
                        }
                        Action::Assign => { registry.assign_job("job", "u1").await; }
                        Action::Release => { registry.release("job").await; }
                        Action::Fault => { registry.release_faulted("job").await; }
                    }
                }
                registry.transitions("u1").await.unwrap()
            });
            for t in &log {
                prop_assert!(t.is_legal(), "{:?}", t);
            }
            for pair in log.windows(2) {
                prop_assert_eq!(pair[0].to, pair[1].from);
            }
        }
    }
}
