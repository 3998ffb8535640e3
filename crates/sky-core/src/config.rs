//! skygrid.toml configuration parser.
//!
//! Every section is optional; a missing key takes the default shown in
//! [`SkyConfig::default`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::geo::Position;
use crate::task::TaskParams;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SkyConfig {
    pub slots: SlotsConfig,
    pub fleet: FleetConfig,
    pub scheduler: SchedulerConfig,
    pub mission: MissionConfig,
    pub telemetry: TelemetryConfig,
    pub link: LinkConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotsConfig {
    /// First slot number in the pool.
    pub base: u16,
    /// Number of sequential slots to try.
    pub count: u16,
    /// Skip slots whose UDP port cannot be bound locally.
    pub probe: bool,
}

impl Default for SlotsConfig {
    fn default() -> Self {
        Self {
            base: 14540,
            count: 4,
            probe: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub home_lat: f64,
    pub home_lon: f64,
    pub home_alt: f64,
    /// Battery fraction a unit needs to accept a job.
    pub min_dispatch_battery: f64,
    /// Pause between reads of a unit's telemetry stream.
    pub telemetry_interval_ms: u64,
    pub units: Vec<UnitConfig>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            home_lat: 37.7749,
            home_lon: -122.4194,
            home_alt: 10.0,
            min_dispatch_battery: 0.2,
            telemetry_interval_ms: 1000,
            units: Vec::new(),
        }
    }
}

/// One work unit in the fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitConfig {
    pub id: String,
    pub name: Option<String>,
    #[serde(default)]
    pub lat_offset: f64,
    #[serde(default)]
    pub lon_offset: f64,
}

impl FleetConfig {
    /// Configured units, or the four-unit default fleet when none are listed.
    pub fn resolved_units(&self) -> Vec<UnitConfig> {
        if !self.units.is_empty() {
            return self.units.clone();
        }
        [
            ("Alpha", 0.0, 0.0),
            ("Bravo", 0.001, 0.001),
            ("Charlie", -0.001, 0.001),
            ("Delta", 0.001, -0.001),
        ]
        .iter()
        .enumerate()
        .map(|(i, (name, lat_offset, lon_offset))| UnitConfig {
            id: format!("unit-{}", i + 1),
            name: Some(name.to_string()),
            lat_offset: *lat_offset,
            lon_offset: *lon_offset,
        })
        .collect()
    }

    /// Home position of a unit.
    pub fn home_for(&self, unit: &UnitConfig) -> Position {
        Position::new(
            self.home_lat + unit.lat_offset,
            self.home_lon + unit.lon_offset,
            self.home_alt,
        )
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_millis(self.telemetry_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub interval_ms: u64,
    /// Failed dispatch attempts before a job is marked failed.
    pub max_retries: u32,
    /// Jobs dispatched per cycle.
    pub jobs_per_cycle: usize,
    /// Battery fraction a delivery is expected to use per kilometre.
    pub battery_per_km: f64,
    /// Age after which an unfinished job is reported overdue.
    pub overdue_after_secs: u64,
    pub overdue_scan_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5000,
            max_retries: 3,
            jobs_per_cycle: 1,
            battery_per_km: 0.02,
            overdue_after_secs: 3600,
            overdue_scan_interval_ms: 60_000,
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn overdue_scan_interval(&self) -> Duration {
        Duration::from_millis(self.overdue_scan_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MissionConfig {
    pub cruise_speed: f64,
    pub cruise_altitude: f64,
    pub takeoff_altitude: f64,
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Hold in `Returning` before the unit is released.
    pub settle_delay_ms: u64,
}

impl Default for MissionConfig {
    fn default() -> Self {
        Self {
            cruise_speed: 5.0,
            cruise_altitude: 20.0,
            takeoff_altitude: 20.0,
            timeout_secs: 30 * 60,
            poll_interval_ms: 1000,
            settle_delay_ms: 5000,
        }
    }
}

impl MissionConfig {
    pub fn task_params(&self) -> TaskParams {
        TaskParams {
            cruise_speed: self.cruise_speed,
            cruise_altitude: self.cruise_altitude,
            takeoff_altitude: self.takeoff_altitude,
            timeout_secs: self.timeout_secs,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub collect_interval_ms: u64,
    pub health_interval_ms: u64,
    pub fleet_interval_ms: u64,
    /// Samples retained per unit.
    pub history_len: usize,
    /// Age after which a unit's telemetry counts as stale.
    pub stale_after_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            collect_interval_ms: 1000,
            health_interval_ms: 5000,
            fleet_interval_ms: 2000,
            history_len: 100,
            stale_after_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Link implementation; only "simulated" ships with SkyGrid.
    pub kind: String,
    /// Simulated-time multiplier.
    pub time_scale: f64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            kind: "simulated".to_string(),
            time_scale: 1.0,
        }
    }
}

impl SkyConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SkyConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// A config listing the default fleet explicitly, for `skyd scaffold`.
    pub fn scaffold() -> Self {
        let mut config = SkyConfig::default();
        config.fleet.units = config.fleet.resolved_units();
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty() {
        let config: SkyConfig = toml::from_str("").unwrap();
        assert_eq!(config, SkyConfig::default());
        assert_eq!(config.slots.base, 14540);
        assert_eq!(config.mission.timeout_secs, 1800);
    }

    #[test]
    fn test_parse_partial() {
        let toml_str = r#"
[slots]
base = 15000
count = 8

[scheduler]
jobs_per_cycle = 2

[[fleet.units]]
id = "hawk"
lat_offset = 0.01
"#;
        let config: SkyConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.slots.base, 15000);
        assert_eq!(config.slots.count, 8);
        assert!(config.slots.probe);
        assert_eq!(config.scheduler.jobs_per_cycle, 2);
        assert_eq!(config.scheduler.max_retries, 3);
        let units = config.fleet.resolved_units();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].id, "hawk");
        assert_eq!(units[0].lon_offset, 0.0);
    }

    #[test]
    fn test_default_fleet() {
        let units = FleetConfig::default().resolved_units();
        assert_eq!(units.len(), 4);
        assert_eq!(units[1].name.as_deref(), Some("Bravo"));
        let home = FleetConfig::default().home_for(&units[1]);
        assert!((home.lat - 37.7759).abs() < 1e-9);
    }

    #[test]
    fn test_scaffold_round_trips() {
        let config = SkyConfig::scaffold();
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("Charlie"));
        let parsed: SkyConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skygrid.toml");
        std::fs::write(&path, "[mission]\ncruise_speed = 8.0\n").unwrap();
        let config = SkyConfig::from_file(&path).unwrap();
        assert_eq!(config.mission.task_params().cruise_speed, 8.0);
    }
}
