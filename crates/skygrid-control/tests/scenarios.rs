//! End-to-end fleet scenarios with scripted vehicle links and paused time.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use sky_core::config::UnitConfig;
use sky_core::{Coordinates, Notification, SkyConfig, TaskStatus, Topic, epoch_secs};
use skygrid_control::Orchestrator;
use skygrid_link::{Command, ScriptedLinkFactory};
use skygrid_registry::UnitStatus;
use skygrid_state::{JobStatus, JobStore, NewJob, Priority};
use skygrid_telemetry::FleetStatus;

fn config(units: usize) -> SkyConfig {
    let mut config = SkyConfig::default();
    config.slots.base = 100;
    config.slots.count = 4;
    config.slots.probe = false;
    config.scheduler.interval_ms = 1000;
    config.mission.poll_interval_ms = 1000;
    config.mission.settle_delay_ms = 2000;
    config.fleet.units = (1..=units)
        .map(|i| UnitConfig {
            id: format!("unit-{i}"),
            name: None,
            lat_offset: 0.0,
            lon_offset: 0.0,
        })
        .collect();
    config
}

fn fleet(units: usize) -> (Orchestrator, Arc<ScriptedLinkFactory>) {
    let links = Arc::new(ScriptedLinkFactory::new());
    let orch = Orchestrator::new(
        config(units),
        JobStore::open_in_memory().unwrap(),
        links.clone(),
    );
    (orch, links)
}

fn submit(orch: &Orchestrator) -> String {
    orch.submit_job(
        Coordinates::new(37.7749, -122.4194),
        Coordinates::new(37.7849, -122.4094),
        Priority::Medium,
    )
    .unwrap()
}

async fn settle(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// Statuses carried on `topic` for `job_id`, consecutive repeats removed.
fn statuses(rx: &mut broadcast::Receiver<Notification>, topic: Topic, job_id: &str) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        if msg.topic != topic || msg.payload["job_id"] != job_id {
            continue;
        }
        let status = msg.payload["status"].as_str().unwrap_or_default().to_string();
        if seen.last() != Some(&status) {
            seen.push(status);
        }
    }
    seen
}

#[tokio::test(start_paused = true)]
async fn slots_are_sequential_from_base_and_exhaust() {
    let (orch, _links) = fleet(5);
    orch.start().await.unwrap();

    let numbers: Vec<u16> = orch.slot_status().await.iter().map(|s| s.number).collect();
    assert_eq!(numbers, vec![100, 101, 102, 103]);
    assert!(orch.slot_status().await.iter().all(|s| !s.free));

    let fifth = orch.registry().unit("unit-5").await.unwrap();
    assert_eq!(fifth.slot, None);
    assert_eq!(fifth.status, UnitStatus::Offline);
    assert_eq!(
        orch.registry().unit("unit-2").await.unwrap().link_address.as_deref(),
        Some("udp://:101")
    );
    orch.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn job_waits_pending_until_a_unit_is_available() {
    let (orch, links) = fleet(1);
    orch.start().await.unwrap();
    let link = links.link("unit-1").unwrap();

    link.set_battery(0.1);
    settle(1500).await;
    let job_id = submit(&orch);

    settle(5000).await;
    assert_eq!(orch.job(&job_id).unwrap().status, JobStatus::Pending);
    assert!(orch.dispatch_stats().await.idle_cycles >= 5);

    link.set_battery(0.9);
    settle(2500).await;
    let job = orch.job(&job_id).unwrap();
    assert_ne!(job.status, JobStatus::Pending);
    assert!(job.scheduled_at.is_some());
    assert_eq!(job.unit_id.as_deref(), Some("unit-1"));
    orch.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn full_success_path() {
    let (orch, links) = fleet(1);
    let mut rx = orch.subscribe();
    let job_id = submit(&orch);
    orch.start().await.unwrap();
    settle(100).await;

    assert_eq!(
        orch.executor().task(&job_id).await.unwrap().status,
        TaskStatus::Executing
    );
    assert_eq!(orch.job(&job_id).unwrap().status, JobStatus::InFlight);

    let link = links.link("unit-1").unwrap();
    link.complete();
    settle(1100).await;

    assert_eq!(orch.job(&job_id).unwrap().status, JobStatus::Completed);
    assert_eq!(
        orch.registry().unit("unit-1").await.unwrap().status,
        UnitStatus::Returning
    );

    settle(2500).await;
    let unit = orch.registry().unit("unit-1").await.unwrap();
    assert_eq!(unit.status, UnitStatus::Idle);
    assert_eq!(unit.current_job_id, None);

    let path: Vec<UnitStatus> = orch
        .registry()
        .transitions("unit-1")
        .await
        .unwrap()
        .iter()
        .map(|t| t.to)
        .collect();
    assert_eq!(
        path,
        vec![
            UnitStatus::Connecting,
            UnitStatus::Idle,
            UnitStatus::Armed,
            UnitStatus::InFlight,
            UnitStatus::MissionActive,
            UnitStatus::Returning,
            UnitStatus::Idle,
        ]
    );

    let job = orch.job(&job_id).unwrap();
    assert!(job.scheduled_at.is_some());
    assert!(job.started_at.is_some());
    assert!(job.completed_at.is_some());

    let calls = link.calls();
    for command in [Command::Upload, Command::Arm, Command::Start] {
        assert!(calls.contains(&command));
    }

    let tasks = statuses(&mut rx, Topic::TaskStatus, &job_id);
    assert_eq!(tasks, vec!["created", "uploaded", "executing", "completed"]);
    orch.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn abort_while_executing_releases_unit() {
    let (orch, links) = fleet(1);
    let job_id = submit(&orch);
    orch.start().await.unwrap();
    settle(1500).await;

    assert!(orch.abort(&job_id).await);

    let task = orch.executor().task(&job_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Aborted);
    let job = orch.job(&job_id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.failure_reason.unwrap().contains("abort"));

    let unit = orch.registry().unit("unit-1").await.unwrap();
    assert_eq!(unit.status, UnitStatus::Idle);
    assert_eq!(unit.current_job_id, None);
    assert!(links.link("unit-1").unwrap().calls().contains(&Command::Abort));

    assert!(!orch.abort(&job_id).await);
    orch.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn critical_battery_and_lost_link_is_unhealthy() {
    let (orch, links) = fleet(1);
    orch.start().await.unwrap();
    let link = links.link("unit-1").unwrap();

    link.set_battery(0.08);
    settle(1500).await;
    link.disconnect();
    settle(4000).await;

    let unit = orch.registry().unit("unit-1").await.unwrap();
    assert!(!unit.connected);
    assert_eq!(unit.battery, 0.08);

    orch.telemetry().assess_once().await;
    let health = orch.unit_detail("unit-1").await.unwrap().health.unwrap();
    assert!(!health.healthy);
    assert!(health.errors.iter().any(|e| e.contains("critical battery")));
    assert!(health.errors.iter().any(|e| e.contains("not connected")));

    let stats = orch.fleet_statistics().await;
    assert_eq!(stats.with_errors, 1);
    orch.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn active_missions_label_wins_over_connectivity() {
    let (orch, links) = fleet(4);
    orch.start().await.unwrap();
    links.link("unit-3").unwrap().disconnect();
    links.link("unit-4").unwrap().disconnect();
    settle(1500).await;

    let job_id = submit(&orch);
    settle(1500).await;
    assert_eq!(
        orch.executor().active_jobs().await.get(&job_id).map(String::as_str),
        Some("unit-1")
    );

    let snapshot = orch.telemetry().aggregate_once().await;
    assert_eq!(snapshot.total_units, 4);
    assert_eq!(snapshot.connected_units, 2);
    assert_eq!(snapshot.executing_tasks, 1);
    assert_eq!(snapshot.fleet_status, FleetStatus::ActiveMissions);
    orch.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_fails_running_jobs_and_frees_slots() {
    let (orch, _links) = fleet(2);
    let job_id = submit(&orch);
    orch.start().await.unwrap();
    settle(1500).await;
    assert_eq!(orch.job(&job_id).unwrap().status, JobStatus::InFlight);

    orch.shutdown().await;

    let job = orch.job(&job_id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.failure_reason.unwrap().contains("shutdown"));
    assert!(
        orch.units()
            .await
            .iter()
            .all(|u| u.status == UnitStatus::Offline && !u.connected)
    );
    assert_eq!(orch.slot_statistics().await.allocated, 0);
    assert!(orch.telemetry().running().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn telemetry_export_after_collection() {
    let (orch, _links) = fleet(2);
    orch.start().await.unwrap();
    settle(3500).await;

    let one: serde_json::Value =
        serde_json::from_str(&orch.export_telemetry(Some("unit-1")).await.unwrap()).unwrap();
    assert!(one.as_array().unwrap().len() >= 2);

    let all: serde_json::Value =
        serde_json::from_str(&orch.export_telemetry(None).await.unwrap()).unwrap();
    assert!(all.get("unit-2").is_some());

    assert!(orch.export_telemetry(Some("unit-9")).await.is_err());
    orch.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stale_job_raises_overdue_alert_on_start() {
    let (orch, _links) = fleet(1);
    let mut rx = orch.subscribe();
    let stale = orch
        .store()
        .create(
            NewJob::new(
                Coordinates::new(37.7749, -122.4194),
                Coordinates::new(37.7849, -122.4094),
                Priority::Low,
            )
            .at(epoch_secs() - 7200),
        )
        .unwrap();
    let fresh = submit(&orch);
    orch.start().await.unwrap();
    settle(100).await;

    let mut alerts = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        if msg.topic == Topic::Alert {
            alerts.push(msg.payload);
        }
    }
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0]["overdue_count"], 1);
    assert_eq!(alerts[0]["job_ids"][0], stale.as_str());
    assert_ne!(alerts[0]["job_ids"][0], fresh.as_str());
    orch.shutdown().await;
}
