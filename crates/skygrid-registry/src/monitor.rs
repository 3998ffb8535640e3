//! Link monitor: connects units and runs one telemetry task per unit.
//!
//! Each connected unit gets a background task draining its link's
//! telemetry stream into the registry. When the stream ends the link is
//! considered lost and the unit moves to `Error`.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use skygrid_link::SharedLink;

use crate::error::{RegistryError, RegistryResult};
use crate::registry::FleetRegistry;
use crate::status::UnitStatus;

/// Per-unit monitor state.
struct MonitorSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

pub struct LinkMonitor {
    registry: FleetRegistry,
    /// Active monitors: unit_id → slot.
    monitors: Arc<RwLock<HashMap<String, MonitorSlot>>>,
}

impl LinkMonitor {
    pub fn new(registry: FleetRegistry) -> Self {
        Self {
            registry,
            monitors: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Connect a unit over its attached link and start its telemetry
    /// monitor. Returns false if the link did not come up; the unit is
    /// left `Offline` (refused) or `Error` (link fault).
    pub async fn connect(&self, unit_id: &str) -> RegistryResult<bool> {
        let unit = self
            .registry
            .unit(unit_id)
            .await
            .ok_or_else(|| RegistryError::UnknownUnit(unit_id.to_string()))?;
        let Some(link) = self.registry.link(unit_id).await else {
            warn!(%unit_id, "no link attached");
            return Ok(false);
        };
        let Some(address) = unit.link_address else {
            warn!(%unit_id, "no link address, unit has no slot");
            return Ok(false);
        };

        self.registry.transition(unit_id, UnitStatus::Connecting).await?;
        match link.connect(&address).await {
            Ok(true) => {
                self.registry.set_connected(unit_id, true).await?;
                self.registry.transition(unit_id, UnitStatus::Idle).await?;
                self.start_monitor(unit_id, link).await;
                info!(%unit_id, %address, "unit connected");
                Ok(true)
            }
            Ok(false) => {
                warn!(%unit_id, %address, "link refused connection");
                self.registry.transition(unit_id, UnitStatus::Offline).await?;
                Ok(false)
            }
            Err(e) => {
                error!(%unit_id, %address, error = %e, "link connect failed");
                self.registry.transition(unit_id, UnitStatus::Error).await?;
                Ok(false)
            }
        }
    }

    /// Start draining the unit's telemetry stream. Replaces any running
    /// monitor for the unit.
    pub async fn start_monitor(&self, unit_id: &str, link: SharedLink) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let registry = self.registry.clone();
        let id = unit_id.to_string();

        let handle = tokio::spawn(async move {
            run_telemetry_loop(&id, link, registry, shutdown_rx).await;
        });

        let mut monitors = self.monitors.write().await;
        if let Some(old) = monitors.insert(
            unit_id.to_string(),
            MonitorSlot {
                handle,
                shutdown_tx,
            },
        ) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }
        debug!(%unit_id, "telemetry monitor started");
    }

    pub async fn stop_monitor(&self, unit_id: &str) {
        let mut monitors = self.monitors.write().await;
        if let Some(slot) = monitors.remove(unit_id) {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(%unit_id, "telemetry monitor stopped");
        }
    }

    pub async fn stop_all(&self) {
        let mut monitors = self.monitors.write().await;
        for (id, slot) in monitors.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(unit_id = %id, "telemetry monitor stopped");
        }
        info!("all telemetry monitors stopped");
    }

    pub async fn active_monitors(&self) -> Vec<String> {
        self.monitors.read().await.keys().cloned().collect()
    }

    pub async fn is_monitoring(&self, unit_id: &str) -> bool {
        self.monitors.read().await.contains_key(unit_id)
    }
}

async fn run_telemetry_loop(
    unit_id: &str,
    link: SharedLink,
    registry: FleetRegistry,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut stream = link.telemetry_stream();
    debug!(%unit_id, "telemetry loop starting");

    loop {
        tokio::select! {
            next = stream.next() => match next {
                Some(sample) => {
                    if let Err(e) = registry.record_telemetry(unit_id, &sample).await {
                        error!(%unit_id, error = %e, "failed to record telemetry");
                        break;
                    }
                }
                None => {
                    warn!(%unit_id, "telemetry stream ended, link lost");
                    let _ = registry.set_connected(unit_id, false).await;
                    let _ = registry.transition(unit_id, UnitStatus::Error).await;
                    break;
                }
            },
            _ = shutdown.changed() => {
                debug!(%unit_id, "telemetry loop shutting down");
                break;
            }
        }
    }
}
