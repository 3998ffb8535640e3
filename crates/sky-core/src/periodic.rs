//! Periodic loops with cooperative cancellation.
//!
//! Every background activity in SkyGrid (dispatch, telemetry collection,
//! health assessment, fleet aggregation) is a [`spawn_periodic`] loop that
//! observes a [`ShutdownSignal`] at each suspension point. A failed
//! iteration is logged and the loop carries on at the next tick.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

/// Owner side of a shutdown signal.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// A new receiver observing this shutdown.
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Request shutdown. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver side of a shutdown signal. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested or the owner is dropped.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Run `tick` every `period` until `signal` fires.
///
/// The first iteration runs immediately. Missed ticks are delayed rather
/// than bursted, so a slow iteration never causes back-to-back runs.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut signal: ShutdownSignal,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(loop_name = name, period_ms = period.as_millis() as u64, "periodic loop starting");

        loop {
            tokio::select! {
                _ = signal.cancelled() => {
                    debug!(loop_name = name, "periodic loop shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = tick().await {
                        error!(loop_name = name, error = %e, "loop iteration failed");
                    }
                }
            }
        }
    })
}
