//! A link that does exactly what it is told.
//!
//! Every command answers with a configurable [`Reply`] and mission progress
//! only moves when the caller sets it. Used to drive executor and scheduler
//! paths deterministically, including refusals and link faults.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;

use sky_core::{Position, Task, TelemetrySample, Velocity, epoch_millis};

use crate::error::{LinkError, LinkResult};
use crate::link::{LinkFactory, MissionProgress, SharedLink, TelemetryStream, VehicleLink};

/// A link command that can be scripted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Upload,
    Arm,
    Start,
    Abort,
}

/// How a scripted command answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Accept,
    Refuse,
    Fail(LinkError),
    /// Never answer.
    Hang,
}

#[derive(Debug)]
struct Script {
    connected: bool,
    replies: HashMap<Command, Reply>,
    progress: MissionProgress,
    progress_error: Option<LinkError>,
    sample: TelemetrySample,
    uploaded: Option<Task>,
    calls: Vec<Command>,
}

pub struct ScriptedLink {
    unit_id: String,
    script: Arc<Mutex<Script>>,
    telemetry_interval: Duration,
}

impl ScriptedLink {
    pub fn new(unit_id: &str, home: Position) -> Self {
        Self {
            unit_id: unit_id.to_string(),
            script: Arc::new(Mutex::new(Script {
                connected: false,
                replies: HashMap::new(),
                progress: MissionProgress::default(),
                progress_error: None,
                sample: TelemetrySample {
                    position: home,
                    battery: 1.0,
                    velocity: Velocity::default(),
                    timestamp_ms: 0,
                },
                uploaded: None,
                calls: Vec::new(),
            })),
            telemetry_interval: Duration::from_secs(1),
        }
    }

    pub fn with_telemetry_interval(mut self, interval: Duration) -> Self {
        self.telemetry_interval = interval;
        self
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        lock(&self.script)
    }

    /// Set the answer for every later call of `command`.
    pub fn reply(&self, command: Command, reply: Reply) {
        self.script().replies.insert(command, reply);
    }

    pub fn set_progress(&self, current: usize, total: usize) {
        let mut script = self.script();
        script.progress = MissionProgress { current, total };
        script.progress_error = None;
    }

    /// Report every waypoint of the uploaded task as reached.
    pub fn complete(&self) {
        let mut script = self.script();
        let total = script.progress.total.max(1);
        script.progress = MissionProgress {
            current: total,
            total,
        };
    }

    /// Make progress queries fail with `error`.
    pub fn fail_progress(&self, error: LinkError) {
        self.script().progress_error = Some(error);
    }

    pub fn set_battery(&self, battery: f64) {
        self.script().sample.battery = battery;
    }

    pub fn set_position(&self, position: Position) {
        self.script().sample.position = position;
    }

    /// Drop the link; the telemetry stream ends and commands fail.
    pub fn disconnect(&self) {
        self.script().connected = false;
    }

    pub fn calls(&self) -> Vec<Command> {
        self.script().calls.clone()
    }

    pub fn uploaded_task(&self) -> Option<Task> {
        self.script().uploaded.clone()
    }

    async fn answer(&self, command: Command) -> LinkResult<bool> {
        let reply = {
            let mut script = self.script();
            script.calls.push(command);
            if command != Command::Connect && !script.connected {
                return Err(LinkError::ConnectionLost(self.unit_id.clone()));
            }
            script.replies.get(&command).cloned().unwrap_or(Reply::Accept)
        };
        match reply {
            Reply::Accept => Ok(true),
            Reply::Refuse => Ok(false),
            Reply::Fail(e) => Err(e),
            Reply::Hang => std::future::pending().await,
        }
    }
}

fn lock(script: &Mutex<Script>) -> MutexGuard<'_, Script> {
    script.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl VehicleLink for ScriptedLink {
    async fn connect(&self, _address: &str) -> LinkResult<bool> {
        let accepted = self.answer(Command::Connect).await?;
        if accepted {
            self.script().connected = true;
        }
        Ok(accepted)
    }

    fn is_connected(&self) -> bool {
        self.script().connected
    }

    fn telemetry_stream(&self) -> TelemetryStream {
        let script = self.script.clone();
        let interval = self.telemetry_interval;
        futures_util::stream::unfold(script, move |script| async move {
            tokio::time::sleep(interval).await;
            let sample = {
                let s = lock(&script);
                if !s.connected {
                    return None;
                }
                TelemetrySample {
                    timestamp_ms: epoch_millis(),
                    ..s.sample.clone()
                }
            };
            Some((sample, script))
        })
        .boxed()
    }

    async fn upload_task(&self, task: &Task) -> LinkResult<bool> {
        let accepted = self.answer(Command::Upload).await?;
        if accepted {
            let mut script = self.script();
            script.uploaded = Some(task.clone());
            script.progress = MissionProgress {
                current: 0,
                total: task.waypoints.len(),
            };
        }
        Ok(accepted)
    }

    async fn arm(&self) -> LinkResult<bool> {
        self.answer(Command::Arm).await
    }

    async fn start(&self) -> LinkResult<bool> {
        self.answer(Command::Start).await
    }

    async fn abort(&self) -> LinkResult<bool> {
        self.answer(Command::Abort).await
    }

    async fn mission_progress(&self) -> LinkResult<MissionProgress> {
        let script = self.script();
        if !script.connected {
            return Err(LinkError::ConnectionLost(self.unit_id.clone()));
        }
        match &script.progress_error {
            Some(e) => Err(e.clone()),
            None => Ok(script.progress),
        }
    }
}

/// Hands out [`ScriptedLink`]s and keeps them reachable by unit id.
#[derive(Default)]
pub struct ScriptedLinkFactory {
    links: Mutex<HashMap<String, Arc<ScriptedLink>>>,
}

impl ScriptedLinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The link created for `unit_id`, if any.
    pub fn link(&self, unit_id: &str) -> Option<Arc<ScriptedLink>> {
        self.links
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(unit_id)
            .cloned()
    }
}

impl LinkFactory for ScriptedLinkFactory {
    fn create(&self, unit_id: &str, home: Position) -> SharedLink {
        let link = Arc::new(ScriptedLink::new(unit_id, home));
        self.links
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(unit_id.to_string(), link.clone());
        link
    }
}
