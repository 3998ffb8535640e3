//! Work unit status and the legal transition graph.
//!
//! ```text
//!   Offline → Connecting → Idle ⇄ Armed → InFlight → MissionActive
//!                 │          ▲                              │
//!                 ▼          └── Landing ◀── Returning ◀────┘
//!              Offline
//!
//!   any state except Offline → Error → Connecting
//! ```
//!
//! Two forced moves sit outside the graph: releasing a unit sends it to
//! `Idle` from wherever it is, and shutdown sends it to `Offline`. Both are
//! recorded with their cause so the history stays auditable.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Offline,
    Connecting,
    Idle,
    Armed,
    InFlight,
    MissionActive,
    Returning,
    Landing,
    Error,
}

impl UnitStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UnitStatus::Offline => "offline",
            UnitStatus::Connecting => "connecting",
            UnitStatus::Idle => "idle",
            UnitStatus::Armed => "armed",
            UnitStatus::InFlight => "in_flight",
            UnitStatus::MissionActive => "mission_active",
            UnitStatus::Returning => "returning",
            UnitStatus::Landing => "landing",
            UnitStatus::Error => "error",
        }
    }

    /// Adjacent forward edges plus the universal move into `Error`.
    pub fn can_transition_to(self, next: UnitStatus) -> bool {
        use UnitStatus::*;
        if next == Error {
            return self != Offline;
        }
        matches!(
            (self, next),
            (Offline, Connecting)
                | (Connecting, Idle)
                | (Connecting, Offline)
                | (Idle, Armed)
                | (Armed, Idle)
                | (Armed, InFlight)
                | (InFlight, MissionActive)
                | (MissionActive, Returning)
                | (Returning, Landing)
                | (Landing, Idle)
                | (Error, Connecting)
        )
    }

    /// Holding or working a job.
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            UnitStatus::Armed
                | UnitStatus::InFlight
                | UnitStatus::MissionActive
                | UnitStatus::Returning
                | UnitStatus::Landing
        )
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a status changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionCause {
    /// A move along the graph.
    Step,
    /// The unit's job ended and the unit was handed back.
    Release,
    /// Process shutdown.
    Shutdown,
}

/// One recorded status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitTransition {
    pub from: UnitStatus,
    pub to: UnitStatus,
    pub cause: TransitionCause,
    pub at_ms: u64,
}

impl UnitTransition {
    /// Whether this change is allowed for its cause.
    pub fn is_legal(&self) -> bool {
        match self.cause {
            TransitionCause::Step => self.from.can_transition_to(self.to),
            TransitionCause::Release => {
                self.to == UnitStatus::Idle || self.to == UnitStatus::Error
            }
            TransitionCause::Shutdown => self.to == UnitStatus::Offline,
        }
    }
}
