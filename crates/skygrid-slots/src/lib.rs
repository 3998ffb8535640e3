//! skygrid-slots — the communication slot pool.
//!
//! Each work unit talks to the orchestrator over one numbered slot (a
//! local UDP port for the vehicle link). The pool hands slots out
//! exclusively, lets operators fence slots off with reservations, and can
//! detect and repair a slot table that has drifted out of agreement with
//! its unit mapping.
//!
//! # Invariants
//!
//! ```text
//! slot.assigned_unit_id == Some(u)  <=>  unit_slots[u] == slot.number
//! slot.free == false                <=>  some unit maps to the slot
//! ```
//!
//! [`ResourcePool::validate`] reports every violation;
//! [`ResourcePool::auto_repair`] rebuilds the table from the unit mapping.

pub mod error;
pub mod pool;

pub use error::{PoolError, PoolResult};
pub use pool::{Inconsistency, PoolStatistics, RepairReport, ResourcePool, ResourceSlot, SlotProbe, link_address};
