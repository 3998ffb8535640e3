//! skygrid-state — the job store for SkyGrid.
//!
//! Backed by [redb](https://docs.rs/redb), holds every delivery job and its
//! status history timestamps. The orchestrator core treats this store as
//! the system of record for jobs: it reads pending work from it and writes
//! status transitions back, but never caches jobs beyond a single cycle.
//!
//! # Architecture
//!
//! Jobs are JSON-serialized into redb's `&[u8]` value column, keyed by a
//! zero-padded sequential id (`job-000001`) so key order is creation order.
//! The sequence counter lives in the `meta` table and survives reopen.
//!
//! The `JobStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::JobStore;
pub use types::*;
