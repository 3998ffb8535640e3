//! redb table definitions for the SkyGrid job store.

use redb::TableDefinition;

/// Jobs keyed by `job-{seq:06}`.
pub const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");

/// Store bookkeeping (sequence counters).
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Key in [`META`] holding the last issued job sequence number.
pub const JOB_SEQ_KEY: &str = "job_seq";
