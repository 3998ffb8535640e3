//! Slot pool: allocation, reservation, validation, and repair.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{PoolError, PoolResult};

/// Decides whether a slot number is usable (not occupied externally).
pub type SlotProbe = Box<dyn Fn(u16) -> bool + Send + Sync>;

/// A numbered communication slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSlot {
    pub number: u16,
    pub free: bool,
    pub assigned_unit_id: Option<String>,
    /// Blocks allocation without assigning the slot to anyone.
    pub reserved: bool,
}

impl ResourceSlot {
    fn new(number: u16) -> Self {
        Self {
            number,
            free: true,
            assigned_unit_id: None,
            reserved: false,
        }
    }

    fn allocatable(&self) -> bool {
        self.free && !self.reserved
    }
}

/// A detected disagreement between the slot table and the unit mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Inconsistency {
    /// Two units map to the same slot.
    SharedSlot { slot: u16, first: String, second: String },
    /// A unit maps to a slot that is still marked free.
    MappedSlotFree { slot: u16, unit_id: String },
    /// A slot is in use but no unit maps to it.
    OrphanedSlot { slot: u16 },
}

impl fmt::Display for Inconsistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inconsistency::SharedSlot { slot, first, second } => {
                write!(f, "slot {slot} is assigned to multiple units: {first} and {second}")
            }
            Inconsistency::MappedSlotFree { slot, unit_id } => {
                write!(f, "slot {slot} assigned to unit {unit_id} is marked free")
            }
            Inconsistency::OrphanedSlot { slot } => {
                write!(f, "slot {slot} is in use but not assigned to any unit")
            }
        }
    }
}

/// Pool-wide counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStatistics {
    pub total: usize,
    pub available: usize,
    pub allocated: usize,
    pub reserved: usize,
    pub utilization_pct: f64,
}

/// Outcome of [`ResourcePool::auto_repair`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairReport {
    /// Problems found before repair.
    pub issues: Vec<Inconsistency>,
    /// New slot for every unit that regained one.
    pub reassigned: BTreeMap<String, u16>,
    /// Units left without a slot.
    pub unplaced: Vec<String>,
}

impl RepairReport {
    pub fn repaired(&self) -> bool {
        !self.issues.is_empty()
    }
}

/// The set of communication slots and which unit holds each.
pub struct ResourcePool {
    slots: BTreeMap<u16, ResourceSlot>,
    /// unit_id → slot number.
    unit_slots: BTreeMap<String, u16>,
    probe: SlotProbe,
}

impl ResourcePool {
    /// An empty pool that probes slots by binding a local UDP port.
    pub fn new() -> Self {
        Self::with_probe(Box::new(udp_probe))
    }

    /// An empty pool with a custom availability probe.
    pub fn with_probe(probe: SlotProbe) -> Self {
        Self {
            slots: BTreeMap::new(),
            unit_slots: BTreeMap::new(),
            probe,
        }
    }

    /// Add `count` sequential slots starting at `base`, skipping any the
    /// probe rejects. Returns how many slots were added.
    pub fn initialize(&mut self, base: u16, count: u16) -> usize {
        info!(base, count, "initializing slot pool");
        let mut added = 0;
        for offset in 0..count {
            let Some(number) = base.checked_add(offset) else {
                warn!(base, offset, "slot number overflow, stopping");
                break;
            };
            if self.slots.contains_key(&number) {
                continue;
            }
            if (self.probe)(number) {
                self.slots.insert(number, ResourceSlot::new(number));
                added += 1;
                debug!(slot = number, "slot added to pool");
            } else {
                warn!(slot = number, "slot occupied externally, skipping");
            }
        }
        info!(slots = added, "slot pool initialized");
        added
    }

    /// Give `unit_id` a slot. Idempotent: a unit that already holds a slot
    /// gets the same one back. Otherwise the lowest free, unreserved slot.
    pub fn allocate(&mut self, unit_id: &str) -> PoolResult<u16> {
        if let Some(&number) = self.unit_slots.get(unit_id) {
            debug!(%unit_id, slot = number, "unit already holds a slot");
            return Ok(number);
        }

        let Some(slot) = self.slots.values_mut().find(|s| s.allocatable()) else {
            error!(%unit_id, "no free slots");
            return Err(PoolError::ResourceExhausted(unit_id.to_string()));
        };
        slot.free = false;
        slot.assigned_unit_id = Some(unit_id.to_string());
        let number = slot.number;
        self.unit_slots.insert(unit_id.to_string(), number);

        info!(%unit_id, slot = number, "slot allocated");
        Ok(number)
    }

    /// Allocate for several units in order; each gets its own result.
    pub fn allocate_many(&mut self, unit_ids: &[&str]) -> Vec<(String, PoolResult<u16>)> {
        unit_ids
            .iter()
            .map(|id| (id.to_string(), self.allocate(id)))
            .collect()
    }

    /// Free the slot held by `unit_id`. False if the unit held none.
    pub fn release(&mut self, unit_id: &str) -> bool {
        let Some(number) = self.unit_slots.remove(unit_id) else {
            warn!(%unit_id, "unit holds no slot");
            return false;
        };
        if let Some(slot) = self.slots.get_mut(&number) {
            slot.free = true;
            slot.assigned_unit_id = None;
        }
        info!(%unit_id, slot = number, "slot released");
        true
    }

    /// Block a slot from future allocation.
    pub fn reserve(&mut self, number: u16) -> PoolResult<()> {
        let slot = self
            .slots
            .get_mut(&number)
            .ok_or(PoolError::UnknownSlot(number))?;
        slot.reserved = true;
        info!(slot = number, "slot reserved");
        Ok(())
    }

    /// Lift a reservation. Returns false if the slot was not reserved.
    pub fn unreserve(&mut self, number: u16) -> PoolResult<bool> {
        let slot = self
            .slots
            .get_mut(&number)
            .ok_or(PoolError::UnknownSlot(number))?;
        if !slot.reserved {
            warn!(slot = number, "slot was not reserved");
            return Ok(false);
        }
        slot.reserved = false;
        info!(slot = number, "slot unreserved");
        Ok(true)
    }

    pub fn slot_for(&self, unit_id: &str) -> Option<u16> {
        self.unit_slots.get(unit_id).copied()
    }

    /// Slots that `allocate` could hand out right now, ascending.
    pub fn available_slots(&self) -> Vec<u16> {
        self.slots
            .values()
            .filter(|s| s.allocatable())
            .map(|s| s.number)
            .collect()
    }

    /// unit_id → slot for every allocated unit.
    pub fn allocations(&self) -> BTreeMap<String, u16> {
        self.unit_slots.clone()
    }

    /// Per-slot view, ascending by number.
    pub fn status(&self) -> Vec<ResourceSlot> {
        self.slots.values().cloned().collect()
    }

    pub fn statistics(&self) -> PoolStatistics {
        let total = self.slots.len();
        let allocated = self.unit_slots.len();
        PoolStatistics {
            total,
            available: self.available_slots().len(),
            allocated,
            reserved: self.slots.values().filter(|s| s.reserved).count(),
            utilization_pct: if total > 0 {
                allocated as f64 / total as f64 * 100.0
            } else {
                0.0
            },
        }
    }

    /// The first run of `count` consecutive allocatable slot numbers.
    pub fn consecutive_run(&self, count: usize) -> Option<Vec<u16>> {
        if count == 0 {
            return Some(Vec::new());
        }
        let available = self.available_slots();
        available
            .windows(count)
            .find(|w| (w[count - 1] - w[0]) as usize == count - 1)
            .map(|w| w.to_vec())
    }

    /// Report every disagreement between slots and the unit mapping.
    /// Nothing is fixed here.
    pub fn validate(&self) -> Vec<Inconsistency> {
        let mut issues = Vec::new();

        let mut holders: BTreeMap<u16, &str> = BTreeMap::new();
        for (unit_id, &number) in &self.unit_slots {
            if let Some(first) = holders.get(&number) {
                issues.push(Inconsistency::SharedSlot {
                    slot: number,
                    first: first.to_string(),
                    second: unit_id.clone(),
                });
            } else {
                holders.insert(number, unit_id);
            }
        }

        for (unit_id, &number) in &self.unit_slots {
            if self.slots.get(&number).is_some_and(|s| s.free) {
                issues.push(Inconsistency::MappedSlotFree {
                    slot: number,
                    unit_id: unit_id.clone(),
                });
            }
        }

        for slot in self.slots.values().filter(|s| !s.free) {
            let mapped = slot
                .assigned_unit_id
                .as_ref()
                .and_then(|u| self.unit_slots.get(u))
                .is_some_and(|&n| n == slot.number);
            if !mapped {
                issues.push(Inconsistency::OrphanedSlot { slot: slot.number });
            }
        }

        issues
    }

    /// Rebuild the slot table from the unit mapping when [`validate`]
    /// finds problems. Every slot is freed (reservations kept) and each
    /// previously mapped unit is re-allocated in unit-id order, so units
    /// may end up on different slots than before.
    ///
    /// [`validate`]: ResourcePool::validate
    pub fn auto_repair(&mut self) -> RepairReport {
        let issues = self.validate();
        if issues.is_empty() {
            info!("no slot assignment issues found");
            return RepairReport::default();
        }
        warn!(issues = issues.len(), "slot assignment issues found, repairing");
        for issue in &issues {
            warn!(%issue, "slot inconsistency");
        }

        for slot in self.slots.values_mut() {
            slot.free = true;
            slot.assigned_unit_id = None;
        }
        let units: Vec<String> = std::mem::take(&mut self.unit_slots).into_keys().collect();

        let mut report = RepairReport {
            issues,
            ..RepairReport::default()
        };
        for unit_id in units {
            match self.allocate(&unit_id) {
                Ok(number) => {
                    info!(%unit_id, slot = number, "slot reallocated");
                    report.reassigned.insert(unit_id, number);
                }
                Err(e) => {
                    error!(%unit_id, error = %e, "failed to reallocate slot");
                    report.unplaced.push(unit_id);
                }
            }
        }
        report
    }
}

impl Default for ResourcePool {
    fn default() -> Self {
        Self::new()
    }
}

/// Link address for a slot.
pub fn link_address(number: u16) -> String {
    format!("udp://:{number}")
}

/// A slot is usable if its UDP port can be bound on localhost.
fn udp_probe(number: u16) -> bool {
    std::net::UdpSocket::bind(("127.0.0.1", number)).is_ok()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn open_pool(base: u16, count: u16) -> ResourcePool {
        let mut pool = ResourcePool::with_probe(Box::new(|_| true));
        pool.initialize(base, count);
        pool
    }

    #[test]
    fn initialize_creates_sequential_slots() {
        let pool = open_pool(100, 4);
        let numbers: Vec<u16> = pool.status().iter().map(|s| s.number).collect();
        assert_eq!(numbers, vec![100, 101, 102, 103]);
    }

    #[test]
    fn initialize_skips_occupied_slots() {
        let mut pool = ResourcePool::with_probe(Box::new(|n| n != 101));
        assert_eq!(pool.initialize(100, 4), 3);
        assert_eq!(pool.available_slots(), vec![100, 102, 103]);
    }

    #[test]
    fn fifth_allocation_is_exhausted() {
        let mut pool = open_pool(100, 4);
        for (i, unit) in ["a", "b", "c", "d"].iter().enumerate() {
            assert_eq!(pool.allocate(unit), Ok(100 + i as u16));
        }
        assert_eq!(
            pool.allocate("e"),
            Err(PoolError::ResourceExhausted("e".to_string()))
        );
    }

    #[test]
    fn allocate_is_idempotent() {
        let mut pool = open_pool(100, 4);
        let first = pool.allocate("a").unwrap();
        assert_eq!(pool.allocate("a").unwrap(), first);
        assert_eq!(pool.statistics().allocated, 1);
    }

    #[test]
    fn release_frees_slot_for_reuse() {
        let mut pool = open_pool(100, 2);
        pool.allocate("a").unwrap();
        pool.allocate("b").unwrap();
        assert!(pool.release("a"));
        assert!(!pool.release("a"));
        assert_eq!(pool.allocate("c"), Ok(100));
    }

    #[test]
    fn reserved_slots_are_skipped() {
        let mut pool = open_pool(100, 3);
        pool.reserve(100).unwrap();
        assert_eq!(pool.allocate("a"), Ok(101));
        assert_eq!(pool.unreserve(100), Ok(true));
        assert_eq!(pool.unreserve(100), Ok(false));
        assert_eq!(pool.allocate("b"), Ok(100));
    }

    #[test]
    fn reserve_unknown_slot_fails() {
        let mut pool = open_pool(100, 2);
        assert_eq!(pool.reserve(999), Err(PoolError::UnknownSlot(999)));
        assert_eq!(pool.unreserve(999), Err(PoolError::UnknownSlot(999)));
    }

    #[test]
    fn statistics_counts() {
        let mut pool = open_pool(100, 4);
        pool.allocate("a").unwrap();
        pool.reserve(103).unwrap();
        let stats = pool.statistics();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.reserved, 1);
        assert_eq!(stats.available, 2);
        assert_eq!(stats.utilization_pct, 25.0);
    }

    #[test]
    fn consecutive_run_skips_gaps() {
        let mut pool = open_pool(100, 6);
        pool.allocate("a").unwrap(); // 100
        pool.reserve(102).unwrap();
        assert_eq!(pool.consecutive_run(3), Some(vec![103, 104, 105]));
        assert_eq!(pool.consecutive_run(4), None);
    }

    #[test]
    fn allocate_many_reports_each() {
        let mut pool = open_pool(100, 1);
        let results = pool.allocate_many(&["a", "b"]);
        assert_eq!(results[0], ("a".to_string(), Ok(100)));
        assert!(results[1].1.is_err());
    }

    #[test]
    fn validate_clean_pool() {
        let mut pool = open_pool(100, 4);
        pool.allocate("a").unwrap();
        assert!(pool.validate().is_empty());
    }

    #[test]
    fn validate_detects_each_fault() {
        let mut pool = open_pool(100, 4);
        pool.allocate("a").unwrap(); // 100
        pool.allocate("b").unwrap(); // 101

        // b also claims 100.
        pool.unit_slots.insert("b".to_string(), 100);
        // 102 mapped to c but left free.
        pool.unit_slots.insert("c".to_string(), 102);
        // 103 in use with nobody mapped.
        pool.slots.get_mut(&103).unwrap().free = false;

        let issues = pool.validate();
        assert!(issues.contains(&Inconsistency::SharedSlot {
            slot: 100,
            first: "a".to_string(),
            second: "b".to_string(),
        }));
        assert!(issues.contains(&Inconsistency::MappedSlotFree {
            slot: 102,
            unit_id: "c".to_string(),
        }));
        assert!(issues.contains(&Inconsistency::OrphanedSlot { slot: 103 }));
        // 101 still says it belongs to b, but b now maps to 100.
        assert!(issues.contains(&Inconsistency::OrphanedSlot { slot: 101 }));
    }

    #[test]
    fn auto_repair_reallocates_in_unit_order() {
        let mut pool = open_pool(100, 4);
        pool.allocate("zulu").unwrap(); // 100
        pool.allocate("alpha").unwrap(); // 101
        pool.reserve(102).unwrap();
        pool.slots.get_mut(&103).unwrap().free = false;

        let report = pool.auto_repair();
        assert!(report.repaired());
        assert_eq!(report.reassigned.get("alpha"), Some(&100));
        assert_eq!(report.reassigned.get("zulu"), Some(&101));
        assert!(report.unplaced.is_empty());
        assert!(pool.validate().is_empty());
        // Reservation survives repair.
        assert!(pool.status()[2].reserved);
    }

    #[test]
    fn auto_repair_reports_unplaced_units() {
        let mut pool = open_pool(100, 1);
        pool.allocate("a").unwrap();
        pool.unit_slots.insert("b".to_string(), 100);

        let report = pool.auto_repair();
        assert_eq!(report.reassigned.get("a"), Some(&100));
        assert_eq!(report.unplaced, vec!["b".to_string()]);
        assert_eq!(pool.slot_for("b"), None);
    }

    #[test]
    fn auto_repair_noop_when_consistent() {
        let mut pool = open_pool(100, 2);
        pool.allocate("a").unwrap();
        let report = pool.auto_repair();
        assert!(!report.repaired());
        assert_eq!(pool.slot_for("a"), Some(100));
    }

    #[test]
    fn link_address_format() {
        assert_eq!(link_address(14540), "udp://:14540");
    }

    #[derive(Debug, Clone)]
    enum Op {
        Allocate(u8),
        Release(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..8).prop_map(Op::Allocate),
            (0u8..8).prop_map(Op::Release),
        ]
    }

    proptest! {
        #[test]
        fn no_slot_held_twice(ops in proptest::collection::vec(op(), 0..64)) {
            let mut pool = open_pool(100, 4);
            for op in ops {
                match op {
                    Op::Allocate(u) => { let _ = pool.allocate(&format!("u{u}")); }
                    Op::Release(u) => { pool.release(&format!("u{u}")); }
                }
                let allocations = pool.allocations();
                let mut numbers: Vec<u16> = allocations.values().copied().collect();
                let before = numbers.len();
                numbers.sort_unstable();
                numbers.dedup();
                prop_assert_eq!(numbers.len(), before);
                prop_assert!(pool.validate().is_empty());
            }
        }

        #[test]
        fn allocate_twice_same_slot(u in 0u8..8) {
            let mut pool = open_pool(100, 8);
            let id = format!("u{u}");
            let first = pool.allocate(&id).unwrap();
            prop_assert_eq!(pool.allocate(&id).unwrap(), first);
        }
    }
}
