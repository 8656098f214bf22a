//! Single resources (spec §3 "Resource"/"Allocation", §4.4).
//!
//! A `Resource` only tracks capacity, busy/failed bookkeeping and its own
//! waiting queue; it knows nothing about processes or futures. The bridge
//! between "a unit became available" and "an entity's `Suspend` future
//! resolves" lives in `model.rs`, which owns both the resource table and the
//! process table.

use crate::error::{KslError, KslResult};
use crate::ids::{AllocationId, EntityId};
use crate::queue::{Discipline, RankedQueue};
use std::collections::HashMap;
use tracing::debug;

/// Spec §3: `state ∈ {Idle, Busy, Failed, Inactive}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Idle,
    Busy,
    Failed,
    Inactive,
}

/// Record of `amount` units of a resource held by an entity. `amount == 0`
/// after deallocation; deallocated allocations are immutable thereafter
/// (spec §3).
#[derive(Debug, Clone)]
pub struct Allocation {
    pub entity: EntityId,
    pub amount: u32,
    pub time_allocated: f64,
    pub time_deallocated: Option<f64>,
}

impl Allocation {
    pub fn is_live(&self) -> bool {
        self.time_deallocated.is_none() && self.amount > 0
    }
}

/// A still-parked seize request against a single resource. `resolve` is
/// called by `model.rs` exactly once, with the granted allocation, when the
/// request is satisfied.
pub struct SeizeRequest {
    pub entity: EntityId,
    pub amount: u32,
    pub resolve: Box<dyn FnOnce(AllocationId)>,
}

/// A `(newCapacity, duration)` item of a capacity schedule (spec §4.4
/// "UseSchedule").
#[derive(Debug, Clone, Copy)]
pub struct CapacityChangeNotice {
    pub new_capacity: u32,
    pub duration: f64,
}

/// A time-keyed sequence of capacity changes to apply to a resource, most
/// recent item repeating once exhausted only if `cyclic` is set.
#[derive(Debug, Clone, Default)]
pub struct CapacitySchedule {
    pub items: Vec<CapacityChangeNotice>,
    pub cyclic: bool,
}

pub struct Resource {
    pub name: String,
    capacity: u32,
    num_busy: u32,
    /// Deficit recorded when a capacity decrease could not be fully applied
    /// because the units it wants to remove are currently busy (spec §4.4
    /// "Capacity-change policy"). Incoming releases satisfy this before
    /// satisfying waiters.
    still_needed: u32,
    failed: bool,
    pub allocations: HashMap<EntityId, Vec<AllocationId>>,
    pub waiting: RankedQueue<SeizeRequest>,
    pub schedule: Option<CapacitySchedule>,
}

impl Resource {
    pub fn new(name: impl Into<String>, capacity: u32) -> Self {
        Resource {
            name: name.into(),
            capacity,
            num_busy: 0,
            still_needed: 0,
            failed: false,
            allocations: HashMap::new(),
            waiting: RankedQueue::new(Discipline::Fifo),
            schedule: None,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn num_busy(&self) -> u32 {
        self.num_busy
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// `numAvailable` per spec §3: zero while failed, otherwise capacity
    /// minus busy units.
    pub fn available(&self) -> u32 {
        if self.failed {
            0
        } else {
            self.capacity.saturating_sub(self.num_busy)
        }
    }

    pub fn state(&self) -> ResourceState {
        if self.failed {
            ResourceState::Failed
        } else if self.capacity == 0 {
            ResourceState::Inactive
        } else if self.num_busy == 0 {
            ResourceState::Idle
        } else {
            ResourceState::Busy
        }
    }

    /// Records that `amount` units were just granted to `entity` under
    /// `id`. Caller (model.rs) is responsible for having verified
    /// `amount <= available()` beforehand; this only updates bookkeeping.
    pub fn note_allocate(&mut self, entity: EntityId, id: AllocationId, amount: u32) {
        self.num_busy += amount;
        self.allocations.entry(entity).or_default().push(id);
        debug!(resource = %self.name, amount, num_busy = self.num_busy, "allocated");
    }

    /// Records that `amount` units held by `entity` under `id` were just
    /// released. Applies the deficit-accounting capacity-change policy
    /// (spec §4.4): an outstanding `still_needed` deficit is paid down by
    /// the released amount (shrinking capacity) before the units become
    /// available to waiters.
    pub fn note_deallocate(
        &mut self,
        entity: EntityId,
        id: AllocationId,
        amount: u32,
    ) -> KslResult<()> {
        if amount > self.num_busy {
            return Err(KslError::state_violation(format!(
                "resource {} released {} units but only {} are busy",
                self.name, amount, self.num_busy
            )));
        }
        self.num_busy -= amount;
        if let Some(ids) = self.allocations.get_mut(&entity) {
            ids.retain(|existing| *existing != id);
            if ids.is_empty() {
                self.allocations.remove(&entity);
            }
        }
        if self.still_needed > 0 {
            let paid = amount.min(self.still_needed);
            self.capacity -= paid;
            self.still_needed -= paid;
        }
        debug!(resource = %self.name, amount, num_busy = self.num_busy, "deallocated");
        Ok(())
    }

    pub fn begin_failure(&mut self) {
        self.failed = true;
    }

    pub fn end_failure(&mut self) {
        self.failed = false;
    }

    /// Applies a new total capacity, using the deficit-accounting path
    /// spec §4.4/§9 mandates (the alternative, partially-implemented path
    /// in the source is explicitly not reproduced — see DESIGN.md).
    ///
    /// Returns `true` if capacity grew (the caller should scan the waiting
    /// queue for newly satisfiable requests).
    pub fn apply_capacity_change(&mut self, new_capacity: u32) -> bool {
        if new_capacity >= self.capacity {
            self.capacity = new_capacity;
            return true;
        }
        let decrease = self.capacity - new_capacity;
        let idle = self.capacity.saturating_sub(self.num_busy);
        if decrease <= idle {
            self.capacity -= decrease;
        } else {
            let immediate = idle;
            let deficit = decrease - immediate;
            self.capacity -= immediate;
            self.still_needed += deficit;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    #[test]
    fn idle_busy_inactive_failed_states() {
        let mut r = Resource::new("r", 2);
        assert_eq!(r.state(), ResourceState::Idle);

        let mut entities: SlotMap<EntityId, ()> = SlotMap::with_key();
        let e = entities.insert(());
        let mut allocs: SlotMap<AllocationId, ()> = SlotMap::with_key();
        let a = allocs.insert(());
        r.note_allocate(e, a, 2);
        assert_eq!(r.state(), ResourceState::Busy);
        assert_eq!(r.available(), 0);

        r.note_deallocate(e, a, 2).unwrap();
        assert_eq!(r.state(), ResourceState::Idle);

        let empty = Resource::new("empty", 0);
        assert_eq!(empty.state(), ResourceState::Inactive);

        let mut failing = Resource::new("f", 1);
        failing.begin_failure();
        assert_eq!(failing.state(), ResourceState::Failed);
        assert_eq!(failing.available(), 0);
    }

    #[test]
    fn deficit_accounting_defers_capacity_decrease() {
        let mut r = Resource::new("r", 2);
        let mut entities: SlotMap<EntityId, ()> = SlotMap::with_key();
        let e = entities.insert(());
        let mut allocs: SlotMap<AllocationId, ()> = SlotMap::with_key();
        let a = allocs.insert(());
        r.note_allocate(e, a, 2); // fully busy

        // Ask to shrink to 0 while both units are busy: nothing idle to
        // remove immediately, so the whole decrease becomes a deficit.
        let grew = r.apply_capacity_change(0);
        assert!(!grew);
        assert_eq!(r.capacity(), 2);
        assert_eq!(r.still_needed, 2);

        // Releasing pays down the deficit instead of freeing units.
        r.note_deallocate(e, a, 2).unwrap();
        assert_eq!(r.capacity(), 0);
        assert_eq!(r.num_busy(), 0);
        assert_eq!(r.still_needed, 0);
    }
}
