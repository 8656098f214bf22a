//! Resource pools (spec §3 "ResourcePool", §4.5).
//!
//! A pool aggregates several resources behind one seize endpoint. As with
//! `resource.rs`, this module only holds data and the pluggable
//! selection/allocation rules; the actual cross-resource bookkeeping (which
//! needs the resource arena) lives in `model.rs`.

use crate::ids::{AllocationId, EntityId, PooledAllocationId, ResourceId};
use crate::queue::{Discipline, RankedQueue};

/// Chooses which eligible resources to draw from. Default: list order,
/// every resource with at least one available unit is eligible (spec
/// §4.5).
pub trait SelectionRule {
    fn select(&self, candidates: &[(ResourceId, u32)], amount_needed: u32) -> Vec<ResourceId>;
}

/// Distributes `amount_needed` across the resources the selection rule
/// chose. Default: greedy, left to right (spec §4.5).
pub trait AllocationRule {
    fn allocate(&self, selected: &[(ResourceId, u32)], amount_needed: u32) -> Vec<(ResourceId, u32)>;
}

/// The default selection rule: every resource in list order with
/// `available > 0` is eligible, no filtering beyond that.
pub struct ListOrderSelection;

impl SelectionRule for ListOrderSelection {
    fn select(&self, candidates: &[(ResourceId, u32)], _amount_needed: u32) -> Vec<ResourceId> {
        candidates
            .iter()
            .filter(|(_, available)| *available > 0)
            .map(|(id, _)| *id)
            .collect()
    }
}

/// The default allocation rule: draw as much as possible from the first
/// selected resource, then the next, until `amount_needed` is covered.
pub struct GreedyAllocation;

impl AllocationRule for GreedyAllocation {
    fn allocate(&self, selected: &[(ResourceId, u32)], amount_needed: u32) -> Vec<(ResourceId, u32)> {
        let mut remaining = amount_needed;
        let mut draws = Vec::new();
        for (id, available) in selected {
            if remaining == 0 {
                break;
            }
            let take = (*available).min(remaining);
            if take > 0 {
                draws.push((*id, take));
                remaining -= take;
            }
        }
        draws
    }
}

/// Owns one child [`crate::resource::Allocation`] per underlying resource
/// drawn from. Spec invariant: `Σ child.amount == amountRequested`.
#[derive(Debug, Clone)]
pub struct PooledAllocation {
    pub entity: EntityId,
    pub amount_requested: u32,
    pub children: Vec<(ResourceId, AllocationId)>,
    pub time_allocated: f64,
    pub time_deallocated: Option<f64>,
}

impl PooledAllocation {
    pub fn is_live(&self) -> bool {
        self.time_deallocated.is_none()
    }
}

/// A still-parked pool seize request.
pub struct PoolSeizeRequest {
    pub entity: EntityId,
    pub amount: u32,
    pub resolve: Box<dyn FnOnce(PooledAllocationId)>,
}

pub struct ResourcePool {
    pub name: String,
    pub resources: Vec<ResourceId>,
    pub selection: Box<dyn SelectionRule>,
    pub allocation: Box<dyn AllocationRule>,
    pub waiting: RankedQueue<PoolSeizeRequest>,
}

impl ResourcePool {
    pub fn new(name: impl Into<String>, resources: Vec<ResourceId>) -> Self {
        ResourcePool {
            name: name.into(),
            resources,
            selection: Box::new(ListOrderSelection),
            allocation: Box::new(GreedyAllocation),
            waiting: RankedQueue::new(Discipline::Fifo),
        }
    }

    pub fn with_rules(
        name: impl Into<String>,
        resources: Vec<ResourceId>,
        selection: Box<dyn SelectionRule>,
        allocation: Box<dyn AllocationRule>,
    ) -> Self {
        ResourcePool {
            name: name.into(),
            resources,
            selection,
            allocation,
            waiting: RankedQueue::new(Discipline::Fifo),
        }
    }

    /// Given each member resource's current `available()`, decides the
    /// per-resource draw for `amount_needed`, or `None` if the pool cannot
    /// currently cover it (spec: `Σ available_i >= amountNeeded`).
    pub fn plan_draws(
        &self,
        availability: &[(ResourceId, u32)],
        amount_needed: u32,
    ) -> Option<Vec<(ResourceId, u32)>> {
        let total: u32 = availability.iter().map(|(_, a)| a).sum();
        if total < amount_needed {
            return None;
        }
        let selected = self.selection.select(availability, amount_needed);
        let selected_availability: Vec<(ResourceId, u32)> = selected
            .into_iter()
            .filter_map(|id| availability.iter().find(|(rid, _)| *rid == id).copied())
            .collect();
        let draws = self.allocation.allocate(&selected_availability, amount_needed);
        let drawn_total: u32 = draws.iter().map(|(_, a)| a).sum();
        if drawn_total == amount_needed {
            Some(draws)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    #[test]
    fn greedy_allocation_draws_left_to_right() {
        let mut resources: SlotMap<ResourceId, ()> = SlotMap::with_key();
        let r0 = resources.insert(());
        let r1 = resources.insert(());
        let pool = ResourcePool::new("p", vec![r0, r1]);

        let availability = [(r0, 2), (r1, 3)];
        let draws = pool.plan_draws(&availability, 4).unwrap();
        assert_eq!(draws, vec![(r0, 2), (r1, 2)]);
    }

    #[test]
    fn insufficient_total_returns_none() {
        let mut resources: SlotMap<ResourceId, ()> = SlotMap::with_key();
        let r0 = resources.insert(());
        let pool = ResourcePool::new("p", vec![r0]);
        let availability = [(r0, 1)];
        assert!(pool.plan_draws(&availability, 2).is_none());
    }
}
