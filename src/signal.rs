//! Signals and hold queues (spec §3 "Signal", §4.6).
//!
//! A [`HoldQueue`] is a ranked queue of parked entities, each carrying the
//! `resolve` closure that wakes it — the same shape `resource.rs`'s
//! `SeizeRequest` and `pool.rs`'s `PoolSeizeRequest` use, so `model.rs`
//! never needs a side-table to find out how to wake a held entity. A
//! [`Signal`] is a named wait-point built around its own `HoldQueue`;
//! `Signal::take_selected` resolves a [`Selector`] against the queue's
//! current contents and hands back the resolvers for every entity it
//! matched, already removed from the queue.

use crate::ids::EntityId;
use crate::priority::Priority;
use crate::queue::{Discipline, RankedQueue};
use std::ops::Range;

/// One parked `Hold`: the entity waiting and the closure that wakes it.
/// The resolver takes the priority its resume event should fire at, since
/// a plain `HoldQueue` and a `Signal`'s internal queue resume at different
/// defaults (spec §4.6: `RESUME` vs. the signal's configured priority).
pub struct HoldEntry {
    pub entity: EntityId,
    pub resolve: Box<dyn FnOnce(Priority)>,
}

/// A named, ranked queue of parked entities. Standalone `HoldQueue`s back
/// bespoke synchronization that doesn't need a `Signal`'s selector
/// machinery; `Signal` also uses one internally.
pub struct HoldQueue {
    pub name: String,
    entries: RankedQueue<HoldEntry>,
}

impl HoldQueue {
    pub fn new(name: impl Into<String>, discipline: Discipline) -> Self {
        HoldQueue {
            name: name.into(),
            entries: RankedQueue::new(discipline),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn park(&mut self, entry: HoldEntry, now: f64) {
        self.entries.enqueue(entry, 0, now, true);
    }

    pub fn snapshot(&self) -> Vec<EntityId> {
        self.entries.iter().map(|e| e.entity).collect()
    }

    /// Resolves `selector` against the queue's current contents and
    /// removes every match, returning their wake closures in queue order.
    pub fn take_selected(&mut self, selector: &Selector) -> Vec<Box<dyn FnOnce(Priority)>> {
        let ids = self.snapshot();
        let chosen = selector.resolve(&ids);
        self.entries
            .filter_remove(|e| chosen.contains(&e.entity))
            .into_iter()
            .map(|e| e.resolve)
            .collect()
    }
}

/// Chooses which entities a `Signal::signal` call resumes (spec §4.6).
pub enum Selector {
    Entity(EntityId),
    /// 0-indexed position within the queue, head first.
    Index(usize),
    /// 0-indexed, end-exclusive range within the queue.
    Range(Range<usize>),
    Predicate(Box<dyn Fn(&EntityId) -> bool>),
    First,
    Last,
    All,
}

impl Selector {
    /// Resolves the selector against a snapshot of the queue's current
    /// entities (head-to-tail order), returning the matched subset in that
    /// same order.
    pub fn resolve(&self, entities: &[EntityId]) -> Vec<EntityId> {
        match self {
            Selector::Entity(target) => entities
                .iter()
                .filter(|e| *e == target)
                .copied()
                .collect(),
            Selector::Index(i) => entities.get(*i).into_iter().copied().collect(),
            Selector::Range(range) => entities
                .get(range.clone())
                .map(|slice| slice.to_vec())
                .unwrap_or_default(),
            Selector::Predicate(pred) => entities.iter().filter(|e| pred(e)).copied().collect(),
            Selector::First => entities.first().into_iter().copied().collect(),
            Selector::Last => entities.last().into_iter().copied().collect(),
            Selector::All => entities.to_vec(),
        }
    }
}

/// A wait-point holding a ranked queue of parked entities (spec §3).
pub struct Signal {
    pub name: String,
    pub queue: HoldQueue,
    pub resume_priority: Priority,
}

impl Signal {
    pub fn new(name: impl Into<String>, discipline: Discipline, resume_priority: Priority) -> Self {
        let name = name.into();
        Signal {
            queue: HoldQueue::new(name.clone(), discipline),
            name,
            resume_priority,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    #[test]
    fn range_selector_picks_0_indexed_subrange() {
        let mut arena: SlotMap<EntityId, ()> = SlotMap::with_key();
        let ids: Vec<EntityId> = (0..4).map(|_| arena.insert(())).collect();
        let selector = Selector::Range(2..4);
        let picked = selector.resolve(&ids);
        assert_eq!(picked, vec![ids[2], ids[3]]);
    }

    #[test]
    fn take_selected_removes_matched_entries_and_returns_their_resolvers() {
        let mut arena: SlotMap<EntityId, ()> = SlotMap::with_key();
        let ids: Vec<EntityId> = (0..3).map(|_| arena.insert(())).collect();
        let mut queue = HoldQueue::new("q", Discipline::Fifo);
        let woke = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        for (i, id) in ids.iter().enumerate() {
            let woke = woke.clone();
            queue.park(
                HoldEntry {
                    entity: *id,
                    resolve: Box::new(move |_priority| woke.borrow_mut().push(i)),
                },
                0.0,
            );
        }
        let resolvers = queue.take_selected(&Selector::Range(0..2));
        assert_eq!(queue.len(), 1);
        for r in resolvers {
            r(crate::priority::RESUME);
        }
        assert_eq!(*woke.borrow(), vec![0, 1]);
    }
}
