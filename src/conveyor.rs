//! Conveyors (spec §3 "Conveyor", §4.8).
//!
//! A conveyor is a flat array of cells partitioned into named [`Segment`]s;
//! the entry of a segment is the exit of the previous one, so cell indices
//! are global and contiguous across segment boundaries. Requests reserve a
//! contiguous run of cells, ride by advancing one cell per tick, and
//! release their cells on exit. Two disciplines (spec §4.8):
//!
//! - **Non-accumulating**: any blocked riding request halts the whole belt
//!   for that tick.
//! - **Accumulating**: each riding request advances independently,
//!   front-most first within a tick (so a same-tick cascade can propagate
//!   backward through a run of closely spaced items, matching how a real
//!   accumulating belt's wave of motion works), and stops only on contact
//!   with the rear of the request ahead.

use crate::error::{KslError, KslResult};
use crate::ids::{ConveyorRequestId, EntityId};
use std::collections::VecDeque;
use tracing::{trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discipline {
    Accumulating,
    NonAccumulating,
}

#[derive(Debug, Clone)]
pub struct SegmentSpec {
    pub entry_location: String,
    pub exit_location: String,
    pub num_cells: usize,
}

struct Segment {
    entry_location: String,
    exit_location: String,
    start_cell: usize,
    num_cells: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    WaitingForEntry,
    BlockingEntry,
    Riding,
    BlockingExit,
    Completed,
}

pub struct ConveyorRequest {
    pub entity: EntityId,
    pub num_cells_needed: usize,
    pub state: RequestState,
    /// Index of the frontmost cell this request currently occupies.
    pub front_cell: usize,
    /// Target cell index set by `ride`; `None` until then.
    pub dest_cell: Option<usize>,
}

impl ConveyorRequest {
    fn rear_cell(&self) -> usize {
        self.front_cell + 1 - self.num_cells_needed
    }
}

struct WaitingEntry {
    request: ConveyorRequestId,
    entry_cell: usize,
    num_cells_needed: usize,
}

pub struct Conveyor {
    pub name: String,
    pub cell_size: f64,
    pub velocity: f64,
    pub discipline: Discipline,
    segments: Vec<Segment>,
    cells: Vec<Option<ConveyorRequestId>>,
    /// Requests waiting for room at a segment entry, FIFO per conveyor
    /// (spec does not distinguish per-entry fairness beyond FIFO).
    entry_waiters: VecDeque<WaitingEntry>,
    /// `true` while at least one request is `Riding` (the tick only runs
    /// when something is in motion, spec §4.8).
    pub in_motion: bool,
    /// Set when a non-accumulating belt halts on a blockage; cleared when
    /// an `exit` frees the blocking cell.
    pub halted: bool,
}

impl Conveyor {
    pub fn new(
        name: impl Into<String>,
        segments: Vec<SegmentSpec>,
        cell_size: f64,
        velocity: f64,
        discipline: Discipline,
    ) -> KslResult<Self> {
        if cell_size <= 0.0 || !cell_size.is_finite() {
            return Err(KslError::invalid_argument("cell_size must be positive and finite"));
        }
        if velocity <= 0.0 || !velocity.is_finite() {
            return Err(KslError::invalid_argument("velocity must be positive and finite"));
        }
        let mut built = Vec::with_capacity(segments.len());
        let mut start_cell = 0;
        let mut total_cells = 0;
        for spec in segments {
            if spec.num_cells == 0 {
                return Err(KslError::invalid_argument("segment must have at least one cell"));
            }
            built.push(Segment {
                entry_location: spec.entry_location,
                exit_location: spec.exit_location,
                start_cell,
                num_cells: spec.num_cells,
            });
            start_cell += spec.num_cells;
            total_cells += spec.num_cells;
        }
        if built.is_empty() {
            return Err(KslError::invalid_argument("conveyor must have at least one segment"));
        }
        Ok(Conveyor {
            name: name.into(),
            cell_size,
            velocity,
            discipline,
            segments: built,
            cells: vec![None; total_cells],
            entry_waiters: VecDeque::new(),
            in_motion: false,
            halted: false,
        })
    }

    pub fn cell_time(&self) -> f64 {
        self.cell_size / self.velocity
    }

    pub fn total_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn entry_cell_of(&self, location: &str) -> KslResult<usize> {
        self.segments
            .iter()
            .find(|s| s.entry_location == location)
            .map(|s| s.start_cell)
            .ok_or_else(|| KslError::precondition(format!("no segment enters at {location}")))
    }

    /// The cell index a request should be considered to have arrived at
    /// once it reaches the named location's segment exit.
    pub fn exit_cell_of(&self, location: &str) -> KslResult<usize> {
        self.segments
            .iter()
            .find(|s| s.exit_location == location)
            .map(|s| s.start_cell + s.num_cells - 1)
            .ok_or_else(|| KslError::precondition(format!("no segment exits at {location}")))
    }

    fn cells_free(&self, start: usize, n: usize) -> bool {
        (start..start + n).all(|i| self.cells.get(i).is_some_and(|c| c.is_none()))
    }

    fn occupy(&mut self, id: ConveyorRequestId, start: usize, n: usize) {
        for cell in self.cells[start..start + n].iter_mut() {
            *cell = Some(id);
        }
    }

    fn vacate(&mut self, start: usize, n: usize) {
        for cell in self.cells[start..start + n].iter_mut() {
            *cell = None;
        }
    }

    /// Attempts to reserve `num_cells_needed` contiguous cells at
    /// `entry_location`'s segment entry. On success returns the reserved
    /// start cell and the caller moves the request to `BlockingEntry`; on
    /// failure the caller should park the request (`WaitingForEntry`) via
    /// [`Conveyor::park_entry`].
    pub fn try_request(&mut self, entry_location: &str, num_cells_needed: usize) -> KslResult<Option<usize>> {
        if num_cells_needed == 0 {
            return Err(KslError::invalid_argument("num_cells_needed must be >= 1"));
        }
        let start = self.entry_cell_of(entry_location)?;
        let segment_len = self
            .segments
            .iter()
            .find(|s| s.start_cell == start)
            .expect("entry_cell_of returns a real segment start")
            .num_cells;
        if num_cells_needed > segment_len {
            return Err(KslError::invalid_argument(
                "num_cells_needed exceeds the entry segment's length",
            ));
        }
        Ok(if self.cells_free(start, num_cells_needed) {
            Some(start)
        } else {
            None
        })
    }

    pub fn park_entry(&mut self, request: ConveyorRequestId, entry_cell: usize, num_cells_needed: usize) {
        self.entry_waiters.push_back(WaitingEntry {
            request,
            entry_cell,
            num_cells_needed,
        });
    }

    pub fn grant_entry(&mut self, id: ConveyorRequestId, start: usize, num_cells_needed: usize) {
        self.occupy(id, start, num_cells_needed);
    }

    /// Transitions a `BlockingEntry` request to `Riding` toward `dest_cell`.
    pub fn ride(&mut self, req: &mut ConveyorRequest, dest_cell: usize) {
        req.state = RequestState::Riding;
        req.dest_cell = Some(dest_cell);
        self.in_motion = true;
    }

    /// Advances all `Riding` requests by one cell-time, applying the
    /// conveyor's discipline. `requests` is every live request on this
    /// conveyor, keyed by id; callers own the arena.
    pub fn tick(
        &mut self,
        requests: &mut [(ConveyorRequestId, &mut ConveyorRequest)],
    ) -> Vec<ConveyorRequestId> {
        let mut riding: Vec<usize> = requests
            .iter()
            .enumerate()
            .filter(|(_, (_, r))| r.state == RequestState::Riding)
            .map(|(i, _)| i)
            .collect();
        // front-most first so an accumulating cascade can propagate within
        // one tick.
        riding.sort_by_key(|&i| std::cmp::Reverse(requests[i].1.front_cell));

        if self.discipline == Discipline::NonAccumulating {
            let any_blocked = riding.iter().any(|&i| {
                let (id, req) = &requests[i];
                self.is_blocked(*id, req)
            });
            if any_blocked {
                if !self.halted {
                    warn!(conveyor = %self.name, "non-accumulating belt halted on blockage");
                }
                self.halted = true;
                return Vec::new();
            }
            self.halted = false;
        }

        let mut arrived = Vec::new();
        for &i in &riding {
            let (id, req) = &mut requests[i];
            if self.discipline == Discipline::NonAccumulating && self.halted {
                continue;
            }
            if self.advance_one(*id, req) {
                trace!(conveyor = %self.name, request = ?id, cell = req.front_cell, "advanced");
                if Some(req.front_cell) == req.dest_cell {
                    req.state = RequestState::BlockingExit;
                    arrived.push(*id);
                }
            }
        }
        self.in_motion = requests.iter().any(|(_, r)| r.state == RequestState::Riding);
        arrived
    }

    fn is_blocked(&self, id: ConveyorRequestId, req: &ConveyorRequest) -> bool {
        if Some(req.front_cell) == req.dest_cell {
            return true; // arrived, occupying its cell until ExitConveyor
        }
        let target = req.front_cell + 1;
        match self.cells.get(target) {
            Some(Some(occupant)) => *occupant != id,
            Some(None) => false,
            None => true, // ran off the end of the conveyor without a destination set
        }
    }

    /// Moves `req` one cell forward if unobstructed. Returns whether it
    /// moved.
    fn advance_one(&mut self, id: ConveyorRequestId, req: &mut ConveyorRequest) -> bool {
        if Some(req.front_cell) == req.dest_cell {
            return false;
        }
        let target = req.front_cell + 1;
        let blocked = match self.cells.get(target) {
            Some(Some(occupant)) => *occupant != id,
            Some(None) => false,
            None => true,
        };
        if blocked {
            return false;
        }
        let old_rear = req.rear_cell();
        self.cells[old_rear] = None;
        self.cells[target] = Some(id);
        req.front_cell = target;
        true
    }

    /// Releases all cells held by `req` (spec: `ExitConveyor` releases all
    /// cells of the request). Returns the ids of requests freshly able to
    /// re-evaluate movement, i.e. any entry waiters that can now be
    /// granted.
    pub fn exit(&mut self, req: &ConveyorRequest) {
        let start = req.rear_cell();
        self.vacate(start, req.num_cells_needed);
        self.halted = false;
    }

    /// Pops the next entry waiter that can now be granted, if any.
    pub fn next_grantable_entry(&mut self) -> Option<(ConveyorRequestId, usize, usize)> {
        let idx = self
            .entry_waiters
            .iter()
            .position(|w| self.cells_free(w.entry_cell, w.num_cells_needed))?;
        let w = self.entry_waiters.remove(idx)?;
        Some((w.request, w.entry_cell, w.num_cells_needed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn single_segment(cells: usize, discipline: Discipline) -> Conveyor {
        Conveyor::new(
            "c",
            vec![SegmentSpec {
                entry_location: "in".into(),
                exit_location: "out".into(),
                num_cells: cells,
            }],
            1.0,
            1.0,
            discipline,
        )
        .unwrap()
    }

    #[test]
    fn one_cell_per_segment_when_cell_size_equals_segment_length() {
        let c = single_segment(1, Discipline::NonAccumulating);
        assert_eq!(c.total_cells(), 1);
    }

    #[test]
    fn accumulating_conveyor_second_item_stops_behind_first() {
        let mut c = single_segment(5, Discipline::Accumulating);
        let mut entities: SlotMap<EntityId, ()> = SlotMap::with_key();
        let mut req_ids: SlotMap<ConveyorRequestId, ()> = SlotMap::with_key();

        let ea = entities.insert(());
        let eb = entities.insert(());
        let ida = req_ids.insert(());
        let idb = req_ids.insert(());

        let mut a = ConveyorRequest {
            entity: ea,
            num_cells_needed: 1,
            state: RequestState::BlockingEntry,
            front_cell: 0,
            dest_cell: None,
        };
        c.grant_entry(ida, 0, 1);
        c.ride(&mut a, c.exit_cell_of("out").unwrap());

        // one tick later item B enters cell 0 too (after A has moved to 1).
        let _ = c.tick(&mut [(ida, &mut a)]);
        assert_eq!(a.front_cell, 1);

        let mut b = ConveyorRequest {
            entity: eb,
            num_cells_needed: 1,
            state: RequestState::BlockingEntry,
            front_cell: 0,
            dest_cell: None,
        };
        c.grant_entry(idb, 0, 1);
        c.ride(&mut b, c.exit_cell_of("out").unwrap() - 1); // dest cell 3 (0-indexed)

        // drive both to the scenario endpoint: A reaches cell 4 at t=5
        // (started at t=0, needs 4 more ticks), B reaches cell 3 at t=5
        // (started at t=1, needs 3 more ticks) and then contacts A.
        for _ in 0..3 {
            let mut reqs: Vec<(ConveyorRequestId, &mut ConveyorRequest)> =
                vec![(ida, &mut a), (idb, &mut b)];
            c.tick(&mut reqs);
        }
        assert_eq!(a.front_cell, 4);
        assert_eq!(b.front_cell, 3);
        assert_eq!(a.state, RequestState::BlockingExit);

        // B should now be blocked behind A (contact at A's rear == A's cell).
        let mut reqs: Vec<(ConveyorRequestId, &mut ConveyorRequest)> = vec![(idb, &mut b)];
        c.tick(&mut reqs);
        assert_eq!(b.front_cell, 3, "B stays put, blocked by A ahead");

        c.exit(&a);
        let mut reqs: Vec<(ConveyorRequestId, &mut ConveyorRequest)> = vec![(idb, &mut b)];
        c.tick(&mut reqs);
        assert_eq!(b.front_cell, 3, "B has already reached its own destination");
        assert_eq!(b.state, RequestState::BlockingExit);
    }

    #[test]
    fn non_accumulating_conveyor_halts_whole_belt_on_blockage() {
        let mut c = single_segment(3, Discipline::NonAccumulating);
        let mut req_ids: SlotMap<ConveyorRequestId, ()> = SlotMap::with_key();
        let mut entities: SlotMap<EntityId, ()> = SlotMap::with_key();
        let e = entities.insert(());
        let id = req_ids.insert(());

        let mut r = ConveyorRequest {
            entity: e,
            num_cells_needed: 1,
            state: RequestState::BlockingEntry,
            front_cell: 0,
            dest_cell: None,
        };
        c.grant_entry(id, 0, 1);
        c.ride(&mut r, 1); // destination is cell 1, not the far end

        let mut reqs: Vec<(ConveyorRequestId, &mut ConveyorRequest)> = vec![(id, &mut r)];
        c.tick(&mut reqs);
        assert_eq!(r.front_cell, 1);
        assert_eq!(r.state, RequestState::BlockingExit);
        assert!(!c.halted);
    }
}
