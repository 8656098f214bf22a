//! The event executive (spec §4.1): owns the clock and the FEL, dequeues the
//! next non-cancelled event, advances `now` to its fire time, and invokes its
//! handler. Execution is strictly serial — at most one handler runs at a
//! time, and simulated time is frozen for the whole duration of a handler
//! (spec §5).

use crate::error::{KslError, KslResult};
use crate::event::{EventHandle, EventHandler, Fel};
use crate::priority::Priority;
use std::cell::Cell;
use tracing::trace;

/// How a call to [`EventExecutive::run`] should decide it is done.
#[derive(Debug, Clone, Copy)]
pub enum EndCondition {
    /// Run until simulated time reaches (or passes) `t`.
    Time(f64),
    /// Run until the FEL has no more events.
    NoEvents,
    /// Run for exactly `n` dispatched (non-cancelled) events.
    EventCount(usize),
}

/// Why a run actually stopped — the machine-readable counterpart of
/// [`EndCondition`], returned in a [`crate::model::RunReport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    ReachedStopTime,
    FelExhausted,
    ReachedEventCount,
}

/// Owns the simulation clock and the future event list. Does not know what
/// an "entity" or a "resource" is — handlers are opaque closures scheduled
/// by higher layers (see [`crate::model::Model`]).
pub struct EventExecutive {
    now: Cell<f64>,
    fel: Fel,
    events_processed: usize,
}

impl Default for EventExecutive {
    fn default() -> Self {
        Self::new()
    }
}

impl EventExecutive {
    pub fn new() -> Self {
        EventExecutive {
            now: Cell::new(0.0),
            fel: Fel::new(),
            events_processed: 0,
        }
    }

    pub fn now(&self) -> f64 {
        self.now.get()
    }

    pub fn events_processed(&self) -> usize {
        self.events_processed
    }

    pub fn pending_events(&self) -> usize {
        self.fel.len()
    }

    /// Schedules `handler` to fire `delta` time units from now, at
    /// `priority`. `delta` must be finite and non-negative.
    pub fn schedule(
        &mut self,
        delta: f64,
        priority: Priority,
        handler: EventHandler,
    ) -> KslResult<EventHandle> {
        if !delta.is_finite() || delta < 0.0 {
            return Err(KslError::invalid_argument(format!(
                "schedule delta must be finite and >= 0, got {delta}"
            )));
        }
        let fire_time = self.now.get() + delta;
        Ok(self.fel.schedule(fire_time, priority, handler))
    }

    pub fn cancel(&self, handle: &EventHandle) {
        handle.cancel();
    }

    /// Pops and dispatches the single next non-cancelled event, if any.
    /// Returns `true` if an event was dispatched.
    pub fn step(&mut self) -> bool {
        match self.fel.pop() {
            Some((fire_time, handler)) => {
                debug_assert!(fire_time >= self.now.get(), "FEL popped an event in the past");
                self.now.set(fire_time);
                trace!(time = fire_time, "dispatching event");
                handler();
                self.events_processed += 1;
                true
            }
            None => false,
        }
    }

    /// Runs events until `until` is satisfied. Returns the reason the run
    /// actually stopped.
    pub fn run(&mut self, until: EndCondition) -> StopReason {
        loop {
            match until {
                EndCondition::Time(t) => {
                    match self.fel.peek_time() {
                        Some(next) if next <= t => {}
                        _ => return StopReason::ReachedStopTime,
                    }
                }
                EndCondition::NoEvents => {
                    if self.fel.is_empty() {
                        return StopReason::FelExhausted;
                    }
                }
                EndCondition::EventCount(n) => {
                    if self.events_processed >= n {
                        return StopReason::ReachedEventCount;
                    }
                }
            }
            if !self.step() {
                return StopReason::FelExhausted;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_to_time_stops_without_consuming_later_events() {
        let mut exec = EventExecutive::new();
        exec.schedule(1.0, 0, Box::new(|| {})).unwrap();
        exec.schedule(5.0, 0, Box::new(|| {})).unwrap();
        let reason = exec.run(EndCondition::Time(2.0));
        assert_eq!(reason, StopReason::ReachedStopTime);
        assert_eq!(exec.now(), 1.0);
        assert_eq!(exec.pending_events(), 1);
    }

    #[test]
    fn rejects_negative_delta() {
        let mut exec = EventExecutive::new();
        assert!(exec.schedule(-1.0, 0, Box::new(|| {})).is_err());
    }
}
