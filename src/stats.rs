//! Narrow traits for the external collaborators named in spec §1, plus the
//! resource-failure notification hook of §4.4.
//!
//! The core never depends on a concrete statistics, geometry or
//! random-variate crate — it only calls through these trait objects, which a
//! host application supplies when it builds a [`crate::model::Model`].

use crate::ids::EntityId;

/// Records a named counter delta (e.g. "queue wait time", "number seized").
/// The core calls this at the points spec §4.3 describes; it never
/// aggregates the values itself.
pub trait CounterRecorder {
    fn record(&mut self, name: &str, delta: f64);
}

/// Resolves the distance between two abstract locations for `Move`.
pub trait DistanceOracle {
    fn distance(&self, from: &str, to: &str) -> f64;
}

/// Produces a stochastic duration/amount. The core only ever calls this for
/// callers who explicitly opt into sampled delays; deterministic callers
/// never touch it.
pub trait SampleSource {
    fn sample(&mut self) -> f64;
}

/// A `CounterRecorder` that discards everything. Useful when a host does not
/// care about statistics and does not want to wire up a real collector.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCounterRecorder;

impl CounterRecorder for NullCounterRecorder {
    fn record(&mut self, _name: &str, _delta: f64) {}
}

/// A `DistanceOracle` that always returns zero. Useful for models that never
/// call `Move`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZeroDistanceOracle;

impl DistanceOracle for ZeroDistanceOracle {
    fn distance(&self, _from: &str, _to: &str) -> f64 {
        0.0
    }
}

/// Notified when a resource's `Failed` state changes (spec §4.4
/// "Failure"). `BeginFailure` does not reclaim allocated amounts itself —
/// `holders` lists the entities still holding live allocations against the
/// resource so a host can decide what they should do about it (reroute,
/// record downtime, etc).
pub trait FailureActions {
    fn on_begin_failure(&mut self, resource: &str, holders: &[EntityId]);
    fn on_end_failure(&mut self, resource: &str);
}

/// A `FailureActions` that does nothing. Default for hosts that never call
/// `begin_failure`/`end_failure`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullFailureActions;

impl FailureActions for NullFailureActions {
    fn on_begin_failure(&mut self, _resource: &str, _holders: &[EntityId]) {}
    fn on_end_failure(&mut self, _resource: &str) {}
}
