//! Entity data (spec §3 "Entity").
//!
//! An entity is the actor that executes a [`crate::process::KSLProcess`]. Its
//! runtime bookkeeping — current state, what it is suspended on, which
//! allocations and queues it currently belongs to — lives here; the
//! behaviour that drives those transitions lives in `process.rs` and
//! `model.rs`.

use crate::ids::{AllocationId, EntityId, ProcessId};

/// Spec §3: `currentState ∈ {Created, Scheduled, Waiting, InProcess, Terminated}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    Created,
    Scheduled,
    Waiting,
    InProcess,
    Terminated,
}

/// What kind of suspension operation an entity is currently parked on, for
/// debugging/identification and for interrupt targeting by name (spec §4.2,
/// §6).
#[derive(Debug, Clone, PartialEq)]
pub enum SuspendType {
    None,
    Delay,
    Seize,
    WaitForSignal,
    Hold,
    WaitForItems,
    Send,
    WaitFor,
    BlockUntilCompleted,
    RequestConveyor,
    RideConveyor,
    Move,
    Yield,
}

/// An actor in the simulation. Invariant (spec §3): an entity is in at most
/// one waiting structure at a time, and has at most one pending resume
/// event — both are enforced by `model.rs`, not by this struct itself.
#[derive(Debug, Clone)]
pub struct Entity {
    pub name: String,
    pub location: String,
    pub current_process: Option<ProcessId>,
    pub allocations: Vec<AllocationId>,
    pub state: EntityState,
    pub suspend_type: SuspendType,
    pub suspension_name: Option<String>,
}

impl Entity {
    pub fn new(name: impl Into<String>) -> Self {
        Entity {
            name: name.into(),
            location: String::new(),
            current_process: None,
            allocations: Vec::new(),
            state: EntityState::Created,
            suspend_type: SuspendType::None,
            suspension_name: None,
        }
    }

    pub fn park(&mut self, suspend_type: SuspendType, suspension_name: Option<String>) {
        self.state = EntityState::Waiting;
        self.suspend_type = suspend_type;
        self.suspension_name = suspension_name;
    }

    pub fn resume(&mut self) {
        self.state = EntityState::InProcess;
        self.suspend_type = SuspendType::None;
        self.suspension_name = None;
    }
}

/// Re-exported for callers that only need to name an entity without pulling
/// in the rest of this module.
pub type Id = EntityId;
