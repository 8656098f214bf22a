//! The entity coroutine runtime (spec §4.2).
//!
//! A [`KSLProcess`] body is an ordinary `async fn`/`async move` block written
//! against [`crate::builder::ProcessContext`]. Rust's own async transform is
//! the "CPS transform" spec §9 calls for — no hand-rolled generator or
//! stackful-coroutine machinery is needed. Every suspension operation in
//! spec §4.2's table is, underneath, one [`Suspend<R>`] future: a single
//! generic type whose `poll` performs the "park" side effect exactly once
//! (on first poll) and thereafter reports [`Poll::Pending`] until whatever
//! resumes it (an event handler, a `Release`, a `Signal::signal`, a `Send`)
//! writes a value into the shared slot and asks the model to re-poll this
//! entity.
//!
//! Only the executive (via [`crate::model::Model::resume`]) ever polls a
//! process's future, and it always does so with a no-op waker — nothing
//! reactor-driven resumes a process. That is the single-runner rule of
//! spec §4.2 made concrete: the future is simply never polled except when
//! the model decides to.

use crate::error::KslResult;
use crate::ids::{EntityId, ProcessId};
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

/// Spec §3 "KSLProcess": `Created → Activated → Running → (Suspended ⇄
/// Running)* → (Completed | Terminated)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Created,
    Activated,
    Running,
    Suspended,
    Completed,
    Terminated,
}

/// The boxed future a process's body compiles down to. Not `Send` — the
/// whole engine is single-threaded (spec §5) — so no executor thread pool
/// could ever touch it anyway.
pub type ProcessFuture = Pin<Box<dyn Future<Output = KslResult<()>>>>;

/// One execution instance of a user procedure for one entity.
pub struct KSLProcess {
    pub entity: EntityId,
    pub state: ProcessState,
    pub start_time: Option<f64>,
    pub completion_time: Option<f64>,
    pub(crate) future: Option<ProcessFuture>,
    /// Ran once, after a `Terminated` unwind, if the user registered one via
    /// `ProcessBuilder::with_after_termination`.
    pub(crate) after_termination: Option<Box<dyn FnOnce()>>,
}

impl KSLProcess {
    pub fn new(entity: EntityId, future: ProcessFuture) -> Self {
        KSLProcess {
            entity,
            state: ProcessState::Created,
            start_time: None,
            completion_time: None,
            future: Some(future),
            after_termination: None,
        }
    }

    pub fn elapsed(&self) -> Option<f64> {
        match (self.start_time, self.completion_time) {
            (Some(s), Some(c)) => Some(c - s),
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, ProcessState::Completed | ProcessState::Terminated)
    }
}

/// The value a [`Suspend`] future resolves to once its condition is met.
pub(crate) enum SuspendSlot<R> {
    Pending,
    Ready(R),
}

pub(crate) type SlotHandle<R> = Rc<RefCell<SuspendSlot<R>>>;

/// The single generic future type backing every suspension operation in
/// spec §4.2's table.
pub(crate) struct Suspend<R> {
    slot: SlotHandle<R>,
    park: Option<Box<dyn FnOnce(SlotHandle<R>)>>,
}

impl<R> Suspend<R> {
    /// `park` is invoked exactly once, on the future's first poll, with a
    /// clone of the shared slot. It is responsible for performing the park
    /// side effect (registering in a waiting structure, scheduling a resume
    /// event, ...) and for eventually writing `SuspendSlot::Ready(value)`
    /// into that slot and asking the model to re-poll this entity.
    pub(crate) fn new(park: impl FnOnce(SlotHandle<R>) + 'static) -> Self {
        Suspend {
            slot: Rc::new(RefCell::new(SuspendSlot::Pending)),
            park: Some(Box::new(park)),
        }
    }

    /// A suspension that is already known to be satisfiable: no park side
    /// effect, resolves on first poll. Used by synchronous fast paths (e.g.
    /// `Seize` when capacity is already available).
    pub(crate) fn ready(value: R) -> Self {
        Suspend {
            slot: Rc::new(RefCell::new(SuspendSlot::Ready(value))),
            park: None,
        }
    }
}

impl<R> Future for Suspend<R> {
    type Output = R;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<R> {
        // `Suspend<R>` holds no address-sensitive fields (Rc + boxed
        // FnOnce), so projecting through `get_mut` is sound.
        let this = self.get_mut();
        if let Some(park) = this.park.take() {
            park(this.slot.clone());
        }
        let mut slot = this.slot.borrow_mut();
        match std::mem::replace(&mut *slot, SuspendSlot::Pending) {
            SuspendSlot::Ready(v) => Poll::Ready(v),
            SuspendSlot::Pending => Poll::Pending,
        }
    }
}

/// Identifies a process for callers that only need the handle type.
pub type Id = ProcessId;
