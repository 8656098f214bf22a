//! The `Model`: owns every arena and wires the suspension operations of
//! spec §4.2 to the data structures of §4.4-§4.8.
//!
//! Per spec §9 "Global state", each simulation run owns exactly one
//! `Model`; there are no process-wide singletons. Per the design note on
//! "Coroutine control flow", this crate realizes the single-runner rule by
//! never holding a `RefCell` borrow across a `poll()` call: every method
//! that mutates shared state borrows, does its work, and drops the borrow
//! before control could re-enter through a suspension future's `park`
//! closure.
//!
//! `Model<T>` is generic in the item type carried by its blocking queues,
//! mirroring the generic `Context<T>`/`SendMessage` message-passing the
//! prototype this crate is descended from already used.

use crate::blocking_queue::{BlockingQueue, PendingReceive, PendingSend};
use crate::conveyor::{Conveyor, ConveyorRequest, RequestState};
use crate::entity::{Entity, EntityState, SuspendType};
use crate::error::{KslError, KslResult};
use crate::event::EventHandle;
use crate::executive::{EndCondition, EventExecutive, StopReason};
use crate::ids::{
    AllocationId, BlockingQueueId, ConveyorId, ConveyorRequestId, EntityId, HoldQueueId,
    PooledAllocationId, ProcessId, ResourceId, ResourcePoolId, SignalId,
};
use crate::pool::{PoolSeizeRequest, PooledAllocation, ResourcePool};
use crate::priority;
use crate::process::{KSLProcess, ProcessFuture, ProcessState, Suspend, SuspendSlot};
use crate::queue::Discipline;
use crate::resource::{Allocation, CapacitySchedule, Resource, SeizeRequest};
use crate::signal::{HoldEntry, HoldQueue, Selector, Signal};
use crate::stats::{
    CounterRecorder, DistanceOracle, FailureActions, NullCounterRecorder, NullFailureActions,
    SampleSource, ZeroDistanceOracle,
};
use slotmap::SlotMap;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, info, warn};

/// How a [`Model::run`] call should decide it is done (spec §6.1).
#[derive(Debug, Clone, Copy)]
pub struct RunConfig {
    pub until: EndCondition,
    /// Safety valve against runaway self-rescheduling loops. `None` means
    /// no cap beyond `until` itself.
    pub event_count_cap: Option<usize>,
}

impl RunConfig {
    pub fn until(until: EndCondition) -> Self {
        RunConfig {
            until,
            event_count_cap: None,
        }
    }
}

/// Machine-readable answer to "why did the run stop" (spec §6.1).
#[derive(Debug, Clone, Copy)]
pub struct RunReport {
    pub events_processed: usize,
    pub stopped_at: f64,
    pub stop_reason: StopReason,
}

pub(crate) struct ModelState<T> {
    executive: EventExecutive,
    entities: SlotMap<EntityId, Entity>,
    processes: SlotMap<ProcessId, KSLProcess>,
    resources: SlotMap<ResourceId, Resource>,
    pools: SlotMap<ResourcePoolId, ResourcePool>,
    allocations: SlotMap<AllocationId, Allocation>,
    pooled_allocations: SlotMap<PooledAllocationId, PooledAllocation>,
    signals: SlotMap<SignalId, Signal>,
    hold_queues: SlotMap<HoldQueueId, HoldQueue>,
    blocking_queues: SlotMap<BlockingQueueId, BlockingQueue<T>>,
    conveyors: SlotMap<ConveyorId, Conveyor>,
    conveyor_requests: SlotMap<ConveyorRequestId, RefCell<ConveyorRequest>>,
    /// Which conveyor owns each live request.
    request_conveyor: HashMap<ConveyorRequestId, ConveyorId>,
    /// Resolvers for requests parked on `RequestConveyor`, called once
    /// `Conveyor::next_grantable_entry` picks them.
    entry_resolvers: HashMap<ConveyorRequestId, Box<dyn FnOnce(usize)>>,
    /// Resolvers for requests parked on `RideConveyor`, called once
    /// `Conveyor::tick` reports them arrived.
    ride_resolvers: HashMap<ConveyorRequestId, Box<dyn FnOnce()>>,
    /// Conveyors with a self-rescheduling tick currently in flight.
    ticking_conveyors: std::collections::HashSet<ConveyorId>,
    /// Processes parked on another process's completion (`wait_for`, spec
    /// §4.2), keyed by the process being awaited.
    completion_waiters: HashMap<ProcessId, Vec<Box<dyn FnOnce()>>>,
    /// Which resource each still-live allocation was drawn from, so a
    /// `terminate()` sweep can release everything an entity is holding
    /// without the caller having to remember it.
    alloc_resource: HashMap<AllocationId, ResourceId>,
    /// Which pools a resource is a member of, so releasing a unit of it can
    /// re-scan every pool that might now be satisfiable (spec §4.5).
    resource_pools: HashMap<ResourceId, Vec<ResourcePoolId>>,
    /// A process's still-pending `Delay`, if any, so `interrupt` can cancel
    /// it and later re-arm it (spec §4.2 "Interrupt semantics for delay").
    pending_delay: HashMap<ProcessId, PendingDelay>,
    counter: Box<dyn CounterRecorder>,
    distance: Box<dyn DistanceOracle>,
    sampler: Option<Box<dyn SampleSource>>,
    failure_actions: Box<dyn FailureActions>,
}

impl<T> ModelState<T> {
    fn now(&self) -> f64 {
        self.executive.now()
    }
}

/// The simulation kernel. Cheap to clone (an `Rc` clone); every clone
/// refers to the same run.
pub struct Model<T> {
    pub(crate) state: Rc<RefCell<ModelState<T>>>,
}

impl<T> Clone for Model<T> {
    fn clone(&self) -> Self {
        Model {
            state: self.state.clone(),
        }
    }
}

impl<T: 'static> Model<T> {
    pub fn new() -> Self {
        Self::with_collaborators(NullCounterRecorder, ZeroDistanceOracle, None, NullFailureActions)
    }

    pub fn with_collaborators(
        counter: impl CounterRecorder + 'static,
        distance: impl DistanceOracle + 'static,
        sampler: Option<Box<dyn SampleSource>>,
        failure_actions: impl FailureActions + 'static,
    ) -> Self {
        Model {
            state: Rc::new(RefCell::new(ModelState {
                executive: EventExecutive::new(),
                entities: SlotMap::with_key(),
                processes: SlotMap::with_key(),
                resources: SlotMap::with_key(),
                pools: SlotMap::with_key(),
                allocations: SlotMap::with_key(),
                pooled_allocations: SlotMap::with_key(),
                signals: SlotMap::with_key(),
                hold_queues: SlotMap::with_key(),
                blocking_queues: SlotMap::with_key(),
                conveyors: SlotMap::with_key(),
                conveyor_requests: SlotMap::with_key(),
                request_conveyor: HashMap::new(),
                entry_resolvers: HashMap::new(),
                ride_resolvers: HashMap::new(),
                ticking_conveyors: std::collections::HashSet::new(),
                completion_waiters: HashMap::new(),
                alloc_resource: HashMap::new(),
                resource_pools: HashMap::new(),
                pending_delay: HashMap::new(),
                counter: Box::new(counter),
                distance: Box::new(distance),
                sampler,
                failure_actions: Box::new(failure_actions),
            })),
        }
    }

    pub fn now(&self) -> f64 {
        self.state.borrow().now()
    }

    // -- registration -----------------------------------------------------

    pub fn create_entity(&self, name: impl Into<String>) -> EntityId {
        self.state.borrow_mut().entities.insert(Entity::new(name))
    }

    pub fn register_resource(&self, name: impl Into<String>, capacity: u32) -> ResourceId {
        self.state
            .borrow_mut()
            .resources
            .insert(Resource::new(name, capacity))
    }

    pub fn register_pool(&self, name: impl Into<String>, resources: Vec<ResourceId>) -> ResourcePoolId {
        let mut st = self.state.borrow_mut();
        let id = st.pools.insert(ResourcePool::new(name, resources.clone()));
        for resource in resources {
            st.resource_pools.entry(resource).or_default().push(id);
        }
        id
    }

    pub fn register_signal(
        &self,
        name: impl Into<String>,
        discipline: Discipline,
        resume_priority: priority::Priority,
    ) -> SignalId {
        self.state
            .borrow_mut()
            .signals
            .insert(Signal::new(name, discipline, resume_priority))
    }

    pub fn register_hold_queue(&self, name: impl Into<String>, discipline: Discipline) -> HoldQueueId {
        self.state
            .borrow_mut()
            .hold_queues
            .insert(HoldQueue::new(name, discipline))
    }

    pub fn register_blocking_queue(
        &self,
        name: impl Into<String>,
        capacity: Option<usize>,
    ) -> BlockingQueueId {
        self.state
            .borrow_mut()
            .blocking_queues
            .insert(BlockingQueue::new(name, capacity))
    }

    pub fn register_conveyor(&self, conveyor: Conveyor) -> ConveyorId {
        self.state.borrow_mut().conveyors.insert(conveyor)
    }

    /// Registers a process body (an `async move { ... }` block written
    /// against a [`crate::builder::ProcessContext`]) for `entity` and
    /// activates it at `start_time`. Returns the new process's id.
    pub fn spawn_process(
        &self,
        entity: EntityId,
        start_time: f64,
        build: impl FnOnce(crate::builder::ProcessContext<T>) -> ProcessFuture,
    ) -> KslResult<ProcessId> {
        if !start_time.is_finite() || start_time < 0.0 {
            return Err(KslError::invalid_argument("start_time must be finite and >= 0"));
        }
        let process_id = {
            let mut st = self.state.borrow_mut();
            let placeholder = KSLProcess::new(entity, Box::pin(async { Ok(()) }));
            st.processes.insert(placeholder)
        };
        let ctx = crate::builder::ProcessContext::new(entity, process_id, self.clone());
        let future = build(ctx);
        {
            let mut st = self.state.borrow_mut();
            if let Some(p) = st.processes.get_mut(process_id) {
                p.future = Some(future);
            }
            if let Some(e) = st.entities.get_mut(entity) {
                e.current_process = Some(process_id);
                e.state = EntityState::Scheduled;
            }
        }
        let model = self.clone();
        self.state.borrow_mut().executive.schedule(
            start_time - self.now(),
            priority::RESUME,
            Box::new(move || resume_process(&model, process_id)),
        )?;
        Ok(process_id)
    }

    pub fn run(&self, config: RunConfig) -> RunReport {
        let until = match config.event_count_cap {
            Some(cap) => match config.until {
                EndCondition::EventCount(n) => EndCondition::EventCount(n.min(cap)),
                _ => EndCondition::EventCount(cap),
            },
            None => config.until,
        };
        let stop_reason = self.state.borrow_mut().executive.run(until);
        let st = self.state.borrow();
        RunReport {
            events_processed: st.executive.events_processed(),
            stopped_at: st.executive.now(),
            stop_reason,
        }
    }

    pub fn process_state(&self, process: ProcessId) -> Option<ProcessState> {
        self.state.borrow().processes.get(process).map(|p| p.state)
    }

    pub fn process_elapsed(&self, process: ProcessId) -> Option<f64> {
        self.state.borrow().processes.get(process).and_then(|p| p.elapsed())
    }

    pub fn entity_state(&self, entity: EntityId) -> Option<EntityState> {
        self.state.borrow().entities.get(entity).map(|e| e.state)
    }

    pub fn resource(&self, id: ResourceId) -> Option<ResourceSnapshot> {
        self.state.borrow().resources.get(id).map(ResourceSnapshot::from)
    }
}

impl<T: 'static> Default for Model<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A point-in-time copy of a resource's public counters, safe to hold
/// outside the model's `RefCell`.
#[derive(Debug, Clone, Copy)]
pub struct ResourceSnapshot {
    pub capacity: u32,
    pub num_busy: u32,
    pub available: u32,
    pub failed: bool,
}

impl From<&Resource> for ResourceSnapshot {
    fn from(r: &Resource) -> Self {
        ResourceSnapshot {
            capacity: r.capacity(),
            num_busy: r.num_busy(),
            available: r.available(),
            failed: r.is_failed(),
        }
    }
}

/// Drives one resumption of `process`: takes its future out of the arena,
/// polls it with a no-op waker (nothing but the model itself ever re-polls
/// a process), and puts it back if it suspended again. Never holds a
/// `RefCell` borrow while polling, so a `Suspend::park` closure invoked
/// during that poll can freely borrow the model again.
pub(crate) fn resume_process<T: 'static>(model: &Model<T>, process: ProcessId) {
    let taken = {
        let mut st = model.state.borrow_mut();
        let Some(p) = st.processes.get_mut(process) else {
            return;
        };
        if p.start_time.is_none() {
            p.start_time = Some(st.executive.now());
        }
        p.state = ProcessState::Running;
        if let Some(e) = st.entities.get_mut(p.entity) {
            e.resume();
        }
        st.pending_delay.remove(&process);
        p.future.take()
    };
    let Some(mut fut) = taken else { return };
    match poll_boxed(&mut fut) {
        Some(result) => {
            let mut st = model.state.borrow_mut();
            let now = st.executive.now();
            if let Some(p) = st.processes.get_mut(process) {
                p.completion_time = Some(now);
                p.state = match &result {
                    Ok(()) => ProcessState::Completed,
                    Err(KslError::Terminated { .. }) => ProcessState::Terminated,
                    Err(_) => ProcessState::Terminated,
                };
                if let ProcessState::Terminated = p.state {
                    if let Some(hook) = p.after_termination.take() {
                        hook();
                    }
                }
            }
            if let Some(p) = st.processes.get(process) {
                if let Some(e) = st.entities.get_mut(p.entity) {
                    e.state = EntityState::Terminated;
                }
                debug!(?process, state = ?p.state, "process finished");
            }
            if let Err(err) = &result {
                warn!(?process, error = %err, "process ended with error");
            }
            let waiters = st.completion_waiters.remove(&process).unwrap_or_default();
            drop(st);
            for wake in waiters {
                wake();
            }
        }
        None => {
            let mut st = model.state.borrow_mut();
            if let Some(p) = st.processes.get_mut(process) {
                p.future = Some(fut);
                p.state = ProcessState::Suspended;
            }
        }
    }
}

fn poll_boxed(fut: &mut ProcessFuture) -> Option<KslResult<()>> {
    use std::task::Context;
    let waker = futures::task::noop_waker();
    let mut cx = Context::from_waker(&waker);
    match fut.as_mut().poll(&mut cx) {
        std::task::Poll::Ready(r) => Some(r),
        std::task::Poll::Pending => None,
    }
}

fn schedule_resume<T: 'static>(model: &Model<T>, process: ProcessId, priority: priority::Priority) {
    let m = model.clone();
    let _ = model
        .state
        .borrow_mut()
        .executive
        .schedule(0.0, priority, Box::new(move || resume_process(&m, process)));
}

/// A process's still-outstanding `Delay`: the event that will resolve it,
/// the slot that delivers the result, and the original requested duration
/// (needed to re-arm the delay from scratch when `interrupt` restarts it).
pub(crate) struct PendingDelay {
    handle: EventHandle,
    slot: crate::process::SlotHandle<()>,
    original_dt: f64,
}

/// Schedules the event that completes a (possibly re-armed) delay and
/// records it in `pending_delay` so `interrupt` can find and cancel it.
/// Shared by `op_delay` and by `interrupt`'s restart path.
fn schedule_delay<T: 'static>(
    model: &Model<T>,
    process: ProcessId,
    slot: crate::process::SlotHandle<()>,
    dt: f64,
    priority: priority::Priority,
    original_dt: f64,
) {
    let mut st = model.state.borrow_mut();
    let slot2 = slot.clone();
    let m2 = model.clone();
    if let Ok(handle) = st.executive.schedule(
        dt,
        priority,
        Box::new(move || {
            *slot2.borrow_mut() = SuspendSlot::Ready(());
            resume_process(&m2, process);
        }),
    ) {
        st.pending_delay.insert(
            process,
            PendingDelay {
                handle,
                slot,
                original_dt,
            },
        );
    }
}

// -- suspension-op implementations, one per spec §4.2 row --------------
//
// Each function validates what it can validate synchronously, then either
// resolves a `Suspend` immediately (the happy, non-parking path) or parks
// the caller and returns a `Suspend` that will resolve once some other
// operation satisfies it. `crate::builder::ProcessContext` is the thin
// `async fn` surface that awaits these.

impl<T: 'static> Model<T> {
    pub(crate) fn op_delay(
        &self,
        entity: EntityId,
        process: ProcessId,
        dt: f64,
        priority: priority::Priority,
    ) -> KslResult<Suspend<()>> {
        if !dt.is_finite() || dt < 0.0 {
            return Err(KslError::invalid_argument("delay must be finite and >= 0"));
        }
        let model = self.clone();
        Ok(Suspend::new(move |slot| {
            schedule_delay(&model, process, slot, dt, priority, dt);
            let mut st = model.state.borrow_mut();
            if let Some(e) = st.entities.get_mut(entity) {
                e.park(SuspendType::Delay, None);
            }
        }))
    }

    pub(crate) fn op_yield(&self, entity: EntityId, process: ProcessId, priority: priority::Priority) -> Suspend<()> {
        let model = self.clone();
        Suspend::new(move |slot| {
            let mut st = model.state.borrow_mut();
            let slot2 = slot.clone();
            let m2 = model.clone();
            let _ = st.executive.schedule(
                0.0,
                priority,
                Box::new(move || {
                    *slot2.borrow_mut() = SuspendSlot::Ready(());
                    resume_process(&m2, process);
                }),
            );
            if let Some(e) = st.entities.get_mut(entity) {
                e.park(SuspendType::Yield, None);
            }
        })
    }

    /// Cancels a process's currently-pending `Delay` and resolves it
    /// immediately, resuming the process at `INTERRUPT` priority (spec
    /// §4.2 "Interrupt", variant (iii): continue with whatever's left —
    /// here, nothing, the delay simply ends now). Fails if the process has
    /// no interruptible delay outstanding right now.
    pub fn interrupt(&self, process: ProcessId) -> KslResult<()> {
        let pending = {
            let mut st = self.state.borrow_mut();
            st.pending_delay
                .remove(&process)
                .ok_or_else(|| KslError::precondition("process has no interruptible delay pending"))?
        };
        pending.handle.cancel();
        *pending.slot.borrow_mut() = SuspendSlot::Ready(());
        schedule_resume(self, process, priority::INTERRUPT);
        Ok(())
    }

    /// Cancels a process's currently-pending `Delay`, waits `interrupt_time`
    /// more simulated time units, then restarts the delay from its
    /// original full duration (spec §4.2 "Interrupt", variant (ii), the
    /// form an interrupting entity typically uses). The interrupted
    /// process itself stays parked throughout; nothing repolls it until
    /// the restarted delay's own completion event fires.
    pub fn interrupt_and_restart(&self, process: ProcessId, interrupt_time: f64) -> KslResult<()> {
        if !interrupt_time.is_finite() || interrupt_time < 0.0 {
            return Err(KslError::invalid_argument("interrupt_time must be finite and >= 0"));
        }
        let pending = {
            let mut st = self.state.borrow_mut();
            st.pending_delay
                .remove(&process)
                .ok_or_else(|| KslError::precondition("process has no interruptible delay pending"))?
        };
        pending.handle.cancel();
        let model = self.clone();
        let original_dt = pending.original_dt;
        let slot = pending.slot;
        let mut st = self.state.borrow_mut();
        let _ = st.executive.schedule(
            interrupt_time,
            priority::INTERRUPT,
            Box::new(move || {
                schedule_delay(&model, process, slot, original_dt, priority::DELAY, original_dt);
            }),
        );
        Ok(())
    }

    pub(crate) fn op_seize(
        &self,
        entity: EntityId,
        process: ProcessId,
        resource: ResourceId,
        amount: u32,
    ) -> KslResult<Suspend<AllocationId>> {
        if amount < 1 {
            return Err(KslError::invalid_argument("seize amount must be >= 1"));
        }
        let mut st = self.state.borrow_mut();
        let now = st.now();
        {
            let res = st
                .resources
                .get(resource)
                .ok_or_else(|| KslError::state_violation("unknown resource"))?;
            if res.available() >= amount {
                let id = st.allocations.insert(Allocation {
                    entity,
                    amount,
                    time_allocated: now,
                    time_deallocated: None,
                });
                st.resources.get_mut(resource).unwrap().note_allocate(entity, id, amount);
                st.alloc_resource.insert(id, resource);
                if let Some(e) = st.entities.get_mut(entity) {
                    e.allocations.push(id);
                }
                return Ok(Suspend::ready(id));
            }
        }
        drop(st);
        let model = self.clone();
        Ok(Suspend::new(move |slot| {
            let mut st = model.state.borrow_mut();
            let now = st.now();
            let m2 = model.clone();
            if let Some(res) = st.resources.get_mut(resource) {
                res.waiting.enqueue(
                    SeizeRequest {
                        entity,
                        amount,
                        resolve: Box::new(move |id| {
                            *slot.borrow_mut() = SuspendSlot::Ready(id);
                            schedule_resume(&m2, process, priority::SEIZE);
                        }),
                    },
                    0,
                    now,
                    true,
                );
            }
            if let Some(e) = st.entities.get_mut(entity) {
                e.park(SuspendType::Seize, None);
            }
        }))
    }

    pub fn release(&self, entity: EntityId, resource: ResourceId, allocation: AllocationId) -> KslResult<()> {
        let mut st = self.state.borrow_mut();
        let now = st.now();
        let amount = {
            let alloc = st
                .allocations
                .get_mut(allocation)
                .ok_or_else(|| KslError::state_violation("unknown allocation"))?;
            if !alloc.is_live() {
                return Err(KslError::state_violation("double release"));
            }
            let amount = alloc.amount;
            alloc.time_deallocated = Some(now);
            alloc.amount = 0;
            amount
        };
        if let Some(e) = st.entities.get_mut(entity) {
            e.allocations.retain(|a| *a != allocation);
        }
        st.alloc_resource.remove(&allocation);
        st.resources
            .get_mut(resource)
            .ok_or_else(|| KslError::state_violation("unknown resource"))?
            .note_deallocate(entity, allocation, amount)?;
        let pools = st.resource_pools.get(&resource).cloned().unwrap_or_default();
        drop(st);
        self.settle_resource_waiters(resource);
        for pool in pools {
            self.settle_pool_waiters(pool);
        }
        Ok(())
    }

    /// Fails `resource` (spec §4.4 "Failure"): state → Failed, `available()`
    /// becomes 0 until `end_failure`. Allocated amounts are not reclaimed —
    /// holders are only notified through `FailureActions`.
    pub fn begin_failure(&self, resource: ResourceId) -> KslResult<()> {
        let mut st = self.state.borrow_mut();
        let (name, holders) = {
            let res = st
                .resources
                .get_mut(resource)
                .ok_or_else(|| KslError::state_violation("unknown resource"))?;
            res.begin_failure();
            let holders: Vec<EntityId> = res.allocations.keys().copied().collect();
            (res.name.clone(), holders)
        };
        info!(resource = %name, "BeginFailure");
        st.failure_actions.on_begin_failure(&name, &holders);
        Ok(())
    }

    /// Clears a failure (spec §4.4 "Failure"): state leaves Failed and the
    /// resource's waiting queue (and any pool it belongs to) is rescanned,
    /// since capacity just became available again.
    pub fn end_failure(&self, resource: ResourceId) -> KslResult<()> {
        let mut st = self.state.borrow_mut();
        let name = {
            let res = st
                .resources
                .get_mut(resource)
                .ok_or_else(|| KslError::state_violation("unknown resource"))?;
            res.end_failure();
            res.name.clone()
        };
        info!(resource = %name, "EndFailure");
        st.failure_actions.on_end_failure(&name);
        let pools = st.resource_pools.get(&resource).cloned().unwrap_or_default();
        drop(st);
        self.settle_resource_waiters(resource);
        for pool in pools {
            self.settle_pool_waiters(pool);
        }
        Ok(())
    }

    /// Registers `schedule` against `resource` and applies its first item
    /// immediately (spec §4.4 "UseSchedule"): each
    /// `CapacityChangeNotice{new_capacity, duration}` holds for `duration`
    /// simulated time units before the next item (or, if `cyclic`, item 0
    /// again) takes over.
    pub fn use_schedule(&self, resource: ResourceId, schedule: CapacitySchedule) -> KslResult<()> {
        if schedule.items.is_empty() {
            return Err(KslError::invalid_argument("capacity schedule must have at least one item"));
        }
        {
            let mut st = self.state.borrow_mut();
            st.resources
                .get_mut(resource)
                .ok_or_else(|| KslError::state_violation("unknown resource"))?
                .schedule = Some(schedule);
        }
        self.apply_schedule_item(resource, 0);
        Ok(())
    }

    /// Applies item `index` of `resource`'s registered schedule and, if
    /// there is a next item (wrapping to 0 when `cyclic`), schedules it to
    /// fire after this item's `duration`.
    fn apply_schedule_item(&self, resource: ResourceId, index: usize) {
        let mut st = self.state.borrow_mut();
        let Some(res) = st.resources.get_mut(resource) else { return };
        let Some(schedule) = res.schedule.clone() else { return };
        let Some(item) = schedule.items.get(index).copied() else { return };
        let grew = res.apply_capacity_change(item.new_capacity);
        let name = res.name.clone();
        info!(resource = %name, new_capacity = item.new_capacity, duration = item.duration, "CapacityChangeNotice");
        let next_index = match index + 1 {
            next if next < schedule.items.len() => Some(next),
            _ if schedule.cyclic => Some(0),
            _ => None,
        };
        if let Some(next_index) = next_index {
            let model = self.clone();
            let _ = st.executive.schedule(
                item.duration,
                priority::RELEASE,
                Box::new(move || {
                    model.apply_schedule_item(resource, next_index);
                }),
            );
        }
        drop(st);
        if grew {
            self.settle_resource_waiters(resource);
            let pools = {
                let st = self.state.borrow();
                st.resource_pools.get(&resource).cloned().unwrap_or_default()
            };
            for pool in pools {
                self.settle_pool_waiters(pool);
            }
        }
    }

    /// Default `SelectRequestsFor`: walk the resource's waiting queue in
    /// discipline order, granting a request in full if it fits the
    /// remaining available amount, skipping (never partially granting) a
    /// request that would exceed it, and stopping once nothing remains
    /// (spec §4.4).
    fn settle_resource_waiters(&self, resource: ResourceId) {
        loop {
            let mut st = self.state.borrow_mut();
            let now = st.now();
            let Some(res) = st.resources.get_mut(resource) else { return };
            let remaining = res.available();
            if remaining == 0 || res.waiting.is_empty() {
                return;
            }
            let Some(req) = res.waiting.peek() else { return };
            if req.amount > remaining {
                // Head of queue cannot be satisfied yet; the default rule
                // never skips ahead of it (see DESIGN.md).
                return;
            }
            let req = res
                .waiting
                .remove_next(now, "resource.wait", st.counter.as_mut())
                .expect("peek just confirmed an entry");
            let id = st.allocations.insert(Allocation {
                entity: req.entity,
                amount: req.amount,
                time_allocated: now,
                time_deallocated: None,
            });
            st.resources.get_mut(resource).unwrap().note_allocate(req.entity, id, req.amount);
            st.alloc_resource.insert(id, resource);
            if let Some(e) = st.entities.get_mut(req.entity) {
                e.allocations.push(id);
            }
            drop(st);
            (req.resolve)(id);
        }
    }

    /// Default `SelectRequestsFor` for pools: re-plans the head request
    /// against current member-resource availability whenever a release
    /// might have satisfied it (spec §4.5: unblock once
    /// `Σ available_i >= amountNeeded`). Called after every release of a
    /// resource belonging to this pool.
    fn settle_pool_waiters(&self, pool: ResourcePoolId) {
        loop {
            let mut st = self.state.borrow_mut();
            let now = st.now();
            let amount = {
                let Some(p) = st.pools.get(pool) else { return };
                if p.waiting.is_empty() {
                    return;
                }
                let Some(req) = p.waiting.peek() else { return };
                req.amount
            };
            // Head of queue cannot be satisfied yet; the default rule never
            // skips ahead of it (see DESIGN.md).
            let Some(draws) = st.plan_pool_draws(pool, amount) else {
                return;
            };
            let req = {
                let p = st.pools.get_mut(pool).unwrap();
                p.waiting
                    .remove_next(now, "pool.wait", st.counter.as_mut())
                    .expect("peek just confirmed an entry")
            };
            let id = st.grant_pool_allocation(req.entity, req.amount, draws, now);
            drop(st);
            (req.resolve)(id);
        }
    }

    pub(crate) fn op_pool_seize(
        &self,
        entity: EntityId,
        process: ProcessId,
        pool: ResourcePoolId,
        amount: u32,
    ) -> KslResult<Suspend<PooledAllocationId>> {
        if amount < 1 {
            return Err(KslError::invalid_argument("seize amount must be >= 1"));
        }
        let mut st = self.state.borrow_mut();
        let now = st.now();
        if let Some(draws) = st.plan_pool_draws(pool, amount) {
            let id = st.grant_pool_allocation(entity, amount, draws, now);
            return Ok(Suspend::ready(id));
        }
        drop(st);
        let model = self.clone();
        Ok(Suspend::new(move |slot| {
            let mut st = model.state.borrow_mut();
            let now = st.now();
            let m2 = model.clone();
            if let Some(p) = st.pools.get_mut(pool) {
                p.waiting.enqueue(
                    PoolSeizeRequest {
                        entity,
                        amount,
                        resolve: Box::new(move |id| {
                            *slot.borrow_mut() = SuspendSlot::Ready(id);
                            schedule_resume(&m2, process, priority::SEIZE);
                        }),
                    },
                    0,
                    now,
                    true,
                );
            }
            if let Some(e) = st.entities.get_mut(entity) {
                e.park(SuspendType::Seize, None);
            }
        }))
    }

    pub fn release_pool(&self, pool: ResourcePoolId, pooled: PooledAllocationId) -> KslResult<()> {
        let (children, entity) = {
            let mut st = self.state.borrow_mut();
            let now = st.now();
            let pa = st
                .pooled_allocations
                .get_mut(pooled)
                .ok_or_else(|| KslError::state_violation("unknown pooled allocation"))?;
            if !pa.is_live() {
                return Err(KslError::state_violation("double release"));
            }
            pa.time_deallocated = Some(now);
            (pa.children.clone(), pa.entity)
        };
        for (resource, alloc) in &children {
            self.release(entity, *resource, *alloc)?;
        }
        let _ = pool;
        Ok(())
    }
}

impl<T> ModelState<T> {
    fn plan_pool_draws(&self, pool: ResourcePoolId, amount: u32) -> Option<Vec<(ResourceId, u32)>> {
        let p = self.pools.get(pool)?;
        let availability: Vec<(ResourceId, u32)> = p
            .resources
            .iter()
            .filter_map(|id| self.resources.get(*id).map(|r| (*id, r.available())))
            .collect();
        p.plan_draws(&availability, amount)
    }

    fn grant_pool_allocation(
        &mut self,
        entity: EntityId,
        amount: u32,
        draws: Vec<(ResourceId, u32)>,
        now: f64,
    ) -> PooledAllocationId {
        let mut children = Vec::with_capacity(draws.len());
        for (resource, draw_amount) in draws {
            let id = self.allocations.insert(Allocation {
                entity,
                amount: draw_amount,
                time_allocated: now,
                time_deallocated: None,
            });
            self.resources.get_mut(resource).unwrap().note_allocate(entity, id, draw_amount);
            self.alloc_resource.insert(id, resource);
            children.push((resource, id));
        }
        let pooled_id = self.pooled_allocations.insert(PooledAllocation {
            entity,
            amount_requested: amount,
            children: children.clone(),
            time_allocated: now,
            time_deallocated: None,
        });
        if let Some(e) = self.entities.get_mut(entity) {
            e.allocations.extend(children.iter().map(|(_, a)| *a));
        }
        pooled_id
    }

}

// -- signals & hold queues ------------------------------------------------

impl<T: 'static> Model<T> {
    pub(crate) fn op_hold(&self, entity: EntityId, process: ProcessId, queue: HoldQueueId) -> Suspend<()> {
        let model = self.clone();
        Suspend::new(move |slot| {
            let mut st = model.state.borrow_mut();
            let now = st.now();
            let m2 = model.clone();
            if let Some(q) = st.hold_queues.get_mut(queue) {
                q.park(
                    HoldEntry {
                        entity,
                        resolve: Box::new(move |priority| {
                            *slot.borrow_mut() = SuspendSlot::Ready(());
                            schedule_resume(&m2, process, priority);
                        }),
                    },
                    now,
                );
            }
            if let Some(e) = st.entities.get_mut(entity) {
                e.park(SuspendType::Hold, None);
            }
        })
    }

    /// Parks on `signal`'s internal queue until a `Model::signal` call's
    /// selector matches this entity (spec §4.2 "WaitForSignal", §4.6).
    pub(crate) fn await_signal(&self, entity: EntityId, process: ProcessId, signal: SignalId) -> Suspend<()> {
        let model = self.clone();
        Suspend::new(move |slot| {
            let mut st = model.state.borrow_mut();
            let now = st.now();
            let m2 = model.clone();
            if let Some(s) = st.signals.get_mut(signal) {
                s.queue.park(
                    HoldEntry {
                        entity,
                        resolve: Box::new(move |priority| {
                            *slot.borrow_mut() = SuspendSlot::Ready(());
                            schedule_resume(&m2, process, priority);
                        }),
                    },
                    now,
                );
            }
            if let Some(e) = st.entities.get_mut(entity) {
                e.park(SuspendType::WaitForSignal, None);
            }
        })
    }

    /// Resumes every entity `selector` picks out of a standalone hold
    /// queue, at `RESUME` priority.
    pub fn resume_held(&self, queue: HoldQueueId, selector: Selector) -> KslResult<usize> {
        let resolvers = {
            let mut st = self.state.borrow_mut();
            st.hold_queues
                .get_mut(queue)
                .ok_or_else(|| KslError::state_violation("unknown hold queue"))?
                .take_selected(&selector)
        };
        let n = resolvers.len();
        for resolve in resolvers {
            resolve(priority::RESUME);
        }
        Ok(n)
    }

    /// Resumes every entity `selector` picks out of `signal`'s queue, at
    /// the signal's configured resume priority (spec §4.6).
    pub fn signal(&self, signal: SignalId, selector: Selector) -> KslResult<usize> {
        let (resolvers, priority) = {
            let mut st = self.state.borrow_mut();
            let s = st
                .signals
                .get_mut(signal)
                .ok_or_else(|| KslError::state_violation("unknown signal"))?;
            (s.queue.take_selected(&selector), s.resume_priority)
        };
        let n = resolvers.len();
        for resolve in resolvers {
            resolve(priority);
        }
        Ok(n)
    }
}

// -- blocking queues --------------------------------------------------------

impl<T: 'static> Model<T> {
    pub(crate) fn op_send(
        &self,
        entity: EntityId,
        process: ProcessId,
        queue: BlockingQueueId,
        item: T,
    ) -> KslResult<Suspend<()>> {
        let mut st = self.state.borrow_mut();
        let q = st
            .blocking_queues
            .get_mut(queue)
            .ok_or_else(|| KslError::state_violation("unknown blocking queue"))?;
        match q.offer(item) {
            Ok(()) => {
                q.settle();
                Ok(Suspend::ready(()))
            }
            Err(item) => {
                drop(st);
                let model = self.clone();
                Ok(Suspend::new(move |slot| {
                    let mut st = model.state.borrow_mut();
                    let m2 = model.clone();
                    if let Some(q) = st.blocking_queues.get_mut(queue) {
                        q.park_sender(PendingSend {
                            item,
                            resolve: Box::new(move || {
                                *slot.borrow_mut() = SuspendSlot::Ready(());
                                schedule_resume(&m2, process, priority::RESUME);
                            }),
                        });
                    }
                    if let Some(e) = st.entities.get_mut(entity) {
                        e.park(SuspendType::Send, None);
                    }
                }))
            }
        }
    }

    pub(crate) fn op_receive(
        &self,
        entity: EntityId,
        process: ProcessId,
        queue: BlockingQueueId,
        amount: usize,
        predicate: Box<dyn Fn(&T) -> bool>,
    ) -> KslResult<Suspend<Vec<T>>> {
        if amount == 0 {
            return Err(KslError::invalid_argument("receive amount must be >= 1"));
        }
        let mut st = self.state.borrow_mut();
        let q = st
            .blocking_queues
            .get_mut(queue)
            .ok_or_else(|| KslError::state_violation("unknown blocking queue"))?;
        if let Some(items) = q.poll(amount, predicate.as_ref()) {
            q.settle();
            return Ok(Suspend::ready(items));
        }
        drop(st);
        let model = self.clone();
        Ok(Suspend::new(move |slot| {
            let mut st = model.state.borrow_mut();
            let m2 = model.clone();
            if let Some(q) = st.blocking_queues.get_mut(queue) {
                q.park_receiver(PendingReceive {
                    amount,
                    predicate,
                    resolve: Box::new(move |items| {
                        *slot.borrow_mut() = SuspendSlot::Ready(items);
                        schedule_resume(&m2, process, priority::RESUME);
                    }),
                });
            }
            if let Some(e) = st.entities.get_mut(entity) {
                e.park(SuspendType::WaitForItems, None);
            }
        }))
    }
}

// -- conveyors ---------------------------------------------------------------

impl<T: 'static> Model<T> {
    pub(crate) fn op_request_conveyor(
        &self,
        entity: EntityId,
        process: ProcessId,
        conveyor: ConveyorId,
        entry_location: String,
        num_cells_needed: usize,
    ) -> KslResult<Suspend<ConveyorRequestId>> {
        let mut st = self.state.borrow_mut();
        let start = st
            .conveyors
            .get_mut(conveyor)
            .ok_or_else(|| KslError::state_violation("unknown conveyor"))?
            .try_request(&entry_location, num_cells_needed)?;
        match start {
            Some(start_cell) => {
                let req = ConveyorRequest {
                    entity,
                    num_cells_needed,
                    state: RequestState::BlockingEntry,
                    front_cell: start_cell + num_cells_needed - 1,
                    dest_cell: None,
                };
                let id = st.conveyor_requests.insert(RefCell::new(req));
                st.request_conveyor.insert(id, conveyor);
                st.conveyors.get_mut(conveyor).unwrap().grant_entry(id, start_cell, num_cells_needed);
                Ok(Suspend::ready(id))
            }
            None => {
                let entry_cell = st.conveyors.get(conveyor).unwrap().entry_cell_of(&entry_location)?;
                let req = ConveyorRequest {
                    entity,
                    num_cells_needed,
                    state: RequestState::WaitingForEntry,
                    front_cell: entry_cell,
                    dest_cell: None,
                };
                let id = st.conveyor_requests.insert(RefCell::new(req));
                st.request_conveyor.insert(id, conveyor);
                st.conveyors.get_mut(conveyor).unwrap().park_entry(id, entry_cell, num_cells_needed);
                if let Some(e) = st.entities.get_mut(entity) {
                    e.park(SuspendType::RequestConveyor, None);
                }
                drop(st);
                let model = self.clone();
                Ok(Suspend::new(move |slot| {
                    let mut st = model.state.borrow_mut();
                    let m2 = model.clone();
                    st.entry_resolvers.insert(
                        id,
                        Box::new(move |_start_cell| {
                            *slot.borrow_mut() = SuspendSlot::Ready(id);
                            schedule_resume(&m2, process, priority::CONVEYOR_REQUEST);
                        }),
                    );
                }))
            }
        }
    }

    /// Grants every entry waiter on `conveyor` that now fits, in FIFO order,
    /// until none remain (spec §4.8: checked after every `ExitConveyor`).
    fn settle_conveyor_entries(&self, conveyor: ConveyorId) {
        loop {
            let granted = {
                let mut st = self.state.borrow_mut();
                let Some(c) = st.conveyors.get_mut(conveyor) else { return };
                let Some((id, start_cell, n)) = c.next_grantable_entry() else {
                    return;
                };
                c.grant_entry(id, start_cell, n);
                if let Some(cell) = st.conveyor_requests.get(id) {
                    let mut req = cell.borrow_mut();
                    req.state = RequestState::BlockingEntry;
                    req.front_cell = start_cell + n - 1;
                }
                (id, start_cell, st.entry_resolvers.remove(&id))
            };
            if let (id, start_cell, Some(resolve)) = granted {
                let _ = id;
                resolve(start_cell);
            }
        }
    }

    pub(crate) fn op_ride(
        &self,
        process: ProcessId,
        request: ConveyorRequestId,
        dest_location: String,
    ) -> KslResult<Suspend<()>> {
        let conveyor = {
            let mut st = self.state.borrow_mut();
            let conveyor = *st
                .request_conveyor
                .get(&request)
                .ok_or_else(|| KslError::state_violation("unknown conveyor request"))?;
            let dest_cell = st
                .conveyors
                .get(conveyor)
                .ok_or_else(|| KslError::state_violation("unknown conveyor"))?
                .exit_cell_of(&dest_location)?;
            let cell = st
                .conveyor_requests
                .get(request)
                .ok_or_else(|| KslError::state_violation("unknown conveyor request"))?;
            let mut req = cell.borrow_mut();
            st.conveyors.get_mut(conveyor).unwrap().ride(&mut req, dest_cell);
            conveyor
        };
        self.ensure_conveyor_ticking(conveyor);
        let model = self.clone();
        Ok(Suspend::new(move |slot| {
            let mut st = model.state.borrow_mut();
            let m2 = model.clone();
            st.ride_resolvers.insert(
                request,
                Box::new(move || {
                    *slot.borrow_mut() = SuspendSlot::Ready(());
                    schedule_resume(&m2, process, priority::CONVEYOR_EXIT);
                }),
            );
        }))
    }

    pub fn exit_conveyor(&self, request: ConveyorRequestId) -> KslResult<()> {
        let conveyor = {
            let mut st = self.state.borrow_mut();
            let conveyor = *st
                .request_conveyor
                .get(&request)
                .ok_or_else(|| KslError::state_violation("unknown conveyor request"))?;
            {
                let cell = st
                    .conveyor_requests
                    .get(request)
                    .ok_or_else(|| KslError::state_violation("unknown conveyor request"))?;
                if cell.borrow().state != RequestState::BlockingExit {
                    return Err(KslError::precondition(
                        "exit_conveyor called before the request reached its destination",
                    ));
                }
                let mut req = cell.borrow_mut();
                st.conveyors.get_mut(conveyor).unwrap().exit(&req);
                req.state = RequestState::Completed;
            }
            st.conveyor_requests.remove(request);
            st.request_conveyor.remove(&request);
            conveyor
        };
        self.settle_conveyor_entries(conveyor);
        Ok(())
    }

    fn ensure_conveyor_ticking(&self, conveyor: ConveyorId) {
        let dt = {
            let mut st = self.state.borrow_mut();
            if !st.ticking_conveyors.insert(conveyor) {
                return;
            }
            st.conveyors.get(conveyor).map(|c| c.cell_time()).unwrap_or(0.0)
        };
        self.schedule_conveyor_tick(conveyor, dt);
    }

    fn schedule_conveyor_tick(&self, conveyor: ConveyorId, dt: f64) {
        let model = self.clone();
        let mut st = self.state.borrow_mut();
        let _ = st
            .executive
            .schedule(dt, priority::DELAY, Box::new(move || model.run_conveyor_tick(conveyor)));
    }

    fn run_conveyor_tick(&self, conveyor: ConveyorId) {
        let (arrived, still_moving, dt) = {
            let mut st = self.state.borrow_mut();
            let ids: Vec<ConveyorRequestId> = st
                .request_conveyor
                .iter()
                .filter(|(_, c)| **c == conveyor)
                .map(|(id, _)| *id)
                .filter(|id| st.conveyor_requests.contains_key(*id))
                .collect();
            let mut borrows: Vec<_> = ids.iter().map(|id| st.conveyor_requests[*id].borrow_mut()).collect();
            let mut pairs: Vec<(ConveyorRequestId, &mut ConveyorRequest)> = ids
                .iter()
                .zip(borrows.iter_mut())
                .map(|(id, r)| (*id, &mut **r))
                .collect();
            let Some(c) = st.conveyors.get_mut(conveyor) else {
                return;
            };
            let arrived = c.tick(&mut pairs);
            let dt = c.cell_time();
            let still_moving = c.in_motion;
            drop(pairs);
            drop(borrows);
            (arrived, still_moving, dt)
        };
        for id in arrived {
            let resolve = {
                let mut st = self.state.borrow_mut();
                st.ride_resolvers.remove(&id)
            };
            if let Some(resolve) = resolve {
                resolve();
            }
        }
        if still_moving {
            self.schedule_conveyor_tick(conveyor, dt);
        } else {
            self.state.borrow_mut().ticking_conveyors.remove(&conveyor);
        }
    }
}

// -- movement, process synchronization, termination -------------------------

impl<T: 'static> Model<T> {
    pub(crate) fn op_move(
        &self,
        entity: EntityId,
        process: ProcessId,
        destination: String,
        speed: f64,
    ) -> KslResult<Suspend<()>> {
        if !speed.is_finite() || speed <= 0.0 {
            return Err(KslError::invalid_argument("speed must be positive and finite"));
        }
        let dt = {
            let mut st = self.state.borrow_mut();
            let from = st.entities.get(entity).map(|e| e.location.clone()).unwrap_or_default();
            let distance = st.distance.distance(&from, &destination);
            if let Some(e) = st.entities.get_mut(entity) {
                e.location = destination;
                e.park(SuspendType::Move, None);
            }
            distance / speed
        };
        self.op_delay(entity, process, dt, priority::MOVE)
    }

    /// Parks the caller until `awaited` reaches `Completed`/`Terminated`
    /// (spec §4.2 "WaitFor"). Resolves immediately if it already has.
    pub(crate) fn op_wait_for(&self, awaited: ProcessId, process: ProcessId) -> Suspend<()> {
        let model = self.clone();
        Suspend::new(move |slot| {
            let mut st = model.state.borrow_mut();
            let finished = st.processes.get(awaited).map(KSLProcess::is_finished).unwrap_or(true);
            if finished {
                *slot.borrow_mut() = SuspendSlot::Ready(());
                drop(st);
                schedule_resume(&model, process, priority::RESUME);
                return;
            }
            let m2 = model.clone();
            st.completion_waiters.entry(awaited).or_default().push(Box::new(move || {
                *slot.borrow_mut() = SuspendSlot::Ready(());
                schedule_resume(&m2, process, priority::RESUME);
            }));
        })
    }

    /// Forces `process` to `Terminated` right away without polling it again,
    /// releases every resource allocation its entity still holds, and wakes
    /// anyone parked on its completion (spec §4.2 "RemoveAndTerminate").
    /// A no-op if the process already finished on its own.
    pub fn terminate(&self, process: ProcessId) -> KslResult<()> {
        let (entity, already_finished) = {
            let mut st = self.state.borrow_mut();
            let p = st
                .processes
                .get_mut(process)
                .ok_or_else(|| KslError::state_violation("unknown process"))?;
            if p.is_finished() {
                (p.entity, true)
            } else {
                p.future = None;
                p.state = ProcessState::Terminated;
                p.completion_time = Some(st.executive.now());
                (p.entity, false)
            }
        };
        if already_finished {
            return Ok(());
        }
        let live_allocations: Vec<(AllocationId, ResourceId)> = {
            let st = self.state.borrow();
            st.entities
                .get(entity)
                .map(|e| {
                    e.allocations
                        .iter()
                        .filter_map(|a| st.alloc_resource.get(a).map(|r| (*a, *r)))
                        .collect()
                })
                .unwrap_or_default()
        };
        for (alloc, resource) in live_allocations {
            let _ = self.release(entity, resource, alloc);
        }
        let mut st = self.state.borrow_mut();
        if let Some(e) = st.entities.get_mut(entity) {
            e.state = EntityState::Terminated;
        }
        if let Some(p) = st.processes.get_mut(process) {
            if let Some(hook) = p.after_termination.take() {
                drop(st);
                hook();
                st = self.state.borrow_mut();
            }
        }
        let waiters = st.completion_waiters.remove(&process).unwrap_or_default();
        drop(st);
        for wake in waiters {
            wake();
        }
        Ok(())
    }
}
