//! The public suspension-operation surface a process body awaits against
//! (spec §4.2's table, one method per row).
//!
//! A process is an ordinary `async move { ... }` block built from a
//! `ProcessContext<T>` and handed to [`crate::model::Model::spawn_process`].
//! Every method here does the synchronous validation it can do immediately,
//! then constructs and awaits the one [`crate::process::Suspend`] future that
//! backs the corresponding row of `Model<T>`'s suspension-op implementations.

use crate::error::KslResult;
use crate::ids::{
    AllocationId, BlockingQueueId, ConveyorId, ConveyorRequestId, EntityId, HoldQueueId,
    PooledAllocationId, ProcessId, ResourceId, ResourcePoolId, SignalId,
};
use crate::model::Model;
use crate::priority;

/// What a process body holds onto: which entity it drives, its own id (for
/// wiring resolvers back to the right resume event), and the model it runs
/// against.
pub struct ProcessContext<T> {
    entity: EntityId,
    process: ProcessId,
    model: Model<T>,
}

impl<T> Clone for ProcessContext<T> {
    fn clone(&self) -> Self {
        ProcessContext {
            entity: self.entity,
            process: self.process,
            model: self.model.clone(),
        }
    }
}

impl<T: 'static> ProcessContext<T> {
    pub(crate) fn new(entity: EntityId, process: ProcessId, model: Model<T>) -> Self {
        ProcessContext {
            entity,
            process,
            model,
        }
    }

    pub fn entity(&self) -> EntityId {
        self.entity
    }

    pub fn process(&self) -> ProcessId {
        self.process
    }

    pub fn model(&self) -> &Model<T> {
        &self.model
    }

    pub fn now(&self) -> f64 {
        self.model.now()
    }

    /// Suspends for `dt` simulated time units (spec §4.2 "Delay").
    pub async fn delay(&self, dt: f64) -> KslResult<()> {
        self.model
            .op_delay(self.entity, self.process, dt, priority::DELAY)?
            .await;
        Ok(())
    }

    /// Yields control at `priority`, resuming at the same simulated time
    /// (spec §4.2 "Yield" — lets other same-time events run first).
    pub async fn yield_now(&self) {
        self.model
            .op_yield(self.entity, self.process, priority::YIELD)
            .await;
    }

    /// Requests `amount` units of `resource`, parking if not immediately
    /// available (spec §4.2 "Seize", §4.4).
    pub async fn seize(&self, resource: ResourceId, amount: u32) -> KslResult<AllocationId> {
        Ok(self
            .model
            .op_seize(self.entity, self.process, resource, amount)?
            .await)
    }

    /// Releases a previously granted allocation (spec §4.2 "Release").
    pub fn release(&self, resource: ResourceId, allocation: AllocationId) -> KslResult<()> {
        self.model.release(self.entity, resource, allocation)
    }

    /// Requests `amount` units drawn across a pool's member resources,
    /// parking if the pool cannot currently cover it (spec §4.5).
    pub async fn seize_pool(&self, pool: ResourcePoolId, amount: u32) -> KslResult<PooledAllocationId> {
        Ok(self
            .model
            .op_pool_seize(self.entity, self.process, pool, amount)?
            .await)
    }

    pub fn release_pool(&self, pool: ResourcePoolId, pooled: PooledAllocationId) -> KslResult<()> {
        self.model.release_pool(pool, pooled)
    }

    /// Parks on a standalone hold queue until a matching `resume_held` call
    /// picks this entity (spec §4.2 "Hold").
    pub async fn hold(&self, queue: HoldQueueId) {
        self.model.op_hold(self.entity, self.process, queue).await;
    }

    /// Parks on `signal` until a `Model::signal` call's selector matches
    /// this entity (spec §4.2 "WaitForSignal", §4.6). Implemented the same
    /// way as `hold`: a signal's queue is itself a `HoldQueue`.
    pub async fn wait_for_signal(&self, signal: SignalId) {
        self.model
            .await_signal(self.entity, self.process, signal)
            .await;
    }

    /// Sends `item` into `queue`, parking if it is full (spec §4.2 "Send",
    /// §4.7).
    pub async fn send(&self, queue: BlockingQueueId, item: T) -> KslResult<()> {
        self.model
            .op_send(self.entity, self.process, queue, item)?
            .await;
        Ok(())
    }

    /// Receives `amount` items matching `predicate` from `queue`, parking
    /// until enough are available (spec §4.2 "WaitForItems", §4.7).
    pub async fn receive(
        &self,
        queue: BlockingQueueId,
        amount: usize,
        predicate: impl Fn(&T) -> bool + 'static,
    ) -> KslResult<Vec<T>> {
        Ok(self
            .model
            .op_receive(self.entity, self.process, queue, amount, Box::new(predicate))?
            .await)
    }

    /// Parks until `awaited` reaches `Completed` or `Terminated` (spec §4.2
    /// "WaitFor").
    pub async fn wait_for(&self, awaited: ProcessId) {
        self.model.op_wait_for(awaited, self.process).await;
    }

    /// Parks until `awaited` finishes, same as `wait_for` (spec §4.2
    /// "BlockUntilCompleted" is the pool/fork-join-flavored alias for the
    /// same underlying wait).
    pub async fn block_until_completed(&self, awaited: ProcessId) {
        self.model.op_wait_for(awaited, self.process).await;
    }

    /// Reserves room to enter `conveyor` at `entry_location`, parking until
    /// `num_cells_needed` contiguous cells are free there (spec §4.2
    /// "RequestConveyor", §4.8).
    pub async fn request_conveyor(
        &self,
        conveyor: ConveyorId,
        entry_location: impl Into<String>,
        num_cells_needed: usize,
    ) -> KslResult<ConveyorRequestId> {
        Ok(self
            .model
            .op_request_conveyor(
                self.entity,
                self.process,
                conveyor,
                entry_location.into(),
                num_cells_needed,
            )?
            .await)
    }

    /// Begins riding a granted request toward `dest_location`'s segment
    /// exit, parking until it arrives (spec §4.2 "RideConveyor").
    pub async fn ride_conveyor(
        &self,
        request: ConveyorRequestId,
        dest_location: impl Into<String>,
    ) -> KslResult<()> {
        self.model
            .op_ride(self.process, request, dest_location.into())?
            .await;
        Ok(())
    }

    /// Releases the cells held by a request that has reached
    /// `BlockingExit` (spec §4.2 "ExitConveyor").
    pub fn exit_conveyor(&self, request: ConveyorRequestId) -> KslResult<()> {
        self.model.exit_conveyor(request)
    }

    /// Moves the entity to `destination` at `speed`, parking for the
    /// travel time the model's `DistanceOracle` reports (spec §4.2
    /// "Move"/"TransferTo").
    pub async fn transfer_to(&self, destination: impl Into<String>, speed: f64) -> KslResult<()> {
        self.model
            .op_move(self.entity, self.process, destination.into(), speed)?
            .await;
        Ok(())
    }
}
