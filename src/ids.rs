//! Arena handle types (spec §3.1 / §9 "cyclic ownership").
//!
//! Entities, processes, resources, pools, signals, blocking queues and
//! conveyors are owned by one [`crate::model::Model`] in `slotmap::SlotMap`s.
//! Everything else refers to them by one of these `Copy` handles instead of
//! a strong pointer, so the Resource/Allocation/Entity triangle never needs
//! `Rc`/`Weak` bookkeeping.

use slotmap::new_key_type;

new_key_type! {
    pub struct EntityId;
    pub struct ProcessId;
    pub struct ResourceId;
    pub struct ResourcePoolId;
    pub struct SignalId;
    pub struct HoldQueueId;
    pub struct BlockingQueueId;
    pub struct ConveyorId;
    pub struct AllocationId;
    pub struct PooledAllocationId;
    pub struct ConveyorRequestId;
}
