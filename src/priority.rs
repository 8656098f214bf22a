//! Well-known event priorities (spec §6). Lower value fires earlier at the
//! same simulated time. User code may override with any `i32`; these are
//! only the defaults the builder API reaches for.

pub type Priority = i32;

pub const INTERRUPT: Priority = 1;
pub const CONVEYOR_EXIT: Priority = 2;
pub const CONVEYOR_REQUEST: Priority = 3;
pub const TRANSPORT_REQUEST: Priority = 4;
pub const SEIZE: Priority = 5;
pub const RELEASE: Priority = 6;
pub const RESUME: Priority = 7;
pub const WAIT_FOR: Priority = 8;
pub const BLOCKAGE: Priority = 9;
pub const DELAY: Priority = 10;
pub const MOVE: Priority = 10;
pub const YIELD: Priority = 11;
pub const QUEUE: Priority = 12;
