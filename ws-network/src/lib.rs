//! Deterministic network identities for workspace VMs.
//!
//! Every workspace gets a numbered slot. The slot alone decides the TAP
//! device name, the /30 block inside `172.16.0.0/16`, the host and guest
//! addresses and the guest MAC, so two live slots can never collide.

pub mod allocation;
pub mod allocator;

pub use allocation::{SlotAllocation, POOL_SIZE};
pub use allocator::SlotAllocator;
