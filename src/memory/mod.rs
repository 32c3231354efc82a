//! Memory management for graph workloads
//!
//! Tensors that are not pinned by graph inputs, outputs or constants are not
//! given their own buffers. Instead the workload builder registers each one
//! with the target's memory manager together with the task steps during
//! which it is live. Tensors whose live ranges never overlap are grouped and
//! share one region.
//!
//! # Pattern
//!
//! 1. `manage` every transient tensor with its `[first_use, last_use + 1)` range
//! 2. Group allocations first-fit by lifetime (blob or offset strategy)
//! 3. `finalize` allocates `num_pools` copies of the grouped buffers
//! 4. Each run acquires one pool, commits and releases handles per task

pub mod allocator;
pub mod lifetime;
pub mod manager;
pub mod pool;

pub use allocator::{align_up, Allocator, AllocatorStats, Buffer, HostAllocator};
pub use lifetime::{
    AllocationId, BlobLifetimeManager, Lifetime, LifetimeGroup, LifetimeManager,
    ManagedAllocation, OffsetLifetimeManager, PoolLayout, Region,
};
pub use manager::MemoryManagerOnDemand;
pub use pool::{PoolId, PoolManager};
