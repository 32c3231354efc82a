//! On-demand memory manager: lifetime planning plus pooled backing storage.

use crate::error::{GraphError, GraphResult, Status};
use crate::graph::types::MemoryManagerAffinity;
use crate::memory::allocator::Allocator;
use crate::memory::lifetime::{
    lifetime_manager_for, AllocationId, Lifetime, LifetimeManager, ManagedAllocation, PoolLayout,
    Region,
};
use crate::memory::pool::{PoolId, PoolManager};

/// Memory manager for one target.
///
/// Allocations are registered with [`manage`](Self::manage) while a workload
/// is planned. [`finalize`](Self::finalize) freezes the layout and allocates
/// the pools; after that a run may [`acquire`](Self::acquire) a pool.
/// Registering more allocations after finalize marks the manager dirty and
/// a new finalize is required.
#[derive(Debug)]
pub struct MemoryManagerOnDemand {
    lifetime: Box<dyn LifetimeManager>,
    pools: PoolManager,
    alignment: usize,
    layout: Option<PoolLayout>,
    next_id: usize,
    finalized: bool,
    dirty: bool,
}

impl MemoryManagerOnDemand {
    pub fn new(affinity: MemoryManagerAffinity, num_pools: usize, alignment: usize) -> Self {
        Self {
            lifetime: lifetime_manager_for(affinity),
            pools: PoolManager::new(num_pools),
            alignment,
            layout: None,
            next_id: 0,
            finalized: false,
            dirty: false,
        }
    }

    pub fn affinity(&self) -> MemoryManagerAffinity {
        self.lifetime.affinity()
    }

    pub fn num_pools(&self) -> usize {
        self.pools.num_pools()
    }

    pub fn num_allocations(&self) -> usize {
        self.lifetime.allocations().len()
    }

    /// Register an allocation of `size` bytes live during `lifetime`.
    pub fn manage(&mut self, size: usize, lifetime: Lifetime) -> GraphResult<AllocationId> {
        if self.pools.num_acquired() > 0 {
            return Err(GraphError::InternalError(
                "manage called while a pool is acquired".to_string(),
            ));
        }

        let id = AllocationId(self.next_id);
        self.lifetime.register(ManagedAllocation { id, size, lifetime })?;
        self.next_id += 1;

        if self.finalized {
            self.dirty = true;
        }
        Ok(id)
    }

    /// Drop an allocation from planning, e.g. when its workload is discarded.
    ///
    /// Like [`manage`](Self::manage), this marks a finalized manager dirty.
    /// Returns false if `allocation` is not registered.
    pub fn unmanage(&mut self, allocation: AllocationId) -> GraphResult<bool> {
        if self.pools.num_acquired() > 0 {
            return Err(GraphError::InternalError(
                "unmanage called while a pool is acquired".to_string(),
            ));
        }
        let removed = self.lifetime.remove(allocation);
        if removed && self.finalized {
            self.dirty = true;
        }
        Ok(removed)
    }

    /// Compute the group layout of everything registered so far.
    pub fn allocate(&mut self) -> &PoolLayout {
        self.layout.insert(self.lifetime.compute_layout(self.alignment))
    }

    /// Freeze the layout and allocate pools. No-op when already finalized.
    pub fn finalize(&mut self, allocator: &dyn Allocator) -> Status {
        if self.is_finalized() {
            return Ok(());
        }

        let layout = self.lifetime.compute_layout(self.alignment);
        self.pools.finalize(&layout, allocator, self.alignment)?;
        tracing::info!(
            "Memory manager finalized: affinity={:?}, allocations={}, groups={}, bytes/pool={}, pools={}",
            self.affinity(),
            layout.num_allocations(),
            layout.num_groups(),
            layout.total_bytes(),
            self.pools.num_pools()
        );

        self.layout = Some(layout);
        self.finalized = true;
        self.dirty = false;
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized && !self.dirty
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn layout(&self) -> Option<&PoolLayout> {
        self.layout.as_ref()
    }

    pub fn acquire(&mut self) -> GraphResult<PoolId> {
        if !self.finalized {
            return Err(GraphError::MemoryManagerNotFinalized(
                "acquire before finalize".to_string(),
            ));
        }
        if self.dirty {
            return Err(GraphError::MemoryManagerNotFinalized(
                "allocations were added after finalize".to_string(),
            ));
        }
        self.pools.acquire()
    }

    pub fn release(&mut self, pool: PoolId) -> Status {
        self.pools.release(pool)
    }

    pub fn region(&self, allocation: AllocationId) -> Option<Region> {
        self.layout.as_ref().and_then(|l| l.region(allocation))
    }

    /// F32 view of an allocation inside an acquired pool.
    pub fn slice(&self, pool: PoolId, allocation: AllocationId) -> GraphResult<&[f32]> {
        let (buffer, range) = self.locate(allocation)?;
        self.pools
            .buffers(pool)?
            .get(buffer)
            .and_then(|b| b.as_f32().get(range.clone()))
            .ok_or_else(|| out_of_range(allocation, &range))
    }

    pub fn slice_mut(&mut self, pool: PoolId, allocation: AllocationId) -> GraphResult<&mut [f32]> {
        let (buffer, range) = self.locate(allocation)?;
        self.pools
            .buffers_mut(pool)?
            .get_mut(buffer)
            .and_then(|b| b.as_f32_mut().get_mut(range.clone()))
            .ok_or_else(|| out_of_range(allocation, &range))
    }

    fn locate(&self, allocation: AllocationId) -> GraphResult<(usize, std::ops::Range<usize>)> {
        if !self.is_finalized() {
            return Err(GraphError::MemoryManagerNotFinalized(format!(
                "{} accessed before finalize",
                allocation
            )));
        }
        let region = self
            .region(allocation)
            .ok_or_else(|| GraphError::InvalidHandle(format!("unknown {}", allocation)))?;
        let start = region.offset / 4;
        Ok((region.buffer, start..start + region.size.div_ceil(4)))
    }
}

fn out_of_range(allocation: AllocationId, range: &std::ops::Range<usize>) -> GraphError {
    GraphError::InternalError(format!(
        "{} words {:?} outside of its pool buffer",
        allocation, range
    ))
}
