//! Pools of finalized backing buffers.
//!
//! Each pool holds one full set of buffers described by a [`PoolLayout`]. A
//! workload run borrows one pool for its whole duration, so `num_pools`
//! bounds how many runs of the same plan may be in flight.

use std::fmt;

use crate::error::{GraphError, GraphResult, Status};
use crate::memory::allocator::{Allocator, Buffer};
use crate::memory::lifetime::PoolLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolId(pub usize);

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool#{}", self.0)
    }
}

#[derive(Debug)]
struct Pool {
    buffers: Vec<Buffer>,
    in_use: bool,
}

#[derive(Debug)]
pub struct PoolManager {
    num_pools: usize,
    pools: Vec<Pool>,
}

impl PoolManager {
    pub fn new(num_pools: usize) -> Self {
        Self {
            num_pools: num_pools.max(1),
            pools: Vec::new(),
        }
    }

    pub fn num_pools(&self) -> usize {
        self.num_pools
    }

    pub fn is_finalized(&self) -> bool {
        !self.pools.is_empty()
    }

    pub fn num_acquired(&self) -> usize {
        self.pools.iter().filter(|p| p.in_use).count()
    }

    /// Allocate `num_pools` buffer sets matching `layout`, replacing earlier ones.
    pub fn finalize(
        &mut self,
        layout: &PoolLayout,
        allocator: &dyn Allocator,
        alignment: usize,
    ) -> Status {
        if self.num_acquired() > 0 {
            return Err(GraphError::InternalError(
                "cannot re-finalize pools while one is acquired".to_string(),
            ));
        }

        let mut pools = Vec::with_capacity(self.num_pools);
        for _ in 0..self.num_pools {
            let buffers = layout
                .buffer_sizes
                .iter()
                .map(|&bytes| allocator.allocate(bytes, alignment))
                .collect::<GraphResult<Vec<_>>>()?;
            pools.push(Pool {
                buffers,
                in_use: false,
            });
        }
        self.pools = pools;
        Ok(())
    }

    /// Lend out the first free pool.
    pub fn acquire(&mut self) -> GraphResult<PoolId> {
        if !self.is_finalized() {
            return Err(GraphError::MemoryManagerNotFinalized(
                "pools have not been allocated".to_string(),
            ));
        }
        let (idx, pool) = self
            .pools
            .iter_mut()
            .enumerate()
            .find(|(_, p)| !p.in_use)
            .ok_or_else(|| {
                GraphError::InternalError(format!("all {} pools are in use", self.num_pools))
            })?;
        pool.in_use = true;
        Ok(PoolId(idx))
    }

    pub fn release(&mut self, id: PoolId) -> Status {
        match self.pools.get_mut(id.0) {
            Some(pool) if pool.in_use => {
                pool.in_use = false;
                Ok(())
            }
            Some(_) => Err(GraphError::InternalError(format!("{} was not acquired", id))),
            None => Err(GraphError::InternalError(format!("unknown {}", id))),
        }
    }

    pub fn buffers(&self, id: PoolId) -> GraphResult<&[Buffer]> {
        self.acquired(id).map(|p| p.buffers.as_slice())
    }

    pub fn buffers_mut(&mut self, id: PoolId) -> GraphResult<&mut [Buffer]> {
        match self.pools.get_mut(id.0) {
            Some(pool) if pool.in_use => Ok(pool.buffers.as_mut_slice()),
            _ => Err(GraphError::InvalidHandle(format!("{} is not acquired", id))),
        }
    }

    fn acquired(&self, id: PoolId) -> GraphResult<&Pool> {
        match self.pools.get(id.0) {
            Some(pool) if pool.in_use => Ok(pool),
            _ => Err(GraphError::InvalidHandle(format!("{} is not acquired", id))),
        }
    }
}
