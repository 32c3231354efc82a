//! Per-graph execution context: configuration plus one memory manager per target.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::Status;
use crate::graph::config::GraphConfig;
use crate::graph::types::Target;
use crate::memory::allocator::Allocator;
use crate::memory::manager::MemoryManagerOnDemand;

/// Memory manager of one target together with the allocator backing it
pub struct MemoryManagerContext {
    pub target: Target,
    pub mm: MemoryManagerOnDemand,
    pub allocator: Arc<dyn Allocator>,
}

impl fmt::Debug for MemoryManagerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryManagerContext")
            .field("target", &self.target)
            .field("mm", &self.mm)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct GraphContext {
    config: GraphConfig,
    memory_managers: HashMap<Target, MemoryManagerContext>,
}

impl GraphContext {
    pub fn new(config: GraphConfig) -> Self {
        Self {
            config,
            memory_managers: HashMap::new(),
        }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: GraphConfig) {
        self.config = config;
    }

    /// Register a memory manager for its target.
    ///
    /// Returns false, leaving the existing context untouched, if the target
    /// is unspecified or already has one.
    pub fn insert_memory_management_ctx(&mut self, ctx: MemoryManagerContext) -> bool {
        if ctx.target == Target::Unspecified || self.memory_managers.contains_key(&ctx.target) {
            return false;
        }
        tracing::debug!(
            "Registered {:?} memory manager for {}",
            ctx.mm.affinity(),
            ctx.target
        );
        self.memory_managers.insert(ctx.target, ctx);
        true
    }

    pub fn memory_management_ctx(&mut self, target: Target) -> Option<&mut MemoryManagerContext> {
        self.memory_managers.get_mut(&target)
    }

    pub fn memory_management_ctx_ref(&self, target: Target) -> Option<&MemoryManagerContext> {
        self.memory_managers.get(&target)
    }

    pub fn has_memory_management_ctx(&self, target: Target) -> bool {
        self.memory_managers.contains_key(&target)
    }

    /// Finalize every memory manager. Already finalized managers are skipped.
    pub fn finalize(&mut self) -> Status {
        for ctx in self.memory_managers.values_mut() {
            ctx.mm.finalize(ctx.allocator.as_ref())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::types::MemoryManagerAffinity;
    use crate::memory::allocator::HostAllocator;
    use crate::memory::lifetime::Lifetime;

    fn mm_ctx(target: Target, affinity: MemoryManagerAffinity) -> MemoryManagerContext {
        MemoryManagerContext {
            target,
            mm: MemoryManagerOnDemand::new(affinity, 1, 64),
            allocator: Arc::new(HostAllocator::new()),
        }
    }

    #[test]
    fn test_duplicate_insert_keeps_first() {
        let mut ctx = GraphContext::default();
        assert!(ctx.insert_memory_management_ctx(mm_ctx(Target::Cpu, MemoryManagerAffinity::Buffer)));
        assert!(!ctx.insert_memory_management_ctx(mm_ctx(Target::Cpu, MemoryManagerAffinity::Offset)));
        assert_eq!(
            ctx.memory_management_ctx(Target::Cpu).unwrap().mm.affinity(),
            MemoryManagerAffinity::Buffer
        );
    }

    #[test]
    fn test_unspecified_target_rejected() {
        let mut ctx = GraphContext::default();
        assert!(!ctx.insert_memory_management_ctx(mm_ctx(
            Target::Unspecified,
            MemoryManagerAffinity::Buffer
        )));
        assert!(ctx.memory_management_ctx(Target::Unspecified).is_none());
    }

    #[test]
    fn test_finalize_every_manager() {
        let mut ctx = GraphContext::default();
        ctx.insert_memory_management_ctx(mm_ctx(Target::Cpu, MemoryManagerAffinity::Buffer));
        ctx.insert_memory_management_ctx(mm_ctx(Target::GpuCompute, MemoryManagerAffinity::Offset));
        ctx.memory_management_ctx(Target::Cpu)
            .unwrap()
            .mm
            .manage(64, Lifetime::new(0, 1))
            .unwrap();

        ctx.finalize().unwrap();
        ctx.finalize().unwrap();
        assert!(ctx.memory_management_ctx_ref(Target::Cpu).unwrap().mm.is_finalized());
        assert!(ctx
            .memory_management_ctx_ref(Target::GpuCompute)
            .unwrap()
            .mm
            .is_finalized());
    }
}
