//! CPU backend
//!
//! Runs the reference kernels on host memory. An optional dedicated rayon
//! pool bounds the threads used by the GEMM convolution path; without one
//! rayon's global pool is used.

use std::sync::Arc;

use rayon::ThreadPool;

use crate::backends::function_factory::{create_operator, Operator};
use crate::backends::{check_node_target, validator, DeviceBackend};
use crate::error::{GraphError, GraphResult, Status};
use crate::graph::context::GraphContext;
use crate::graph::graph::Graph;
use crate::graph::types::{NodeId, Target};
use crate::memory::allocator::{Allocator, HostAllocator};

#[derive(Debug, Clone)]
pub struct CpuBackend {
    allocator: Arc<dyn Allocator>,
    thread_pool: Option<Arc<ThreadPool>>,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::with_allocator(Arc::new(HostAllocator::named("cpu")))
    }

    pub fn with_allocator(allocator: Arc<dyn Allocator>) -> Self {
        Self {
            allocator,
            thread_pool: None,
        }
    }

    /// Run kernels on a dedicated pool of `num_threads` workers.
    pub fn with_thread_pool(mut self, num_threads: usize) -> GraphResult<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("graphforge-cpu-{}", i))
            .build()
            .map_err(|e| {
                GraphError::InvalidConfiguration(format!("CPU thread pool: {}", e))
            })?;
        tracing::debug!("CPU backend using {} worker threads", pool.current_num_threads());
        self.thread_pool = Some(Arc::new(pool));
        Ok(self)
    }

    pub fn num_threads(&self) -> usize {
        self.thread_pool
            .as_ref()
            .map_or_else(rayon::current_num_threads, |p| p.current_num_threads())
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceBackend for CpuBackend {
    fn target(&self) -> Target {
        Target::Cpu
    }

    fn is_backend_supported(&self) -> bool {
        true
    }

    fn allocator(&self) -> Arc<dyn Allocator> {
        Arc::clone(&self.allocator)
    }

    fn validate_node(&self, graph: &mut Graph, node: NodeId) -> Status {
        validator::validate_node(Target::Cpu, graph, node)
    }

    fn configure_node(
        &self,
        graph: &Graph,
        node: NodeId,
        _ctx: &mut GraphContext,
    ) -> GraphResult<Option<Box<dyn Operator>>> {
        check_node_target(graph, node, Target::Cpu)?;
        create_operator(Target::Cpu, graph, node, self.thread_pool.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::config::GraphConfig;
    use crate::graph::node::NodeKind;
    use crate::graph::tensor::{Tensor, TensorDescriptor};
    use crate::graph::types::{DataType, TensorId};

    #[test]
    fn test_setup_registers_memory_manager_once() {
        let backend = CpuBackend::new();
        let mut ctx = GraphContext::new(GraphConfig::default());
        backend.setup_backend_context(&mut ctx);
        assert!(ctx.has_memory_management_ctx(Target::Cpu));
        // Second setup leaves the registered manager alone
        backend.setup_backend_context(&mut ctx);
        assert!(ctx.has_memory_management_ctx(Target::Cpu));
    }

    #[test]
    fn test_setup_without_memory_manager() {
        let backend = CpuBackend::new();
        let mut ctx = GraphContext::new(GraphConfig::default().with_memory_manager(false));
        backend.setup_backend_context(&mut ctx);
        assert!(!ctx.has_memory_management_ctx(Target::Cpu));
    }

    #[test]
    fn test_create_tensor_checks_target() {
        let backend = CpuBackend::new();
        let cpu = Tensor::new(
            TensorId(0),
            TensorDescriptor::new(vec![4], DataType::F32).with_target(Target::Cpu),
        );
        let gpu = Tensor::new(
            TensorId(1),
            TensorDescriptor::new(vec![4], DataType::F32).with_target(Target::GpuCompute),
        );
        assert!(backend.create_tensor(&cpu).is_some());
        assert!(backend.create_tensor(&gpu).is_none());
    }

    #[test]
    fn test_configure_rejects_foreign_node() {
        let backend = CpuBackend::new();
        let mut graph = Graph::new("foreign");
        let node = graph.add_node(NodeKind::Input {
            desc: TensorDescriptor::new(vec![4], DataType::F32),
        });
        if let Some(n) = graph.node_mut(node) {
            n.set_assigned_target(Target::GpuShader);
        }
        let mut ctx = GraphContext::default();
        assert!(matches!(
            backend.configure_node(&graph, node, &mut ctx),
            Err(GraphError::TargetMismatch { .. })
        ));
    }

    #[test]
    fn test_thread_pool_size() {
        let backend = CpuBackend::new().with_thread_pool(2).unwrap();
        assert_eq!(backend.num_threads(), 2);
    }
}
