//! GPU backends
//!
//! Both GPU flavours are built over an allocator handed in by device bring-up
//! code. Their handles start unmapped; host access goes through
//! `Graph::map_tensor`, and accessors are wrapped in a map/unmap pair.

use std::sync::Arc;

use crate::backends::function_factory::{create_operator, Operator};
use crate::backends::{check_node_target, validator, DeviceBackend};
use crate::error::{GraphResult, Status};
use crate::graph::context::GraphContext;
use crate::graph::graph::Graph;
use crate::graph::types::{NodeId, Target};
use crate::memory::allocator::Allocator;

/// Compute-API GPU backend
#[derive(Debug, Clone)]
pub struct GpuComputeBackend {
    allocator: Arc<dyn Allocator>,
}

impl GpuComputeBackend {
    pub fn new(allocator: Arc<dyn Allocator>) -> Self {
        tracing::debug!("GPU compute backend over {:?}", allocator);
        Self { allocator }
    }
}

impl DeviceBackend for GpuComputeBackend {
    fn target(&self) -> Target {
        Target::GpuCompute
    }

    fn is_backend_supported(&self) -> bool {
        true
    }

    fn allocator(&self) -> Arc<dyn Allocator> {
        Arc::clone(&self.allocator)
    }

    fn validate_node(&self, graph: &mut Graph, node: NodeId) -> Status {
        validator::validate_node(Target::GpuCompute, graph, node)
    }

    fn configure_node(
        &self,
        graph: &Graph,
        node: NodeId,
        _ctx: &mut GraphContext,
    ) -> GraphResult<Option<Box<dyn Operator>>> {
        check_node_target(graph, node, Target::GpuCompute)?;
        create_operator(Target::GpuCompute, graph, node, None)
    }
}

/// Shader-API GPU backend. Narrower than compute: no flatten or reshape,
/// and direct convolution is limited to small strides.
#[derive(Debug, Clone)]
pub struct GpuShaderBackend {
    allocator: Arc<dyn Allocator>,
}

impl GpuShaderBackend {
    pub fn new(allocator: Arc<dyn Allocator>) -> Self {
        tracing::debug!("GPU shader backend over {:?}", allocator);
        Self { allocator }
    }
}

impl DeviceBackend for GpuShaderBackend {
    fn target(&self) -> Target {
        Target::GpuShader
    }

    fn is_backend_supported(&self) -> bool {
        true
    }

    fn allocator(&self) -> Arc<dyn Allocator> {
        Arc::clone(&self.allocator)
    }

    fn validate_node(&self, graph: &mut Graph, node: NodeId) -> Status {
        validator::validate_node(Target::GpuShader, graph, node)
    }

    fn configure_node(
        &self,
        graph: &Graph,
        node: NodeId,
        _ctx: &mut GraphContext,
    ) -> GraphResult<Option<Box<dyn Operator>>> {
        check_node_target(graph, node, Target::GpuShader)?;
        create_operator(Target::GpuShader, graph, node, None)
    }
}
