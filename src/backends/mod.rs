//! Device backends
//!
//! A backend turns nodes assigned to its target into runnable operators and
//! creates storage handles for their tensors. Backends are looked up by
//! target through an explicit [`BackendRegistry`]; there is no global
//! registry.

pub mod cpu;
pub mod function_factory;
pub mod gpu;
pub mod registry;
pub mod validator;

pub use cpu::CpuBackend;
pub use function_factory::Operator;
pub use gpu::{GpuComputeBackend, GpuShaderBackend};
pub use registry::BackendRegistry;

use std::fmt;
use std::sync::Arc;

use crate::error::{GraphError, GraphResult, Status};
use crate::graph::config::GraphConfig;
use crate::graph::context::{GraphContext, MemoryManagerContext};
use crate::graph::graph::Graph;
use crate::graph::handle::{contiguous_offset, fits_inside, HandleState, SubTensorView, TensorHandle};
use crate::graph::tensor::Tensor;
use crate::graph::types::{Coordinates, MemoryManagerAffinity, NodeId, Target, TensorId, TensorShape};
use crate::memory::allocator::Allocator;
use crate::memory::manager::MemoryManagerOnDemand;

pub trait DeviceBackend: fmt::Debug {
    fn target(&self) -> Target;

    /// Whether the device behind this backend can run workloads
    fn is_backend_supported(&self) -> bool;

    fn allocator(&self) -> Arc<dyn Allocator>;

    /// Register this backend's memory manager with the context if needed.
    fn setup_backend_context(&self, ctx: &mut GraphContext) {
        let config = ctx.config().clone();
        if config.use_memory_manager && !ctx.has_memory_management_ctx(self.target()) {
            let mm_ctx = self.create_memory_manager(config.memory_affinity, &config);
            ctx.insert_memory_management_ctx(mm_ctx);
        }
    }

    /// Handle for a tensor, `None` if the tensor belongs to another target.
    fn create_tensor(&self, tensor: &Tensor) -> Option<TensorHandle> {
        let desc = tensor.desc();
        if desc.target != self.target() {
            tracing::warn!(
                "{} backend asked to create tensor {} for {}",
                self.target(),
                tensor.id(),
                desc.target
            );
            return None;
        }
        Some(TensorHandle::new(
            self.target(),
            desc.shape.clone(),
            desc.data_type,
        ))
    }

    /// View into `parent`, `None` if no valid view can be created.
    fn create_subtensor(
        &self,
        parent: Option<&TensorHandle>,
        parent_id: TensorId,
        shape: &TensorShape,
        coords: &Coordinates,
        extend_parent: bool,
    ) -> Option<TensorHandle> {
        create_subtensor_handle(self.target(), parent, parent_id, shape, coords, extend_parent)
    }

    /// Target-specific validation. May rewrite node parameters the backend
    /// cannot honour into ones it can.
    fn validate_node(&self, graph: &mut Graph, node: NodeId) -> Status;

    /// Operator running the node, `None` for nodes without runtime work.
    fn configure_node(
        &self,
        graph: &Graph,
        node: NodeId,
        ctx: &mut GraphContext,
    ) -> GraphResult<Option<Box<dyn Operator>>>;

    fn create_memory_manager(
        &self,
        affinity: MemoryManagerAffinity,
        config: &GraphConfig,
    ) -> MemoryManagerContext {
        MemoryManagerContext {
            target: self.target(),
            mm: MemoryManagerOnDemand::new(
                affinity,
                config.num_memory_pools,
                config.tensor_alignment,
            ),
            allocator: self.allocator(),
        }
    }
}

/// Shared sub-tensor rules of every backend.
///
/// A view is rejected when the parent is missing, released, or on another
/// target; when it leaves the parent's bounds without `extend_parent`; and
/// when it is not one contiguous range of the parent's storage.
pub fn create_subtensor_handle(
    target: Target,
    parent: Option<&TensorHandle>,
    parent_id: TensorId,
    shape: &TensorShape,
    coords: &Coordinates,
    extend_parent: bool,
) -> Option<TensorHandle> {
    let parent = parent?;

    if parent.target() != target {
        tracing::warn!(
            "Sub-tensor of tensor {} rejected: parent on {}, backend {}",
            parent_id,
            parent.target(),
            target
        );
        return None;
    }
    if parent.state() == HandleState::Released {
        tracing::warn!("Sub-tensor of tensor {} rejected: parent released", parent_id);
        return None;
    }
    if !extend_parent && !fits_inside(parent.shape(), shape, coords) {
        tracing::warn!(
            "Sub-tensor {} at {:?} does not fit parent {} {}",
            shape,
            coords.0,
            parent_id,
            parent.shape()
        );
        return None;
    }
    let Some(offset) = contiguous_offset(parent.shape(), shape, coords) else {
        tracing::warn!(
            "Sub-tensor {} at {:?} of {} is not contiguous",
            shape,
            coords.0,
            parent.shape()
        );
        return None;
    };
    if offset + shape.total_size() > parent.num_elements() {
        tracing::warn!(
            "Sub-tensor {} at {:?} overruns storage of tensor {}",
            shape,
            coords.0,
            parent_id
        );
        return None;
    }

    Some(TensorHandle::new_view(
        target,
        shape.clone(),
        parent.data_type(),
        SubTensorView {
            parent: parent_id,
            coords: coords.clone(),
            offset_elems: offset,
        },
    ))
}

/// Node must be assigned to the backend's target.
pub(crate) fn check_node_target(graph: &Graph, node: NodeId, target: Target) -> Status {
    let assigned = graph
        .node(node)
        .map(|n| n.assigned_target())
        .ok_or_else(|| GraphError::InvalidConfiguration(format!("unknown node {}", node)))?;
    if assigned != target {
        return Err(GraphError::TargetMismatch {
            expected: target,
            actual: assigned,
        });
    }
    Ok(())
}
