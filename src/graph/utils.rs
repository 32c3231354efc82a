//! Helpers around target selection and default graph setup.

use crate::backends::BackendRegistry;
use crate::error::Status;
use crate::graph::context::GraphContext;
use crate::graph::graph::Graph;
use crate::graph::mutators::{
    ActivationFusionMutator, DeadCodeEliminationMutator, DepthConcatSubTensorMutator,
    InPlaceOperationMutator, TargetAssignmentMutator,
};
use crate::graph::pass_manager::PassManager;
use crate::graph::types::Target;

/// Whether `target` has a registered backend that reports itself usable.
pub fn is_target_supported(registry: &BackendRegistry, target: Target) -> bool {
    registry
        .find_backend(target)
        .is_some_and(|b| b.is_backend_supported())
}

/// First supported target in preference order: CPU, GPU compute, GPU shader.
pub fn get_default_target(registry: &BackendRegistry) -> Option<Target> {
    Target::CONCRETE
        .into_iter()
        .find(|t| is_target_supported(registry, *t))
}

/// Assign `target` to every node and tensor of the graph.
pub fn force_target_to_graph(graph: &mut Graph, target: Target) {
    for id in graph.node_ids() {
        if let Some(node) = graph.node_mut(id) {
            node.set_assigned_target(target);
        }
    }
    for id in graph.tensor_ids() {
        if let Some(tensor) = graph.tensor_mut(id) {
            tensor.desc_mut().target = target;
        }
    }
    tracing::debug!("Forced graph '{}' to {}", graph.name(), target);
}

/// Default pass pipeline for `target`.
///
/// The shader backend cannot alias storage, so it skips the in-place and
/// depth concatenation sub-tensor passes. Dead code elimination runs last
/// so it also sweeps nodes the earlier passes disconnect.
pub fn create_default_pass_manager(target: Target) -> PassManager {
    let mut pm = PassManager::new();
    pm.append(Box::new(TargetAssignmentMutator::new(target)));
    pm.append(Box::new(ActivationFusionMutator));
    if target != Target::GpuShader {
        pm.append(Box::new(InPlaceOperationMutator));
        pm.append(Box::new(DepthConcatSubTensorMutator));
    }
    pm.append(Box::new(DeadCodeEliminationMutator));
    pm
}

/// Validate the context's configuration and let every usable backend
/// register its memory manager.
pub fn setup_default_graph_context(ctx: &mut GraphContext, registry: &BackendRegistry) -> Status {
    ctx.config().validate()?;
    for target in registry.registered_targets() {
        if let Some(backend) = registry.find_backend(target) {
            if backend.is_backend_supported() {
                backend.setup_backend_context(ctx);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::config::GraphConfig;
    use crate::memory::allocator::HostAllocator;
    use std::sync::Arc;

    #[test]
    fn test_default_target_prefers_cpu() {
        let mut registry = BackendRegistry::new();
        assert_eq!(get_default_target(&registry), None);
        registry.register_gpu_shader(Arc::new(HostAllocator::new()));
        assert_eq!(get_default_target(&registry), Some(Target::GpuShader));
        registry.register(Target::Cpu, || Box::new(crate::backends::CpuBackend::new()));
        assert_eq!(get_default_target(&registry), Some(Target::Cpu));
    }

    #[test]
    fn test_shader_pipeline_is_shorter() {
        let cpu = create_default_pass_manager(Target::Cpu);
        let shader = create_default_pass_manager(Target::GpuShader);
        assert_eq!(cpu.num_passes(), 5);
        assert_eq!(shader.num_passes(), 3);
        let names: Vec<&str> = (0..shader.num_passes())
            .filter_map(|i| shader.pass(i).map(|p| p.name()))
            .collect();
        assert!(!names.contains(&"InPlaceOperationMutator"));
        for pm in [&cpu, &shader] {
            let last = pm.pass(pm.num_passes() - 1).map(|p| p.name());
            assert_eq!(last, Some("DeadCodeEliminationMutator"));
        }
    }

    #[test]
    fn test_setup_default_context_registers_managers() {
        let mut registry = BackendRegistry::default();
        registry.register_gpu_compute(Arc::new(HostAllocator::new()));
        let mut ctx = GraphContext::new(GraphConfig::default());
        setup_default_graph_context(&mut ctx, &registry).unwrap();
        assert!(ctx.has_memory_management_ctx(Target::Cpu));
        assert!(ctx.has_memory_management_ctx(Target::GpuCompute));
    }

    #[test]
    fn test_setup_rejects_invalid_config() {
        let registry = BackendRegistry::default();
        let mut ctx = GraphContext::new(GraphConfig::default().with_tensor_alignment(3));
        assert!(setup_default_graph_context(&mut ctx, &registry).is_err());
    }
}
