//! Owner of built workloads.
//!
//! `finalize_graph` runs the whole lowering pipeline once per graph: target
//! forcing, context setup, passes and workload build. The resulting workload
//! is kept under the graph's id until the graph is invalidated.

use std::collections::HashMap;

use crate::backends::BackendRegistry;
use crate::error::{GraphError, GraphResult, Status};
use crate::graph::context::GraphContext;
use crate::graph::graph::Graph;
use crate::graph::pass_manager::{PassManager, PassStats};
use crate::graph::types::{GraphId, Target};
use crate::graph::utils::{
    force_target_to_graph, get_default_target, is_target_supported, setup_default_graph_context,
};
use crate::graph::workload::{ExecutionWorkload, WorkloadBuilder};

#[derive(Debug, Default)]
pub struct GraphManager {
    workloads: HashMap<GraphId, ExecutionWorkload>,
}

impl GraphManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lower `graph` for `target` and keep the workload.
    ///
    /// Falls back to the default target when `target` is not supported.
    pub fn finalize_graph(
        &mut self,
        graph: &mut Graph,
        ctx: &mut GraphContext,
        registry: &BackendRegistry,
        pass_manager: &PassManager,
        target: Target,
    ) -> GraphResult<PassStats> {
        if self.workloads.contains_key(&graph.id()) {
            return Err(GraphError::InvalidConfiguration(format!(
                "graph '{}' is already finalized",
                graph.name()
            )));
        }

        let forced = if is_target_supported(registry, target) {
            target
        } else {
            let fallback = get_default_target(registry).ok_or_else(|| {
                GraphError::UnregisteredTarget(target)
            })?;
            tracing::warn!("{} is not supported, falling back to {}", target, fallback);
            fallback
        };
        force_target_to_graph(graph, forced);

        setup_default_graph_context(ctx, registry)?;
        let stats = pass_manager.run_all(graph)?;

        let workload = WorkloadBuilder::build(graph, ctx, registry)?;
        tracing::info!(
            "Finalized graph '{}' on {}: {} tasks",
            graph.name(),
            forced,
            workload.num_tasks()
        );
        self.workloads.insert(graph.id(), workload);
        Ok(stats)
    }

    pub fn execute_graph(&mut self, graph: &mut Graph, ctx: &mut GraphContext) -> Status {
        let workload = self.workloads.get_mut(&graph.id()).ok_or_else(|| {
            GraphError::InvalidConfiguration(format!(
                "graph '{}' has not been finalized",
                graph.name()
            ))
        })?;
        workload.execute(graph, ctx)
    }

    /// Drop the workload of `id` and its pooled regions in `ctx`.
    /// Returns false if none was kept.
    pub fn invalidate_graph(&mut self, id: GraphId, ctx: &mut GraphContext) -> GraphResult<bool> {
        let Some(mut workload) = self.workloads.remove(&id) else {
            return Ok(false);
        };
        workload.unmanage_allocations(ctx)?;
        tracing::debug!("Invalidated workload of graph {:?}", id);
        Ok(true)
    }

    pub fn is_finalized(&self, id: GraphId) -> bool {
        self.workloads.contains_key(&id)
    }

    pub fn workload(&self, id: GraphId) -> Option<&ExecutionWorkload> {
        self.workloads.get(&id)
    }

    pub fn num_workloads(&self) -> usize {
        self.workloads.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::builder::{GraphBuilder, NodeParams};
    use crate::graph::tensor::TensorDescriptor;
    use crate::graph::types::DataType;
    use crate::graph::utils::create_default_pass_manager;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn softmax_graph(result: Rc<RefCell<Vec<f32>>>) -> Graph {
        let mut g = Graph::new("softmax");
        let inp = GraphBuilder::add_input_node(
            &mut g,
            NodeParams::new("in"),
            TensorDescriptor::new(vec![2], DataType::F32),
            Some(Box::new(|data: &mut [f32]| {
                data.copy_from_slice(&[0.0, 0.0]);
                true
            })),
        )
        .unwrap();
        let sm = GraphBuilder::add_softmax_node(&mut g, NodeParams::new("sm"), inp.into(), 1.0)
            .unwrap();
        // sm's output is neither a source nor a sink, so it gets pooled
        let sm2 = GraphBuilder::add_softmax_node(&mut g, NodeParams::new("sm2"), sm.into(), 1.0)
            .unwrap();
        GraphBuilder::add_output_node(
            &mut g,
            NodeParams::new("out"),
            sm2.into(),
            Some(Box::new(move |data: &mut [f32]| {
                *result.borrow_mut() = data.to_vec();
                true
            })),
        )
        .unwrap();
        g
    }

    #[test]
    fn test_finalize_execute_invalidate() {
        let result = Rc::new(RefCell::new(Vec::new()));
        let mut g = softmax_graph(Rc::clone(&result));
        let mut ctx = GraphContext::default();
        let registry = BackendRegistry::default();
        let pm = create_default_pass_manager(Target::Cpu);
        let mut manager = GraphManager::new();

        manager
            .finalize_graph(&mut g, &mut ctx, &registry, &pm, Target::Cpu)
            .unwrap();
        assert!(manager.is_finalized(g.id()));
        assert!(manager
            .finalize_graph(&mut g, &mut ctx, &registry, &pm, Target::Cpu)
            .is_err());

        manager.execute_graph(&mut g, &mut ctx).unwrap();
        assert_eq!(*result.borrow(), vec![0.5, 0.5]);

        assert!(manager.invalidate_graph(g.id(), &mut ctx).unwrap());
        assert!(!manager.invalidate_graph(g.id(), &mut ctx).unwrap());
        assert!(manager.execute_graph(&mut g, &mut ctx).is_err());
    }

    #[test]
    fn test_refinalize_after_invalidate_reuses_pool() {
        let result = Rc::new(RefCell::new(Vec::new()));
        let mut g = softmax_graph(Rc::clone(&result));
        let mut ctx = GraphContext::default();
        let registry = BackendRegistry::default();
        let pm = create_default_pass_manager(Target::Cpu);
        let mut manager = GraphManager::new();

        let mut sizes = Vec::new();
        for _ in 0..3 {
            manager
                .finalize_graph(&mut g, &mut ctx, &registry, &pm, Target::Cpu)
                .unwrap();
            manager.execute_graph(&mut g, &mut ctx).unwrap();
            assert_eq!(*result.borrow(), vec![0.5, 0.5]);

            let mm = &ctx.memory_management_ctx_ref(Target::Cpu).unwrap().mm;
            sizes.push((mm.num_allocations(), mm.layout().unwrap().total_bytes()));
            assert!(manager.invalidate_graph(g.id(), &mut ctx).unwrap());
        }
        assert_eq!(sizes[0].0, 1);
        assert!(sizes.iter().all(|s| *s == sizes[0]));
        let mm = &ctx.memory_management_ctx_ref(Target::Cpu).unwrap().mm;
        assert_eq!(mm.num_allocations(), 0);
    }

    #[test]
    fn test_unsupported_target_falls_back() {
        let result = Rc::new(RefCell::new(Vec::new()));
        let mut g = softmax_graph(result);
        let mut ctx = GraphContext::default();
        let registry = BackendRegistry::default();
        let pm = create_default_pass_manager(Target::GpuCompute);
        let mut manager = GraphManager::new();

        manager
            .finalize_graph(&mut g, &mut ctx, &registry, &pm, Target::GpuCompute)
            .unwrap();
        assert!(g.nodes().all(|n| n.assigned_target() == Target::Cpu));
    }
}
