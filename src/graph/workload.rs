//! Workload linearization and execution.
//!
//! [`WorkloadBuilder::build`] turns a validated graph into an ordered list of
//! tasks, one per reachable node in topological order. Task indices double as
//! lifetime steps for the memory manager: a pooled tensor is committed before
//! the first task touching it and released after the last one.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use crate::backends::{BackendRegistry, Operator};
use crate::error::{GraphError, GraphResult, Status};
use crate::graph::context::GraphContext;
use crate::graph::graph::{Graph, StorageLocation};
use crate::graph::handle::TensorHandle;
use crate::graph::node::NodeKind;
use crate::graph::tensor::Tensor;
use crate::graph::types::{GraphId, NodeId, Target, TensorId, TensorShape};
use crate::memory::lifetime::{AllocationId, Lifetime};
use crate::memory::pool::PoolId;

/// Tensor access for operators during one run.
///
/// Resolves sub-tensor views and pooled storage. Reads return owned copies,
/// so an operator may write an output that aliases one of its inputs.
pub struct ExecutionContext<'a> {
    graph: &'a mut Graph,
    ctx: &'a mut GraphContext,
    pools: &'a HashMap<Target, PoolId>,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(
        graph: &'a mut Graph,
        ctx: &'a mut GraphContext,
        pools: &'a HashMap<Target, PoolId>,
    ) -> Self {
        Self { graph, ctx, pools }
    }

    pub fn shape(&self, id: TensorId) -> GraphResult<TensorShape> {
        self.graph
            .tensor(id)
            .map(|t| t.desc().shape.clone())
            .ok_or_else(|| GraphError::InvalidHandle(format!("tensor {} does not exist", id)))
    }

    pub fn read(&self, id: TensorId) -> GraphResult<Vec<f32>> {
        let resolved = self.graph.resolve_storage(id)?;
        let range = resolved.offset..resolved.offset + resolved.len;
        let data = match resolved.location {
            StorageLocation::Dedicated { root } => self
                .graph
                .tensor(root)
                .and_then(Tensor::handle)
                .and_then(|h| h.buffer())
                .and_then(|b| b.as_f32().get(range)),
            StorageLocation::Managed {
                target, allocation, ..
            } => {
                let pool = self.pool(target)?;
                let mm = &self
                    .ctx
                    .memory_management_ctx_ref(target)
                    .ok_or_else(|| missing_manager(target))?
                    .mm;
                mm.slice(pool, allocation)?.get(range)
            }
        };
        data.map(<[f32]>::to_vec)
            .ok_or_else(|| GraphError::InternalError(format!("tensor {} outside of its storage", id)))
    }

    pub fn write(&mut self, id: TensorId, data: &[f32]) -> Status {
        let resolved = self.graph.resolve_storage(id)?;
        if data.len() != resolved.len {
            return Err(GraphError::ShapeMismatch(format!(
                "writing {} values into tensor {} of {} elements",
                data.len(),
                id,
                resolved.len
            )));
        }
        let range = resolved.offset..resolved.offset + resolved.len;
        let dst = match resolved.location {
            StorageLocation::Dedicated { root } => self
                .graph
                .tensor_mut(root)
                .and_then(Tensor::handle_mut)
                .and_then(|h| h.buffer_mut())
                .and_then(|b| b.as_f32_mut().get_mut(range)),
            StorageLocation::Managed {
                target, allocation, ..
            } => {
                let pool = self.pool(target)?;
                let mm = &mut self
                    .ctx
                    .memory_management_ctx(target)
                    .ok_or_else(|| missing_manager(target))?
                    .mm;
                mm.slice_mut(pool, allocation)?.get_mut(range)
            }
        };
        dst.ok_or_else(|| {
            GraphError::InternalError(format!("tensor {} outside of its storage", id))
        })?
        .copy_from_slice(data);
        Ok(())
    }

    fn pool(&self, target: Target) -> GraphResult<PoolId> {
        self.pools.get(&target).copied().ok_or_else(|| {
            GraphError::MemoryManagerNotFinalized(format!("no pool acquired for {}", target))
        })
    }
}

fn missing_manager(target: Target) -> GraphError {
    GraphError::InvalidConfiguration(format!("no memory manager registered for {}", target))
}

/// One runnable step of a workload.
pub struct ExecutionTask {
    pub operator: Option<Box<dyn Operator>>,
    pub node: NodeId,
    /// Pooled roots to make resident before the operator runs
    pub commit_handles: Vec<TensorId>,
    /// Pooled roots whose last use is this task
    pub release_handles: Vec<TensorId>,
}

impl fmt::Debug for ExecutionTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionTask")
            .field("operator", &self.operator.as_ref().map(|op| op.name().to_string()))
            .field("node", &self.node)
            .field("commit_handles", &self.commit_handles)
            .field("release_handles", &self.release_handles)
            .finish()
    }
}

#[derive(Debug)]
pub struct ExecutionWorkload {
    pub graph: GraphId,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
    pub tasks: Vec<ExecutionTask>,
    /// Targets whose memory manager owns at least one allocation
    pub managed_targets: Vec<Target>,
    /// Pooled regions registered for this workload
    pub allocations: Vec<(Target, AllocationId)>,
}

impl ExecutionWorkload {
    pub fn num_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Index of the task created for `node`
    pub fn task_index(&self, node: NodeId) -> Option<usize> {
        self.tasks.iter().position(|t| t.node == node)
    }

    /// Hand this workload's pooled regions back to their memory managers.
    ///
    /// The managers turn dirty and are re-finalized by the next build on the
    /// same context. Tasks referencing the regions must not run afterwards.
    pub fn unmanage_allocations(&mut self, ctx: &mut GraphContext) -> Status {
        let allocations = std::mem::take(&mut self.allocations);
        self.managed_targets.clear();
        unmanage_all(ctx, &allocations)
    }

    /// Run every task once.
    ///
    /// Input accessors fill the inputs, one pool per managed target is held
    /// for the duration of the run, then output accessors drain the outputs.
    /// Pools are handed back even when a task fails.
    pub fn execute(&mut self, graph: &mut Graph, ctx: &mut GraphContext) -> Status {
        if graph.id() != self.graph {
            return Err(GraphError::InternalError(format!(
                "workload of graph {:?} executed on graph {:?}",
                self.graph,
                graph.id()
            )));
        }

        for &input in &self.inputs {
            if !graph.call_accessor(input)? {
                tracing::debug!("Input accessor of tensor {} has no more data", input);
            }
        }

        let mut pools = HashMap::new();
        let mut result = self.acquire_pools(ctx, &mut pools);
        if result.is_ok() {
            result = self.run_tasks(graph, ctx, &pools);
        }
        for (target, pool) in pools {
            let released = ctx
                .memory_management_ctx(target)
                .ok_or_else(|| missing_manager(target))
                .and_then(|mm_ctx| mm_ctx.mm.release(pool));
            if let Err(e) = released {
                tracing::error!("Failed to release {} of {}: {}", pool, target, e);
                result = result.and(Err(e));
            }
        }
        result?;

        for &output in &self.outputs {
            graph.call_accessor(output)?;
        }
        Ok(())
    }

    fn acquire_pools(&self, ctx: &mut GraphContext, pools: &mut HashMap<Target, PoolId>) -> Status {
        for &target in &self.managed_targets {
            let mm_ctx = ctx
                .memory_management_ctx(target)
                .ok_or_else(|| missing_manager(target))?;
            pools.insert(target, mm_ctx.mm.acquire()?);
        }
        Ok(())
    }

    fn run_tasks(
        &self,
        graph: &mut Graph,
        ctx: &mut GraphContext,
        pools: &HashMap<Target, PoolId>,
    ) -> Status {
        for task in &self.tasks {
            for &id in &task.commit_handles {
                handle_mut(graph, id)?.commit()?;
            }

            if let Some(op) = &task.operator {
                tracing::trace!("Running {} for node {}", op.name(), task.node);
                let mut exec = ExecutionContext::new(graph, ctx, pools);
                op.run(&mut exec).map_err(|e| {
                    if e.is_programmer_error() {
                        e
                    } else {
                        GraphError::TaskFailed {
                            node: task.node,
                            reason: e.to_string(),
                        }
                    }
                })?;
            }

            for &id in &task.release_handles {
                handle_mut(graph, id)?.release();
            }
        }
        Ok(())
    }
}

fn handle_mut(graph: &mut Graph, id: TensorId) -> GraphResult<&mut TensorHandle> {
    graph
        .tensor_mut(id)
        .and_then(Tensor::handle_mut)
        .ok_or_else(|| GraphError::InvalidHandle(format!("tensor {} has no handle", id)))
}

/// Builds [`ExecutionWorkload`]s out of graphs.
pub struct WorkloadBuilder;

impl WorkloadBuilder {
    pub fn build(
        graph: &mut Graph,
        ctx: &mut GraphContext,
        registry: &BackendRegistry,
    ) -> GraphResult<ExecutionWorkload> {
        ctx.config().validate()?;

        let order: Vec<NodeId> = graph
            .topological_order()?
            .into_iter()
            .filter(|id| graph.node(*id).is_some_and(|n| n.is_reachable()))
            .collect();

        let targets = check_targets(graph, registry, &order)?;

        for &id in &order {
            graph.validate_node(id)?;
            let target = node_target(graph, id)?;
            registry.backend(target)?.validate_node(graph, id)?;
        }

        for &target in &targets {
            registry.backend(target)?.setup_backend_context(ctx);
        }

        // Tensors written or read by the ordered nodes
        let mut tensors = BTreeSet::new();
        for &id in &order {
            if let Some(n) = graph.node(id) {
                tensors.extend(n.outputs().iter().flatten().copied());
            }
            for idx in 0..graph.node(id).map_or(0, |n| n.num_inputs()) {
                tensors.extend(graph.node_input(id, idx));
            }
        }

        let mut created = HashSet::new();
        for &id in &tensors {
            create_handle(graph, registry, id, &mut created, 0)?;
        }

        let mut tasks = Vec::with_capacity(order.len());
        for &id in &order {
            let target = node_target(graph, id)?;
            let operator = registry.backend(target)?.configure_node(graph, id, ctx)?;
            tasks.push(ExecutionTask {
                operator,
                node: id,
                commit_handles: Vec::new(),
                release_handles: Vec::new(),
            });
        }

        // Regions registered from here on are dropped again if the build fails
        let mut allocations = Vec::new();
        let result = finish_build(graph, ctx, registry, &order, tasks, &mut allocations);
        if result.is_err() {
            if let Err(e) = unmanage_all(ctx, &allocations) {
                tracing::error!("Failed to drop regions of failed build: {}", e);
            }
        }
        result
    }
}

/// Memory planning and finalization, the part of a build that registers
/// pooled regions into `allocations`.
fn finish_build(
    graph: &mut Graph,
    ctx: &mut GraphContext,
    registry: &BackendRegistry,
    order: &[NodeId],
    mut tasks: Vec<ExecutionTask>,
    allocations: &mut Vec<(Target, AllocationId)>,
) -> GraphResult<ExecutionWorkload> {
    let plan = plan_lifetimes(graph, ctx, registry, order, allocations)?;
    for (root, (first, last)) in &plan.managed {
        if let Some(task) = tasks.get_mut(*first) {
            task.commit_handles.push(*root);
        }
        if let Some(task) = tasks.get_mut(*last) {
            task.release_handles.push(*root);
        }
    }

    for id in graph.const_nodes() {
        if !order.contains(&id) {
            continue;
        }
        let outputs: Vec<TensorId> = graph
            .node(id)
            .map(|n| n.outputs().iter().flatten().copied().collect())
            .unwrap_or_default();
        for t in outputs {
            graph.call_accessor(t)?;
        }
    }

    ctx.finalize()?;

    let inputs = collect_outputs(graph, &graph.input_nodes(), order);
    let outputs: Vec<TensorId> = graph
        .output_nodes()
        .into_iter()
        .filter(|id| order.contains(id))
        .filter_map(|id| graph.node_input(id, 0))
        .collect();

    tracing::info!(
        "Built workload for graph '{}': {} tasks, {} pooled and {} dedicated tensors",
        graph.name(),
        tasks.len(),
        plan.managed.len(),
        plan.dedicated
    );

    Ok(ExecutionWorkload {
        graph: graph.id(),
        inputs,
        outputs,
        tasks,
        managed_targets: plan.managed_targets.into_iter().collect(),
        allocations: std::mem::take(allocations),
    })
}

fn unmanage_all(ctx: &mut GraphContext, allocations: &[(Target, AllocationId)]) -> Status {
    for &(target, allocation) in allocations {
        let mm_ctx = ctx
            .memory_management_ctx(target)
            .ok_or_else(|| missing_manager(target))?;
        mm_ctx.mm.unmanage(allocation)?;
    }
    if !allocations.is_empty() {
        tracing::debug!("Dropped {} pooled regions", allocations.len());
    }
    Ok(())
}

fn node_target(graph: &Graph, id: NodeId) -> GraphResult<Target> {
    graph
        .node(id)
        .map(|n| n.assigned_target())
        .ok_or_else(|| GraphError::InvalidConfiguration(format!("unknown node {}", id)))
}

/// Resolved, registered, supported targets and no edge between two targets.
fn check_targets(
    graph: &Graph,
    registry: &BackendRegistry,
    order: &[NodeId],
) -> GraphResult<BTreeSet<Target>> {
    let mut targets = BTreeSet::new();
    for &id in order {
        let target = node_target(graph, id)?;
        if target == Target::Unspecified {
            return Err(GraphError::InvalidConfiguration(format!(
                "node {} has no target assigned",
                id
            )));
        }
        let backend = registry.backend(target)?;
        if !backend.is_backend_supported() {
            return Err(GraphError::UnsupportedOperation(format!(
                "{} backend is not supported on this device",
                target
            )));
        }
        targets.insert(target);

        let Some(node) = graph.node(id) else { continue };
        for edge in node.input_edges().iter().flatten().filter_map(|e| graph.edge(*e)) {
            let producer = node_target(graph, edge.producer)?;
            if producer != target {
                return Err(GraphError::CrossTargetEdge(format!(
                    "edge {:?} connects node {} on {} to node {} on {}",
                    edge.id, edge.producer, producer, id, target
                )));
            }
        }
    }
    Ok(targets)
}

/// Create the handle of `id`, creating sub-tensor parents first.
fn create_handle(
    graph: &mut Graph,
    registry: &BackendRegistry,
    id: TensorId,
    created: &mut HashSet<TensorId>,
    depth: usize,
) -> Status {
    if created.contains(&id) {
        return Ok(());
    }
    if depth > graph.num_tensors() {
        return Err(GraphError::InternalError(format!(
            "sub-tensor chain of tensor {} is cyclic",
            id
        )));
    }

    let producer_target = graph
        .producer(id)
        .and_then(|(node, _)| graph.node(node))
        .map(|n| n.assigned_target());
    let tensor = graph
        .tensor_mut(id)
        .ok_or_else(|| GraphError::InvalidHandle(format!("tensor {} does not exist", id)))?;
    if tensor.desc().target == Target::Unspecified {
        if let Some(target) = producer_target {
            tensor.desc_mut().target = target;
        }
    }
    let desc = tensor.desc().clone();
    let subtensor = tensor.subtensor().cloned();
    let backend = registry.backend(desc.target)?;

    let handle = match subtensor {
        Some(info) => {
            create_handle(graph, registry, info.parent, created, depth + 1)?;
            let parent = graph.tensor(info.parent).and_then(Tensor::handle);
            backend
                .create_subtensor(parent, info.parent, &desc.shape, &info.coords, info.extend_parent)
                .ok_or_else(|| {
                    GraphError::InvalidConfiguration(format!(
                        "sub-tensor {} of tensor {} at {:?} rejected",
                        id, info.parent, info.coords.0
                    ))
                })?
        }
        None => {
            let tensor = graph
                .tensor(id)
                .ok_or_else(|| GraphError::InvalidHandle(format!("tensor {} does not exist", id)))?;
            backend.create_tensor(tensor).ok_or(GraphError::TargetMismatch {
                expected: backend.target(),
                actual: desc.target,
            })?
        }
    };

    if let Some(t) = graph.tensor_mut(id) {
        t.set_handle(handle);
    }
    created.insert(id);
    Ok(())
}

fn storage_root(graph: &Graph, id: TensorId) -> GraphResult<TensorId> {
    let mut current = id;
    for _ in 0..=graph.num_tensors() {
        let parent = graph
            .tensor(current)
            .and_then(Tensor::handle)
            .ok_or_else(|| GraphError::InvalidHandle(format!("tensor {} has no handle", current)))?
            .parent();
        match parent {
            Some(parent) => current = parent,
            None => return Ok(current),
        }
    }
    Err(GraphError::InternalError(format!(
        "sub-tensor chain of tensor {} does not terminate",
        id
    )))
}

struct LifetimePlan {
    /// Pooled root -> (first task, last task)
    managed: BTreeMap<TensorId, (usize, usize)>,
    managed_targets: BTreeSet<Target>,
    dedicated: usize,
}

/// Give every storage root either dedicated storage or a pooled region.
fn plan_lifetimes(
    graph: &mut Graph,
    ctx: &mut GraphContext,
    registry: &BackendRegistry,
    order: &[NodeId],
    allocations: &mut Vec<(Target, AllocationId)>,
) -> GraphResult<LifetimePlan> {
    let use_mm = ctx.config().use_memory_manager;
    let alignment = ctx.config().tensor_alignment;

    let mut uses: BTreeMap<TensorId, (usize, usize)> = BTreeMap::new();
    let mut pinned = BTreeSet::new();

    for (step, &id) in order.iter().enumerate() {
        let Some(node) = graph.node(id) else { continue };
        let outputs: Vec<TensorId> = node.outputs().iter().flatten().copied().collect();
        let inputs: Vec<TensorId> = (0..node.num_inputs())
            .filter_map(|idx| graph.node_input(id, idx))
            .collect();
        let pins_outputs = node.kind().is_source();
        let pins_inputs = matches!(node.kind(), NodeKind::Output);

        for t in outputs.iter().chain(&inputs) {
            let root = storage_root(graph, *t)?;
            let entry = uses.entry(root).or_insert((step, step));
            entry.0 = entry.0.min(step);
            entry.1 = entry.1.max(step);
        }
        for t in outputs.iter().filter(|_| pins_outputs).chain(inputs.iter().filter(|_| pins_inputs)) {
            pinned.insert(storage_root(graph, *t)?);
        }
    }

    let mut plan = LifetimePlan {
        managed: BTreeMap::new(),
        managed_targets: BTreeSet::new(),
        dedicated: 0,
    };

    for (root, (first, last)) in uses {
        let handle = graph
            .tensor_mut(root)
            .and_then(Tensor::handle_mut)
            .ok_or_else(|| GraphError::InvalidHandle(format!("tensor {} has no handle", root)))?;
        let target = handle.target();
        let pooled = use_mm && !pinned.contains(&root) && ctx.has_memory_management_ctx(target);

        if pooled {
            let mm_ctx = ctx
                .memory_management_ctx(target)
                .ok_or_else(|| missing_manager(target))?;
            let allocation = mm_ctx
                .mm
                .manage(handle.extent_bytes(), Lifetime::new(first, last + 1))?;
            allocations.push((target, allocation));
            handle.bind_managed(allocation)?;
            tracing::debug!(
                "Tensor {} pooled as {} over tasks [{}, {}]",
                root,
                allocation,
                first,
                last
            );
            plan.managed.insert(root, (first, last));
            plan.managed_targets.insert(target);
        } else {
            let allocator = registry.backend(target)?.allocator();
            handle.allocate_dedicated(allocator.as_ref(), alignment)?;
            plan.dedicated += 1;
        }
    }
    Ok(plan)
}

fn collect_outputs(graph: &Graph, nodes: &[NodeId], order: &[NodeId]) -> Vec<TensorId> {
    nodes
        .iter()
        .filter(|id| order.contains(id))
        .filter_map(|id| graph.node(*id))
        .flat_map(|n| n.outputs().iter().flatten().copied())
        .collect()
}
