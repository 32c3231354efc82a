//! Graph container: node, tensor and edge arenas.
//!
//! Ids index into `Vec<Option<_>>` arenas and are never reused, so a removed
//! element leaves a hole rather than shifting later ids.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{GraphError, GraphResult, Status};
use crate::graph::handle::{check_host_access, Backing, TensorHandle};
use crate::graph::node::{Node, NodeKind};
use crate::graph::tensor::{Tensor, TensorDescriptor};
use crate::graph::types::{EdgeId, GraphId, NodeId, Target, TensorId};
use crate::memory::lifetime::AllocationId;

static NEXT_GRAPH_ID: AtomicUsize = AtomicUsize::new(0);

/// Directed connection from a producer output to a consumer input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub id: EdgeId,
    pub producer: NodeId,
    pub producer_idx: usize,
    pub consumer: NodeId,
    pub consumer_idx: usize,
    pub tensor: TensorId,
}

/// Where the storage behind a tensor lives once views are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StorageLocation {
    Dedicated {
        root: TensorId,
    },
    Managed {
        root: TensorId,
        target: Target,
        allocation: AllocationId,
    },
}

/// Element window of a tensor inside its root storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResolvedStorage {
    pub location: StorageLocation,
    pub offset: usize,
    pub len: usize,
}

#[derive(Debug)]
pub struct Graph {
    id: GraphId,
    name: String,
    nodes: Vec<Option<Node>>,
    tensors: Vec<Option<Tensor>>,
    edges: Vec<Option<Edge>>,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: GraphId(NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed)),
            name: name.into(),
            nodes: Vec::new(),
            tensors: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn id(&self) -> GraphId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // ========== Arena access ==========

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.0).and_then(Option::as_mut)
    }

    pub fn tensor(&self, id: TensorId) -> Option<&Tensor> {
        self.tensors.get(id.0).and_then(Option::as_ref)
    }

    pub fn tensor_mut(&mut self, id: TensorId) -> Option<&mut Tensor> {
        self.tensors.get_mut(id.0).and_then(Option::as_mut)
    }

    pub fn edge(&self, id: EdgeId) -> Option<&Edge> {
        self.edges.get(id.0).and_then(Option::as_ref)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().flatten()
    }

    pub fn tensors(&self) -> impl Iterator<Item = &Tensor> {
        self.tensors.iter().flatten()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter().flatten()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes().map(Node::id).collect()
    }

    pub fn tensor_ids(&self) -> Vec<TensorId> {
        self.tensors().map(Tensor::id).collect()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes().count()
    }

    pub fn num_tensors(&self) -> usize {
        self.tensors().count()
    }

    pub fn num_edges(&self) -> usize {
        self.edges().count()
    }

    // ========== Construction ==========

    /// Add a node and create its output tensors.
    pub fn add_node(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        let mut node = Node::new(id, kind);

        for idx in 0..node.kind().num_outputs() {
            let desc = node
                .kind()
                .output_descriptor(&[], idx)
                .unwrap_or_default();
            let tensor = self.add_tensor(desc);
            node.push_output(tensor);
        }

        tracing::debug!("Graph {}: added {} node {}", self.id, node.kind(), id);
        self.nodes.push(Some(node));
        id
    }

    pub fn add_tensor(&mut self, desc: TensorDescriptor) -> TensorId {
        let id = TensorId(self.tensors.len());
        self.tensors.push(Some(Tensor::new(id, desc)));
        id
    }

    /// Connect output `src_idx` of `src` to input `dst_idx` of `dst`.
    ///
    /// An out-of-range `dst_idx` grows the consumer's inputs and is reported
    /// by validation. An existing connection at `dst_idx` is replaced.
    pub fn add_connection(
        &mut self,
        src: NodeId,
        src_idx: usize,
        dst: NodeId,
        dst_idx: usize,
    ) -> GraphResult<EdgeId> {
        let producer = self
            .node(src)
            .ok_or_else(|| GraphError::InvalidConfiguration(format!("unknown producer node {}", src)))?;
        if self.node(dst).is_none() {
            return Err(GraphError::InvalidConfiguration(format!(
                "unknown consumer node {}",
                dst
            )));
        }
        let tensor = producer.output_id(src_idx).ok_or_else(|| GraphError::InvalidArity {
            node: src,
            reason: format!("{} has no output {}", producer.kind(), src_idx),
        })?;

        if src == dst || self.reaches(dst, src) {
            return Err(GraphError::GraphCycle {
                producer: src,
                consumer: dst,
            });
        }

        if let Some(existing) = self.node(dst).and_then(|n| n.input_edge(dst_idx)) {
            self.remove_connection(existing);
        }

        let id = EdgeId(self.edges.len());
        self.edges.push(Some(Edge {
            id,
            producer: src,
            producer_idx: src_idx,
            consumer: dst,
            consumer_idx: dst_idx,
            tensor,
        }));
        if let Some(node) = self.node_mut(src) {
            node.add_output_edge(id);
        }
        if let Some(node) = self.node_mut(dst) {
            node.set_input_edge(dst_idx, Some(id));
        }
        if let Some(t) = self.tensor_mut(tensor) {
            t.bind_edge(id);
        }

        self.forward_descriptors(dst);
        Ok(id)
    }

    /// Remove an edge. Returns false if it does not exist.
    pub fn remove_connection(&mut self, id: EdgeId) -> bool {
        let Some(edge) = self.edges.get_mut(id.0).and_then(Option::take) else {
            return false;
        };
        if let Some(node) = self.node_mut(edge.producer) {
            node.remove_output_edge(id);
        }
        if let Some(node) = self.node_mut(edge.consumer) {
            if node.input_edge(edge.consumer_idx) == Some(id) {
                node.set_input_edge(edge.consumer_idx, None);
            }
        }
        if let Some(t) = self.tensor_mut(edge.tensor) {
            t.unbind_edge(id);
        }
        true
    }

    /// Remove a node, its edges and its output tensors.
    pub fn remove_node(&mut self, id: NodeId) -> bool {
        let Some(node) = self.node(id) else {
            return false;
        };
        let edges: Vec<EdgeId> = node
            .input_edges()
            .iter()
            .flatten()
            .chain(node.output_edges().iter())
            .copied()
            .collect();
        let outputs: Vec<TensorId> = node.outputs().iter().flatten().copied().collect();

        for edge in edges {
            self.remove_connection(edge);
        }
        for tensor in outputs {
            if let Some(slot) = self.tensors.get_mut(tensor.0) {
                *slot = None;
            }
        }
        self.nodes[id.0] = None;
        true
    }

    /// Remove a tensor no node produces. Returns false if it does not exist.
    pub fn remove_tensor(&mut self, id: TensorId) -> bool {
        match self.tensors.get_mut(id.0) {
            Some(slot @ Some(_)) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    /// Re-derive output descriptors of `node` and everything downstream.
    pub fn forward_descriptors(&mut self, node: NodeId) {
        let mut pending = vec![node];
        let mut seen = BTreeSet::new();

        while let Some(id) = pending.pop() {
            if !seen.insert(id) {
                continue;
            }
            let Some(n) = self.node(id) else { continue };
            let target = n.assigned_target();
            let updates: Vec<(TensorId, TensorDescriptor)> = (0..n.num_outputs())
                .filter_map(|idx| Some((n.output_id(idx)?, n.configure_output(self, idx)?)))
                .collect();
            let consumers: Vec<NodeId> = n
                .output_edges()
                .iter()
                .filter_map(|e| self.edge(*e).map(|e| e.consumer))
                .collect();

            for (tensor, mut desc) in updates {
                if target != Target::Unspecified {
                    desc.target = target;
                }
                if let Some(t) = self.tensor_mut(tensor) {
                    *t.desc_mut() = desc;
                }
            }
            pending.extend(consumers);
        }
    }

    // ========== Queries ==========

    /// Whether `to` can be reached from `from` along edges
    pub fn reaches(&self, from: NodeId, to: NodeId) -> bool {
        let mut stack = vec![from];
        let mut seen = BTreeSet::new();
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(node) = self.node(id) {
                stack.extend(
                    node.output_edges()
                        .iter()
                        .filter_map(|e| self.edge(*e).map(|e| e.consumer)),
                );
            }
        }
        false
    }

    /// Tensor feeding input `idx` of `node`
    pub fn node_input(&self, node: NodeId, idx: usize) -> Option<TensorId> {
        let edge = self.node(node)?.input_edge(idx)?;
        self.edge(edge).map(|e| e.tensor)
    }

    pub fn input_descriptor(&self, node: NodeId, idx: usize) -> Option<&TensorDescriptor> {
        self.node_input(node, idx)
            .and_then(|t| self.tensor(t))
            .map(Tensor::desc)
    }

    /// Node and output index producing `tensor`
    pub fn producer(&self, tensor: TensorId) -> Option<(NodeId, usize)> {
        self.nodes().find_map(|n| {
            n.outputs()
                .iter()
                .position(|t| *t == Some(tensor))
                .map(|idx| (n.id(), idx))
        })
    }

    /// Nodes consuming `tensor`, in edge order
    pub fn consumers(&self, tensor: TensorId) -> Vec<NodeId> {
        self.tensor(tensor)
            .map(|t| {
                t.bound_edges()
                    .iter()
                    .filter_map(|e| self.edge(*e).map(|e| e.consumer))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn input_nodes(&self) -> Vec<NodeId> {
        self.nodes_where(|k| matches!(k, NodeKind::Input { .. }))
    }

    pub fn const_nodes(&self) -> Vec<NodeId> {
        self.nodes_where(|k| matches!(k, NodeKind::Const { .. }))
    }

    pub fn output_nodes(&self) -> Vec<NodeId> {
        self.nodes_where(|k| matches!(k, NodeKind::Output))
    }

    fn nodes_where(&self, pred: impl Fn(&NodeKind) -> bool) -> Vec<NodeId> {
        self.nodes()
            .filter(|n| pred(n.kind()))
            .map(Node::id)
            .collect()
    }

    /// Topological order, ties broken by ascending node id.
    pub fn topological_order(&self) -> GraphResult<Vec<NodeId>> {
        let mut in_degree: HashMap<NodeId, usize> = HashMap::new();
        for node in self.nodes() {
            let bound = node
                .input_edges()
                .iter()
                .flatten()
                .filter(|e| self.edge(**e).is_some())
                .count();
            in_degree.insert(node.id(), bound);
        }

        let mut ready: BinaryHeap<Reverse<NodeId>> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| Reverse(*id))
            .collect();
        let mut order = Vec::with_capacity(in_degree.len());

        while let Some(Reverse(id)) = ready.pop() {
            order.push(id);
            let Some(node) = self.node(id) else { continue };
            for edge in node.output_edges() {
                let Some(edge) = self.edge(*edge) else { continue };
                if let Some(d) = in_degree.get_mut(&edge.consumer) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push(Reverse(edge.consumer));
                    }
                }
            }
        }

        if order.len() != in_degree.len() {
            return Err(GraphError::InternalError(format!(
                "graph {} contains a cycle",
                self.id
            )));
        }
        Ok(order)
    }

    /// Generic validation of one node
    pub fn validate_node(&self, id: NodeId) -> Status {
        let node = self
            .node(id)
            .ok_or_else(|| GraphError::InvalidConfiguration(format!("unknown node {}", id)))?;
        let result = node.validate(self);
        tracing::debug!("Validated {} node {}: {:?}", node.kind(), id, result);
        result
    }

    // ========== Host access ==========

    /// Follow sub-tensor views down to the tensor owning the storage.
    pub(crate) fn resolve_storage(&self, id: TensorId) -> GraphResult<ResolvedStorage> {
        let handle = self.handle(id)?;
        let len = handle.num_elements();
        let mut offset = 0;
        let mut current = id;

        // A view chain can never be longer than the number of tensors
        for _ in 0..=self.tensors.len() {
            let handle = self.handle(current)?;
            match handle.backing() {
                Backing::View(view) => {
                    offset += view.offset_elems;
                    current = view.parent;
                }
                Backing::Dedicated(_) => {
                    return Ok(ResolvedStorage {
                        location: StorageLocation::Dedicated { root: current },
                        offset,
                        len,
                    })
                }
                Backing::Managed(allocation) => {
                    if !handle.is_resident() {
                        return Err(GraphError::InvalidHandle(format!(
                            "tensor {} read through {} while {}",
                            id,
                            current,
                            handle.state()
                        )));
                    }
                    return Ok(ResolvedStorage {
                        location: StorageLocation::Managed {
                            root: current,
                            target: handle.target(),
                            allocation: *allocation,
                        },
                        offset,
                        len,
                    });
                }
                Backing::Unallocated => {
                    return Err(GraphError::InvalidHandle(format!(
                        "tensor {} has no storage",
                        current
                    )))
                }
            }
        }
        Err(GraphError::InternalError(format!(
            "sub-tensor chain of tensor {} does not terminate",
            id
        )))
    }

    fn handle(&self, id: TensorId) -> GraphResult<&TensorHandle> {
        self.tensor(id)
            .and_then(Tensor::handle)
            .ok_or_else(|| GraphError::InvalidHandle(format!("tensor {} has no handle", id)))
    }

    fn dedicated_root(&self, id: TensorId) -> GraphResult<(TensorId, usize, usize)> {
        let resolved = self.resolve_storage(id)?;
        match resolved.location {
            StorageLocation::Dedicated { root } => {
                check_host_access(self.handle(root)?, root)?;
                Ok((root, resolved.offset, resolved.len))
            }
            StorageLocation::Managed { .. } => Err(GraphError::InvalidHandle(format!(
                "tensor {} lives in pooled memory and is only accessible during a run",
                id
            ))),
        }
    }

    /// Copy a tensor with dedicated storage out to the host.
    pub fn read_tensor(&self, id: TensorId) -> GraphResult<Vec<f32>> {
        let (root, offset, len) = self.dedicated_root(id)?;
        self.handle(root)?
            .buffer()
            .and_then(|b| b.as_f32().get(offset..offset + len))
            .map(<[f32]>::to_vec)
            .ok_or_else(|| {
                GraphError::InternalError(format!("tensor {} outside of its buffer", id))
            })
    }

    /// Copy host data into a tensor with dedicated storage.
    pub fn write_tensor(&mut self, id: TensorId, data: &[f32]) -> Status {
        let (root, offset, len) = self.dedicated_root(id)?;
        if data.len() != len {
            return Err(GraphError::ShapeMismatch(format!(
                "writing {} values into tensor {} of {} elements",
                data.len(),
                id,
                len
            )));
        }
        self.tensor_mut(root)
            .and_then(Tensor::handle_mut)
            .and_then(TensorHandle::buffer_mut)
            .and_then(|b| b.as_f32_mut().get_mut(offset..offset + len))
            .ok_or_else(|| {
                GraphError::InternalError(format!("tensor {} outside of its buffer", id))
            })?
            .copy_from_slice(data);
        Ok(())
    }

    pub fn map_tensor(&mut self, id: TensorId) -> Status {
        let root = self.storage_root(id)?;
        self.handle_mut(root)?.map();
        Ok(())
    }

    pub fn unmap_tensor(&mut self, id: TensorId) -> Status {
        let root = self.storage_root(id)?;
        self.handle_mut(root)?.unmap();
        Ok(())
    }

    fn storage_root(&self, id: TensorId) -> GraphResult<TensorId> {
        let mut current = id;
        for _ in 0..=self.tensors.len() {
            match self.handle(current)?.parent() {
                Some(parent) => current = parent,
                None => return Ok(current),
            }
        }
        Err(GraphError::InternalError(format!(
            "sub-tensor chain of tensor {} does not terminate",
            id
        )))
    }

    fn handle_mut(&mut self, id: TensorId) -> GraphResult<&mut TensorHandle> {
        self.tensor_mut(id)
            .and_then(Tensor::handle_mut)
            .ok_or_else(|| GraphError::InvalidHandle(format!("tensor {} has no handle", id)))
    }

    /// Run the accessor bound to `id`, mapping GPU storage around the call.
    ///
    /// Returns the accessor's result, or `true` if none is bound.
    pub fn call_accessor(&mut self, id: TensorId) -> GraphResult<bool> {
        let Some(mut accessor) = self.tensor_mut(id).and_then(Tensor::take_accessor) else {
            return Ok(true);
        };

        let result = (|| -> GraphResult<bool> {
            let root = self.storage_root(id)?;
            let was_mapped = self.handle(root)?.is_mapped();
            if !was_mapped {
                self.map_tensor(id)?;
            }
            let mut data = self.read_tensor(id)?;
            let more = accessor.access_tensor(&mut data);
            self.write_tensor(id, &data)?;
            if !was_mapped {
                self.unmap_tensor(id)?;
            }
            Ok(more)
        })();

        if let Some(t) = self.tensor_mut(id) {
            t.restore_accessor(accessor);
        }
        result
    }
}
