//! Graph mutation passes.
//!
//! - **Target assignment**: resolve unspecified node targets
//! - **Activation fusion**: fold an activation into the convolution feeding it
//! - **In-place operations**: let activations overwrite their input
//! - **Depth concat sub-tensors**: producers write straight into the concatenation output
//! - **Dead code elimination**: drop nodes and tensors not contributing to an output
//!
//! Each pass reports the number of changes it made. Running a pass again on
//! its own output makes no further changes.

use std::collections::BTreeSet;

use crate::error::{GraphError, GraphResult};
use crate::graph::graph::Graph;
use crate::graph::handle::{contiguous_offset, fits_inside};
use crate::graph::node::{NodeKind, DEPTH_AXIS};
use crate::graph::pass_manager::GraphMutator;
use crate::graph::tensor::SubTensorInfo;
use crate::graph::types::{Coordinates, NodeId, Target, TensorId};

/// Assigns `default` to every node without a target, then makes every
/// tensor's descriptor target match its producer.
///
/// Idempotent: a second run finds nothing unspecified or mismatched.
#[derive(Debug, Clone, Copy)]
pub struct TargetAssignmentMutator {
    default: Target,
}

impl TargetAssignmentMutator {
    pub fn new(default: Target) -> Self {
        Self { default }
    }
}

impl GraphMutator for TargetAssignmentMutator {
    fn name(&self) -> &str {
        "TargetAssignmentMutator"
    }

    fn mutate(&self, graph: &mut Graph) -> GraphResult<usize> {
        if self.default == Target::Unspecified {
            return Err(GraphError::InvalidConfiguration(
                "default target must be a concrete target".to_string(),
            ));
        }

        let mut changes = 0;
        for id in graph.node_ids() {
            if let Some(node) = graph.node_mut(id) {
                if node.assigned_target() == Target::Unspecified {
                    node.set_assigned_target(self.default);
                    changes += 1;
                }
            }
        }

        let produced: Vec<(TensorId, Target)> = graph
            .nodes()
            .flat_map(|n| {
                let target = n.assigned_target();
                n.outputs().iter().flatten().map(move |t| (*t, target))
            })
            .collect();
        for (tensor, target) in produced {
            if let Some(t) = graph.tensor_mut(tensor) {
                if t.desc().target != target {
                    t.desc_mut().target = target;
                    changes += 1;
                }
            }
        }
        Ok(changes)
    }
}

/// Folds an activation into the convolution producing its input when the
/// activation is that output's only consumer.
///
/// The activation's consumers are rewired to the convolution output, the
/// activation is disconnected and marked unreachable. Idempotent: a
/// convolution already carrying a fused activation is skipped.
#[derive(Debug, Default, Clone, Copy)]
pub struct ActivationFusionMutator;

impl GraphMutator for ActivationFusionMutator {
    fn name(&self) -> &str {
        "ActivationFusionMutator"
    }

    fn mutate(&self, graph: &mut Graph) -> GraphResult<usize> {
        let mut changes = 0;
        for conv in graph.node_ids() {
            let Some((act, info)) = fusable_activation(graph, conv) else {
                continue;
            };
            let (Some(conv_out), Some(act_out)) = (
                graph.node(conv).and_then(|n| n.output_id(0)),
                graph.node(act).and_then(|n| n.output_id(0)),
            ) else {
                continue;
            };

            let rewired: Vec<(NodeId, usize)> = graph
                .node(act)
                .map(|n| {
                    n.output_edges()
                        .iter()
                        .filter_map(|e| graph.edge(*e))
                        .map(|e| (e.consumer, e.consumer_idx))
                        .collect()
                })
                .unwrap_or_default();
            for (consumer, idx) in rewired {
                graph.add_connection(conv, 0, consumer, idx)?;
            }
            if let Some(edge) = graph.node(act).and_then(|n| n.input_edge(0)) {
                graph.remove_connection(edge);
            }
            if let Some(accessor) = graph.tensor_mut(act_out).and_then(|t| t.take_accessor()) {
                if let Some(t) = graph.tensor_mut(conv_out) {
                    t.set_accessor(accessor);
                }
            }

            if let Some(node) = graph.node_mut(conv) {
                if let NodeKind::Convolution {
                    fused_activation, ..
                } = node.kind_mut()
                {
                    *fused_activation = Some(info);
                }
            }
            if let Some(node) = graph.node_mut(act) {
                node.set_reachable(false);
            }
            tracing::debug!("Fused activation node {} into convolution {}", act, conv);
            changes += 1;
        }
        Ok(changes)
    }
}

fn fusable_activation(
    graph: &Graph,
    conv: NodeId,
) -> Option<(NodeId, crate::graph::types::ActivationLayerInfo)> {
    let node = graph.node(conv)?;
    if !node.is_reachable() {
        return None;
    }
    let NodeKind::Convolution {
        fused_activation: None,
        ..
    } = node.kind()
    else {
        return None;
    };
    let consumers = graph.consumers(node.output_id(0)?);
    let [act] = consumers.as_slice() else {
        return None;
    };
    let act_node = graph.node(*act)?;
    match act_node.kind() {
        NodeKind::Activation { info }
            if act_node.is_reachable() && act_node.assigned_target() == node.assigned_target() =>
        {
            Some((*act, *info))
        }
        _ => None,
    }
}

/// Turns an activation's output into a full-size view of its input when
/// nothing else reads that input and it is not fed by an accessor.
///
/// Idempotent: outputs that are already views are left alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct InPlaceOperationMutator;

impl GraphMutator for InPlaceOperationMutator {
    fn name(&self) -> &str {
        "InPlaceOperationMutator"
    }

    fn mutate(&self, graph: &mut Graph) -> GraphResult<usize> {
        let mut changes = 0;
        for id in graph.node_ids() {
            let Some((input, output)) = in_place_candidate(graph, id) else {
                continue;
            };
            if let Some(t) = graph.tensor_mut(output) {
                t.set_subtensor(Some(SubTensorInfo {
                    parent: input,
                    coords: Coordinates::default(),
                    extend_parent: false,
                }));
                tracing::debug!("Node {} runs in place on tensor {}", id, input);
                changes += 1;
            }
        }
        Ok(changes)
    }
}

fn in_place_candidate(graph: &Graph, id: NodeId) -> Option<(TensorId, TensorId)> {
    let node = graph.node(id)?;
    if !node.is_reachable() || !matches!(node.kind(), NodeKind::Activation { .. }) {
        return None;
    }
    let input = graph.node_input(id, 0)?;
    let output = node.output_id(0)?;
    let out_tensor = graph.tensor(output)?;
    if out_tensor.subtensor().is_some() || out_tensor.has_accessor() {
        return None;
    }

    let (producer, _) = graph.producer(input)?;
    let producer = graph.node(producer)?;
    if producer.kind().is_source() || producer.assigned_target() != node.assigned_target() {
        return None;
    }
    if graph.consumers(input).len() != 1 {
        return None;
    }
    let in_tensor = graph.tensor(input)?;
    (in_tensor.desc().shape == out_tensor.desc().shape).then_some((input, output))
}

/// Makes each input of a depth concatenation a contiguous view of the
/// concatenation output and disables the node, so producers write their
/// results in place.
///
/// Applied only when every input qualifies. Idempotent: disabled
/// concatenations are skipped.
#[derive(Debug, Default, Clone, Copy)]
pub struct DepthConcatSubTensorMutator;

impl GraphMutator for DepthConcatSubTensorMutator {
    fn name(&self) -> &str {
        "DepthConcatSubTensorMutator"
    }

    fn mutate(&self, graph: &mut Graph) -> GraphResult<usize> {
        let mut changes = 0;
        for id in graph.node_ids() {
            let Some(views) = concat_views(graph, id) else {
                continue;
            };
            for (tensor, info) in views {
                if let Some(t) = graph.tensor_mut(tensor) {
                    t.set_subtensor(Some(info));
                }
            }
            if let Some(node) = graph.node_mut(id) {
                if let NodeKind::DepthConcatenate { enabled, .. } = node.kind_mut() {
                    *enabled = false;
                }
            }
            tracing::debug!("Depth concatenation {} replaced by sub-tensors", id);
            changes += 1;
        }
        Ok(changes)
    }
}

fn concat_views(graph: &Graph, id: NodeId) -> Option<Vec<(TensorId, SubTensorInfo)>> {
    let node = graph.node(id)?;
    let NodeKind::DepthConcatenate {
        num_inputs,
        enabled: true,
    } = node.kind()
    else {
        return None;
    };
    if !node.is_reachable() {
        return None;
    }
    let output = node.output_id(0)?;
    let out_shape = &graph.tensor(output)?.desc().shape;

    let mut views = Vec::with_capacity(*num_inputs);
    let mut depth = 0;
    for idx in 0..*num_inputs {
        let input = graph.node_input(id, idx)?;
        let tensor = graph.tensor(input)?;
        let (producer, _) = graph.producer(input)?;
        let producer = graph.node(producer)?;
        if producer.kind().is_source()
            || producer.assigned_target() != node.assigned_target()
            || tensor.subtensor().is_some()
            || graph.consumers(input).len() != 1
        {
            return None;
        }

        let shape = &tensor.desc().shape;
        let coords = Coordinates::new(vec![0, 0, depth]);
        if !fits_inside(out_shape, shape, &coords) {
            return None;
        }
        contiguous_offset(out_shape, shape, &coords)?;
        views.push((
            input,
            SubTensorInfo {
                parent: output,
                coords,
                extend_parent: false,
            },
        ));
        depth += shape.dim(DEPTH_AXIS);
    }
    Some(views)
}

/// Removes unreachable nodes, nodes no output depends on, and tensors left
/// without producer or consumer.
///
/// Graphs without output nodes only lose their unreachable nodes.
/// Idempotent: after one run every remaining node feeds an output.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeadCodeEliminationMutator;

impl GraphMutator for DeadCodeEliminationMutator {
    fn name(&self) -> &str {
        "DeadCodeEliminationMutator"
    }

    fn mutate(&self, graph: &mut Graph) -> GraphResult<usize> {
        let outputs: Vec<NodeId> = graph
            .output_nodes()
            .into_iter()
            .filter(|id| graph.node(*id).is_some_and(|n| n.is_reachable()))
            .collect();

        let live: BTreeSet<NodeId> = if outputs.is_empty() {
            graph
                .nodes()
                .filter(|n| n.is_reachable())
                .map(|n| n.id())
                .collect()
        } else {
            let mut live = BTreeSet::new();
            let mut stack = outputs;
            while let Some(id) = stack.pop() {
                if !live.insert(id) {
                    continue;
                }
                let Some(node) = graph.node(id) else { continue };
                stack.extend(
                    node.input_edges()
                        .iter()
                        .flatten()
                        .filter_map(|e| graph.edge(*e))
                        .map(|e| e.producer),
                );
            }
            live
        };

        let mut changes = 0;
        for id in graph.node_ids() {
            if !live.contains(&id) && graph.remove_node(id) {
                tracing::debug!("Removed dead node {}", id);
                changes += 1;
            }
        }

        let produced: BTreeSet<TensorId> = graph
            .nodes()
            .flat_map(|n| n.outputs().iter().flatten().copied())
            .collect();
        for id in graph.tensor_ids() {
            let orphan = graph
                .tensor(id)
                .is_some_and(|t| t.bound_edges().is_empty() && !produced.contains(&id));
            if orphan && graph.remove_tensor(id) {
                changes += 1;
            }
        }
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::builder::{GraphBuilder, LayerAccessors, NodeParams};
    use crate::graph::tensor::TensorDescriptor;
    use crate::graph::types::{
        ActivationFunction, ActivationLayerInfo, ConvolutionMethod, DataType, PadStrideInfo,
    };

    fn params() -> NodeParams {
        NodeParams::new("n")
    }

    fn input(g: &mut Graph, dims: &[usize]) -> NodeId {
        GraphBuilder::add_input_node(
            g,
            params(),
            TensorDescriptor::new(dims.to_vec(), DataType::F32),
            None,
        )
        .unwrap()
    }

    fn conv(g: &mut Graph, src: NodeId) -> NodeId {
        GraphBuilder::add_convolution_node(
            g,
            params(),
            src.into(),
            (1, 1),
            2,
            PadStrideInfo::default(),
            ConvolutionMethod::Gemm,
            LayerAccessors {
                weights: None,
                bias: None,
            },
        )
        .unwrap()
    }

    fn relu(g: &mut Graph, src: NodeId) -> NodeId {
        GraphBuilder::add_activation_node(g, params(), src.into(), ActivationLayerInfo::relu())
            .unwrap()
    }

    fn assert_idempotent(pass: &dyn GraphMutator, g: &mut Graph) {
        assert_eq!(pass.mutate(g).unwrap(), 0, "{} not idempotent", pass.name());
    }

    #[test]
    fn test_target_assignment() {
        let mut g = Graph::new("targets");
        let inp = input(&mut g, &[4, 4, 1]);
        let act = relu(&mut g, inp);
        let pass = TargetAssignmentMutator::new(Target::Cpu);
        assert!(pass.mutate(&mut g).unwrap() > 0);
        assert_eq!(g.node(act).unwrap().assigned_target(), Target::Cpu);
        let out = g.node(act).unwrap().output_id(0).unwrap();
        assert_eq!(g.tensor(out).unwrap().desc().target, Target::Cpu);
        assert_idempotent(&pass, &mut g);
    }

    #[test]
    fn test_target_assignment_needs_concrete_default() {
        let mut g = Graph::new("targets");
        let pass = TargetAssignmentMutator::new(Target::Unspecified);
        assert!(pass.mutate(&mut g).is_err());
    }

    #[test]
    fn test_activation_fusion() {
        let mut g = Graph::new("fusion");
        let inp = input(&mut g, &[4, 4, 1]);
        let c = conv(&mut g, inp);
        let act = relu(&mut g, c);
        let out = GraphBuilder::add_output_node(&mut g, params(), act.into(), None).unwrap();

        let pass = ActivationFusionMutator;
        assert_eq!(pass.mutate(&mut g).unwrap(), 1);
        assert!(!g.node(act).unwrap().is_reachable());
        assert_eq!(
            g.node_input(out, 0),
            g.node(c).unwrap().output_id(0)
        );
        match g.node(c).unwrap().kind() {
            NodeKind::Convolution {
                fused_activation: Some(info),
                ..
            } => assert_eq!(info.function, ActivationFunction::Relu),
            other => panic!("unexpected {:?}", other),
        }
        assert_idempotent(&pass, &mut g);
    }

    #[test]
    fn test_no_fusion_with_two_consumers() {
        let mut g = Graph::new("fusion");
        let inp = input(&mut g, &[4, 4, 1]);
        let c = conv(&mut g, inp);
        relu(&mut g, c);
        relu(&mut g, c);
        assert_eq!(ActivationFusionMutator.mutate(&mut g).unwrap(), 0);
    }

    #[test]
    fn test_in_place_activation() {
        let mut g = Graph::new("inplace");
        let inp = input(&mut g, &[4, 4, 1]);
        let first = relu(&mut g, inp);
        let second = relu(&mut g, first);

        let pass = InPlaceOperationMutator;
        // The first activation reads a graph input and stays out of place
        assert_eq!(pass.mutate(&mut g).unwrap(), 1);
        let second_out = g.node(second).unwrap().output_id(0).unwrap();
        let info = g.tensor(second_out).unwrap().subtensor().unwrap();
        assert_eq!(Some(info.parent), g.node(first).unwrap().output_id(0));
        assert_idempotent(&pass, &mut g);
    }

    #[test]
    fn test_depth_concat_subtensors() {
        let mut g = Graph::new("concat");
        let inp = input(&mut g, &[2, 2, 1]);
        let a = relu(&mut g, inp);
        let b = relu(&mut g, inp);
        let cat = GraphBuilder::add_depth_concatenate_node(&mut g, params(), &[a.into(), b.into()])
            .unwrap();

        let pass = DepthConcatSubTensorMutator;
        assert_eq!(pass.mutate(&mut g).unwrap(), 1);
        assert!(matches!(
            g.node(cat).unwrap().kind(),
            NodeKind::DepthConcatenate { enabled: false, .. }
        ));
        let b_out = g.node(b).unwrap().output_id(0).unwrap();
        let info = g.tensor(b_out).unwrap().subtensor().unwrap();
        assert_eq!(info.coords, Coordinates::new(vec![0, 0, 1]));
        assert_idempotent(&pass, &mut g);
    }

    #[test]
    fn test_depth_concat_skips_graph_inputs() {
        let mut g = Graph::new("concat");
        let a = input(&mut g, &[2, 2, 1]);
        let b = input(&mut g, &[2, 2, 1]);
        GraphBuilder::add_depth_concatenate_node(&mut g, params(), &[a.into(), b.into()]).unwrap();
        assert_eq!(DepthConcatSubTensorMutator.mutate(&mut g).unwrap(), 0);
    }

    #[test]
    fn test_dead_code_elimination() {
        let mut g = Graph::new("dce");
        let inp = input(&mut g, &[4]);
        let live = relu(&mut g, inp);
        let dead = relu(&mut g, inp);
        GraphBuilder::add_output_node(&mut g, params(), live.into(), None).unwrap();
        let stray = g.add_tensor(TensorDescriptor::new(vec![4], DataType::F32));

        let pass = DeadCodeEliminationMutator;
        assert_eq!(pass.mutate(&mut g).unwrap(), 2);
        assert!(g.node(dead).is_none());
        assert!(g.tensor(stray).is_none());
        assert!(g.node(live).is_some());
        assert_idempotent(&pass, &mut g);
    }
}
