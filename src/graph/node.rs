//! Operation nodes.
//!
//! `NodeKind` is a closed set; backends match on it exhaustively so adding a
//! kind forces every backend to handle it.

use std::collections::BTreeSet;
use std::fmt;

use crate::error::{GraphError, Status};
use crate::graph::graph::Graph;
use crate::graph::tensor::TensorDescriptor;
use crate::graph::types::{
    ActivationLayerInfo, ConvolutionMethod, DataType, DepthwiseConvolutionMethod, EdgeId,
    EltwiseOperation, NodeId, PadStrideInfo, Target, TensorId, TensorShape,
};
use crate::return_error_on;

/// Concatenation axis of [`NodeKind::DepthConcatenate`] (channels)
pub const DEPTH_AXIS: usize = 2;

/// Input index of the optional bias of convolution and fully connected nodes
pub const BIAS_INPUT: usize = 2;

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Input {
        desc: TensorDescriptor,
    },
    Const {
        desc: TensorDescriptor,
    },
    Output,
    Activation {
        info: ActivationLayerInfo,
    },
    Softmax {
        beta: f32,
    },
    Eltwise {
        op: EltwiseOperation,
    },
    /// Inputs: source, weights `[kw, kh, Cin, Cout]`, optional bias `[Cout]`
    Convolution {
        info: PadStrideInfo,
        method: ConvolutionMethod,
        fused_activation: Option<ActivationLayerInfo>,
    },
    /// Inputs: source, weights `[kw, kh, C]`, optional bias `[C]`
    DepthwiseConvolution {
        info: PadStrideInfo,
        method: DepthwiseConvolutionMethod,
    },
    /// Inputs: source, weights `[in_features, num_outputs]`, optional bias
    FullyConnected {
        num_outputs: usize,
    },
    Flatten,
    Reshape {
        shape: TensorShape,
    },
    /// Disabled once its inputs write straight into the output
    DepthConcatenate {
        num_inputs: usize,
        enabled: bool,
    },
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Input { .. } => "Input",
            NodeKind::Const { .. } => "Const",
            NodeKind::Output => "Output",
            NodeKind::Activation { .. } => "Activation",
            NodeKind::Softmax { .. } => "Softmax",
            NodeKind::Eltwise { .. } => "Eltwise",
            NodeKind::Convolution { .. } => "Convolution",
            NodeKind::DepthwiseConvolution { .. } => "DepthwiseConvolution",
            NodeKind::FullyConnected { .. } => "FullyConnected",
            NodeKind::Flatten => "Flatten",
            NodeKind::Reshape { .. } => "Reshape",
            NodeKind::DepthConcatenate { .. } => "DepthConcatenate",
        }
    }

    pub fn num_inputs(&self) -> usize {
        match self {
            NodeKind::Input { .. } | NodeKind::Const { .. } => 0,
            NodeKind::Output
            | NodeKind::Activation { .. }
            | NodeKind::Softmax { .. }
            | NodeKind::Flatten
            | NodeKind::Reshape { .. } => 1,
            NodeKind::Eltwise { .. } => 2,
            NodeKind::Convolution { .. }
            | NodeKind::DepthwiseConvolution { .. }
            | NodeKind::FullyConnected { .. } => 3,
            NodeKind::DepthConcatenate { num_inputs, .. } => *num_inputs,
        }
    }

    pub fn num_outputs(&self) -> usize {
        match self {
            NodeKind::Output => 0,
            _ => 1,
        }
    }

    /// Whether input `idx` must be connected before the node is valid
    pub fn is_input_required(&self, idx: usize) -> bool {
        match self {
            NodeKind::Convolution { .. }
            | NodeKind::DepthwiseConvolution { .. }
            | NodeKind::FullyConnected { .. } => idx != BIAS_INPUT,
            _ => true,
        }
    }

    /// Whether the node's output is filled from outside the graph
    pub fn is_source(&self) -> bool {
        matches!(self, NodeKind::Input { .. } | NodeKind::Const { .. })
    }

    /// Output descriptor from the input descriptors.
    ///
    /// Returns `None` while a required input is missing or unconfigured.
    pub fn output_descriptor(
        &self,
        inputs: &[Option<&TensorDescriptor>],
        idx: usize,
    ) -> Option<TensorDescriptor> {
        if idx >= self.num_outputs() {
            return None;
        }
        let input = |i: usize| inputs.get(i).copied().flatten();

        match self {
            NodeKind::Input { desc } | NodeKind::Const { desc } => Some(desc.clone()),
            NodeKind::Output => None,
            NodeKind::Activation { .. } | NodeKind::Softmax { .. } | NodeKind::Eltwise { .. } => {
                input(0).cloned()
            }
            NodeKind::Convolution { info, .. } => {
                let src = input(0)?;
                let weights = input(1)?;
                let (w, h) = conv_output_dims(&src.shape, &weights.shape, info)?;
                let mut out = src.clone();
                out.shape = TensorShape::new(vec![w, h, weights.shape.dim(3), src.shape.dim(3)]);
                Some(out)
            }
            NodeKind::DepthwiseConvolution { info, .. } => {
                let src = input(0)?;
                let weights = input(1)?;
                let (w, h) = conv_output_dims(&src.shape, &weights.shape, info)?;
                let mut out = src.clone();
                out.shape = TensorShape::new(vec![w, h, src.shape.dim(2), src.shape.dim(3)]);
                Some(out)
            }
            NodeKind::FullyConnected { num_outputs } => {
                let src = input(0)?;
                let mut out = src.clone();
                out.shape = TensorShape::new(vec![*num_outputs, fc_batches(&src.shape)]);
                Some(out)
            }
            NodeKind::Flatten => {
                let src = input(0)?;
                let mut out = src.clone();
                out.shape = TensorShape::new(vec![
                    src.shape.total_size_upper(0) / src.shape.dim(3).max(1),
                    src.shape.dim(3),
                ]);
                Some(out)
            }
            NodeKind::Reshape { shape } => {
                let mut out = input(0)?.clone();
                out.shape = shape.clone();
                Some(out)
            }
            NodeKind::DepthConcatenate { num_inputs, .. } => {
                let first = input(0)?;
                let mut depth = 0;
                for i in 0..*num_inputs {
                    depth += input(i)?.shape.dim(DEPTH_AXIS);
                }
                let mut out = first.clone();
                out.shape.set(DEPTH_AXIS, depth);
                Some(out)
            }
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Spatial output size of a (depthwise) convolution, `None` if the kernel
/// does not fit the padded input.
pub fn conv_output_dims(
    src: &TensorShape,
    weights: &TensorShape,
    info: &PadStrideInfo,
) -> Option<(usize, usize)> {
    let padded_w = src.dim(0) + info.pad_left + info.pad_right;
    let padded_h = src.dim(1) + info.pad_top + info.pad_bottom;
    let (kw, kh) = (weights.dim(0), weights.dim(1));
    if kw > padded_w || kh > padded_h || info.stride_x == 0 || info.stride_y == 0 {
        return None;
    }
    Some((
        (padded_w - kw) / info.stride_x + 1,
        (padded_h - kh) / info.stride_y + 1,
    ))
}

/// Batch count a fully connected layer sees for a given input shape
pub fn fc_batches(src: &TensorShape) -> usize {
    match src.num_dimensions() {
        2 => src.dim(1),
        n if n >= 4 => src.dim(3),
        _ => 1,
    }
}

/// One operation in the graph.
#[derive(Debug, Clone)]
pub struct Node {
    id: NodeId,
    name: String,
    kind: NodeKind,
    assigned_target: Target,
    input_edges: Vec<Option<EdgeId>>,
    outputs: Vec<Option<TensorId>>,
    output_edges: BTreeSet<EdgeId>,
    reachable: bool,
}

impl Node {
    pub(crate) fn new(id: NodeId, kind: NodeKind) -> Self {
        Self {
            id,
            name: String::new(),
            input_edges: vec![None; kind.num_inputs()],
            outputs: Vec::with_capacity(kind.num_outputs()),
            kind,
            assigned_target: Target::Unspecified,
            output_edges: BTreeSet::new(),
            reachable: true,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn kind_mut(&mut self) -> &mut NodeKind {
        &mut self.kind
    }

    pub fn assigned_target(&self) -> Target {
        self.assigned_target
    }

    pub fn set_assigned_target(&mut self, target: Target) {
        self.assigned_target = target;
    }

    pub fn input_edges(&self) -> &[Option<EdgeId>] {
        &self.input_edges
    }

    pub fn input_edge(&self, idx: usize) -> Option<EdgeId> {
        self.input_edges.get(idx).copied().flatten()
    }

    pub fn num_inputs(&self) -> usize {
        self.input_edges.len()
    }

    pub fn outputs(&self) -> &[Option<TensorId>] {
        &self.outputs
    }

    pub fn output_id(&self, idx: usize) -> Option<TensorId> {
        self.outputs.get(idx).copied().flatten()
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    pub fn output_edges(&self) -> &BTreeSet<EdgeId> {
        &self.output_edges
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    pub fn set_reachable(&mut self, reachable: bool) {
        self.reachable = reachable;
    }

    pub(crate) fn set_input_edge(&mut self, idx: usize, edge: Option<EdgeId>) {
        if idx >= self.input_edges.len() {
            self.input_edges.resize(idx + 1, None);
        }
        self.input_edges[idx] = edge;
    }

    pub(crate) fn push_output(&mut self, tensor: TensorId) {
        self.outputs.push(Some(tensor));
    }

    pub(crate) fn add_output_edge(&mut self, edge: EdgeId) {
        self.output_edges.insert(edge);
    }

    pub(crate) fn remove_output_edge(&mut self, edge: EdgeId) {
        self.output_edges.remove(&edge);
    }

    /// Descriptor output `idx` would have given the currently connected inputs
    pub fn configure_output(&self, graph: &Graph, idx: usize) -> Option<TensorDescriptor> {
        let inputs: Vec<Option<&TensorDescriptor>> = (0..self.num_inputs())
            .map(|i| graph.input_descriptor(self.id, i))
            .collect();
        self.kind.output_descriptor(&inputs, idx)
    }

    /// Check arity, data types and shapes against the connected inputs.
    pub fn validate(&self, graph: &Graph) -> Status {
        let expected = self.kind.num_inputs();
        if self.input_edges.len() != expected {
            return Err(GraphError::InvalidArity {
                node: self.id,
                reason: format!(
                    "{} expects {} inputs, got {}",
                    self.kind,
                    expected,
                    self.input_edges.len()
                ),
            });
        }

        let mut inputs = Vec::with_capacity(expected);
        for idx in 0..expected {
            let desc = graph.input_descriptor(self.id, idx);
            if desc.is_none() && self.kind.is_input_required(idx) {
                return Err(GraphError::InvalidArity {
                    node: self.id,
                    reason: format!("{} input {} is not connected", self.kind, idx),
                });
            }
            inputs.push(desc);
        }

        validate_kind(self, &inputs)
    }
}

fn validate_kind(node: &Node, inputs: &[Option<&TensorDescriptor>]) -> Status {
    let kind = &node.kind;
    for (idx, desc) in inputs.iter().enumerate() {
        if let Some(desc) = desc {
            return_error_on!(
                desc.data_type == DataType::Unknown,
                UnsupportedDataType,
                "{} node {} input {} has unknown data type",
                kind,
                node.id,
                idx
            );
        }
    }

    // Required inputs were checked by the caller
    let src = |i: usize| inputs.get(i).copied().flatten();

    match kind {
        NodeKind::Input { desc } | NodeKind::Const { desc } => {
            return_error_on!(
                desc.data_type == DataType::Unknown,
                UnsupportedDataType,
                "{} node {} has unknown data type",
                kind,
                node.id
            );
            return_error_on!(
                desc.shape.total_size() == 0,
                ShapeMismatch,
                "{} node {} has empty shape",
                kind,
                node.id
            );
        }
        NodeKind::Output | NodeKind::Activation { .. } | NodeKind::Flatten => {}
        NodeKind::Softmax { beta } => {
            return_error_on!(
                !beta.is_finite() || *beta <= 0.0,
                InvalidConfiguration,
                "softmax node {} has invalid beta {}",
                node.id,
                beta
            );
        }
        NodeKind::Eltwise { .. } => {
            if let (Some(a), Some(b)) = (src(0), src(1)) {
                return_error_on!(
                    a.shape != b.shape,
                    ShapeMismatch,
                    "eltwise node {}: {} vs {}",
                    node.id,
                    a.shape,
                    b.shape
                );
                return_error_on!(
                    a.data_type != b.data_type,
                    UnsupportedDataType,
                    "eltwise node {} mixes {:?} and {:?}",
                    node.id,
                    a.data_type,
                    b.data_type
                );
            }
        }
        NodeKind::Convolution { info, .. } | NodeKind::DepthwiseConvolution { info, .. } => {
            if let (Some(input), Some(weights)) = (src(0), src(1)) {
                let depthwise = matches!(kind, NodeKind::DepthwiseConvolution { .. });
                let channels = input.shape.dim(2);
                return_error_on!(
                    weights.shape.dim(2) != channels,
                    ShapeMismatch,
                    "{} node {}: weights {} do not match {} input channels",
                    kind,
                    node.id,
                    weights.shape,
                    channels
                );
                return_error_on!(
                    info.stride_x == 0 || info.stride_y == 0,
                    InvalidConfiguration,
                    "{} node {} has zero stride",
                    kind,
                    node.id
                );
                if let Some(bias) = src(BIAS_INPUT) {
                    let out_channels = if depthwise {
                        channels
                    } else {
                        weights.shape.dim(3)
                    };
                    return_error_on!(
                        bias.shape.total_size() != out_channels,
                        ShapeMismatch,
                        "{} node {}: bias {} for {} output channels",
                        kind,
                        node.id,
                        bias.shape,
                        out_channels
                    );
                }
            }
        }
        NodeKind::FullyConnected { num_outputs } => {
            if let (Some(input), Some(weights)) = (src(0), src(1)) {
                let batches = fc_batches(&input.shape);
                let features = input.shape.total_size() / batches.max(1);
                return_error_on!(
                    weights.shape.dim(0) != features || weights.shape.dim(1) != *num_outputs,
                    ShapeMismatch,
                    "fully connected node {}: weights {} for {} features and {} outputs",
                    node.id,
                    weights.shape,
                    features,
                    num_outputs
                );
                if let Some(bias) = src(BIAS_INPUT) {
                    return_error_on!(
                        bias.shape.total_size() != *num_outputs,
                        ShapeMismatch,
                        "fully connected node {}: bias {} for {} outputs",
                        node.id,
                        bias.shape,
                        num_outputs
                    );
                }
            }
        }
        NodeKind::Reshape { shape } => {
            if let Some(input) = src(0) {
                return_error_on!(
                    input.shape.total_size() != shape.total_size(),
                    ShapeMismatch,
                    "reshape node {}: {} into {}",
                    node.id,
                    input.shape,
                    shape
                );
            }
        }
        NodeKind::DepthConcatenate { num_inputs, .. } => {
            if *num_inputs == 0 {
                return Err(GraphError::InvalidArity {
                    node: node.id,
                    reason: "concatenation without inputs".to_string(),
                });
            }
            if let Some(first) = src(0) {
                for idx in 1..*num_inputs {
                    let Some(other) = src(idx) else { continue };
                    let same_plane = (0..4)
                        .filter(|&d| d != DEPTH_AXIS)
                        .all(|d| other.shape.dim(d) == first.shape.dim(d));
                    return_error_on!(
                        !same_plane,
                        ShapeMismatch,
                        "concatenation node {}: input {} is {}, input 0 is {}",
                        node.id,
                        idx,
                        other.shape,
                        first.shape
                    );
                    return_error_on!(
                        other.data_type != first.data_type,
                        UnsupportedDataType,
                        "concatenation node {} mixes data types",
                        node.id
                    );
                }
            }
        }
    }
    Ok(())
}
