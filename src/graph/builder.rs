//! Typed helpers that create a node and wire its inputs in one call.

use crate::error::{GraphError, GraphResult};
use crate::graph::graph::Graph;
use crate::graph::node::{NodeKind, BIAS_INPUT};
use crate::graph::tensor::{TensorAccessor, TensorDescriptor};
use crate::graph::types::{
    ActivationLayerInfo, ConvolutionMethod, DataType, DepthwiseConvolutionMethod,
    EltwiseOperation, NodeId, PadStrideInfo, Target, TensorShape,
};

/// Output `index` of node `node_id`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeIdxPair {
    pub node_id: NodeId,
    pub index: usize,
}

impl NodeIdxPair {
    pub fn new(node_id: NodeId, index: usize) -> Self {
        Self { node_id, index }
    }
}

impl From<NodeId> for NodeIdxPair {
    fn from(node_id: NodeId) -> Self {
        Self { node_id, index: 0 }
    }
}

/// Common parameters of every created node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeParams {
    pub name: String,
    pub target: Target,
}

impl NodeParams {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: Target::Unspecified,
        }
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }
}

/// Weights and bias accessors of a layer with trainable parameters
pub struct LayerAccessors {
    pub weights: Option<Box<dyn TensorAccessor>>,
    /// No bias input is created when `None`
    pub bias: Option<Box<dyn TensorAccessor>>,
}

impl LayerAccessors {
    pub fn weights_only(weights: Box<dyn TensorAccessor>) -> Self {
        Self {
            weights: Some(weights),
            bias: None,
        }
    }

    pub fn with_bias(weights: Box<dyn TensorAccessor>, bias: Box<dyn TensorAccessor>) -> Self {
        Self {
            weights: Some(weights),
            bias: Some(bias),
        }
    }
}

pub struct GraphBuilder;

impl GraphBuilder {
    pub fn add_input_node(
        g: &mut Graph,
        params: NodeParams,
        desc: TensorDescriptor,
        accessor: Option<Box<dyn TensorAccessor>>,
    ) -> GraphResult<NodeId> {
        let nid = create_node(g, &params, NodeKind::Input { desc }, &[])?;
        set_accessor(g, nid, accessor);
        Ok(nid)
    }

    pub fn add_const_node(
        g: &mut Graph,
        params: NodeParams,
        desc: TensorDescriptor,
        accessor: Option<Box<dyn TensorAccessor>>,
    ) -> GraphResult<NodeId> {
        let nid = create_node(g, &params, NodeKind::Const { desc }, &[])?;
        set_accessor(g, nid, accessor);
        Ok(nid)
    }

    /// Output node. The accessor is bound to the tensor feeding it.
    pub fn add_output_node(
        g: &mut Graph,
        params: NodeParams,
        input: NodeIdxPair,
        accessor: Option<Box<dyn TensorAccessor>>,
    ) -> GraphResult<NodeId> {
        let nid = create_node(g, &params, NodeKind::Output, &[input])?;
        if let (Some(accessor), Some(tensor)) = (accessor, g.node_input(nid, 0)) {
            if let Some(t) = g.tensor_mut(tensor) {
                t.set_accessor(accessor);
            }
        }
        Ok(nid)
    }

    pub fn add_activation_node(
        g: &mut Graph,
        params: NodeParams,
        input: NodeIdxPair,
        info: ActivationLayerInfo,
    ) -> GraphResult<NodeId> {
        create_node(g, &params, NodeKind::Activation { info }, &[input])
    }

    pub fn add_softmax_node(
        g: &mut Graph,
        params: NodeParams,
        input: NodeIdxPair,
        beta: f32,
    ) -> GraphResult<NodeId> {
        create_node(g, &params, NodeKind::Softmax { beta }, &[input])
    }

    pub fn add_elementwise_node(
        g: &mut Graph,
        params: NodeParams,
        input0: NodeIdxPair,
        input1: NodeIdxPair,
        op: EltwiseOperation,
    ) -> GraphResult<NodeId> {
        create_node(g, &params, NodeKind::Eltwise { op }, &[input0, input1])
    }

    /// Convolution with `num_ofm` output feature maps.
    ///
    /// Weights `[kw, kh, Cin, num_ofm]` and bias `[num_ofm]` are created as
    /// const nodes of the input's data type.
    #[allow(clippy::too_many_arguments)]
    pub fn add_convolution_node(
        g: &mut Graph,
        params: NodeParams,
        input: NodeIdxPair,
        kernel: (usize, usize),
        num_ofm: usize,
        conv_info: PadStrideInfo,
        method: ConvolutionMethod,
        accessors: LayerAccessors,
    ) -> GraphResult<NodeId> {
        let src = input_desc(g, input)?;
        let weights_desc = TensorDescriptor::new(
            vec![kernel.0, kernel.1, src.shape.dim(2), num_ofm],
            src.data_type,
        )
        .with_quant_info(src.quant_info);
        let bias_desc = TensorDescriptor::new(vec![num_ofm], bias_type(src.data_type));

        let kind = NodeKind::Convolution {
            info: conv_info,
            method,
            fused_activation: None,
        };
        create_layer(g, &params, kind, input, weights_desc, bias_desc, accessors)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_depthwise_convolution_node(
        g: &mut Graph,
        params: NodeParams,
        input: NodeIdxPair,
        kernel: (usize, usize),
        conv_info: PadStrideInfo,
        method: DepthwiseConvolutionMethod,
        accessors: LayerAccessors,
    ) -> GraphResult<NodeId> {
        let src = input_desc(g, input)?;
        let channels = src.shape.dim(2);
        let weights_desc =
            TensorDescriptor::new(vec![kernel.0, kernel.1, channels], src.data_type)
                .with_quant_info(src.quant_info);
        let bias_desc = TensorDescriptor::new(vec![channels], bias_type(src.data_type));

        let kind = NodeKind::DepthwiseConvolution {
            info: conv_info,
            method,
        };
        create_layer(g, &params, kind, input, weights_desc, bias_desc, accessors)
    }

    pub fn add_fully_connected_layer(
        g: &mut Graph,
        params: NodeParams,
        input: NodeIdxPair,
        num_outputs: usize,
        accessors: LayerAccessors,
    ) -> GraphResult<NodeId> {
        let src = input_desc(g, input)?;
        let batches = crate::graph::node::fc_batches(&src.shape);
        let features = src.shape.total_size() / batches.max(1);
        let weights_desc = TensorDescriptor::new(vec![features, num_outputs], src.data_type)
            .with_quant_info(src.quant_info);
        let bias_desc = TensorDescriptor::new(vec![num_outputs], bias_type(src.data_type));

        let kind = NodeKind::FullyConnected { num_outputs };
        create_layer(g, &params, kind, input, weights_desc, bias_desc, accessors)
    }

    pub fn add_flatten_node(
        g: &mut Graph,
        params: NodeParams,
        input: NodeIdxPair,
    ) -> GraphResult<NodeId> {
        create_node(g, &params, NodeKind::Flatten, &[input])
    }

    pub fn add_reshape_node(
        g: &mut Graph,
        params: NodeParams,
        input: NodeIdxPair,
        shape: TensorShape,
    ) -> GraphResult<NodeId> {
        create_node(g, &params, NodeKind::Reshape { shape }, &[input])
    }

    pub fn add_depth_concatenate_node(
        g: &mut Graph,
        params: NodeParams,
        inputs: &[NodeIdxPair],
    ) -> GraphResult<NodeId> {
        if inputs.is_empty() {
            return Err(GraphError::InvalidConfiguration(
                "depth concatenation needs at least one input".to_string(),
            ));
        }
        let kind = NodeKind::DepthConcatenate {
            num_inputs: inputs.len(),
            enabled: true,
        };
        create_node(g, &params, kind, inputs)
    }
}

fn create_node(
    g: &mut Graph,
    params: &NodeParams,
    kind: NodeKind,
    inputs: &[NodeIdxPair],
) -> GraphResult<NodeId> {
    let nid = g.add_node(kind);
    if let Some(node) = g.node_mut(nid) {
        node.set_name(params.name.clone());
        node.set_assigned_target(params.target);
    }
    for (idx, input) in inputs.iter().enumerate() {
        g.add_connection(input.node_id, input.index, nid, idx)?;
    }
    Ok(nid)
}

fn create_layer(
    g: &mut Graph,
    params: &NodeParams,
    kind: NodeKind,
    input: NodeIdxPair,
    weights_desc: TensorDescriptor,
    bias_desc: TensorDescriptor,
    accessors: LayerAccessors,
) -> GraphResult<NodeId> {
    let LayerAccessors { weights, bias } = accessors;
    let w_params = NodeParams {
        name: format!("{}Weights", params.name),
        target: params.target,
    };
    let w_nid = GraphBuilder::add_const_node(g, w_params, weights_desc, weights)?;

    let b_nid = match bias {
        Some(bias) => {
            let b_params = NodeParams {
                name: format!("{}Bias", params.name),
                target: params.target,
            };
            Some(GraphBuilder::add_const_node(g, b_params, bias_desc, Some(bias))?)
        }
        None => None,
    };

    let nid = create_node(g, params, kind, &[input, NodeIdxPair::from(w_nid)])?;
    if let Some(b_nid) = b_nid {
        g.add_connection(b_nid, 0, nid, BIAS_INPUT)?;
    }
    Ok(nid)
}

fn input_desc(g: &Graph, input: NodeIdxPair) -> GraphResult<TensorDescriptor> {
    g.node(input.node_id)
        .and_then(|n| n.output_id(input.index))
        .and_then(|t| g.tensor(t))
        .map(|t| t.desc().clone())
        .ok_or_else(|| {
            GraphError::InvalidConfiguration(format!(
                "node {} has no output {}",
                input.node_id, input.index
            ))
        })
}

fn bias_type(data_type: DataType) -> DataType {
    match data_type {
        DataType::QAsymm8 => DataType::S32,
        other => other,
    }
}

fn set_accessor(g: &mut Graph, nid: NodeId, accessor: Option<Box<dyn TensorAccessor>>) {
    let Some(accessor) = accessor else { return };
    let tensor = g.node(nid).and_then(|n| n.output_id(0));
    if let Some(t) = tensor.and_then(|t| g.tensor_mut(t)) {
        t.set_accessor(accessor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(g: &mut Graph, dims: &[usize]) -> NodeId {
        GraphBuilder::add_input_node(
            g,
            NodeParams::new("in"),
            TensorDescriptor::new(dims.to_vec(), DataType::F32),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_convolution_creates_weight_and_bias_nodes() {
        let mut g = Graph::new("conv");
        let inp = input(&mut g, &[8, 8, 3]);
        let conv = GraphBuilder::add_convolution_node(
            &mut g,
            NodeParams::new("conv1"),
            inp.into(),
            (3, 3),
            16,
            PadStrideInfo::new(1, 1, 1, 1),
            ConvolutionMethod::Default,
            LayerAccessors::with_bias(Box::new(|_: &mut [f32]| true), Box::new(|_: &mut [f32]| true)),
        )
        .unwrap();

        assert_eq!(g.const_nodes().len(), 2);
        let weights = g.input_descriptor(conv, 1).unwrap();
        assert_eq!(weights.shape, TensorShape::new(vec![3, 3, 3, 16]));
        assert!(g.input_descriptor(conv, BIAS_INPUT).is_some());
        let out = g.node(conv).unwrap().output_id(0).unwrap();
        assert_eq!(
            g.tensor(out).unwrap().desc().shape,
            TensorShape::new(vec![8, 8, 16])
        );
        assert!(g.validate_node(conv).is_ok());
    }

    #[test]
    fn test_convolution_without_bias() {
        let mut g = Graph::new("conv");
        let inp = input(&mut g, &[4, 4, 2]);
        let conv = GraphBuilder::add_convolution_node(
            &mut g,
            NodeParams::new("conv1"),
            inp.into(),
            (1, 1),
            4,
            PadStrideInfo::default(),
            ConvolutionMethod::Gemm,
            LayerAccessors::weights_only(Box::new(|_: &mut [f32]| true)),
        )
        .unwrap();
        assert!(g.node_input(conv, BIAS_INPUT).is_none());
        assert!(g.validate_node(conv).is_ok());
    }

    #[test]
    fn test_output_accessor_bound_to_input_tensor() {
        let mut g = Graph::new("out");
        let inp = input(&mut g, &[4]);
        let out = GraphBuilder::add_output_node(
            &mut g,
            NodeParams::new("out"),
            inp.into(),
            Some(Box::new(|_: &mut [f32]| true)),
        )
        .unwrap();
        let t = g.node_input(out, 0).unwrap();
        assert!(g.tensor(t).unwrap().has_accessor());
    }

    #[test]
    fn test_params_set_name_and_target() {
        let mut g = Graph::new("p");
        let inp = input(&mut g, &[4]);
        let sm = GraphBuilder::add_softmax_node(
            &mut g,
            NodeParams::new("prob").with_target(Target::GpuCompute),
            inp.into(),
            1.0,
        )
        .unwrap();
        let node = g.node(sm).unwrap();
        assert_eq!(node.name(), "prob");
        assert_eq!(node.assigned_target(), Target::GpuCompute);
    }

    #[test]
    fn test_empty_concat_rejected() {
        let mut g = Graph::new("c");
        assert!(GraphBuilder::add_depth_concatenate_node(&mut g, NodeParams::new("cat"), &[])
            .is_err());
    }
}
