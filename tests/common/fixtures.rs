//! Deterministic data and small reference networks shared by the integration tests.

use std::cell::RefCell;
use std::rc::Rc;

use graphforge::graph::{
    ActivationFunction, ActivationLayerInfo, ConvolutionMethod, DataType,
    DepthwiseConvolutionMethod, EltwiseOperation, LayerAccessors, NodeId, PadStrideInfo,
    TensorAccessor,
};
use graphforge::{Graph, GraphBuilder, GraphResult, NodeParams, TensorDescriptor};

/// Output values written by an output accessor
pub type Capture = Rc<RefCell<Vec<f32>>>;

// ============================================================================
// Data
// ============================================================================

/// Values in [-1, 1) from a 32-bit LCG. Same seed, same sequence.
pub fn pseudo_random(len: usize, seed: u32) -> Vec<f32> {
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (state >> 8) as f32 / (1u32 << 23) as f32 - 1.0
        })
        .collect()
}

/// Accessor filling its tensor with [`pseudo_random`] data
pub fn filler(seed: u32) -> Box<dyn TensorAccessor> {
    Box::new(move |data: &mut [f32]| {
        data.copy_from_slice(&pseudo_random(data.len(), seed));
        true
    })
}

/// Accessor filling its tensor with `values`
pub fn constant(values: Vec<f32>) -> Box<dyn TensorAccessor> {
    Box::new(move |data: &mut [f32]| {
        if data.len() != values.len() {
            return false;
        }
        data.copy_from_slice(&values);
        true
    })
}

/// Accessor copying its tensor into `sink`
pub fn capture(sink: &Capture) -> Box<dyn TensorAccessor> {
    let sink = Rc::clone(sink);
    Box::new(move |data: &mut [f32]| {
        *sink.borrow_mut() = data.to_vec();
        true
    })
}

pub fn new_capture() -> Capture {
    Rc::new(RefCell::new(Vec::new()))
}

// ============================================================================
// Networks
// ============================================================================

/// Node ids of [`build_conv_net`] that tests inspect
#[derive(Debug, Clone, Copy)]
pub struct ConvNet {
    pub input: NodeId,
    pub conv1: NodeId,
    pub relu1: NodeId,
    pub depthwise: NodeId,
    pub pointwise: NodeId,
    pub relu2: NodeId,
    pub concat: NodeId,
    pub fc: NodeId,
    pub leaky: NodeId,
    pub softmax: NodeId,
    pub output: NodeId,
}

/// Small branchy classifier over a `[6, 6, 3]` input:
///
/// ```text
/// input -> conv3x3(4) -> relu -+-> depthwise3x3 ------------+-> concat(6)
///                              +-> conv1x1(2) -> relu ------+
/// concat -> flatten -> fc(10) -> leaky relu -> softmax -> output
/// ```
///
/// Every activation is a candidate for fusion or in-place execution and the
/// concatenation is a candidate for sub-tensor inputs.
pub fn build_conv_net(name: &str, sink: &Capture) -> GraphResult<(Graph, ConvNet)> {
    let mut g = Graph::new(name);
    let input = GraphBuilder::add_input_node(
        &mut g,
        NodeParams::new("input"),
        TensorDescriptor::new(vec![6, 6, 3], DataType::F32),
        Some(filler(1)),
    )?;
    let conv1 = GraphBuilder::add_convolution_node(
        &mut g,
        NodeParams::new("conv1"),
        input.into(),
        (3, 3),
        4,
        PadStrideInfo::new(1, 1, 1, 1),
        ConvolutionMethod::Gemm,
        LayerAccessors::with_bias(filler(2), filler(3)),
    )?;
    let relu1 = GraphBuilder::add_activation_node(
        &mut g,
        NodeParams::new("relu1"),
        conv1.into(),
        ActivationLayerInfo::relu(),
    )?;
    let depthwise = GraphBuilder::add_depthwise_convolution_node(
        &mut g,
        NodeParams::new("dw"),
        relu1.into(),
        (3, 3),
        PadStrideInfo::new(1, 1, 1, 1),
        DepthwiseConvolutionMethod::Optimized3x3,
        LayerAccessors::with_bias(filler(4), filler(5)),
    )?;
    let pointwise = GraphBuilder::add_convolution_node(
        &mut g,
        NodeParams::new("pw"),
        relu1.into(),
        (1, 1),
        2,
        PadStrideInfo::new(1, 1, 0, 0),
        ConvolutionMethod::Direct,
        LayerAccessors::weights_only(filler(6)),
    )?;
    let relu2 = GraphBuilder::add_activation_node(
        &mut g,
        NodeParams::new("relu2"),
        pointwise.into(),
        ActivationLayerInfo::relu(),
    )?;
    let concat = GraphBuilder::add_depth_concatenate_node(
        &mut g,
        NodeParams::new("concat"),
        &[depthwise.into(), relu2.into()],
    )?;
    let flatten = GraphBuilder::add_flatten_node(&mut g, NodeParams::new("flatten"), concat.into())?;
    let fc = GraphBuilder::add_fully_connected_layer(
        &mut g,
        NodeParams::new("fc"),
        flatten.into(),
        10,
        LayerAccessors::with_bias(filler(7), filler(8)),
    )?;
    let leaky = GraphBuilder::add_activation_node(
        &mut g,
        NodeParams::new("leaky"),
        fc.into(),
        ActivationLayerInfo::with_params(ActivationFunction::LeakyRelu, 0.1, 0.0),
    )?;
    let softmax = GraphBuilder::add_softmax_node(&mut g, NodeParams::new("softmax"), leaky.into(), 1.0)?;
    let output = GraphBuilder::add_output_node(
        &mut g,
        NodeParams::new("output"),
        softmax.into(),
        Some(capture(sink)),
    )?;

    Ok((
        g,
        ConvNet {
            input,
            conv1,
            relu1,
            depthwise,
            pointwise,
            relu2,
            concat,
            fc,
            leaky,
            softmax,
            output,
        },
    ))
}

/// Node ids of [`build_diamond`]
#[derive(Debug, Clone, Copy)]
pub struct Diamond {
    pub input: NodeId,
    pub a: NodeId,
    pub b: NodeId,
    pub c: NodeId,
    pub d: NodeId,
    pub output: NodeId,
}

/// `input -> A(relu) -> {B(relu), C(abs)} -> D(add) -> output`
pub fn build_diamond(input: Vec<f32>, sink: &Capture) -> GraphResult<(Graph, Diamond)> {
    let mut g = Graph::new("diamond");
    let len = input.len();
    let inp = GraphBuilder::add_input_node(
        &mut g,
        NodeParams::new("in"),
        TensorDescriptor::new(vec![len], DataType::F32),
        Some(constant(input)),
    )?;
    let a = GraphBuilder::add_activation_node(&mut g, NodeParams::new("A"), inp.into(), ActivationLayerInfo::relu())?;
    let b = GraphBuilder::add_activation_node(&mut g, NodeParams::new("B"), a.into(), ActivationLayerInfo::relu())?;
    let c = GraphBuilder::add_activation_node(
        &mut g,
        NodeParams::new("C"),
        a.into(),
        ActivationLayerInfo::new(ActivationFunction::Abs),
    )?;
    let d = GraphBuilder::add_elementwise_node(&mut g, NodeParams::new("D"), b.into(), c.into(), EltwiseOperation::Add)?;
    let output = GraphBuilder::add_output_node(&mut g, NodeParams::new("out"), d.into(), Some(capture(sink)))?;
    Ok((
        g,
        Diamond {
            input: inp,
            a,
            b,
            c,
            d,
            output,
        },
    ))
}
