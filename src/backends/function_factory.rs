//! Node to operator lowering shared by every backend.
//!
//! Operators hold tensor ids, not storage. At run time they read their
//! inputs through the [`ExecutionContext`], which resolves sub-tensor views
//! and pooled memory, and write their outputs back the same way.

use std::fmt;
use std::sync::Arc;

use rayon::ThreadPool;

use crate::error::{GraphError, GraphResult, Status};
use crate::graph::graph::Graph;
use crate::graph::node::{fc_batches, NodeKind, BIAS_INPUT, DEPTH_AXIS};
use crate::graph::types::{
    ActivationLayerInfo, ConvolutionMethod, DepthwiseConvolutionMethod, EltwiseOperation, NodeId,
    Target, TensorId,
};
use crate::graph::workload::ExecutionContext;
use crate::kernels::{self, activation::activation_in_place, ConvGeometry};

/// Runnable unit of work for one node
pub trait Operator: fmt::Debug {
    fn name(&self) -> &str;

    fn run(&self, ctx: &mut ExecutionContext<'_>) -> Status;
}

/// Build the operator for `node`, `None` if it has no runtime work.
pub fn create_operator(
    target: Target,
    graph: &Graph,
    node: NodeId,
    thread_pool: Option<Arc<ThreadPool>>,
) -> GraphResult<Option<Box<dyn Operator>>> {
    let n = graph
        .node(node)
        .ok_or_else(|| GraphError::InvalidConfiguration(format!("unknown node {}", node)))?;
    let name = format!("{}/{}", target, n.kind());

    let input = |idx: usize| {
        graph.node_input(node, idx).ok_or_else(|| GraphError::InvalidArity {
            node,
            reason: format!("input {} is not connected", idx),
        })
    };
    let output = || {
        n.output_id(0).ok_or_else(|| GraphError::InvalidArity {
            node,
            reason: "output 0 does not exist".to_string(),
        })
    };
    let shape = |id: TensorId| {
        graph
            .tensor(id)
            .map(|t| t.desc().shape.clone())
            .ok_or_else(|| GraphError::InvalidHandle(format!("tensor {} does not exist", id)))
    };

    let op: Box<dyn Operator> = match n.kind() {
        NodeKind::Input { .. } | NodeKind::Const { .. } | NodeKind::Output => return Ok(None),
        NodeKind::DepthConcatenate { enabled: false, .. } => return Ok(None),

        NodeKind::Activation { info } => Box::new(ActivationOp {
            name,
            input: input(0)?,
            output: output()?,
            info: *info,
        }),
        NodeKind::Softmax { beta } => {
            let src = input(0)?;
            Box::new(SoftmaxOp {
                name,
                input: src,
                output: output()?,
                row_len: shape(src)?.dim(0),
                beta: *beta,
            })
        }
        NodeKind::Eltwise { op } => Box::new(EltwiseOp {
            name,
            inputs: [input(0)?, input(1)?],
            output: output()?,
            op: *op,
        }),
        NodeKind::Convolution {
            info,
            method,
            fused_activation,
        } => {
            let src = input(0)?;
            let weights = input(1)?;
            let w_shape = shape(weights)?;
            let geom =
                ConvGeometry::new(&shape(src)?, w_shape.dim(0), w_shape.dim(1), w_shape.dim(3), *info)?;
            Box::new(ConvolutionOp {
                name,
                input: src,
                weights,
                bias: graph.node_input(node, BIAS_INPUT),
                output: output()?,
                geom,
                direct: *method == ConvolutionMethod::Direct,
                fused_activation: *fused_activation,
                thread_pool,
            })
        }
        NodeKind::DepthwiseConvolution { info, method } => {
            let src = input(0)?;
            let weights = input(1)?;
            let src_shape = shape(src)?;
            let w_shape = shape(weights)?;
            let geom = ConvGeometry::new(
                &src_shape,
                w_shape.dim(0),
                w_shape.dim(1),
                src_shape.dim(2),
                *info,
            )?;
            Box::new(DepthwiseConvolutionOp {
                name,
                input: src,
                weights,
                bias: graph.node_input(node, BIAS_INPUT),
                output: output()?,
                geom,
                optimized: *method == DepthwiseConvolutionMethod::Optimized3x3,
            })
        }
        NodeKind::FullyConnected { num_outputs } => {
            let src = input(0)?;
            Box::new(FullyConnectedOp {
                name,
                input: src,
                weights: input(1)?,
                bias: graph.node_input(node, BIAS_INPUT),
                output: output()?,
                batches: fc_batches(&shape(src)?),
                num_outputs: *num_outputs,
            })
        }
        NodeKind::Flatten | NodeKind::Reshape { .. } => Box::new(CopyOp {
            name,
            input: input(0)?,
            output: output()?,
        }),
        NodeKind::DepthConcatenate { num_inputs, .. } => {
            let inputs = (0..*num_inputs).map(input).collect::<GraphResult<Vec<_>>>()?;
            let depths = inputs
                .iter()
                .map(|t| shape(*t).map(|s| s.dim(DEPTH_AXIS)))
                .collect::<GraphResult<Vec<_>>>()?;
            let out = output()?;
            let out_shape = shape(out)?;
            Box::new(ConcatOp {
                name,
                inputs,
                depths,
                output: out,
                plane: out_shape.dim(0) * out_shape.dim(1),
                batches: out_shape.dim(3),
            })
        }
    };

    tracing::debug!("Configured {} for node {}", op.name(), node);
    Ok(Some(op))
}

#[derive(Debug)]
struct ActivationOp {
    name: String,
    input: TensorId,
    output: TensorId,
    info: ActivationLayerInfo,
}

impl Operator for ActivationOp {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, ctx: &mut ExecutionContext<'_>) -> Status {
        // Clone input; the output may alias it
        let src = ctx.read(self.input)?;
        let mut dst = vec![0.0; src.len()];
        kernels::activation(&src, &mut dst, &self.info)?;
        ctx.write(self.output, &dst)
    }
}

#[derive(Debug)]
struct SoftmaxOp {
    name: String,
    input: TensorId,
    output: TensorId,
    row_len: usize,
    beta: f32,
}

impl Operator for SoftmaxOp {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, ctx: &mut ExecutionContext<'_>) -> Status {
        let src = ctx.read(self.input)?;
        let mut dst = vec![0.0; src.len()];
        kernels::softmax(&src, &mut dst, self.row_len, self.beta)?;
        ctx.write(self.output, &dst)
    }
}

#[derive(Debug)]
struct EltwiseOp {
    name: String,
    inputs: [TensorId; 2],
    output: TensorId,
    op: EltwiseOperation,
}

impl Operator for EltwiseOp {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, ctx: &mut ExecutionContext<'_>) -> Status {
        let a = ctx.read(self.inputs[0])?;
        let b = ctx.read(self.inputs[1])?;
        let mut dst = vec![0.0; a.len()];
        kernels::eltwise(&a, &b, &mut dst, self.op)?;
        ctx.write(self.output, &dst)
    }
}

struct ConvolutionOp {
    name: String,
    input: TensorId,
    weights: TensorId,
    bias: Option<TensorId>,
    output: TensorId,
    geom: ConvGeometry,
    direct: bool,
    fused_activation: Option<ActivationLayerInfo>,
    thread_pool: Option<Arc<ThreadPool>>,
}

impl fmt::Debug for ConvolutionOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConvolutionOp")
            .field("name", &self.name)
            .field("geom", &self.geom)
            .field("direct", &self.direct)
            .field("fused_activation", &self.fused_activation)
            .finish()
    }
}

impl Operator for ConvolutionOp {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, ctx: &mut ExecutionContext<'_>) -> Status {
        let src = ctx.read(self.input)?;
        let weights = ctx.read(self.weights)?;
        let bias = self.bias.map(|b| ctx.read(b)).transpose()?;
        let mut dst = vec![0.0; self.geom.output_len()];

        if self.direct {
            kernels::convolution_direct(&src, &weights, bias.as_deref(), &mut dst, &self.geom)?;
        } else {
            kernels::convolution_gemm(
                &src,
                &weights,
                bias.as_deref(),
                &mut dst,
                &self.geom,
                self.thread_pool.as_deref(),
            )?;
        }
        if let Some(info) = &self.fused_activation {
            activation_in_place(&mut dst, info);
        }
        ctx.write(self.output, &dst)
    }
}

#[derive(Debug)]
struct DepthwiseConvolutionOp {
    name: String,
    input: TensorId,
    weights: TensorId,
    bias: Option<TensorId>,
    output: TensorId,
    geom: ConvGeometry,
    optimized: bool,
}

impl Operator for DepthwiseConvolutionOp {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, ctx: &mut ExecutionContext<'_>) -> Status {
        let src = ctx.read(self.input)?;
        let weights = ctx.read(self.weights)?;
        let bias = self.bias.map(|b| ctx.read(b)).transpose()?;
        let mut dst = vec![0.0; self.geom.output_len()];

        if self.optimized {
            kernels::depthwise_convolution_3x3(&src, &weights, bias.as_deref(), &mut dst, &self.geom)?;
        } else {
            kernels::depthwise_convolution(&src, &weights, bias.as_deref(), &mut dst, &self.geom)?;
        }
        ctx.write(self.output, &dst)
    }
}

#[derive(Debug)]
struct FullyConnectedOp {
    name: String,
    input: TensorId,
    weights: TensorId,
    bias: Option<TensorId>,
    output: TensorId,
    batches: usize,
    num_outputs: usize,
}

impl Operator for FullyConnectedOp {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, ctx: &mut ExecutionContext<'_>) -> Status {
        let src = ctx.read(self.input)?;
        let weights = ctx.read(self.weights)?;
        let bias = self.bias.map(|b| ctx.read(b)).transpose()?;
        let mut dst = vec![0.0; self.batches * self.num_outputs];
        kernels::fully_connected(
            &src,
            &weights,
            bias.as_deref(),
            &mut dst,
            self.batches,
            self.num_outputs,
        )?;
        ctx.write(self.output, &dst)
    }
}

/// Flatten and reshape: same elements, new shape
#[derive(Debug)]
struct CopyOp {
    name: String,
    input: TensorId,
    output: TensorId,
}

impl Operator for CopyOp {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, ctx: &mut ExecutionContext<'_>) -> Status {
        let src = ctx.read(self.input)?;
        ctx.write(self.output, &src)
    }
}

#[derive(Debug)]
struct ConcatOp {
    name: String,
    inputs: Vec<TensorId>,
    depths: Vec<usize>,
    output: TensorId,
    plane: usize,
    batches: usize,
}

impl Operator for ConcatOp {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, ctx: &mut ExecutionContext<'_>) -> Status {
        let data = self
            .inputs
            .iter()
            .map(|t| ctx.read(*t))
            .collect::<GraphResult<Vec<_>>>()?;
        let slices: Vec<&[f32]> = data.iter().map(Vec::as_slice).collect();
        let total: usize = self.depths.iter().sum();
        let mut dst = vec![0.0; self.plane * total * self.batches];
        kernels::depth_concatenate(&slices, &self.depths, &mut dst, self.plane, self.batches)?;
        ctx.write(self.output, &dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::builder::{GraphBuilder, LayerAccessors, NodeParams};
    use crate::graph::tensor::TensorDescriptor;
    use crate::graph::types::{DataType, PadStrideInfo};

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
    fn test_no_operator_for_io_nodes() {
        let mut g = Graph::new("io");
        let inp = input(&mut g, &[4]);
        let out = GraphBuilder::add_output_node(&mut g, NodeParams::new("out"), inp.into(), None)
            .unwrap();
        assert!(create_operator(Target::Cpu, &g, inp, None).unwrap().is_none());
        assert!(create_operator(Target::Cpu, &g, out, None).unwrap().is_none());
    }

    #[test]
    fn test_disabled_concat_has_no_operator() {
        let mut g = Graph::new("cat");
        let a = input(&mut g, &[2, 2, 1]);
        let b = input(&mut g, &[2, 2, 1]);
        let cat = GraphBuilder::add_depth_concatenate_node(
            &mut g,
            NodeParams::new("cat"),
            &[a.into(), b.into()],
        )
        .unwrap();
        assert!(create_operator(Target::Cpu, &g, cat, None).unwrap().is_some());
        if let Some(n) = g.node_mut(cat) {
            *n.kind_mut() = NodeKind::DepthConcatenate {
                num_inputs: 2,
                enabled: false,
            };
        }
        assert!(create_operator(Target::Cpu, &g, cat, None).unwrap().is_none());
    }

    #[test]
    fn test_oversized_kernel_reports_insufficient_padding() {
        let mut g = Graph::new("conv");
        let inp = input(&mut g, &[3, 3, 1]);
        let conv = GraphBuilder::add_convolution_node(
            &mut g,
            NodeParams::new("conv"),
            inp.into(),
            (5, 5),
            1,
            PadStrideInfo::default(),
            ConvolutionMethod::Gemm,
            LayerAccessors {
                weights: None,
                bias: None,
            },
        )
        .unwrap();
        let err = create_operator(Target::Cpu, &g, conv, None).unwrap_err();
        assert!(matches!(err, GraphError::InsufficientPadding(_)));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_operator_name_mentions_target() {
        let mut g = Graph::new("sm");
        let inp = input(&mut g, &[4]);
        let sm = GraphBuilder::add_softmax_node(&mut g, NodeParams::new("sm"), inp.into(), 1.0)
            .unwrap();
        let op = create_operator(Target::GpuCompute, &g, sm, None).unwrap().unwrap();
        assert_eq!(op.name(), "GPU-compute/Softmax");
    }
}
