//! Per-target node validation.
//!
//! Besides rejecting what a target cannot run, validation downgrades
//! requested methods the target cannot honour. Every downgrade lands on a
//! method that passes the same rule, so validating twice is a no-op.

use crate::backends::check_node_target;
use crate::error::{GraphError, Status};
use crate::graph::graph::Graph;
use crate::graph::node::NodeKind;
use crate::graph::types::{
    ConvolutionMethod, DataType, DepthwiseConvolutionMethod, NodeId, Target,
};

const DIRECT_KERNEL_SIZES: [usize; 3] = [1, 3, 5];
const SHADER_MAX_DIRECT_STRIDE: usize = 2;

/// Validate `node` for `target`, rewriting unsupported methods in place.
pub fn validate_node(target: Target, graph: &mut Graph, node: NodeId) -> Status {
    check_node_target(graph, node, target)?;
    check_data_types(graph, node)?;

    let weights = graph.input_descriptor(node, 1).map(|d| d.shape.clone());
    let Some(n) = graph.node_mut(node) else {
        return Err(GraphError::InvalidConfiguration(format!("unknown node {}", node)));
    };
    let (kw, kh) = weights
        .as_ref()
        .map(|w| (w.dim(0), w.dim(1)))
        .unwrap_or((0, 0));
    let kind_name = n.kind().name();

    match n.kind_mut() {
        NodeKind::DepthwiseConvolution { method, .. } => {
            if *method == DepthwiseConvolutionMethod::Optimized3x3 && (kw, kh) != (3, 3) {
                tracing::debug!(
                    "Node {}: {}x{} depthwise kernel, falling back to default method",
                    node,
                    kw,
                    kh
                );
                *method = DepthwiseConvolutionMethod::Default;
            }
        }
        NodeKind::Convolution { info, method, .. } => {
            if *method == ConvolutionMethod::Direct {
                let supported_kernel = kw == kh && DIRECT_KERNEL_SIZES.contains(&kw);
                let fallback = match target {
                    Target::GpuShader => {
                        let stride_ok = info.stride_x <= SHADER_MAX_DIRECT_STRIDE
                            && info.stride_y <= SHADER_MAX_DIRECT_STRIDE;
                        (!(supported_kernel && stride_ok)).then_some(ConvolutionMethod::Default)
                    }
                    _ => (!supported_kernel).then_some(ConvolutionMethod::Gemm),
                };
                if let Some(fallback) = fallback {
                    tracing::debug!(
                        "Node {}: direct convolution unsupported for {}x{} kernel on {}, using {:?}",
                        node,
                        kw,
                        kh,
                        target,
                        fallback
                    );
                    *method = fallback;
                }
            }
        }
        NodeKind::Flatten | NodeKind::Reshape { .. } if target == Target::GpuShader => {
            return Err(GraphError::UnsupportedOperation(format!(
                "{} is not supported on {}",
                kind_name, target
            )));
        }
        _ => {}
    }
    Ok(())
}

/// Reference kernels only run F32
fn check_data_types(graph: &Graph, node: NodeId) -> Status {
    let Some(n) = graph.node(node) else {
        return Ok(());
    };
    if n.kind().is_source() || matches!(n.kind(), NodeKind::Output) {
        return Ok(());
    }
    for idx in 0..n.num_inputs() {
        if let Some(desc) = graph.input_descriptor(node, idx) {
            if desc.data_type != DataType::F32 {
                return Err(GraphError::UnsupportedDataType(format!(
                    "{} node {} input {} is {:?}, only F32 is supported",
                    n.kind(),
                    node,
                    idx,
                    desc.data_type
                )));
            }
        }
    }
    Ok(())
}
