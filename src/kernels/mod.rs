//! Reference F32 kernels for host-visible memory
//!
//! Organized by operation type:
//! - `activation`: element-wise activation functions
//! - `softmax`: row-wise softmax along the innermost dimension
//! - `eltwise`: element-wise add, sub and mul
//! - `convolution`: direct and im2col + GEMM convolution
//! - `depthwise`: generic and 3x3 depthwise convolution
//! - `fully_connected`: matrix-vector products per batch
//! - `concat`: depth concatenation
//!
//! Kernels take plain slices and a geometry; reading and writing tensor
//! storage is the caller's job.

pub mod activation;
pub mod concat;
pub mod convolution;
pub mod depthwise;
pub mod eltwise;
pub mod fully_connected;
pub mod softmax;

pub use activation::activation;
pub use concat::depth_concatenate;
pub use convolution::{convolution_direct, convolution_gemm, ConvGeometry};
pub use depthwise::{depthwise_convolution, depthwise_convolution_3x3};
pub use eltwise::eltwise;
pub use fully_connected::fully_connected;
pub use softmax::softmax;

use crate::error::{GraphError, Status};

pub(crate) fn check_len(what: &str, actual: usize, expected: usize) -> Status {
    if actual != expected {
        return Err(GraphError::ShapeMismatch(format!(
            "{}: buffer holds {} elements, expected {}",
            what, actual, expected
        )));
    }
    Ok(())
}
