//! Concatenation along the channel dimension of `[W, H, C, N]` tensors

use crate::error::{GraphError, Status};
use crate::kernels::check_len;

/// Copy each input's channels into `dst`, in input order.
///
/// `plane` is `W * H`; `depths[i]` the channel count of input `i`.
pub fn depth_concatenate(
    inputs: &[&[f32]],
    depths: &[usize],
    dst: &mut [f32],
    plane: usize,
    batches: usize,
) -> Status {
    if inputs.len() != depths.len() {
        return Err(GraphError::InternalError(format!(
            "{} concatenation inputs but {} depths",
            inputs.len(),
            depths.len()
        )));
    }
    let total_depth: usize = depths.iter().sum();
    check_len("concatenation output", dst.len(), plane * total_depth * batches)?;
    for (idx, (input, depth)) in inputs.iter().zip(depths).enumerate() {
        check_len(
            &format!("concatenation input {}", idx),
            input.len(),
            plane * depth * batches,
        )?;
    }

    let out_batch = plane * total_depth;
    for n in 0..batches {
        let mut offset = n * out_batch;
        for (input, depth) in inputs.iter().zip(depths) {
            let len = plane * depth;
            dst[offset..offset + len].copy_from_slice(&input[n * len..(n + 1) * len]);
            offset += len;
        }
    }
    Ok(())
}
