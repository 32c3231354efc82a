//! Fully connected layer: `out[o, b] = sum_f in[f, b] * w[f, o] + bias[o]`

use rayon::prelude::*;

use crate::error::{GraphError, Status};
use crate::kernels::check_len;

pub fn fully_connected(
    src: &[f32],
    weights: &[f32],
    bias: Option<&[f32]>,
    dst: &mut [f32],
    batches: usize,
    num_outputs: usize,
) -> Status {
    if batches == 0 || src.len() % batches != 0 {
        return Err(GraphError::ShapeMismatch(format!(
            "fully connected: {} input elements for {} batches",
            src.len(),
            batches
        )));
    }
    let features = src.len() / batches;
    check_len("fully connected weights", weights.len(), features * num_outputs)?;
    if let Some(bias) = bias {
        check_len("fully connected bias", bias.len(), num_outputs)?;
    }
    check_len("fully connected output", dst.len(), batches * num_outputs)?;

    dst.par_chunks_mut(num_outputs.max(1))
        .zip(src.par_chunks(features.max(1)))
        .for_each(|(out, input)| {
            for (o, value) in out.iter_mut().enumerate() {
                let w = &weights[o * features..(o + 1) * features];
                let acc: f32 = input.iter().zip(w).map(|(x, w)| x * w).sum();
                *value = acc + bias.map_or(0.0, |b| b[o]);
            }
        });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_batch() {
        // 3 features -> 2 outputs
        let weights = [1.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let mut out = [0.0; 2];
        fully_connected(&[1.0, 2.0, 3.0], &weights, Some(&[0.5, -1.0]), &mut out, 1, 2).unwrap();
        assert_eq!(out, [1.5, 5.0]);
    }

    #[test]
    fn test_batches() {
        let weights = [1.0, 1.0];
        let mut out = [0.0; 3];
        fully_connected(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &weights, None, &mut out, 3, 1).unwrap();
        assert_eq!(out, [3.0, 7.0, 11.0]);
    }

    #[test]
    fn test_weight_shape_checked() {
        let mut out = [0.0; 2];
        assert!(fully_connected(&[1.0; 3], &[1.0; 4], None, &mut out, 1, 2).is_err());
    }
}
