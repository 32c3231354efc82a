//! Softmax along the innermost dimension

use crate::error::{GraphError, Status};
use crate::kernels::check_len;

/// Row-wise softmax: `out = exp(beta * (x - max)) / sum`
///
/// `row_len` is the size of dimension 0; every row is normalized independently.
pub fn softmax(input: &[f32], output: &mut [f32], row_len: usize, beta: f32) -> Status {
    check_len("softmax output", output.len(), input.len())?;
    if row_len == 0 || input.len() % row_len != 0 {
        return Err(GraphError::ShapeMismatch(format!(
            "softmax: {} elements do not split into rows of {}",
            input.len(),
            row_len
        )));
    }

    for (src, dst) in input.chunks(row_len).zip(output.chunks_mut(row_len)) {
        let max_val = src.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let mut sum = 0.0f32;
        for (o, &x) in dst.iter_mut().zip(src) {
            *o = (beta * (x - max_val)).exp();
            sum += *o;
        }
        let inv_sum = if sum > 0.0 { 1.0 / sum } else { 1.0 };
        dst.iter_mut().for_each(|o| *o *= inv_sum);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_input() {
        let mut out = [0.0; 4];
        softmax(&[1.0; 4], &mut out, 4, 1.0).unwrap();
        assert_eq!(out, [0.25; 4]);
    }

    #[test]
    fn test_rows_normalized_independently() {
        let input = [1.0, 2.0, 3.0, 10.0, 10.0, 10.0];
        let mut out = [0.0; 6];
        softmax(&input, &mut out, 3, 1.0).unwrap();
        let row0: f32 = out[..3].iter().sum();
        assert!((row0 - 1.0).abs() < 1e-6);
        assert!(out[2] > out[1] && out[1] > out[0]);
        for v in &out[3..] {
            assert!((v - 1.0 / 3.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_large_values_are_stable() {
        let mut out = [0.0; 2];
        softmax(&[1000.0, 1000.0], &mut out, 2, 1.0).unwrap();
        assert_eq!(out, [0.5, 0.5]);
    }

    #[test]
    fn test_ragged_rows_rejected() {
        let mut out = [0.0; 5];
        assert!(softmax(&[0.0; 5], &mut out, 2, 1.0).is_err());
    }
}
