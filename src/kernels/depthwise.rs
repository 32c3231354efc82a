//! Depthwise convolution: one `[kw, kh]` filter per channel.

use crate::error::{GraphError, Status};
use crate::kernels::check_len;
use crate::kernels::convolution::ConvGeometry;

fn check_buffers(
    geom: &ConvGeometry,
    src: &[f32],
    weights: &[f32],
    bias: Option<&[f32]>,
    dst: &[f32],
) -> Status {
    if geom.out_c != geom.in_c {
        return Err(GraphError::ShapeMismatch(format!(
            "depthwise convolution maps {} channels to {}",
            geom.in_c, geom.out_c
        )));
    }
    check_len("depthwise input", src.len(), geom.input_len())?;
    check_len(
        "depthwise weights",
        weights.len(),
        geom.kernel_w * geom.kernel_h * geom.in_c,
    )?;
    if let Some(bias) = bias {
        check_len("depthwise bias", bias.len(), geom.in_c)?;
    }
    check_len("depthwise output", dst.len(), geom.output_len())
}

pub fn depthwise_convolution(
    src: &[f32],
    weights: &[f32],
    bias: Option<&[f32]>,
    dst: &mut [f32],
    geom: &ConvGeometry,
) -> Status {
    check_buffers(geom, src, weights, bias, dst)?;
    let plane = geom.out_w * geom.out_h;
    let taps = geom.kernel_w * geom.kernel_h;

    for n in 0..geom.batches {
        for c in 0..geom.in_c {
            let w = &weights[c * taps..(c + 1) * taps];
            for oy in 0..geom.out_h {
                for ox in 0..geom.out_w {
                    let mut acc = 0.0f32;
                    for ky in 0..geom.kernel_h {
                        for kx in 0..geom.kernel_w {
                            acc += geom.sample(src, n, c, ox, oy, kx, ky)
                                * w[kx + geom.kernel_w * ky];
                        }
                    }
                    if let Some(bias) = bias {
                        acc += bias[c];
                    }
                    dst[ox + geom.out_w * oy + plane * (c + geom.in_c * n)] = acc;
                }
            }
        }
    }
    Ok(())
}

/// Unrolled variant for 3x3 filters.
pub fn depthwise_convolution_3x3(
    src: &[f32],
    weights: &[f32],
    bias: Option<&[f32]>,
    dst: &mut [f32],
    geom: &ConvGeometry,
) -> Status {
    if geom.kernel_w != 3 || geom.kernel_h != 3 {
        return Err(GraphError::UnsupportedOperation(format!(
            "3x3 depthwise kernel asked to run a {}x{} filter",
            geom.kernel_w, geom.kernel_h
        )));
    }
    check_buffers(geom, src, weights, bias, dst)?;
    let plane = geom.out_w * geom.out_h;

    for n in 0..geom.batches {
        for c in 0..geom.in_c {
            let w = &weights[c * 9..(c + 1) * 9];
            let b = bias.map(|b| b[c]);
            for oy in 0..geom.out_h {
                for ox in 0..geom.out_w {
                    let s = |kx, ky| geom.sample(src, n, c, ox, oy, kx, ky);
                    let mut acc = 0.0f32;
                    acc += s(0, 0) * w[0];
                    acc += s(1, 0) * w[1];
                    acc += s(2, 0) * w[2];
                    acc += s(0, 1) * w[3];
                    acc += s(1, 1) * w[4];
                    acc += s(2, 1) * w[5];
                    acc += s(0, 2) * w[6];
                    acc += s(1, 2) * w[7];
                    acc += s(2, 2) * w[8];
                    if let Some(b) = b {
                        acc += b;
                    }
                    dst[ox + geom.out_w * oy + plane * (c + geom.in_c * n)] = acc;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::types::{PadStrideInfo, TensorShape};

    fn geom(dims: &[usize], k: usize, info: PadStrideInfo) -> ConvGeometry {
        let shape = TensorShape::new(dims.to_vec());
        ConvGeometry::new(&shape, k, k, shape.dim(2), info).unwrap()
    }

    #[test]
    fn test_channels_are_independent() {
        let g = geom(&[2, 2, 2], 1, PadStrideInfo::default());
        let src = [1.0, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0];
        let mut dst = [0.0; 8];
        depthwise_convolution(&src, &[2.0, 0.5], None, &mut dst, &g).unwrap();
        assert_eq!(dst, [2.0, 4.0, 6.0, 8.0, 5.0, 10.0, 15.0, 20.0]);
    }

    #[test]
    fn test_3x3_matches_generic() {
        let g = geom(&[6, 5, 3], 3, PadStrideInfo::new(1, 1, 1, 1));
        let src: Vec<f32> = (0..g.input_len()).map(|v| (v % 11) as f32 - 5.0).collect();
        let weights: Vec<f32> = (0..27).map(|v| (v % 4) as f32 * 0.5).collect();
        let bias = [1.0, 0.0, -1.0];

        let mut generic = vec![0.0; g.output_len()];
        let mut unrolled = vec![0.0; g.output_len()];
        depthwise_convolution(&src, &weights, Some(&bias), &mut generic, &g).unwrap();
        depthwise_convolution_3x3(&src, &weights, Some(&bias), &mut unrolled, &g).unwrap();
        assert_eq!(generic, unrolled);
    }

    #[test]
    fn test_3x3_rejects_other_sizes() {
        let g = geom(&[4, 4, 1], 1, PadStrideInfo::default());
        let mut dst = vec![0.0; 16];
        assert!(depthwise_convolution_3x3(&[0.0; 16], &[1.0], None, &mut dst, &g).is_err());
    }
}
