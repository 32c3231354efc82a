//! 2D convolution over `[W, H, C, N]` tensors.
//!
//! Weights are `[kw, kh, Cin, Cout]`. Both methods accumulate in the same
//! order (input channel, kernel row, kernel column), so they produce
//! bit-identical results.

use rayon::prelude::*;

use crate::error::{GraphError, GraphResult, Status};
use crate::graph::node::conv_output_dims;
use crate::graph::types::{PadStrideInfo, TensorShape};
use crate::kernels::check_len;

/// Sizes of one convolution, resolved once at configure time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub in_w: usize,
    pub in_h: usize,
    pub in_c: usize,
    pub batches: usize,
    pub kernel_w: usize,
    pub kernel_h: usize,
    pub out_w: usize,
    pub out_h: usize,
    pub out_c: usize,
    pub info: PadStrideInfo,
}

impl ConvGeometry {
    /// Fails with `InsufficientPadding` when the kernel does not fit the
    /// padded input.
    pub fn new(
        src: &TensorShape,
        kernel_w: usize,
        kernel_h: usize,
        out_c: usize,
        info: PadStrideInfo,
    ) -> GraphResult<Self> {
        let kernel = TensorShape::new(vec![kernel_w, kernel_h]);
        let (out_w, out_h) = conv_output_dims(src, &kernel, &info).ok_or_else(|| {
            GraphError::InsufficientPadding(format!(
                "{}x{} kernel does not fit input {} with padding ({}, {}, {}, {})",
                kernel_w,
                kernel_h,
                src,
                info.pad_left,
                info.pad_right,
                info.pad_top,
                info.pad_bottom
            ))
        })?;
        Ok(Self {
            in_w: src.dim(0),
            in_h: src.dim(1),
            in_c: src.dim(2),
            batches: src.dim(3),
            kernel_w,
            kernel_h,
            out_w,
            out_h,
            out_c,
            info,
        })
    }

    pub fn input_len(&self) -> usize {
        self.in_w * self.in_h * self.in_c * self.batches
    }

    pub fn output_len(&self) -> usize {
        self.out_w * self.out_h * self.out_c * self.batches
    }

    /// Length of one im2col row
    pub fn patch_len(&self) -> usize {
        self.kernel_w * self.kernel_h * self.in_c
    }

    pub fn is_square(&self) -> bool {
        self.kernel_w == self.kernel_h
    }

    /// Input value at padded coordinates, 0 inside the padding
    #[inline]
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn sample(
        &self,
        src: &[f32],
        n: usize,
        c: usize,
        ox: usize,
        oy: usize,
        kx: usize,
        ky: usize,
    ) -> f32 {
        let x = (ox * self.info.stride_x + kx) as isize - self.info.pad_left as isize;
        let y = (oy * self.info.stride_y + ky) as isize - self.info.pad_top as isize;
        if x < 0 || y < 0 || x as usize >= self.in_w || y as usize >= self.in_h {
            return 0.0;
        }
        src[x as usize + self.in_w * (y as usize + self.in_h * (c + self.in_c * n))]
    }
}

fn check_buffers(
    geom: &ConvGeometry,
    src: &[f32],
    weights: &[f32],
    bias: Option<&[f32]>,
    dst: &[f32],
) -> Status {
    check_len("convolution input", src.len(), geom.input_len())?;
    check_len("convolution weights", weights.len(), geom.patch_len() * geom.out_c)?;
    if let Some(bias) = bias {
        check_len("convolution bias", bias.len(), geom.out_c)?;
    }
    check_len("convolution output", dst.len(), geom.output_len())
}

/// Straightforward sliding-window convolution.
pub fn convolution_direct(
    src: &[f32],
    weights: &[f32],
    bias: Option<&[f32]>,
    dst: &mut [f32],
    geom: &ConvGeometry,
) -> Status {
    check_buffers(geom, src, weights, bias, dst)?;
    let plane = geom.out_w * geom.out_h;

    for n in 0..geom.batches {
        for co in 0..geom.out_c {
            let w = &weights[co * geom.patch_len()..(co + 1) * geom.patch_len()];
            for oy in 0..geom.out_h {
                for ox in 0..geom.out_w {
                    let mut acc = 0.0f32;
                    for ci in 0..geom.in_c {
                        for ky in 0..geom.kernel_h {
                            for kx in 0..geom.kernel_w {
                                let wi = kx + geom.kernel_w * (ky + geom.kernel_h * ci);
                                acc += geom.sample(src, n, ci, ox, oy, kx, ky) * w[wi];
                            }
                        }
                    }
                    if let Some(bias) = bias {
                        acc += bias[co];
                    }
                    dst[ox + geom.out_w * oy + plane * (co + geom.out_c * n)] = acc;
                }
            }
        }
    }
    Ok(())
}

/// im2col followed by a GEMM against the weight matrix.
///
/// Output channels are computed in parallel on `pool`, or on the global
/// rayon pool when none is given.
pub fn convolution_gemm(
    src: &[f32],
    weights: &[f32],
    bias: Option<&[f32]>,
    dst: &mut [f32],
    geom: &ConvGeometry,
    pool: Option<&rayon::ThreadPool>,
) -> Status {
    check_buffers(geom, src, weights, bias, dst)?;
    match pool {
        Some(pool) => pool.install(|| gemm_batches(src, weights, bias, dst, geom)),
        None => gemm_batches(src, weights, bias, dst, geom),
    }
    Ok(())
}

fn gemm_batches(
    src: &[f32],
    weights: &[f32],
    bias: Option<&[f32]>,
    dst: &mut [f32],
    geom: &ConvGeometry,
) {
    let plane = geom.out_w * geom.out_h;
    let k = geom.patch_len();

    for (n, batch_out) in dst.chunks_mut(plane * geom.out_c).enumerate() {
        let columns = im2col(src, geom, n);

        batch_out
            .par_chunks_mut(plane)
            .enumerate()
            .for_each(|(co, out)| {
                let w = &weights[co * k..(co + 1) * k];
                let b = bias.map_or(0.0, |b| b[co]);
                for (p, o) in out.iter_mut().enumerate() {
                    let row = &columns[p * k..(p + 1) * k];
                    let mut acc = 0.0f32;
                    for (x, wv) in row.iter().zip(w) {
                        acc += x * wv;
                    }
                    *o = if bias.is_some() { acc + b } else { acc };
                }
            });
    }
}

/// One row per output pixel, columns ordered like the weights.
fn im2col(src: &[f32], geom: &ConvGeometry, n: usize) -> Vec<f32> {
    let k = geom.patch_len();
    let mut columns = vec![0.0f32; geom.out_w * geom.out_h * k];
    for oy in 0..geom.out_h {
        for ox in 0..geom.out_w {
            let row = &mut columns[(ox + geom.out_w * oy) * k..][..k];
            for ci in 0..geom.in_c {
                for ky in 0..geom.kernel_h {
                    for kx in 0..geom.kernel_w {
                        row[kx + geom.kernel_w * (ky + geom.kernel_h * ci)] =
                            geom.sample(src, n, ci, ox, oy, kx, ky);
                    }
                }
            }
        }
    }
    columns
}
