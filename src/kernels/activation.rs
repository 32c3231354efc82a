//! Element-wise activation functions

use crate::error::Status;
use crate::graph::types::{ActivationFunction, ActivationLayerInfo};
use crate::kernels::check_len;

#[inline]
pub fn apply(info: &ActivationLayerInfo, x: f32) -> f32 {
    let (a, b) = (info.a, info.b);
    match info.function {
        ActivationFunction::Identity => x,
        ActivationFunction::Relu => x.max(0.0),
        ActivationFunction::BoundedRelu => x.max(0.0).min(a),
        ActivationFunction::LeakyRelu => {
            if x > 0.0 {
                x
            } else {
                a * x
            }
        }
        ActivationFunction::Logistic => 1.0 / (1.0 + (-x).exp()),
        ActivationFunction::Tanh => a * (b * x).tanh(),
        ActivationFunction::Linear => a * x + b,
        ActivationFunction::Abs => x.abs(),
    }
}

/// output[i] = f(input[i])
pub fn activation(input: &[f32], output: &mut [f32], info: &ActivationLayerInfo) -> Status {
    check_len("activation output", output.len(), input.len())?;
    for (o, &x) in output.iter_mut().zip(input) {
        *o = apply(info, x);
    }
    Ok(())
}

/// Apply in place, used for activations fused into a producer
pub fn activation_in_place(data: &mut [f32], info: &ActivationLayerInfo) {
    for x in data.iter_mut() {
        *x = apply(info, *x);
    }
}
