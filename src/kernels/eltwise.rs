//! Element-wise binary operations

use crate::error::Status;
use crate::graph::types::EltwiseOperation;
use crate::kernels::check_len;

pub fn eltwise(a: &[f32], b: &[f32], output: &mut [f32], op: EltwiseOperation) -> Status {
    check_len("eltwise input 1", b.len(), a.len())?;
    check_len("eltwise output", output.len(), a.len())?;

    let f: fn(f32, f32) -> f32 = match op {
        EltwiseOperation::Add => |x, y| x + y,
        EltwiseOperation::Sub => |x, y| x - y,
        EltwiseOperation::Mul => |x, y| x * y,
    };
    for ((o, &x), &y) in output.iter_mut().zip(a).zip(b) {
        *o = f(x, y);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ops() {
        let a = [1.0, 2.0, 3.0];
        let b = [4.0, 5.0, 6.0];
        let mut out = [0.0; 3];
        eltwise(&a, &b, &mut out, EltwiseOperation::Add).unwrap();
        assert_eq!(out, [5.0, 7.0, 9.0]);
        eltwise(&a, &b, &mut out, EltwiseOperation::Sub).unwrap();
        assert_eq!(out, [-3.0, -3.0, -3.0]);
        eltwise(&a, &b, &mut out, EltwiseOperation::Mul).unwrap();
        assert_eq!(out, [4.0, 10.0, 18.0]);
    }

    #[test]
    fn test_mismatched_inputs() {
        let mut out = [0.0; 2];
        assert!(eltwise(&[1.0, 2.0], &[1.0], &mut out, EltwiseOperation::Add).is_err());
    }
}
