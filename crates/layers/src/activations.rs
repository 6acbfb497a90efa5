//! Activation functions used between feed-forward projections.
//!
//! Activations are applied element-wise in the compute dtype chosen by
//! [`PrecisionPolicy`] and cast back to the storage dtype afterwards.
//!
//! * **ReLU** is `max(x, 0)`.
//! * **GELU** uses the erf form `0.5 * x * (1 + erf(x / sqrt(2)))`.

use candle_core::{Result, Tensor};

use crate::dtypes::PrecisionPolicy;

/// Non-linearity applied inside the position-wise feed-forward block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivationKind {
    /// Identity function, useful for checking the linear path in isolation.
    Identity,
    #[default]
    Relu,
    Gelu,
}

impl ActivationKind {
    pub fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let compute = policy.cast_for_compute(input)?;
        let activated = match self {
            ActivationKind::Identity => compute,
            ActivationKind::Relu => compute.relu()?,
            ActivationKind::Gelu => compute.gelu_erf()?,
        };
        policy.cast_to_storage(&activated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use std::f64::consts::SQRT_2;

    #[test]
    fn relu_zeroes_negative_values() -> Result<()> {
        let device = Device::Cpu;
        let input = Tensor::from_slice(&[-2.0f32, -0.0, 0.5, 3.0], (4,), &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let out = ActivationKind::Relu.forward(&input, &policy)?.to_vec1::<f32>()?;
        assert_eq!(out, vec![0.0, 0.0, 0.5, 3.0]);
        Ok(())
    }

    #[test]
    fn gelu_matches_reference_formula() -> Result<()> {
        let device = Device::Cpu;
        let input = Tensor::from_slice(&[-2.5f32, -0.5, 0.0, 1.0, 3.0], (5,), &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let output = ActivationKind::Gelu.forward(&input, &policy)?;

        let reference = {
            let term = input.affine(1.0 / SQRT_2, 0.0)?.erf()?;
            let inner = (Tensor::ones_like(&term)? + term)?;
            input.affine(0.5, 0.0)?.mul(&inner)?
        };

        let diff = output.sub(&reference)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 5e-6);
        Ok(())
    }

    #[test]
    fn half_precision_inputs_keep_their_dtype() -> Result<()> {
        let device = Device::Cpu;
        let input = Tensor::from_slice(&[-1.0f32, 2.0], (2,), &device)?.to_dtype(DType::BF16)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::BF16);
        let out = ActivationKind::Relu.forward(&input, &policy)?;
        assert_eq!(out.dtype(), DType::BF16);
        Ok(())
    }
}
