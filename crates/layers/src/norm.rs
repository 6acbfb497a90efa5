//! Layer normalisation over the hidden axis.
//!
//! Inputs follow the `(batch, seq, hidden)` convention. Statistics are taken
//! along the last axis in [`PrecisionPolicy::compute`] precision and the
//! output is cast back to the storage dtype. Each position is normalised on
//! its own, so rows never influence each other.

use candle_core::{DType, Device, Result, Tensor, D};

use crate::{checks, dtypes::PrecisionPolicy, dtypes::SUPPORTED_DTYPES};

/// Epsilon used by the post-norm encoder/decoder layers.
pub const DEFAULT_EPSILON: f64 = 1e-6;

/// Configuration for a [`LayerNorm`].
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    /// Size of the hidden dimension being normalised.
    pub hidden_size: usize,
    /// Numeric stabiliser added to the variance.
    pub epsilon: f64,
}

impl NormConfig {
    pub fn new(hidden_size: usize) -> Self {
        Self {
            hidden_size,
            epsilon: DEFAULT_EPSILON,
        }
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }
}

/// LayerNorm with learnable scale and shift.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    config: NormConfig,
    weight: Tensor,
    bias: Tensor,
}

impl LayerNorm {
    /// Constructs a LayerNorm from explicit scale and shift parameters.
    pub fn new(weight: Tensor, bias: Tensor, config: NormConfig) -> Result<Self> {
        for (label, tensor) in [("norm.weight", &weight), ("norm.bias", &bias)] {
            checks::expect_shape(label, tensor, &[config.hidden_size])?;
            checks::expect_dtype_in(label, tensor, &SUPPORTED_DTYPES)?;
        }
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    /// Unit scale and zero shift, the usual starting point of a fresh layer.
    pub fn identity(config: NormConfig, device: &Device, dtype: DType) -> Result<Self> {
        let weight = Tensor::ones(config.hidden_size, dtype, device)?;
        let bias = Tensor::zeros(config.hidden_size, dtype, device)?;
        Self::new(weight, bias, config)
    }

    pub fn config(&self) -> &NormConfig {
        &self.config
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> &Tensor {
        &self.bias
    }

    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("norm.input", hidden, self.config.hidden_size)?;

        let hidden_size = self.config.hidden_size as f64;
        let compute = policy.cast_for_compute(hidden)?;

        let mean = (compute.sum_keepdim(D::Minus1)? / hidden_size)?;
        let centered = compute.broadcast_sub(&mean)?;
        let variance = (centered.sqr()?.sum_keepdim(D::Minus1)? / hidden_size)?;
        let denom = (variance + self.config.epsilon)?.sqrt()?;

        let weight = policy.cast_for_compute(&self.weight)?;
        let bias = policy.cast_for_compute(&self.bias)?;
        let normalized = centered
            .broadcast_div(&denom)?
            .broadcast_mul(&weight)?
            .broadcast_add(&bias)?;

        policy.cast_to_storage(&normalized)
    }
}
