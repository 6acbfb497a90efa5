//! Scaled dot-product attention kernel.
//!
//! `weights = softmax(mask_fill(q·kᵀ / temperature))`, `output = weights·v`,
//! evaluated with batched matmuls over every leading axis at once (batch and
//! heads alike). Scores, softmax and the value mix run in
//! [`PrecisionPolicy::compute`] precision.
//!
//! Masked scores are replaced by [`MASKED_SCORE`] before the softmax, which
//! drives their weight to exactly zero. A query row whose keys are all masked
//! has no valid distribution; such rows produce all-zero weights and an
//! all-zero output instead of a uniform or NaN row.

use candle_core::{Tensor, D};
use candle_nn::ops::softmax_last_dim;
use layers::{dtypes::SUPPORTED_DTYPES, Dropout, Mode, PrecisionPolicy};

use crate::core::{Attention, AttentionError, AttentionOutput};

/// Score written into blocked positions before normalisation.
pub const MASKED_SCORE: f64 = -1e9;

/// Masked, temperature-scaled softmax attention with dropout on the weights.
#[derive(Debug, Clone)]
pub struct ScaledDotProductAttention {
    temperature: f64,
    dropout: Dropout,
}

impl ScaledDotProductAttention {
    /// Kernel with the standard temperature `sqrt(d_k)`.
    pub fn new(d_k: usize, dropout_p: f32) -> Result<Self, AttentionError> {
        if d_k == 0 {
            return Err(AttentionError::config("d_k must be greater than zero"));
        }
        Self::with_temperature((d_k as f64).sqrt(), dropout_p)
    }

    /// Kernel with an explicit softmax temperature.
    pub fn with_temperature(temperature: f64, dropout_p: f32) -> Result<Self, AttentionError> {
        if !(temperature.is_finite() && temperature > 0.0) {
            return Err(AttentionError::config(format!(
                "temperature must be positive and finite, got {temperature}"
            )));
        }
        let dropout =
            Dropout::new(dropout_p).map_err(|e| AttentionError::config(e.to_string()))?;
        Ok(Self {
            temperature,
            dropout,
        })
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn dropout(&self) -> &Dropout {
        &self.dropout
    }

    fn validate_inputs(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<(), AttentionError> {
        let device = q.device();
        if !device.same_device(k.device()) || !device.same_device(v.device()) {
            return Err(AttentionError::shape(
                "q, k, v must reside on the same device",
            ));
        }

        let dtype = q.dtype();
        if dtype != k.dtype() || dtype != v.dtype() {
            return Err(AttentionError::shape("q, k, v must share the same dtype"));
        }
        if !SUPPORTED_DTYPES.contains(&dtype) {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("{dtype:?}"),
            });
        }

        let rank = q.rank();
        if rank < 2 || k.rank() != rank || v.rank() != rank {
            return Err(AttentionError::shape(format!(
                "q, k, v must share a rank of at least 2, got {:?}, {:?}, {:?}",
                q.dims(),
                k.dims(),
                v.dims()
            )));
        }

        let (q_dims, k_dims, v_dims) = (q.dims(), k.dims(), v.dims());
        let lead = rank - 2;
        if q_dims[..lead] != k_dims[..lead] || q_dims[..lead] != v_dims[..lead] {
            return Err(AttentionError::shape(format!(
                "leading axes differ: q {:?}, k {:?}, v {:?}",
                q_dims, k_dims, v_dims
            )));
        }
        if q_dims[rank - 1] != k_dims[rank - 1] {
            return Err(AttentionError::shape(format!(
                "q and k feature widths differ: {} vs {}",
                q_dims[rank - 1],
                k_dims[rank - 1]
            )));
        }
        if k_dims[lead] != v_dims[lead] {
            return Err(AttentionError::shape(format!(
                "k and v sequence lengths differ: {} vs {}",
                k_dims[lead], v_dims[lead]
            )));
        }
        Ok(())
    }

    /// Converts a zero/non-zero mask into a `u8` keep mask shaped like the scores.
    fn keep_mask(mask: &Tensor, scores: &Tensor) -> Result<Tensor, AttentionError> {
        if !mask.device().same_device(scores.device()) {
            return Err(AttentionError::shape(
                "mask must reside on the same device as q",
            ));
        }
        let target = scores.dims();
        let dims = mask.dims();
        let broadcastable = dims.len() == target.len()
            && dims
                .iter()
                .zip(target.iter())
                .all(|(&m, &t)| m == t || m == 1);
        if !broadcastable {
            return Err(AttentionError::shape(format!(
                "mask shape {:?} is not broadcastable to scores {:?}",
                dims, target
            )));
        }
        let keep = mask.ne(0f64)?.broadcast_as(target)?.contiguous()?;
        Ok(keep)
    }
}

impl Attention for ScaledDotProductAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        mode: &mut Mode,
    ) -> Result<AttentionOutput, AttentionError> {
        Self::validate_inputs(q, k, v)?;
        let policy = PrecisionPolicy::from_parameter_dtype(q.dtype());

        let q_work = policy.cast_for_compute(q)?.contiguous()?;
        let k_t = policy
            .cast_for_compute(k)?
            .transpose(D::Minus2, D::Minus1)?
            .contiguous()?;
        let scores = (q_work.matmul(&k_t)? / self.temperature)?;
        drop(q_work);
        drop(k_t);

        let (scores, keep) = match mask {
            Some(mask) => {
                let keep = Self::keep_mask(mask, &scores)?;
                let filled = scores.zeros_like()?.affine(0.0, MASKED_SCORE)?;
                (keep.where_cond(&scores, &filled)?, Some(keep))
            }
            None => (scores, None),
        };

        let mut weights = softmax_last_dim(&scores)?;
        if let Some(keep) = keep {
            let keep = keep.to_dtype(weights.dtype())?;
            if log::log_enabled!(log::Level::Warn) {
                let rows = keep.elem_count() / keep.dim(D::Minus1)?.max(1);
                let live_rows = keep.max(D::Minus1)?.sum_all()?.to_vec0::<f32>()?;
                if (live_rows as usize) < rows {
                    log::warn!(
                        "attention::scaled_dot {} of {} query rows have every key masked; their weights are zero",
                        rows - live_rows as usize,
                        rows
                    );
                }
            }
            // Only changes rows where every key is masked.
            weights = weights.mul(&keep)?;
        }
        let weights = self.dropout.forward(&weights, mode)?;

        let v_work = policy.cast_for_compute(v)?.contiguous()?;
        let output = weights.matmul(&v_work)?;

        Ok(AttentionOutput {
            output: policy.cast_to_storage(&output)?,
            weights: policy.cast_to_storage(&weights)?,
        })
    }
}
