//! Post-norm residual wrapper: `norm(residual + dropout(branch))`.
//!
//! Both attention and feed-forward sub-blocks finish with the same sequence,
//! so it lives here once. Inputs share the `(batch, seq, hidden)` layout and
//! dtype; the addition happens in [`PrecisionPolicy::compute`] precision.

use candle_core::{Result, Tensor};

use crate::{
    checks,
    dropout::{Dropout, Mode},
    dtypes::PrecisionPolicy,
    norm::LayerNorm,
};

/// Dropout, residual add and layer normalisation applied to a sub-block output.
#[derive(Debug, Clone)]
pub struct Residual {
    dropout: Dropout,
    norm: LayerNorm,
}

impl Residual {
    pub fn new(dropout: Dropout, norm: LayerNorm) -> Self {
        Self { dropout, norm }
    }

    pub fn dropout(&self) -> &Dropout {
        &self.dropout
    }

    pub fn norm(&self) -> &LayerNorm {
        &self.norm
    }

    /// Adds `residual` to the (dropped-out) `branch` without normalising.
    pub fn add(
        &self,
        branch: &Tensor,
        residual: &Tensor,
        policy: &PrecisionPolicy,
        mode: &mut Mode,
    ) -> Result<Tensor> {
        checks::expect_shape("residual.branch", branch, residual.dims())?;
        checks::expect_same_dtype("residual.branch", branch, "residual.input", residual)?;

        let branch = self.dropout.forward(branch, mode)?;
        let added = policy
            .cast_for_compute(&branch)?
            .add(&policy.cast_for_compute(residual)?)?;
        policy.cast_to_storage(&added)
    }

    /// Full post-norm step: dropout -> add -> LayerNorm.
    pub fn forward(
        &self,
        branch: &Tensor,
        residual: &Tensor,
        policy: &PrecisionPolicy,
        mode: &mut Mode,
    ) -> Result<Tensor> {
        let added = self.add(branch, residual, policy, mode)?;
        self.norm.forward(&added, policy)
    }
}
