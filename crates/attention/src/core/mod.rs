//! Core traits and types shared across attention implementations.
//!
//! Attention kernels take `q: [..., q_len, d_k]`, `k: [..., k_len, d_k]` and
//! `v: [..., k_len, d_v]` with identical leading axes, and return both the
//! mixed values `[..., q_len, d_v]` and the normalised weights
//! `[..., q_len, k_len]`. Softmax and matmuls run in `f32` for half-precision
//! inputs; outputs are cast back to the input dtype.

pub mod config;
pub mod errors;

use candle_core::Tensor;
use layers::Mode;

pub use config::AttentionConfig;
pub use errors::AttentionError;

/// Result of an attention call: the mixed values and the weights that produced them.
#[derive(Debug, Clone)]
pub struct AttentionOutput {
    pub output: Tensor,
    /// Row-stochastic attention map, kept for inspection and visualisation.
    pub weights: Tensor,
}

/// Unified interface for attention kernels.
///
/// * Masks, when present, have the rank of the score tensor and every axis is
///   either the matching score axis or `1`. Zero entries block a position,
///   any other value keeps it.
/// * Dropout on the weights only happens under [`Mode::Train`].
pub trait Attention: Send + Sync {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        mode: &mut Mode,
    ) -> Result<AttentionOutput, AttentionError>;
}
