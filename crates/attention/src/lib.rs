//! Scaled dot-product and multi-head attention for post-norm transformer layers.
//!
//! [`ScaledDotProductAttention`] is the leaf kernel: `softmax(q·kᵀ / sqrt(d_k))·v`
//! for any number of leading batch axes, with boolean masking. It works on
//! all heads at once through batched matmuls over `[batch, n_head, len, d]`
//! tensors. [`MultiHeadAttention`] wraps it with the q/k/v/output projections,
//! the head split and merge, dropout, the residual add and LayerNorm.
//!
//! Masks follow a single convention everywhere: a zero entry blocks the
//! position, anything else keeps it. The [`masks`] module builds padding and
//! causal masks in that form.
//!
//! Dropout is a train-only concern selected through the [`layers::Mode`]
//! argument of each forward call; [`layers::Mode::Eval`] keeps the output
//! deterministic.

pub mod core;
pub mod masks;
pub mod multi_head;
pub mod scaled_dot;

pub use crate::core::{Attention, AttentionConfig, AttentionError, AttentionOutput};
pub use multi_head::{AttentionParams, MultiHeadAttention};
pub use scaled_dot::{ScaledDotProductAttention, MASKED_SCORE};
