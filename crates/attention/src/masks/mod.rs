//! Mask builders shared by attention callers.
//!
//! Every mask produced here is a `u8` tensor where `1` keeps a position and
//! `0` blocks it. Padding masks are shaped `[batch, 1, k_len]` so they
//! broadcast over every query; causal masks are `[1, q_len, k_len]` so they
//! broadcast over the batch. [`MultiHeadAttention`](crate::MultiHeadAttention)
//! adds the head axis itself.

pub mod causal;
pub mod padding;

use candle_core::{DType, Result, Tensor};

/// Dtype shared by all masks built in this module.
pub const MASK_DTYPE: DType = DType::U8;

pub use causal::{causal_mask, decoder_self_attention_mask};
pub use padding::{padding_mask_from_booleans, padding_mask_from_ids, padding_mask_from_lengths};

/// Logical AND of two masks under broadcasting. Either input may use any
/// dtype; non-zero entries count as "keep".
pub fn combine_masks(left: &Tensor, right: &Tensor) -> Result<Tensor> {
    let left = left.ne(0f64)?;
    let right = right.ne(0f64)?;
    left.broadcast_mul(&right)
}
