//! Builders for causal attention masks.
//!
//! The resulting tensors have dtype [`MASK_DTYPE`](super::MASK_DTYPE) and
//! shape `[1, q_len, k_len]`. Entries are `1` where attention is permitted and
//! `0` wherever a query would look at a later key.

use candle_core::{Device, Result, Tensor};

use super::{combine_masks, padding::padding_mask_from_ids};

/// Construct a causal mask for the supplied sequence dimensions.
///
/// When `k_len > q_len`, queries are assumed to align with the most recent
/// `q_len` keys, allowing access to the extended prefix.
pub fn causal_mask(device: &Device, q_len: usize, k_len: usize) -> Result<Tensor> {
    let offset = k_len.saturating_sub(q_len);
    let data: Vec<u8> = (0..q_len)
        .flat_map(|q| (0..k_len).map(move |k| u8::from(k <= q + offset)))
        .collect();
    Tensor::from_vec(data, (1, q_len, k_len), device)
}

/// Self-attention mask for a decoder: padding keys and future keys blocked.
///
/// `ids` is a `[batch, len]` token-id tensor; the result is
/// `[batch, len, len]`.
pub fn decoder_self_attention_mask(ids: &Tensor, pad_id: u32) -> Result<Tensor> {
    let (_, len) = ids.dims2()?;
    let padding = padding_mask_from_ids(ids, pad_id)?;
    let causal = causal_mask(ids.device(), len, len)?;
    combine_masks(&padding, &causal)
}
