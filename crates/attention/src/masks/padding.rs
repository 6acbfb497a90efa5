//! Builders for padding masks used to drop padded keys.
//!
//! All padding masks share the dtype described in
//! [`super::MASK_DTYPE`](super::MASK_DTYPE) and the `[batch, 1, k_len]` layout.

use candle_core::{Device, Error, Result, Tensor};

/// Construct padding masks from per-batch valid key lengths.
///
/// Lengths beyond `k_len` are clamped, so such rows keep every key.
pub fn padding_mask_from_lengths(
    device: &Device,
    key_lengths: &[usize],
    k_len: usize,
) -> Result<Tensor> {
    let data: Vec<u8> = key_lengths
        .iter()
        .flat_map(|&valid| (0..k_len).map(move |k| u8::from(k < valid)))
        .collect();
    Tensor::from_vec(data, (key_lengths.len(), 1, k_len), device)
}

/// Construct padding masks from boolean padding indicators.
///
/// Each inner slice corresponds to a batch element and must share the same
/// length. `true` indicates a padded (masked) key position.
pub fn padding_mask_from_booleans(device: &Device, padding: &[Vec<bool>]) -> Result<Tensor> {
    let k_len = padding.first().map(Vec::len).unwrap_or(0);
    if let Some(row) = padding.iter().position(|mask| mask.len() != k_len) {
        return Err(Error::Msg(format!(
            "all boolean padding masks must share k_len {k_len}, row {row} has {}",
            padding[row].len()
        )));
    }
    let data: Vec<u8> = padding
        .iter()
        .flat_map(|mask| mask.iter().map(|&is_padding| u8::from(!is_padding)))
        .collect();
    Tensor::from_vec(data, (padding.len(), 1, k_len), device)
}

/// Padding mask from a `[batch, len]` tensor of token ids.
pub fn padding_mask_from_ids(ids: &Tensor, pad_id: u32) -> Result<Tensor> {
    ids.dims2()?;
    ids.ne(f64::from(pad_id))?.unsqueeze(1)
}
