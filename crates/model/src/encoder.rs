//! Encoder layer: self-attention followed by the position-wise feed-forward block.

use attention::{AttentionOutput, MultiHeadAttention};
use candle_core::{DType, Device, Tensor};
use layers::{LinearInit, Mode, PositionwiseFeedForward};

use crate::config::LayerConfig;
use crate::error::{ModelError, Result};

/// Output of [`EncoderLayer::forward`].
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// `(batch, len, d_model)`
    pub output: Tensor,
    /// `(batch, n_head, len, len)`
    pub self_attention: Tensor,
}

#[derive(Debug, Clone)]
pub struct EncoderLayer {
    slf_attn: MultiHeadAttention,
    pos_ffn: PositionwiseFeedForward,
}

impl EncoderLayer {
    pub fn new(slf_attn: MultiHeadAttention, pos_ffn: PositionwiseFeedForward) -> Result<Self> {
        check_width("encoder", &slf_attn, &pos_ffn)?;
        log::debug!(
            "model::encoder init d_model={} n_head={} d_inner={}",
            slf_attn.config().d_model,
            slf_attn.config().n_head,
            pos_ffn.config().inner_size
        );
        Ok(Self { slf_attn, pos_ffn })
    }

    pub fn with_init(
        config: &LayerConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        config.validate()?;
        let slf_attn = MultiHeadAttention::with_init(config.attention_config(), init, device, dtype)?;
        let pos_ffn =
            PositionwiseFeedForward::with_init(config.feed_forward_config(), init, device, dtype)?;
        Self::new(slf_attn, pos_ffn)
    }

    pub fn self_attention(&self) -> &MultiHeadAttention {
        &self.slf_attn
    }

    pub fn feed_forward(&self) -> &PositionwiseFeedForward {
        &self.pos_ffn
    }

    /// `slf_attn_mask` is `(batch | 1, len | 1, len)`, typically a padding mask.
    pub fn forward(
        &self,
        input: &Tensor,
        slf_attn_mask: Option<&Tensor>,
        mode: &mut Mode,
    ) -> Result<EncoderOutput> {
        let AttentionOutput { output, weights } =
            self.slf_attn.forward(input, input, input, slf_attn_mask, mode)?;
        let output = self.pos_ffn.forward(&output, mode)?;
        Ok(EncoderOutput {
            output,
            self_attention: weights,
        })
    }
}

pub(crate) fn check_width(
    label: &str,
    attention: &MultiHeadAttention,
    ffn: &PositionwiseFeedForward,
) -> Result<()> {
    let (attn_width, ffn_width) = (attention.config().d_model, ffn.config().hidden_size);
    if attn_width != ffn_width {
        return Err(ModelError::InvalidConfig(format!(
            "{label}: attention d_model {attn_width} differs from feed-forward hidden size {ffn_width}"
        )));
    }
    Ok(())
}
