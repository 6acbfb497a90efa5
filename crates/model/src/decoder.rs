//! Decoder layer: masked self-attention, cross-attention over the encoder
//! output, then the position-wise feed-forward block.

use attention::{AttentionOutput, MultiHeadAttention};
use candle_core::{DType, Device, Tensor};
use layers::{LinearInit, Mode, PositionwiseFeedForward};

use crate::config::LayerConfig;
use crate::encoder::check_width;
use crate::error::{ModelError, Result};

/// Output of [`DecoderLayer::forward`].
#[derive(Debug, Clone)]
pub struct DecoderOutput {
    /// `(batch, tgt_len, d_model)`
    pub output: Tensor,
    /// `(batch, n_head, tgt_len, tgt_len)`
    pub self_attention: Tensor,
    /// `(batch, n_head, tgt_len, src_len)`
    pub cross_attention: Tensor,
}

#[derive(Debug, Clone)]
pub struct DecoderLayer {
    slf_attn: MultiHeadAttention,
    enc_attn: MultiHeadAttention,
    pos_ffn: PositionwiseFeedForward,
}

impl DecoderLayer {
    pub fn new(
        slf_attn: MultiHeadAttention,
        enc_attn: MultiHeadAttention,
        pos_ffn: PositionwiseFeedForward,
    ) -> Result<Self> {
        check_width("decoder", &slf_attn, &pos_ffn)?;
        check_width("decoder cross-attention", &enc_attn, &pos_ffn)?;
        log::debug!(
            "model::decoder init d_model={} self_heads={} cross_heads={} d_inner={}",
            slf_attn.config().d_model,
            slf_attn.config().n_head,
            enc_attn.config().n_head,
            pos_ffn.config().inner_size
        );
        Ok(Self {
            slf_attn,
            enc_attn,
            pos_ffn,
        })
    }

    /// Both attention sub-blocks are sampled independently.
    pub fn with_init(
        config: &LayerConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        config.validate()?;
        let slf_attn = MultiHeadAttention::with_init(config.attention_config(), init, device, dtype)?;
        let enc_attn = MultiHeadAttention::with_init(config.attention_config(), init, device, dtype)?;
        let pos_ffn =
            PositionwiseFeedForward::with_init(config.feed_forward_config(), init, device, dtype)?;
        Self::new(slf_attn, enc_attn, pos_ffn)
    }

    pub fn self_attention(&self) -> &MultiHeadAttention {
        &self.slf_attn
    }

    pub fn cross_attention(&self) -> &MultiHeadAttention {
        &self.enc_attn
    }

    pub fn feed_forward(&self) -> &PositionwiseFeedForward {
        &self.pos_ffn
    }

    /// `slf_attn_mask` should block future positions (see
    /// [`attention::masks::decoder_self_attention_mask`]); `dec_enc_attn_mask`
    /// blocks encoder padding only and is `(batch | 1, 1, src_len)` or
    /// `(batch | 1, tgt_len, src_len)`.
    pub fn forward(
        &self,
        input: &Tensor,
        encoder_output: &Tensor,
        slf_attn_mask: Option<&Tensor>,
        dec_enc_attn_mask: Option<&Tensor>,
        mode: &mut Mode,
    ) -> Result<DecoderOutput> {
        let (batch, _, _) = input.dims3()?;
        let (enc_batch, _, _) = encoder_output.dims3()?;
        if batch != enc_batch {
            return Err(ModelError::InvalidConfig(format!(
                "decoder batch {batch} differs from encoder batch {enc_batch}"
            )));
        }

        let AttentionOutput {
            output,
            weights: self_attention,
        } = self.slf_attn.forward(input, input, input, slf_attn_mask, mode)?;
        let AttentionOutput {
            output,
            weights: cross_attention,
        } = self.enc_attn.forward(
            &output,
            encoder_output,
            encoder_output,
            dec_enc_attn_mask,
            mode,
        )?;
        let output = self.pos_ffn.forward(&output, mode)?;

        Ok(DecoderOutput {
            output,
            self_attention,
            cross_attention,
        })
    }
}
