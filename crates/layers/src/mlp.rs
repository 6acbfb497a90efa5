//! Position-wise feed-forward block.
//!
//! The block maps `(batch, seq, hidden)` to the same layout:
//! `norm(x + dropout(w_2 · act(w_1 · x + b_1) + b_2))`. The same two
//! projections are applied at every position, so no information moves between
//! positions here; mixing across tokens is the job of attention.

use candle_core::{DType, Device, Error, Result, Tensor};

use crate::{
    activations::ActivationKind,
    checks,
    dropout::{Dropout, Mode},
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit},
    norm::{LayerNorm, NormConfig, DEFAULT_EPSILON},
    residual::Residual,
};

/// Configuration for [`PositionwiseFeedForward`].
#[derive(Debug, Clone, PartialEq)]
pub struct FeedForwardConfig {
    /// Model hidden size (input and output width).
    pub hidden_size: usize,
    /// Width of the inner activation space.
    pub inner_size: usize,
    /// Activation applied between the projections.
    pub activation: ActivationKind,
    /// Dropout probability on the block output.
    pub dropout_p: f32,
    /// LayerNorm epsilon.
    pub layer_norm_eps: f64,
}

impl FeedForwardConfig {
    /// ReLU block with the default dropout of `0.1`.
    pub fn new(hidden_size: usize, inner_size: usize) -> Self {
        Self {
            hidden_size,
            inner_size,
            activation: ActivationKind::Relu,
            dropout_p: 0.1,
            layer_norm_eps: DEFAULT_EPSILON,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.hidden_size == 0 || self.inner_size == 0 {
            return Err(Error::Msg(format!(
                "feed-forward dimensions must be non-zero, got hidden={} inner={}",
                self.hidden_size, self.inner_size
            )));
        }
        checks::expect_probability("feed-forward dropout", self.dropout_p)?;
        if self.layer_norm_eps <= 0.0 {
            return Err(Error::Msg("layer_norm_eps must be positive".into()));
        }
        Ok(())
    }
}

/// Two-layer per-position MLP with its own residual add and LayerNorm.
#[derive(Debug, Clone)]
pub struct PositionwiseFeedForward {
    config: FeedForwardConfig,
    policy: PrecisionPolicy,
    w_1: Linear,
    w_2: Linear,
    residual: Residual,
}

impl PositionwiseFeedForward {
    /// Assembles the block from explicit projections and normalisation.
    ///
    /// `w_1` maps `hidden_size -> inner_size` and `w_2` maps back. The
    /// precision policy follows the dtype of `w_1`'s weight.
    pub fn new(
        config: FeedForwardConfig,
        w_1: Linear,
        w_2: Linear,
        norm: LayerNorm,
    ) -> Result<Self> {
        config.validate()?;
        let expect = |label: &str, linear: &Linear, input: usize, output: usize| {
            let cfg = linear.config();
            if cfg.input_dim == input && cfg.output_dim == output {
                Ok(())
            } else {
                Err(Error::Msg(format!(
                    "{label}: expected {input} -> {output} projection, got {} -> {}",
                    cfg.input_dim, cfg.output_dim
                )))
            }
        };
        expect("ffn.w_1", &w_1, config.hidden_size, config.inner_size)?;
        expect("ffn.w_2", &w_2, config.inner_size, config.hidden_size)?;
        if norm.config().hidden_size != config.hidden_size {
            return Err(Error::Msg(format!(
                "ffn.norm: expected hidden size {}, got {}",
                config.hidden_size,
                norm.config().hidden_size
            )));
        }

        let policy = PrecisionPolicy::from_parameter_dtype(w_1.weight().dtype());
        let residual = Residual::new(Dropout::new(config.dropout_p)?, norm);
        log::debug!(
            "layers::mlp init hidden={} inner={} activation={:?} dropout={}",
            config.hidden_size,
            config.inner_size,
            config.activation,
            config.dropout_p
        );
        Ok(Self {
            config,
            policy,
            w_1,
            w_2,
            residual,
        })
    }

    /// Builds the block with random projections and an identity LayerNorm.
    pub fn with_init(
        config: FeedForwardConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let w_1 = Linear::with_init(
            LinearConfig::new(config.hidden_size, config.inner_size),
            init,
            device,
            dtype,
        )?;
        let w_2 = Linear::with_init(
            LinearConfig::new(config.inner_size, config.hidden_size),
            init,
            device,
            dtype,
        )?;
        let norm = LayerNorm::identity(
            NormConfig::new(config.hidden_size).with_epsilon(config.layer_norm_eps),
            device,
            dtype,
        )?;
        Self::new(config, w_1, w_2, norm)
    }

    pub fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    pub fn w_1(&self) -> &Linear {
        &self.w_1
    }

    pub fn w_2(&self) -> &Linear {
        &self.w_2
    }

    pub fn norm(&self) -> &LayerNorm {
        self.residual.norm()
    }

    pub fn forward(&self, hidden: &Tensor, mode: &mut Mode) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("ffn.input", hidden, self.config.hidden_size)?;
        let inner = self.w_1.forward(hidden, &self.policy)?;
        let activated = self.config.activation.forward(&inner, &self.policy)?;
        let projected = self.w_2.forward(&activated, &self.policy)?;
        self.residual.forward(&projected, hidden, &self.policy, mode)
    }
}
