//! Configuration for multi-head attention blocks.

use super::AttentionError;

/// Dimensions and run-time knobs of a [`MultiHeadAttention`](crate::MultiHeadAttention).
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionConfig {
    /// Number of parallel heads.
    pub n_head: usize,
    /// Model (embedding) width of queries, keys, values and the output.
    pub d_model: usize,
    /// Per-head query/key width.
    pub d_k: usize,
    /// Per-head value width.
    pub d_v: usize,
    /// Dropout probability applied to both the attention weights and the
    /// projected output.
    pub dropout_p: f32,
    /// Epsilon of the closing LayerNorm.
    pub layer_norm_eps: f64,
}

impl AttentionConfig {
    /// Configuration with dropout `0.1` and LayerNorm epsilon `1e-6`.
    pub fn new(n_head: usize, d_model: usize, d_k: usize, d_v: usize) -> Self {
        Self {
            n_head,
            d_model,
            d_k,
            d_v,
            dropout_p: 0.1,
            layer_norm_eps: layers::norm::DEFAULT_EPSILON,
        }
    }

    pub fn with_dropout(mut self, dropout_p: f32) -> Self {
        self.dropout_p = dropout_p;
        self
    }

    /// Checks that the residual add is shape-valid and knobs are in range.
    pub fn validate(&self) -> Result<(), AttentionError> {
        for (name, value) in [
            ("n_head", self.n_head),
            ("d_model", self.d_model),
            ("d_k", self.d_k),
            ("d_v", self.d_v),
        ] {
            if value == 0 {
                return Err(AttentionError::config(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        if self.n_head * self.d_v != self.d_model {
            return Err(AttentionError::config(format!(
                "d_model ({}) must equal n_head ({}) * d_v ({})",
                self.d_model, self.n_head, self.d_v
            )));
        }
        if !(0.0..1.0).contains(&self.dropout_p) {
            return Err(AttentionError::config(format!(
                "dropout probability must be in [0, 1), got {}",
                self.dropout_p
            )));
        }
        if self.layer_norm_eps <= 0.0 {
            return Err(AttentionError::config("layer_norm_eps must be positive"));
        }
        Ok(())
    }
}
