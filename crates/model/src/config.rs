use std::{fs, path::Path};

use attention::AttentionConfig;
use layers::{norm::DEFAULT_EPSILON, FeedForwardConfig};
use serde::Deserialize;

use crate::error::{ModelError, Result};

/// Construction-time dimensions shared by [`EncoderLayer`](crate::EncoderLayer)
/// and [`DecoderLayer`](crate::DecoderLayer).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LayerConfig {
    /// Embedding width flowing between layers.
    pub d_model: usize,
    /// Hidden width of the position-wise feed-forward block.
    pub d_inner: usize,
    pub n_head: usize,
    pub d_k: usize,
    pub d_v: usize,
    /// Dropout probability used by every sub-block.
    #[serde(default = "default_dropout")]
    pub dropout: f32,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

fn default_dropout() -> f32 {
    0.1
}

fn default_layer_norm_eps() -> f64 {
    DEFAULT_EPSILON
}

impl LayerConfig {
    pub fn new(d_model: usize, d_inner: usize, n_head: usize, d_k: usize, d_v: usize) -> Self {
        Self {
            d_model,
            d_inner,
            n_head,
            d_k,
            d_v,
            dropout: default_dropout(),
            layer_norm_eps: default_layer_norm_eps(),
        }
    }

    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    /// Loads a configuration from `.json` or `.toml` (the default when the
    /// path has no extension) and validates it.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: LayerConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
            Some(other) => return Err(ModelError::UnsupportedFormat(other.to_string())),
        };
        config.validate()?;
        log::debug!("model::config loaded {} from {}", config.summary(), path.display());
        Ok(config)
    }

    /// Reports every violated constraint at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        for (name, value) in [
            ("d_model", self.d_model),
            ("d_inner", self.d_inner),
            ("n_head", self.n_head),
            ("d_k", self.d_k),
            ("d_v", self.d_v),
        ] {
            if value == 0 {
                errors.push(format!("{name} must be greater than 0"));
            }
        }
        if self.n_head * self.d_v != self.d_model {
            errors.push(format!(
                "d_model ({}) must equal n_head ({}) * d_v ({})",
                self.d_model, self.n_head, self.d_v
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            errors.push(format!("dropout must be in [0, 1), got {}", self.dropout));
        }
        if self.layer_norm_eps <= 0.0 {
            errors.push("layer_norm_eps must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ModelError::InvalidConfig(errors.join("; ")))
        }
    }

    pub fn attention_config(&self) -> AttentionConfig {
        AttentionConfig {
            layer_norm_eps: self.layer_norm_eps,
            ..AttentionConfig::new(self.n_head, self.d_model, self.d_k, self.d_v)
                .with_dropout(self.dropout)
        }
    }

    pub fn feed_forward_config(&self) -> FeedForwardConfig {
        FeedForwardConfig {
            dropout_p: self.dropout,
            layer_norm_eps: self.layer_norm_eps,
            ..FeedForwardConfig::new(self.d_model, self.d_inner)
        }
    }

    pub(crate) fn summary(&self) -> String {
        format!(
            "d_model={} d_inner={} n_head={} d_k={} d_v={} dropout={}",
            self.d_model, self.d_inner, self.n_head, self.d_k, self.d_v, self.dropout
        )
    }
}
