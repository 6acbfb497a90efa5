//! Encoder and decoder layers of a post-norm sequence-to-sequence transformer.
//!
//! Each layer owns its attention and feed-forward sub-blocks. Layers are
//! stateless between calls; stacking them, embeddings and training live with
//! the caller.

pub mod config;
pub mod decoder;
pub mod encoder;
pub mod error;

pub use config::LayerConfig;
pub use decoder::{DecoderLayer, DecoderOutput};
pub use encoder::{EncoderLayer, EncoderOutput};
pub use error::{ModelError, Result};
