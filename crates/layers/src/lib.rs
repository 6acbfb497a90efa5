//! Building blocks for post-norm transformer layers.
//!
//! Every component consumes and produces tensors laid out as
//! `(batch, seq, hidden)` and is assembled from Candle primitives. Parameters
//! are fixed at construction; all per-call state (the train/eval switch and
//! the dropout RNG) travels through the [`dropout::Mode`] argument.

pub mod activations;
pub mod checks;
pub mod dropout;
pub mod dtypes;
pub mod linear;
pub mod mlp;
pub mod norm;
pub mod residual;

pub use dropout::{Dropout, DropoutRng, Mode};
pub use dtypes::PrecisionPolicy;
pub use linear::{Linear, LinearConfig, LinearInit};
pub use mlp::{FeedForwardConfig, PositionwiseFeedForward};
pub use norm::{LayerNorm, NormConfig};
pub use residual::Residual;
