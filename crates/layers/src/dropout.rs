//! Inverted dropout driven by an explicit forward mode.
//!
//! No layer carries a training flag. Callers pass a [`Mode`] into every
//! forward call: [`Mode::Eval`] turns every dropout site into the identity,
//! while [`Mode::Train`] carries the seeded generator that all sites draw their
//! keep masks from, in call order. Two runs that start from the same seed and
//! visit the same sites therefore drop the same activations.

use candle_core::{Result, Tensor};

use crate::checks;

/// Forward-pass mode threaded through every layer.
#[derive(Debug, Clone)]
pub enum Mode {
    /// Inference: dropout is the identity and the forward is deterministic.
    Eval,
    /// Training: dropout samples keep masks from the contained generator.
    Train(DropoutRng),
}

impl Mode {
    /// Training mode seeded with `seed`.
    pub fn train(seed: u64) -> Self {
        Mode::Train(DropoutRng::new(seed))
    }

    pub fn is_training(&self) -> bool {
        matches!(self, Mode::Train(_))
    }
}

/// Dropout site with a fixed drop probability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dropout {
    probability: f32,
}

impl Dropout {
    /// Creates a dropout site; `probability` must lie in `[0, 1)`.
    pub fn new(probability: f32) -> Result<Self> {
        checks::expect_probability("dropout probability", probability)?;
        Ok(Self { probability })
    }

    /// Dropout site that never drops anything.
    pub fn disabled() -> Self {
        Self { probability: 0.0 }
    }

    pub fn probability(&self) -> f32 {
        self.probability
    }

    /// Zeroes each element with the configured probability and rescales the
    /// survivors by `1 / (1 - p)`. Works on tensors of any rank.
    pub fn forward(&self, input: &Tensor, mode: &mut Mode) -> Result<Tensor> {
        let rng = match mode {
            Mode::Train(rng) if self.probability > 0.0 => rng,
            _ => return Ok(input.clone()),
        };
        let keep_prob = 1.0 - self.probability;
        let mask = rng.keep_mask(input.elem_count(), keep_prob);
        let mask = Tensor::from_vec(mask, input.dims(), input.device())?.to_dtype(input.dtype())?;
        input.mul(&mask)?.affine(1.0 / f64::from(keep_prob), 0.0)
    }
}

impl Default for Dropout {
    fn default() -> Self {
        Self::disabled()
    }
}

/// 64-bit linear congruential generator for reproducible dropout masks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropoutRng {
    state: u64,
}

impl DropoutRng {
    pub fn new(seed: u64) -> Self {
        // Offset so that small seeds do not start with near-zero draws.
        Self {
            state: seed.wrapping_add(0x9E37_79B9_7F4A_7C15),
        }
    }

    fn next_u64(&mut self) -> u64 {
        // Knuth MMIX constants.
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.state
    }

    /// Uniform sample in `[0, 1)`.
    pub fn next_f32(&mut self) -> f32 {
        const SCALE: f64 = 1.0 / ((1u64 << 53) as f64);
        let bits = self.next_u64() >> 11;
        (bits as f64 * SCALE) as f32
    }

    fn keep_mask(&mut self, len: usize, keep_prob: f32) -> Vec<f32> {
        (0..len)
            .map(|_| if self.next_f32() < keep_prob { 1.0 } else { 0.0 })
            .collect()
    }
}
