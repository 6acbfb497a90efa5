//! Multi-head attention sub-block with its residual add and LayerNorm.
//!
//! Queries, keys and values arrive as `(batch, len, d_model)`. They are
//! projected without bias, split into `n_head` heads, attended with one
//! batched [`ScaledDotProductAttention`] call, merged back and projected to
//! `d_model`. The block closes with `norm(q + dropout(w_o · heads))`.

use std::sync::OnceLock;

use candle_core::{DType, Device, Tensor};
use layers::{
    dtypes::SUPPORTED_DTYPES, Dropout, LayerNorm, Linear, LinearConfig, LinearInit, Mode,
    NormConfig, PrecisionPolicy, Residual,
};

use crate::core::{Attention, AttentionConfig, AttentionError, AttentionOutput};
use crate::scaled_dot::ScaledDotProductAttention;

/// Explicit parameters for [`MultiHeadAttention::new`].
///
/// Projection weights use the `(out, in)` layout: `w_q` and `w_k` are
/// `(n_head * d_k, d_model)`, `w_v` is `(n_head * d_v, d_model)` and `w_o` is
/// `(d_model, n_head * d_v)`.
#[derive(Debug, Clone)]
pub struct AttentionParams {
    pub w_q: Tensor,
    pub w_k: Tensor,
    pub w_v: Tensor,
    pub w_o: Tensor,
    pub norm_weight: Tensor,
    pub norm_bias: Tensor,
}

#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    config: AttentionConfig,
    policy: PrecisionPolicy,
    w_q: Linear,
    w_k: Linear,
    w_v: Linear,
    w_o: Linear,
    attention: ScaledDotProductAttention,
    residual: Residual,
    first_call: OnceLock<()>,
}

impl MultiHeadAttention {
    pub fn new(config: AttentionConfig, params: AttentionParams) -> Result<Self, AttentionError> {
        config.validate()?;
        let AttentionConfig {
            n_head,
            d_model,
            d_k,
            d_v,
            ..
        } = config;

        let projection = |label: &str, weight: Tensor, input: usize, output: usize| {
            Linear::new(LinearConfig::without_bias(input, output), weight, None)
                .map_err(|e| AttentionError::config(format!("{label}: {e}")))
        };
        let w_q = projection("w_q", params.w_q, d_model, n_head * d_k)?;
        let w_k = projection("w_k", params.w_k, d_model, n_head * d_k)?;
        let w_v = projection("w_v", params.w_v, d_model, n_head * d_v)?;
        let w_o = projection("w_o", params.w_o, n_head * d_v, d_model)?;

        let dtype = w_q.weight().dtype();
        for (label, linear) in [("w_k", &w_k), ("w_v", &w_v), ("w_o", &w_o)] {
            if linear.weight().dtype() != dtype {
                return Err(AttentionError::config(format!(
                    "{label} dtype {:?} differs from w_q dtype {dtype:?}",
                    linear.weight().dtype()
                )));
            }
        }

        let norm = LayerNorm::new(
            params.norm_weight,
            params.norm_bias,
            NormConfig::new(d_model).with_epsilon(config.layer_norm_eps),
        )
        .map_err(|e| AttentionError::config(format!("norm: {e}")))?;
        let dropout =
            Dropout::new(config.dropout_p).map_err(|e| AttentionError::config(e.to_string()))?;
        let attention = ScaledDotProductAttention::new(d_k, config.dropout_p)?;

        log::debug!(
            "attention::multi_head init n_head={} d_model={} d_k={} d_v={} dropout={} dtype={:?}",
            n_head,
            d_model,
            d_k,
            d_v,
            config.dropout_p,
            dtype
        );

        Ok(Self {
            config,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
            w_q,
            w_k,
            w_v,
            w_o,
            attention,
            residual: Residual::new(dropout, norm),
            first_call: OnceLock::new(),
        })
    }

    /// Randomly initialised projections and an identity LayerNorm.
    pub fn with_init(
        config: AttentionConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, AttentionError> {
        config.validate()?;
        let AttentionConfig {
            n_head,
            d_model,
            d_k,
            d_v,
            ..
        } = config;
        let sample = |input: usize, output: usize| -> Result<Tensor, AttentionError> {
            Ok(init.sample((output, input), device, dtype)?)
        };
        let params = AttentionParams {
            w_q: sample(d_model, n_head * d_k)?,
            w_k: sample(d_model, n_head * d_k)?,
            w_v: sample(d_model, n_head * d_v)?,
            w_o: sample(n_head * d_v, d_model)?,
            norm_weight: Tensor::ones(d_model, dtype, device)?,
            norm_bias: Tensor::zeros(d_model, dtype, device)?,
        };
        Self::new(config, params)
    }

    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }

    pub fn w_q(&self) -> &Linear {
        &self.w_q
    }

    pub fn w_k(&self) -> &Linear {
        &self.w_k
    }

    pub fn w_v(&self) -> &Linear {
        &self.w_v
    }

    pub fn w_o(&self) -> &Linear {
        &self.w_o
    }

    pub fn norm(&self) -> &LayerNorm {
        self.residual.norm()
    }

    /// Attends `q` over `k`/`v` and returns the normalised output together with
    /// the per-head weights `(batch, n_head, q_len, k_len)`.
    ///
    /// `mask`, when given, is `(batch | 1, q_len | 1, k_len)` and applies to
    /// every head.
    pub fn forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        mode: &mut Mode,
    ) -> Result<AttentionOutput, AttentionError> {
        let (batch, q_len, k_len) = self.validate_inputs(q, k, v)?;
        let mask = mask
            .map(|mask| Self::head_mask(mask, batch, q_len, k_len))
            .transpose()?;

        self.first_call.get_or_init(|| {
            log::info!(
                "attention::multi_head first forward batch={} q_len={} k_len={} heads={} dtype={:?} training={}",
                batch,
                q_len,
                k_len,
                self.config.n_head,
                q.dtype(),
                mode.is_training()
            );
        });

        let AttentionConfig {
            n_head, d_k, d_v, ..
        } = self.config;
        let q_heads = split_heads(&self.w_q.forward(q, &self.policy)?, n_head, d_k)?;
        let k_heads = split_heads(&self.w_k.forward(k, &self.policy)?, n_head, d_k)?;
        let v_heads = split_heads(&self.w_v.forward(v, &self.policy)?, n_head, d_v)?;

        let AttentionOutput { output, weights } =
            self.attention
                .attend(&q_heads, &k_heads, &v_heads, mask.as_ref(), mode)?;
        drop((q_heads, k_heads, v_heads));

        let merged = merge_heads(&output)?;
        drop(output);
        let projected = self.w_o.forward(&merged, &self.policy)?;
        let output = self.residual.forward(&projected, q, &self.policy, mode)?;

        Ok(AttentionOutput { output, weights })
    }

    fn validate_inputs(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
    ) -> Result<(usize, usize, usize), AttentionError> {
        let d_model = self.config.d_model;
        let mut dims = [(0usize, 0usize); 3];
        for (slot, (label, tensor)) in dims.iter_mut().zip([("q", q), ("k", k), ("v", v)]) {
            match *tensor.dims() {
                [batch, len, width] if width == d_model && batch > 0 && len > 0 => {
                    *slot = (batch, len);
                }
                _ => {
                    return Err(AttentionError::shape(format!(
                        "{label} must be [batch, len, {d_model}] with non-zero batch and len, got {:?}",
                        tensor.dims()
                    )))
                }
            }
        }
        let [(batch, q_len), (k_batch, k_len), (v_batch, v_len)] = dims;
        if batch != k_batch || batch != v_batch {
            return Err(AttentionError::shape(format!(
                "batch sizes differ: q {batch}, k {k_batch}, v {v_batch}"
            )));
        }
        if k_len != v_len {
            return Err(AttentionError::shape(format!(
                "k and v sequence lengths differ: {k_len} vs {v_len}"
            )));
        }

        let dtype = q.dtype();
        if !SUPPORTED_DTYPES.contains(&dtype) {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("{dtype:?}"),
            });
        }
        if dtype != self.policy.storage() || k.dtype() != dtype || v.dtype() != dtype {
            return Err(AttentionError::shape(format!(
                "q, k, v dtypes ({dtype:?}, {:?}, {:?}) must match parameter dtype {:?}",
                k.dtype(),
                v.dtype(),
                self.policy.storage()
            )));
        }
        Ok((batch, q_len, k_len))
    }

    /// Checks a `(batch | 1, q_len | 1, k_len)` mask and adds the head axis.
    fn head_mask(
        mask: &Tensor,
        batch: usize,
        q_len: usize,
        k_len: usize,
    ) -> Result<Tensor, AttentionError> {
        match *mask.dims() {
            [b, q, k] if (b == batch || b == 1) && (q == q_len || q == 1) && k == k_len => {
                Ok(mask.unsqueeze(1)?)
            }
            _ => Err(AttentionError::shape(format!(
                "mask must broadcast to [{batch}, {q_len}, {k_len}], got {:?}",
                mask.dims()
            ))),
        }
    }
}

impl Attention for MultiHeadAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        mode: &mut Mode,
    ) -> Result<AttentionOutput, AttentionError> {
        self.forward(q, k, v, mask, mode)
    }
}

/// `(batch, len, n_head * width)` -> `(batch, n_head, len, width)`.
fn split_heads(x: &Tensor, n_head: usize, width: usize) -> candle_core::Result<Tensor> {
    let (batch, len, _) = x.dims3()?;
    x.reshape((batch, len, n_head, width))?
        .transpose(1, 2)?
        .contiguous()
}

/// Inverse of [`split_heads`].
fn merge_heads(x: &Tensor) -> candle_core::Result<Tensor> {
    let (batch, n_head, len, width) = x.dims4()?;
    x.transpose(1, 2)?
        .contiguous()?
        .reshape((batch, len, n_head * width))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masks::{causal_mask, padding_mask_from_lengths};
    use candle_core::Result;

    fn eval_config(n_head: usize, d_model: usize, d_k: usize, d_v: usize) -> AttentionConfig {
        AttentionConfig::new(n_head, d_model, d_k, d_v).with_dropout(0.0)
    }

    fn random(config: AttentionConfig, device: &Device) -> MultiHeadAttention {
        MultiHeadAttention::with_init(config, &LinearInit::XavierUniform, device, DType::F32)
            .unwrap()
    }

    fn rows(tensor: &Tensor) -> Result<Vec<f32>> {
        tensor.flatten_all()?.to_vec1::<f32>()
    }

    #[test]
    fn identity_projections_match_hand_computed_reference() -> Result<()> {
        let device = Device::Cpu;
        let eye = Tensor::eye(4, DType::F32, &device)?;
        let params = AttentionParams {
            w_q: eye.clone(),
            w_k: eye.clone(),
            w_v: eye.clone(),
            w_o: eye,
            norm_weight: Tensor::ones(4, DType::F32, &device)?,
            norm_bias: Tensor::zeros(4, DType::F32, &device)?,
        };
        let mha = MultiHeadAttention::new(eval_config(2, 4, 2, 2), params).unwrap();
        let x = Tensor::from_vec(
            vec![1f32, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0],
            (1, 2, 4),
            &device,
        )?;
        let out = mha.forward(&x, &x, &x, None, &mut Mode::Eval).unwrap();

        // Head 0 sees softmax([1/sqrt(2), 0]); head 1 sees zero vectors.
        let expected = [
            1.698536f32, -0.246500, -0.726018, -0.726018, -0.246500, 1.698536, -0.726018,
            -0.726018,
        ];
        for (a, e) in rows(&out.output)?.iter().zip(expected) {
            assert!((a - e).abs() < 1e-4, "{a} vs {e}");
        }

        let weights = rows(&out.weights)?;
        assert_eq!(out.weights.dims(), &[1, 2, 2, 2]);
        assert!((weights[0] - 0.669761).abs() < 1e-5);
        assert!(weights[4..].iter().all(|w| (w - 0.5).abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn output_shape_follows_query_for_any_head_layout() -> Result<()> {
        let device = Device::Cpu;
        for (n_head, d_model, d_k, d_v) in [(1, 8, 8, 8), (2, 8, 4, 4), (4, 16, 8, 4), (8, 16, 3, 2)]
        {
            let mha = random(eval_config(n_head, d_model, d_k, d_v), &device);
            let q = Tensor::randn(0f32, 1.0, (2, 3, d_model), &device)?;
            let kv = Tensor::randn(0f32, 1.0, (2, 5, d_model), &device)?;
            let out = mha.forward(&q, &kv, &kv, None, &mut Mode::Eval).unwrap();
            assert_eq!(out.output.dims(), q.dims());
            assert_eq!(out.weights.dims(), &[2, n_head, 3, 5]);
        }
        Ok(())
    }

    #[test]
    fn batch_rows_do_not_leak_into_each_other() -> Result<()> {
        let device = Device::Cpu;
        let mha = random(eval_config(2, 8, 4, 4), &device);
        let x = Tensor::randn(0f32, 1.0, (2, 4, 8), &device)?;
        let keep_all = Tensor::ones((2, 1, 4), DType::U8, &device)?;
        let base = mha.forward(&x, &x, &x, Some(&keep_all), &mut Mode::Eval).unwrap();

        let scale = Tensor::from_vec(vec![1f32, 25.0], (2, 1, 1), &device)?;
        let scaled = x.broadcast_mul(&scale)?;
        let out = mha
            .forward(&scaled, &scaled, &scaled, Some(&keep_all), &mut Mode::Eval)
            .unwrap();

        assert_eq!(rows(&base.output.get(0)?)?, rows(&out.output.get(0)?)?);
        assert_eq!(rows(&base.weights.get(0)?)?, rows(&out.weights.get(0)?)?);
        Ok(())
    }

    #[test]
    fn mask_broadcasts_across_heads() -> Result<()> {
        let device = Device::Cpu;
        let mha = random(eval_config(4, 16, 4, 4), &device);
        let x = Tensor::randn(0f32, 1.0, (2, 4, 16), &device)?;

        let causal = causal_mask(&device, 4, 4)?;
        let weights = rows(&mha.forward(&x, &x, &x, Some(&causal), &mut Mode::Eval).unwrap().weights)?;
        for (idx, w) in weights.iter().enumerate() {
            let (i, j) = ((idx / 4) % 4, idx % 4);
            if j > i {
                assert_eq!(*w, 0.0, "query {i} saw key {j}");
            }
        }

        let padding = padding_mask_from_lengths(&device, &[4, 2], 4)?;
        let out = mha.forward(&x, &x, &x, Some(&padding), &mut Mode::Eval).unwrap();
        let batch_1 = rows(&out.weights.get(1)?)?;
        for row in batch_1.chunks(4) {
            assert_eq!(&row[2..], &[0.0, 0.0]);
        }
        Ok(())
    }

    #[test]
    fn eval_forward_is_bit_identical_and_train_is_seeded() -> Result<()> {
        let device = Device::Cpu;
        let mha = random(AttentionConfig::new(2, 8, 4, 4).with_dropout(0.3), &device);
        let x = Tensor::randn(0f32, 1.0, (2, 5, 8), &device)?;

        let a = mha.forward(&x, &x, &x, None, &mut Mode::Eval).unwrap();
        let b = mha.forward(&x, &x, &x, None, &mut Mode::Eval).unwrap();
        assert_eq!(rows(&a.output)?, rows(&b.output)?);

        let t1 = mha.forward(&x, &x, &x, None, &mut Mode::train(5)).unwrap();
        let t2 = mha.forward(&x, &x, &x, None, &mut Mode::train(5)).unwrap();
        assert_eq!(rows(&t1.output)?, rows(&t2.output)?);
        assert_ne!(rows(&t1.output)?, rows(&a.output)?);
        Ok(())
    }

    #[test]
    fn rejects_inconsistent_configuration_and_parameters() -> Result<()> {
        let device = Device::Cpu;
        let err = MultiHeadAttention::with_init(
            eval_config(3, 8, 4, 4),
            &LinearInit::XavierUniform,
            &device,
            DType::F32,
        )
        .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidConfig { .. }));

        let params = AttentionParams {
            w_q: Tensor::zeros((8, 8), DType::F32, &device)?,
            w_k: Tensor::zeros((8, 8), DType::F32, &device)?,
            w_v: Tensor::zeros((6, 8), DType::F32, &device)?,
            w_o: Tensor::zeros((8, 8), DType::F32, &device)?,
            norm_weight: Tensor::ones(8, DType::F32, &device)?,
            norm_bias: Tensor::zeros(8, DType::F32, &device)?,
        };
        let err = MultiHeadAttention::new(eval_config(2, 8, 4, 4), params).unwrap_err();
        assert!(err.to_string().contains("w_v"), "{err}");
        Ok(())
    }

    #[test]
    fn rejects_bad_inputs_and_masks() -> Result<()> {
        let device = Device::Cpu;
        let mha = random(eval_config(2, 8, 4, 4), &device);
        let x = Tensor::zeros((2, 4, 8), DType::F32, &device)?;

        let narrow = Tensor::zeros((2, 4, 6), DType::F32, &device)?;
        assert!(matches!(
            mha.forward(&narrow, &x, &x, None, &mut Mode::Eval),
            Err(AttentionError::InvalidShape { .. })
        ));

        let short_v = Tensor::zeros((2, 3, 8), DType::F32, &device)?;
        assert!(mha.forward(&x, &x, &short_v, None, &mut Mode::Eval).is_err());

        let half = x.to_dtype(DType::F16)?;
        assert!(mha.forward(&half, &half, &half, None, &mut Mode::Eval).is_err());

        let wrong_mask = Tensor::ones((3, 4, 4), DType::U8, &device)?;
        assert!(matches!(
            mha.forward(&x, &x, &x, Some(&wrong_mask), &mut Mode::Eval),
            Err(AttentionError::InvalidShape { .. })
        ));
        Ok(())
    }
}
