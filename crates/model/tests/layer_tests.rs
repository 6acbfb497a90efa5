use std::fs;

use anyhow::Result;
use attention::masks::{decoder_self_attention_mask, padding_mask_from_ids};
use candle_core::{DType, Device, Tensor};
use layers::{LinearInit, Mode};
use model::{DecoderLayer, EncoderLayer, LayerConfig, ModelError};

fn eval_config() -> LayerConfig {
    LayerConfig::new(8, 32, 2, 4, 4).with_dropout(0.0)
}

fn values(tensor: &Tensor) -> Result<Vec<f32>> {
    Ok(tensor.flatten_all()?.to_vec1::<f32>()?)
}

#[test]
fn encoder_preserves_shape_and_blocks_padding() -> Result<()> {
    let device = Device::Cpu;
    let layer = EncoderLayer::with_init(&eval_config(), &LinearInit::XavierUniform, &device, DType::F32)?;
    let input = Tensor::randn(0f32, 1.0, (2, 5, 8), &device)?;
    let src_ids = Tensor::from_slice(&[3u32, 4, 5, 6, 7, 3, 4, 0, 0, 0], (2, 5), &device)?;
    let mask = padding_mask_from_ids(&src_ids, 0)?;

    let out = layer.forward(&input, Some(&mask), &mut Mode::Eval)?;

    assert_eq!(out.output.dims(), &[2, 5, 8]);
    assert_eq!(out.self_attention.dims(), &[2, 2, 5, 5]);
    let padded_batch = values(&out.self_attention.get(1)?)?;
    for row in padded_batch.chunks(5) {
        assert_eq!(&row[2..], &[0.0, 0.0, 0.0]);
        let sum: f32 = row.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }
    Ok(())
}

#[test]
fn decoder_self_attention_never_looks_ahead() -> Result<()> {
    let device = Device::Cpu;
    let layer = DecoderLayer::with_init(&eval_config(), &LinearInit::XavierUniform, &device, DType::F32)?;
    let tgt_ids = Tensor::from_slice(&[1u32, 2, 3, 4, 5, 6, 7, 0], (2, 4), &device)?;
    let dec_input = Tensor::randn(0f32, 1.0, (2, 4, 8), &device)?;
    let enc_output = Tensor::randn(0f32, 1.0, (2, 6, 8), &device)?;
    let slf_mask = decoder_self_attention_mask(&tgt_ids, 0)?;

    let out = layer.forward(&dec_input, &enc_output, Some(&slf_mask), None, &mut Mode::Eval)?;

    assert_eq!(out.output.dims(), &[2, 4, 8]);
    assert_eq!(out.self_attention.dims(), &[2, 2, 4, 4]);
    assert_eq!(out.cross_attention.dims(), &[2, 2, 4, 6]);
    for (idx, weight) in values(&out.self_attention)?.iter().enumerate() {
        let (i, j) = ((idx / 4) % 4, idx % 4);
        if j > i {
            assert_eq!(*weight, 0.0, "query {i} attended future key {j}");
        }
    }
    Ok(())
}

#[test]
fn cross_attention_mask_only_blocks_encoder_padding() -> Result<()> {
    let device = Device::Cpu;
    let layer = DecoderLayer::with_init(&eval_config(), &LinearInit::XavierUniform, &device, DType::F32)?;
    let src_ids = Tensor::from_slice(&[5u32, 6, 0, 0, 5, 6, 7, 8], (2, 4), &device)?;
    let cross_mask = padding_mask_from_ids(&src_ids, 0)?;
    let dec_input = Tensor::randn(0f32, 1.0, (2, 3, 8), &device)?;
    let enc_output = Tensor::randn(0f32, 1.0, (2, 4, 8), &device)?;

    let out = layer.forward(&dec_input, &enc_output, None, Some(&cross_mask), &mut Mode::Eval)?;

    let first = values(&out.cross_attention.get(0)?)?;
    for row in first.chunks(4) {
        assert_eq!(&row[2..], &[0.0, 0.0]);
        assert!(row[..2].iter().all(|w| *w > 0.0));
    }
    let second = values(&out.cross_attention.get(1)?)?;
    assert!(second.iter().all(|w| *w > 0.0));
    Ok(())
}

#[test]
fn eval_forward_is_deterministic_and_train_reproducible() -> Result<()> {
    let device = Device::Cpu;
    let config = LayerConfig::new(8, 32, 2, 4, 4).with_dropout(0.2);
    let encoder = EncoderLayer::with_init(&config, &LinearInit::XavierUniform, &device, DType::F32)?;
    let input = Tensor::randn(0f32, 1.0, (2, 5, 8), &device)?;

    let a = encoder.forward(&input, None, &mut Mode::Eval)?;
    let b = encoder.forward(&input, None, &mut Mode::Eval)?;
    assert_eq!(values(&a.output)?, values(&b.output)?);
    assert_eq!(values(&a.self_attention)?, values(&b.self_attention)?);

    let t1 = encoder.forward(&input, None, &mut Mode::train(42))?;
    let t2 = encoder.forward(&input, None, &mut Mode::train(42))?;
    let t3 = encoder.forward(&input, None, &mut Mode::train(43))?;
    assert_eq!(values(&t1.output)?, values(&t2.output)?);
    assert_ne!(values(&t1.output)?, values(&t3.output)?);
    Ok(())
}

#[test]
fn half_precision_layers_keep_their_dtype() -> Result<()> {
    let device = Device::Cpu;
    for dtype in [DType::F16, DType::BF16] {
        let layer = DecoderLayer::with_init(&eval_config(), &LinearInit::XavierUniform, &device, dtype)?;
        let dec_input = Tensor::randn(0f32, 1.0, (1, 3, 8), &device)?.to_dtype(dtype)?;
        let enc_output = Tensor::randn(0f32, 1.0, (1, 4, 8), &device)?.to_dtype(dtype)?;
        let out = layer.forward(&dec_input, &enc_output, None, None, &mut Mode::Eval)?;
        assert_eq!(out.output.dtype(), dtype);
        let finite = out
            .output
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?
            .iter()
            .all(|x| x.is_finite());
        assert!(finite);
    }
    Ok(())
}

#[test]
fn decoder_rejects_mismatched_batches() -> Result<()> {
    let device = Device::Cpu;
    let layer = DecoderLayer::with_init(&eval_config(), &LinearInit::XavierUniform, &device, DType::F32)?;
    let dec_input = Tensor::zeros((2, 3, 8), DType::F32, &device)?;
    let enc_output = Tensor::zeros((1, 4, 8), DType::F32, &device)?;
    let err = layer
        .forward(&dec_input, &enc_output, None, None, &mut Mode::Eval)
        .unwrap_err();
    assert!(matches!(err, ModelError::InvalidConfig(_)), "{err}");
    Ok(())
}

#[test]
fn layer_config_loads_from_json_and_toml() -> Result<()> {
    let dir = tempfile::tempdir()?;

    let json_path = dir.path().join("layer.json");
    fs::write(
        &json_path,
        r#"{ "d_model": 16, "d_inner": 64, "n_head": 4, "d_k": 8, "d_v": 4, "dropout": 0.0 }"#,
    )?;
    let from_json = LayerConfig::from_path(&json_path)?;
    assert_eq!(from_json, LayerConfig::new(16, 64, 4, 8, 4).with_dropout(0.0));

    let toml_path = dir.path().join("layer.toml");
    fs::write(
        &toml_path,
        "d_model = 16\nd_inner = 64\nn_head = 4\nd_k = 8\nd_v = 4\nlayer_norm_eps = 1e-5\n",
    )?;
    let from_toml = LayerConfig::from_path(&toml_path)?;
    assert_eq!(from_toml.dropout, 0.1);
    assert_eq!(from_toml.layer_norm_eps, 1e-5);

    let layer = EncoderLayer::with_init(&from_toml, &LinearInit::XavierUniform, &Device::Cpu, DType::F32)?;
    assert_eq!(layer.self_attention().config().layer_norm_eps, 1e-5);
    Ok(())
}

#[test]
fn layer_config_rejects_bad_files() -> Result<()> {
    let dir = tempfile::tempdir()?;

    let invalid = dir.path().join("bad.toml");
    fs::write(&invalid, "d_model = 10\nd_inner = 64\nn_head = 4\nd_k = 8\nd_v = 4\n")?;
    assert!(matches!(
        LayerConfig::from_path(&invalid),
        Err(ModelError::InvalidConfig(_))
    ));

    let yaml = dir.path().join("layer.yaml");
    fs::write(&yaml, "d_model: 8")?;
    assert!(matches!(
        LayerConfig::from_path(&yaml),
        Err(ModelError::UnsupportedFormat(ext)) if ext == "yaml"
    ));

    let malformed = dir.path().join("layer.json");
    fs::write(&malformed, "{ \"d_model\": ")?;
    assert!(matches!(LayerConfig::from_path(&malformed), Err(ModelError::Json(_))));

    assert!(matches!(
        LayerConfig::from_path(dir.path().join("missing.toml")),
        Err(ModelError::Io(_))
    ));
    Ok(())
}

#[test]
fn invalid_config_fails_before_allocation() {
    let config = LayerConfig::new(8, 32, 3, 4, 4);
    let err = EncoderLayer::with_init(&config, &LinearInit::XavierUniform, &Device::Cpu, DType::F32)
        .unwrap_err();
    assert!(matches!(err, ModelError::InvalidConfig(_)));
}
