//! End-to-end quantization scenarios
//!
//! Exercises the public API the way a calibration pipeline does: build
//! quantizers, calibrate, attach per-layer state and run quantized forwards.

use approx::assert_relative_eq;
use cuantizar::config::{build_hooks, load_config, QuantMethod};
use cuantizar::quant::{
    generate_weights_with_outliers, minmax_range, mse_range, CalibAlgo, CalibArgs, FakeQuantLinear, HqqConfig,
    HqqRefiner, LayerStateMap, MseOptions, OutlierConfig, OutlierSplitter, PackedInts, QuantOptions,
    QuantizationSpec, Quantizer, TensorRange,
};
use cuantizar::Error;
use ndarray::{Array1, Array2, ArrayD, IxDyn};
use std::io::Write;
use tempfile::NamedTempFile;

fn weight_4x8() -> Array2<f32> {
    Array2::from_shape_fn((4, 8), |(i, j)| (i * 8 + j) as f32 * 0.1 - 1.6)
}

#[test]
fn test_symmetric_per_tensor_4bit_scale_and_codes() {
    let w = weight_4x8();
    let q = Quantizer::new(QuantizationSpec::new(4, true)).unwrap();

    let (reshaped, params) = q.get_tensor_qparams(w.view(), &CalibArgs::default()).unwrap();
    assert_eq!(params.scales.len(), 1);
    assert!(params.zeros.is_none());
    assert_relative_eq!(params.scales[0], 1.6 / 7.0, epsilon = 1e-6);
    assert_eq!((params.min_int, params.max_int), (-8, 7));

    let codes = q.quant(&reshaped, &params).unwrap();
    assert!(codes.iter().all(|&c| (-8.0..=7.0).contains(&c) && c == c.round()));
    assert_eq!(codes[[0, 0]], -7.0);

    // values far outside the calibrated range saturate at the code bounds
    let wide = reshaped.mapv(|v| v * 10.0);
    let saturated = q.quant(&wide, &params).unwrap();
    assert_eq!(saturated.iter().cloned().fold(f32::INFINITY, f32::min), -8.0);
    assert_eq!(saturated.iter().cloned().fold(f32::NEG_INFINITY, f32::max), 7.0);
}

#[test]
fn test_constant_tensor_uses_scale_floor() {
    let w = Array2::from_elem((3, 4), 0.25f32);
    let q = Quantizer::new(QuantizationSpec::new(8, false).per_channel()).unwrap();
    let out = q.fake_quant_weight_dynamic(&w, &QuantOptions::default()).unwrap();
    assert!(out.iter().all(|v| v.is_finite()));

    let zero = Array2::<f32>::zeros((2, 2));
    let sym = Quantizer::new(QuantizationSpec::new(8, true)).unwrap();
    let out = sym.fake_quant_weight_dynamic(&zero, &QuantOptions::default()).unwrap();
    assert!(out.iter().all(|&v| v == 0.0));
}

#[test]
fn test_outlier_channel_kept_in_full_precision() {
    let weight_q = Quantizer::new(QuantizationSpec::new(8, true).per_channel()).unwrap();
    let act_q = Quantizer::new(QuantizationSpec::new(4, true)).unwrap();
    let splitter = OutlierSplitter::new(weight_q, act_q, &OutlierConfig { threshold: 6.0 }).unwrap();

    let mut act = ArrayD::from_shape_fn(IxDyn(&[2, 3, 5]), |ix| 0.1 * (ix[1] + ix[2]) as f32 - 0.3);
    act[[1, 2, 3]] = 10.0;
    act[[0, 0, 3]] = -2.5;

    let mut states = LayerStateMap::new();
    let out = splitter.a_qdq("mlp.down", &act, &mut states).unwrap();
    let mask = states.outlier_mask("mlp.down").unwrap();
    assert_eq!(mask.fp_indices(), &[3]);
    assert_eq!(mask.int_indices(), &[0, 1, 2, 4]);

    for (ix, v) in act.indexed_iter() {
        if ix[2] == 3 {
            assert_eq!(out[ix], *v);
        }
    }

    let w = Array2::from_shape_fn((6, 5), |(i, j)| (i as f32 - j as f32) * 0.3);
    let wq = splitter.w_qdq("mlp.down", &w, &states).unwrap();
    for r in 0..6 {
        assert_eq!(wq[[r, 3]], w[[r, 3]]);
    }
}

#[test]
fn test_weight_hook_without_activation_pass_fails() {
    let q = Quantizer::new(QuantizationSpec::new(8, true)).unwrap();
    let splitter = OutlierSplitter::new(q.clone(), q, &OutlierConfig::default()).unwrap();
    let err = splitter
        .w_qdq("attn.q", &Array2::zeros((2, 2)), &LayerStateMap::new())
        .unwrap_err();
    assert!(matches!(err, Error::MissingState(_)));
}

#[test]
fn test_mse_beats_minmax_on_heavy_tailed_rows() {
    let w = generate_weights_with_outliers(16, 64, 0.02, 8.0, 5);
    let q = Quantizer::new(QuantizationSpec::new(3, false).per_channel()).unwrap();
    let options = MseOptions {
        norm: 2.0,
        bs: 8,
        ..MseOptions::default()
    };

    let base = minmax_range(&w, false);
    let tuned = mse_range(&q, &w, &options).unwrap();
    for r in 0..16 {
        assert!(tuned.max[r] <= base.max[r] + 1e-6);
        assert!(tuned.min[r] >= base.min[r] - 1e-6);
    }

    let mse = |range: &TensorRange| {
        let params = q.get_qparams(range).unwrap();
        let recon = q.quant_dequant(&w, &params).unwrap();
        (&w - &recon).mapv(|d| d * d).mean().unwrap()
    };
    assert!(mse(&tuned) <= mse(&base) * (1.0 + 1e-5));
}

#[test]
fn test_mse_batch_size_must_divide_rows() {
    let w = Array2::from_shape_fn((6, 4), |(i, j)| (i + j) as f32);
    let q = Quantizer::new(QuantizationSpec::new(4, false).per_channel()).unwrap();
    let options = MseOptions {
        bs: 4,
        ..MseOptions::default()
    };
    assert!(matches!(mse_range(&q, &w, &options), Err(Error::ConfigError(_))));
}

#[test]
fn test_hqq_block_calibration_and_forward() {
    let spec = QuantizationSpec::new(4, false).per_group(8).with_round_zp(false);
    let refiner = HqqRefiner::new(Quantizer::new(spec).unwrap(), HqqConfig::default()).unwrap();

    let q_proj = generate_weights_with_outliers(8, 16, 0.05, 4.0, 1);
    let k_proj = generate_weights_with_outliers(8, 16, 0.05, 4.0, 2);
    let mut states = LayerStateMap::new();
    let reports = refiner
        .calibrate_block([("q_proj", &q_proj), ("k_proj", &k_proj)], &mut states)
        .unwrap();

    assert_eq!(reports.len(), 2);
    assert_eq!(states.len(), 2);
    for (name, report) in &reports {
        let state = states.hqq(name).unwrap();
        assert_eq!(state.scales.len(), 16);
        assert!(report.final_error() <= report.initial_error);
    }

    let layer = FakeQuantLinear::new("q_proj", q_proj.clone(), Some(Array1::zeros(8))).unwrap();
    let x = ArrayD::from_shape_fn(IxDyn(&[3, 16]), |ix| ((ix[0] * 16 + ix[1]) % 7) as f32 * 0.1);
    let y = layer.forward(&x, &refiner, &mut states).unwrap();
    assert_eq!(y.shape(), &[3, 8]);

    let restored = LayerStateMap::from_json(&states.to_json().unwrap()).unwrap();
    assert_eq!(restored.hqq("k_proj").unwrap(), states.hqq("k_proj").unwrap());
}

#[test]
fn test_hqq_default_round_zp_inference_matches_refined_error() {
    let spec = QuantizationSpec::new(4, false).per_group(16);
    let quantizer = Quantizer::new(spec).unwrap();
    let refiner = HqqRefiner::new(quantizer.clone(), HqqConfig::default()).unwrap();
    let w = generate_weights_with_outliers(8, 64, 0.02, 4.0, 3);

    let mut states = LayerStateMap::new();
    let reports = refiner.calibrate_block([("o_proj", &w)], &mut states).unwrap();
    let report = &reports[0].1;

    let mae = |wq: &Array2<f32>| (&w - wq).mapv(f32::abs).mean().unwrap();
    let hqq = mae(&refiner.w_qdq("o_proj", &w, &states).unwrap());
    let rtn = mae(&quantizer.fake_quant_weight_dynamic(&w, &QuantOptions::default()).unwrap());

    assert!((hqq - report.final_error()).abs() < 1e-4, "{hqq} vs {}", report.final_error());
    assert!(hqq <= rtn + 1e-4, "hqq {hqq} worse than rtn {rtn}");
}

#[test]
fn test_hqq_rejects_symmetric_quantizer() {
    let q = Quantizer::new(QuantizationSpec::new(4, true).per_group(8)).unwrap();
    assert!(matches!(
        HqqRefiner::new(q, HqqConfig::default()),
        Err(Error::ConfigError(_))
    ));
}

#[test]
fn test_real_quant_packs_int8() {
    let w = weight_4x8();
    let q = Quantizer::new(QuantizationSpec::new(8, true).per_channel()).unwrap();
    let packed = q.real_quant_weight_dynamic(&w, &CalibArgs::default()).unwrap();
    assert!(matches!(packed.weight, PackedInts::I8(_)));
    assert_eq!(packed.weight.shape(), &[4, 8]);
    assert_eq!(packed.scales.len(), 4);
}

#[test]
fn test_unknown_calibration_tag_is_config_error() {
    let err = "percentile".parse::<CalibAlgo>().unwrap_err();
    assert!(matches!(err, Error::ConfigError(_)));
}

#[test]
fn test_yaml_config_drives_llm_int8_forward() {
    let yaml = r#"
method: llm_int8
weight:
  bit: 8
  symmetric: true
  granularity: per_channel
act:
  bit: 8
  symmetric: true
special:
  llm_int8:
    threshold: 4.0
"#;
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();

    let config = load_config(file.path()).unwrap();
    assert_eq!(config.method, QuantMethod::LlmInt8);
    let hooks = build_hooks(&config).unwrap();

    let w = Array2::from_shape_fn((4, 6), |(i, j)| ((i + 2 * j) % 5) as f32 * 0.2 - 0.4);
    let layer = FakeQuantLinear::new("fc1", w, None).unwrap();
    let mut x = ArrayD::from_shape_fn(IxDyn(&[2, 6]), |ix| 0.05 * (ix[0] + ix[1]) as f32);
    x[[0, 1]] = 9.0;

    let mut states = LayerStateMap::new();
    let y = layer.forward(&x, hooks.as_ref(), &mut states).unwrap();
    let reference = layer.forward_float(&x).unwrap();
    assert_eq!(states.outlier_mask("fc1").unwrap().fp_indices(), &[1]);
    for (a, b) in y.iter().zip(reference.iter()) {
        assert!((a - b).abs() < 0.05, "{a} vs {b}");
    }
}
