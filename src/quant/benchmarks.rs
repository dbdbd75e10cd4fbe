//! Accuracy degradation benchmarks
//!
//! Seeded synthetic workloads and a side-by-side comparison of the
//! quantization methods on one linear layer:
//! - Gaussian weights, optionally with injected outlier values
//! - Activations with a few large-magnitude channels
//! - RTN (min-max and MSE calibration), HQQ and outlier-aware mixed precision

use super::calibration::CalibArgs;
use super::error_analysis::{analyze_error, QuantErrorStats};
use super::hqq::{HqqConfig, HqqRefiner};
use super::linear::{FakeQuantLinear, QdqHooks, RtnHooks};
use super::outlier::{OutlierConfig, OutlierSplitter};
use super::quantizer::Quantizer;
use super::spec::{CalibAlgo, Granularity, MseOptions, QuantizationSpec};
use super::state::LayerStateMap;
use crate::error::Result;
use ndarray::{Array2, ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::info;

const BENCH_LAYER: &str = "bench.linear";

/// Error of one method on the benchmark layer
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MethodReport {
    /// Method name
    pub name: String,
    /// Weight reconstruction error
    pub weight: QuantErrorStats,
    /// Layer output error against the full-precision forward pass
    pub output: QuantErrorStats,
    /// HQQ rounds executed, if the method refines
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rounds: Option<usize>,
}

/// Suite of benchmark results
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct BenchmarkSuite {
    pub results: Vec<MethodReport>,
}

impl BenchmarkSuite {
    pub fn add(&mut self, result: MethodReport) {
        self.results.push(result);
    }

    /// Lowest output MSE
    pub fn best_by_output_mse(&self) -> Option<&MethodReport> {
        self.results
            .iter()
            .min_by(|a, b| a.output.mse.total_cmp(&b.output.mse))
    }

    /// Lowest weight MSE
    pub fn best_by_weight_mse(&self) -> Option<&MethodReport> {
        self.results
            .iter()
            .min_by(|a, b| a.weight.mse.total_cmp(&b.weight.mse))
    }

    pub fn get(&self, name: &str) -> Option<&MethodReport> {
        self.results.iter().find(|r| r.name == name)
    }
}

/// One standard normal sample (Box-Muller)
fn normal(rng: &mut StdRng) -> f32 {
    let u1: f32 = rng.random::<f32>().max(1e-10);
    let u2: f32 = rng.random::<f32>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
}

/// Gaussian weight matrix `[rows, cols]` with mean 0
pub fn generate_gaussian_weights(rows: usize, cols: usize, std_dev: f32, seed: u64) -> Array2<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array2::from_shape_simple_fn((rows, cols), || std_dev * normal(&mut rng))
}

/// Gaussian weights with a fraction of entries replaced by `±magnitude`
pub fn generate_weights_with_outliers(
    rows: usize,
    cols: usize,
    outlier_ratio: f32,
    magnitude: f32,
    seed: u64,
) -> Array2<f32> {
    let mut weights = generate_gaussian_weights(rows, cols, 1.0, seed);
    let n = rows * cols;
    if n == 0 {
        return weights;
    }
    let num_outliers = (n as f32 * outlier_ratio) as usize;
    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(12345));
    for _ in 0..num_outliers {
        let idx = rng.random_range(0..n);
        let sign = if rng.random::<bool>() { 1.0 } else { -1.0 };
        weights[[idx / cols, idx % cols]] = sign * magnitude;
    }
    weights
}

/// Activations `[tokens, channels]` where `outlier_channels` evenly spaced
/// channels are scaled up to about `magnitude`
pub fn generate_activations_with_outliers(
    tokens: usize,
    channels: usize,
    outlier_channels: usize,
    magnitude: f32,
    seed: u64,
) -> ArrayD<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut act = ArrayD::from_shape_simple_fn(IxDyn(&[tokens, channels]), || normal(&mut rng) * 0.5);
    let count = outlier_channels.min(channels);
    if count > 0 {
        let stride = channels / count;
        for k in 0..count {
            let c = k * stride;
            for t in 0..tokens {
                let v = act[[t, c]];
                act[[t, c]] = magnitude * (1.0 + 0.1 * v.abs());
            }
        }
    }
    act
}

/// Workload for [`compare_methods`]
#[derive(Clone, Debug)]
pub struct BenchInputs {
    /// Weight `[out, in]`
    pub weight: Array2<f32>,
    /// Activations `[..., in]`
    pub act: ArrayD<f32>,
}

impl BenchInputs {
    /// Synthetic workload: outlier-bearing weights and activations
    pub fn synthetic(rows: usize, cols: usize, seed: u64) -> Self {
        Self {
            weight: generate_weights_with_outliers(rows, cols, 0.002, 6.0, seed),
            act: generate_activations_with_outliers(16, cols, (cols / 32).max(1), 20.0, seed.wrapping_add(1)),
        }
    }
}

/// Quantizer settings shared by every compared method
#[derive(Clone, Debug)]
pub struct BenchPlan<'a> {
    pub weight: &'a QuantizationSpec,
    pub act: Option<&'a QuantizationSpec>,
    pub hqq: HqqConfig,
    pub outlier: OutlierConfig,
}

/// Run every applicable method on the workload
///
/// - `rtn_minmax`: weight spec with min-max calibration
/// - `rtn_mse`: weight spec with MSE calibration (batch size fitted to the row count)
/// - `hqq`: asymmetric weight specs only
/// - `llm_int8`: when an activation spec is given and the weight is not
///   quantized per group (outlier columns break fixed-size groups)
///
/// RTN methods quantize activations with the activation spec when present.
pub fn compare_methods(plan: &BenchPlan<'_>, inputs: &BenchInputs) -> Result<BenchmarkSuite> {
    let mut suite = BenchmarkSuite::default();
    let act_quantizer = plan.act.map(|s| Quantizer::new(s.clone())).transpose()?;

    let minmax = Quantizer::new(plan.weight.clone().with_calib(CalibAlgo::Minmax))?;
    let hooks = RtnHooks::new(minmax.clone(), act_quantizer.clone());
    suite.add(run_method("rtn_minmax", &hooks, inputs, &mut LayerStateMap::new(), None)?);

    let rows = minmax.reshape_tensor(inputs.weight.view())?.nrows();
    let mut mse_options = plan.weight.calib_args;
    if rows == 0 || mse_options.bs == 0 || rows % mse_options.bs != 0 {
        mse_options = MseOptions {
            bs: rows.max(1),
            ..mse_options
        };
    }
    let mse = Quantizer::new(plan.weight.clone().with_mse_options(mse_options))?;
    let hooks = RtnHooks::new(mse, act_quantizer.clone());
    suite.add(run_method("rtn_mse", &hooks, inputs, &mut LayerStateMap::new(), None)?);

    if !plan.weight.symmetric {
        let refiner = HqqRefiner::new(minmax.clone(), plan.hqq)?;
        let mut states = LayerStateMap::new();
        let reports = refiner.calibrate_block([(BENCH_LAYER, &inputs.weight)], &mut states)?;
        let rounds = reports.first().map(|(_, r)| r.rounds);
        suite.add(run_method("hqq", &refiner, inputs, &mut states, rounds)?);
    }

    let grouped = matches!(minmax.granularity(), Granularity::PerGroup(_));
    if let (Some(act), false) = (act_quantizer, grouped) {
        let splitter = OutlierSplitter::new(minmax, act, &plan.outlier)?;
        suite.add(run_method("llm_int8", &splitter, inputs, &mut LayerStateMap::new(), None)?);
    }

    Ok(suite)
}

fn run_method(
    name: &str,
    hooks: &dyn QdqHooks,
    inputs: &BenchInputs,
    states: &mut LayerStateMap,
    rounds: Option<usize>,
) -> Result<MethodReport> {
    let layer = FakeQuantLinear::new(BENCH_LAYER, inputs.weight.clone(), None)?;
    let reference = layer.forward_float(&inputs.act)?;
    let output = layer.forward(&inputs.act, hooks, states)?;
    let wq = hooks.w_qdq(BENCH_LAYER, &inputs.weight, states)?;

    let weight = analyze_error(&inputs.weight.clone().into_dyn(), &wq.into_dyn(), 0.1)?;
    let output = analyze_error(&reference, &output, 0.1)?;
    info!(method = name, weight_mse = weight.mse, output_mse = output.mse, "benchmark finished");

    Ok(MethodReport {
        name: name.to_string(),
        weight,
        output,
        rounds,
    })
}

/// Weight MSE of dynamic RTN across bit widths, `(bit, mse, sqnr_db)`
pub fn compare_bit_width_degradation(weight: &Array2<f32>, symmetric: bool) -> Result<Vec<(u32, f32, f32)>> {
    [2u32, 3, 4, 8]
        .into_iter()
        .map(|bit| {
            let q = Quantizer::new(QuantizationSpec::new(bit, symmetric).per_channel())?;
            let real = q.quantize_tensor(weight.view(), &CalibArgs::default())?;
            let recon = q.dequantize_tensor(&real)?;
            let stats = analyze_error(&weight.clone().into_dyn(), &recon, 0.1)?;
            Ok((bit, stats.mse, stats.sqnr_db))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quant::spec::QuantizationSpec;
    use ndarray::Axis;
    use proptest::prelude::*;

    #[test]
    fn test_generate_gaussian_weights() {
        let w = generate_gaussian_weights(64, 64, 1.0, 42);
        assert_eq!(w.shape(), &[64, 64]);
        let mean = w.mean().unwrap();
        let var = w.mapv(|v| (v - mean) * (v - mean)).mean().unwrap();
        assert!(mean.abs() < 0.1, "mean {mean}");
        assert!((var - 1.0).abs() < 0.2, "variance {var}");
    }

    #[test]
    fn test_generators_deterministic() {
        assert_eq!(
            generate_gaussian_weights(8, 8, 1.0, 7),
            generate_gaussian_weights(8, 8, 1.0, 7)
        );
        assert_ne!(
            generate_gaussian_weights(8, 8, 1.0, 7),
            generate_gaussian_weights(8, 8, 1.0, 8)
        );
    }

    #[test]
    fn test_generate_weights_with_outliers() {
        let w = generate_weights_with_outliers(32, 32, 0.01, 50.0, 3);
        let count = w.iter().filter(|v| v.abs() == 50.0).count();
        assert!(count >= 1 && count <= 10);
    }

    #[test]
    fn test_generate_activations_with_outliers() {
        let act = generate_activations_with_outliers(4, 64, 2, 20.0, 9);
        let peaks: Vec<f32> = act
            .axis_iter(Axis(1))
            .map(|ch| ch.fold(0.0f32, |m, v| m.max(v.abs())))
            .collect();
        assert!(peaks[0] >= 20.0);
        assert!(peaks[32] >= 20.0);
        assert_eq!(peaks.iter().filter(|p| **p >= 20.0).count(), 2);
    }

    #[test]
    fn test_compare_methods_asymmetric() {
        let weight = QuantizationSpec::new(4, false).per_channel();
        let act = QuantizationSpec::new(8, true);
        let plan = BenchPlan {
            weight: &weight,
            act: Some(&act),
            hqq: HqqConfig::default(),
            outlier: OutlierConfig::default(),
        };
        let inputs = BenchInputs::synthetic(32, 64, 5);
        let suite = compare_methods(&plan, &inputs).unwrap();

        let names: Vec<_> = suite.results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["rtn_minmax", "rtn_mse", "hqq", "llm_int8"]);
        assert!(suite.get("hqq").unwrap().rounds.is_some());

        let rtn = suite.get("rtn_minmax").unwrap();
        let int8 = suite.get("llm_int8").unwrap();
        assert!(int8.output.mse < rtn.output.mse);
        assert!(suite.best_by_output_mse().is_some());
    }

    #[test]
    fn test_compare_methods_refits_zero_mse_batch() {
        let weight = QuantizationSpec::new(4, false).per_channel().with_mse_options(MseOptions {
            bs: 0,
            ..MseOptions::default()
        });
        let plan = BenchPlan {
            weight: &weight,
            act: None,
            hqq: HqqConfig::default(),
            outlier: OutlierConfig::default(),
        };
        let suite = compare_methods(&plan, &BenchInputs::synthetic(6, 32, 11)).unwrap();

        let names: Vec<_> = suite.results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["rtn_minmax", "rtn_mse", "hqq"]);
        assert!(suite.get("rtn_mse").unwrap().weight.mse.is_finite());
    }

    #[test]
    fn test_compare_methods_skips_mixed_precision_for_groups() {
        let weight = QuantizationSpec::new(4, false).per_group(16);
        let act = QuantizationSpec::new(8, true);
        let plan = BenchPlan {
            weight: &weight,
            act: Some(&act),
            hqq: HqqConfig::default(),
            outlier: OutlierConfig::default(),
        };
        let suite = compare_methods(&plan, &BenchInputs::synthetic(8, 64, 2)).unwrap();
        assert!(suite.get("llm_int8").is_none());
        assert!(suite.get("hqq").is_some());
    }

    #[test]
    fn test_compare_methods_symmetric_without_act() {
        let weight = QuantizationSpec::new(8, true).per_channel();
        let plan = BenchPlan {
            weight: &weight,
            act: None,
            hqq: HqqConfig::default(),
            outlier: OutlierConfig::default(),
        };
        let inputs = BenchInputs::synthetic(8, 32, 1);
        let suite = compare_methods(&plan, &inputs).unwrap();
        assert_eq!(suite.results.len(), 2);
        assert!(suite.best_by_weight_mse().is_some());
    }

    #[test]
    fn test_bit_width_comparison() {
        let w = generate_gaussian_weights(16, 32, 1.0, 11);
        let results = compare_bit_width_degradation(&w, true).unwrap();
        assert_eq!(results.len(), 4);
        for pair in results.windows(2) {
            assert!(pair[1].1 < pair[0].1);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_generators_finite(seed in any::<u64>(), rows in 1usize..16, cols in 1usize..16) {
            let w = generate_weights_with_outliers(rows, cols, 0.05, 8.0, seed);
            prop_assert!(w.iter().all(|v| v.is_finite()));
        }
    }
}
