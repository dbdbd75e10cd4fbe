//! Range calibration
//!
//! Determines the `(min, max)` range that quantization parameters are
//! derived from:
//! - Min-Max: observed row-wise (or tensor-wise) extremes
//! - MSE: grid search over shrunk min-max ranges, minimizing the per-row
//!   Lp reconstruction error
//! - Learnable: min-max scaled by sigmoid-gated external factors

use super::error_analysis::lp_row_error;
use super::params::{row_value, TensorRange};
use super::quantizer::Quantizer;
use super::spec::{CalibAlgo, MseOptions};
use crate::error::{Error, Result};
use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Optional per-channel factors for learnable calibration
///
/// Raw (pre-sigmoid) values; each has length 1 or one entry per row.
/// A missing side leaves that side of the min-max range unchanged.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LearnableFactors {
    #[serde(default)]
    pub lowbound: Option<Array1<f32>>,
    #[serde(default)]
    pub upbound: Option<Array1<f32>>,
}

impl LearnableFactors {
    pub fn new(lowbound: Array1<f32>, upbound: Array1<f32>) -> Self {
        Self {
            lowbound: Some(lowbound),
            upbound: Some(upbound),
        }
    }
}

/// Per-call calibration arguments
#[derive(Clone, Copy, Debug, Default)]
pub struct CalibArgs<'a> {
    /// Overrides the spec's MSE options for this call
    pub mse: Option<MseOptions>,
    /// Factors for learnable calibration
    pub factors: Option<&'a LearnableFactors>,
}

impl<'a> CalibArgs<'a> {
    pub fn with_mse(mut self, options: MseOptions) -> Self {
        self.mse = Some(options);
        self
    }

    pub fn with_factors(mut self, factors: &'a LearnableFactors) -> Self {
        self.factors = Some(factors);
        self
    }
}

/// Calibration strategy resolved from a [`CalibAlgo`] tag
#[derive(Clone, Copy, Debug)]
pub enum RangeCalibrator<'a> {
    Minmax,
    Mse(MseOptions),
    Learnable(Option<&'a LearnableFactors>),
}

impl<'a> RangeCalibrator<'a> {
    /// Pick the strategy for `algo`, preferring per-call options over the spec's
    pub fn select(algo: CalibAlgo, spec_options: &MseOptions, args: &CalibArgs<'a>) -> Self {
        match algo {
            CalibAlgo::Minmax => RangeCalibrator::Minmax,
            CalibAlgo::Mse => RangeCalibrator::Mse(args.mse.unwrap_or(*spec_options)),
            CalibAlgo::Learnable => RangeCalibrator::Learnable(args.factors),
        }
    }

    /// Compute the range of a reshaped tensor
    pub fn calibrate(&self, quantizer: &Quantizer, tensor: &Array2<f32>) -> Result<TensorRange> {
        let per_tensor = quantizer.granularity().is_per_tensor();
        match self {
            RangeCalibrator::Minmax => Ok(minmax_range(tensor, per_tensor)),
            RangeCalibrator::Mse(options) => mse_range(quantizer, tensor, options),
            RangeCalibrator::Learnable(factors) => learnable_range(tensor, per_tensor, *factors),
        }
    }
}

/// Observed extremes, one entry per row or a single scalar
///
/// Empty rows (and an empty tensor) get the range `(0, 0)`.
pub fn minmax_range(tensor: &Array2<f32>, per_tensor: bool) -> TensorRange {
    if per_tensor {
        let (min, max) = extremes(tensor.iter().copied());
        return TensorRange::scalar(min, max);
    }
    let mut min = Array1::zeros(tensor.nrows());
    let mut max = Array1::zeros(tensor.nrows());
    for (r, row) in tensor.axis_iter(Axis(0)).enumerate() {
        let (lo, hi) = extremes(row.iter().copied());
        min[r] = lo;
        max[r] = hi;
    }
    TensorRange { min, max }
}

fn extremes(values: impl Iterator<Item = f32>) -> (f32, f32) {
    let (min, max) = values.fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    if min > max {
        (0.0, 0.0)
    } else {
        (min, max)
    }
}

/// Grid search over shrunk min-max ranges
///
/// Rows are processed in batches of `options.bs`; the row count must be a
/// multiple of it. Every candidate `p = 1 - i / grid` for
/// `i in 0..maxshrink * grid` shrinks the min-max range of the batch, and
/// each row keeps the candidate with the lowest Lp error seen so far. The
/// first candidate is the min-max range itself, so the result never does
/// worse than min-max.
///
/// With per-tensor granularity a single factor is searched for the whole
/// tensor and `bs` is not used.
pub fn mse_range(quantizer: &Quantizer, tensor: &Array2<f32>, options: &MseOptions) -> Result<TensorRange> {
    options.validate()?;
    let per_tensor = quantizer.granularity().is_per_tensor();
    let base = minmax_range(tensor, per_tensor);
    if per_tensor {
        return search_batch(quantizer, tensor.view(), &base, options);
    }

    let rows = tensor.nrows();
    if rows % options.bs != 0 {
        return Err(Error::config(format!(
            "mse batch size {} does not divide the row count {rows}",
            options.bs
        )));
    }

    let mut best = base.clone();
    for (b, batch) in tensor.axis_chunks_iter(Axis(0), options.bs).enumerate() {
        let lo = b * options.bs;
        let hi = lo + batch.nrows();
        let batch_base = TensorRange {
            min: base.min.slice(s![lo..hi]).to_owned(),
            max: base.max.slice(s![lo..hi]).to_owned(),
        };
        let found = search_batch(quantizer, batch, &batch_base, options)?;
        best.min.slice_mut(s![lo..hi]).assign(&found.min);
        best.max.slice_mut(s![lo..hi]).assign(&found.max);
        debug!(batch = b, rows = hi - lo, "mse batch calibrated");
    }
    Ok(best)
}

fn search_batch(
    quantizer: &Quantizer,
    batch: ArrayView2<'_, f32>,
    base: &TensorRange,
    options: &MseOptions,
) -> Result<TensorRange> {
    let batch = batch.to_owned();
    let mut best = base.clone();
    let mut best_err = Array1::from_elem(base.len(), f32::INFINITY);

    for i in 0..options.steps() {
        let p = 1.0 - i as f32 / options.grid as f32;
        let candidate = base.shrunk(p);
        let params = quantizer.get_qparams(&candidate)?;
        let recon = quantizer.quant_dequant(&batch, &params)?;
        let mut err = lp_row_error(&batch, &recon, options.norm)?;
        if base.len() == 1 {
            err = Array1::from_elem(1, err.sum());
        }

        for r in 0..best_err.len() {
            if err[r] < best_err[r] {
                best_err[r] = err[r];
                best.min[r] = candidate.min[r];
                best.max[r] = candidate.max[r];
            }
        }
    }
    Ok(best)
}

/// Min-max range with each side scaled by `sigmoid(factor)`
pub fn learnable_range(
    tensor: &Array2<f32>,
    per_tensor: bool,
    factors: Option<&LearnableFactors>,
) -> Result<TensorRange> {
    let mut range = minmax_range(tensor, per_tensor);
    if let Some(factors) = factors {
        if let Some(low) = &factors.lowbound {
            range.min = gate(&range.min, low)?;
        }
        if let Some(up) = &factors.upbound {
            range.max = gate(&range.max, up)?;
        }
    }
    Ok(range)
}

fn gate(values: &Array1<f32>, factor: &Array1<f32>) -> Result<Array1<f32>> {
    if factor.len() != 1 && factor.len() != values.len() {
        return Err(Error::ShapeMismatch {
            expected: vec![values.len()],
            got: vec![factor.len()],
        });
    }
    Ok(Array1::from_shape_fn(values.len(), |i| {
        sigmoid(row_value(factor, i)) * values[i]
    }))
}

#[inline]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quant::spec::QuantizationSpec;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2, Array};
    use proptest::prelude::*;

    fn per_channel(bit: u32, symmetric: bool) -> Quantizer {
        Quantizer::new(QuantizationSpec::new(bit, symmetric).per_channel()).unwrap()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_minmax_contains_all_values(
            data in prop::collection::vec(-100.0f32..100.0, 12)
        ) {
            let t = Array::from_shape_vec((3, 4), data).unwrap();
            let range = minmax_range(&t, false);
            for (r, row) in t.axis_iter(Axis(0)).enumerate() {
                for &v in row.iter() {
                    prop_assert!(v >= range.min[r] && v <= range.max[r]);
                }
            }
        }

        #[test]
        fn prop_mse_never_worse_than_minmax(
            data in prop::collection::vec(-10.0f32..10.0, 32)
        ) {
            let t = Array::from_shape_vec((4, 8), data).unwrap();
            let q = per_channel(3, false);
            let opts = MseOptions { bs: 2, grid: 20, ..MseOptions::default() };

            let minmax = q.get_qparams(&minmax_range(&t, false)).unwrap();
            let mse = q.get_qparams(&mse_range(&q, &t, &opts).unwrap()).unwrap();
            let err_minmax = lp_row_error(&t, &q.quant_dequant(&t, &minmax).unwrap(), opts.norm).unwrap();
            let err_mse = lp_row_error(&t, &q.quant_dequant(&t, &mse).unwrap(), opts.norm).unwrap();
            for r in 0..4 {
                prop_assert!(err_mse[r] <= err_minmax[r]);
            }
        }
    }

    #[test]
    fn test_minmax_per_tensor() {
        let t = arr2(&[[1.0, -3.0], [2.0, 0.5]]);
        let range = minmax_range(&t, true);
        assert_eq!(range.min, arr1(&[-3.0]));
        assert_eq!(range.max, arr1(&[2.0]));
    }

    #[test]
    fn test_minmax_per_row() {
        let t = arr2(&[[1.0, -3.0], [2.0, 0.5]]);
        let range = minmax_range(&t, false);
        assert_eq!(range.min, arr1(&[-3.0, 0.5]));
        assert_eq!(range.max, arr1(&[1.0, 2.0]));
    }

    #[test]
    fn test_minmax_empty_tensor() {
        let t = Array2::<f32>::zeros((0, 4));
        let range = minmax_range(&t, true);
        assert_eq!(range.min[0], 0.0);
        assert_eq!(range.max[0], 0.0);
    }

    #[test]
    fn test_mse_rejects_indivisible_batch() {
        let q = per_channel(4, false);
        let t = Array2::<f32>::ones((6, 4));
        let opts = MseOptions { bs: 4, ..MseOptions::default() };
        assert!(matches!(mse_range(&q, &t, &opts), Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_mse_range_stays_on_grid() {
        let mut row: Vec<f32> = (0..63).map(|i| ((i % 7) as f32 - 3.0) * 0.05).collect();
        row.push(4.0);
        let t = Array::from_shape_vec((1, 64), row).unwrap();
        let q = per_channel(2, true);
        let opts = MseOptions { bs: 1, ..MseOptions::default() };
        let range = mse_range(&q, &t, &opts).unwrap();

        let p = range.max[0] / 4.0;
        let lowest = 1.0 - (opts.steps() - 1) as f32 / opts.grid as f32;
        assert!(p <= 1.0 && p >= lowest - 1e-6);
        assert_abs_diff_eq!(range.min[0] / -0.15, p, epsilon = 1e-5);
    }

    #[test]
    fn test_mse_per_tensor_ignores_batch_size() {
        let q = Quantizer::new(QuantizationSpec::new(4, false)).unwrap();
        let t = Array2::<f32>::from_shape_fn((3, 5), |(i, j)| (i * 5 + j) as f32);
        let opts = MseOptions { bs: 4, ..MseOptions::default() };
        let range = mse_range(&q, &t, &opts).unwrap();
        assert_eq!(range.len(), 1);
    }

    #[test]
    fn test_mse_validates_options() {
        let q = per_channel(4, false);
        let t = Array2::<f32>::ones((2, 2));
        let opts = MseOptions { grid: 0, ..MseOptions::default() };
        assert!(mse_range(&q, &t, &opts).is_err());
    }

    #[test]
    fn test_learnable_without_factors_is_minmax() {
        let t = arr2(&[[1.0, -3.0], [2.0, 0.5]]);
        let range = learnable_range(&t, false, None).unwrap();
        assert_eq!(range, minmax_range(&t, false));
    }

    #[test]
    fn test_learnable_gates_each_side() {
        let t = arr2(&[[-2.0, 4.0]]);
        let factors = LearnableFactors {
            lowbound: Some(arr1(&[0.0])),
            upbound: None,
        };
        let range = learnable_range(&t, false, Some(&factors)).unwrap();
        assert_abs_diff_eq!(range.min[0], -1.0, epsilon = 1e-6);
        assert_eq!(range.max[0], 4.0);
    }

    #[test]
    fn test_learnable_factor_length_mismatch() {
        let t = Array2::<f32>::ones((3, 2));
        let factors = LearnableFactors::new(arr1(&[1.0, 2.0]), arr1(&[1.0, 2.0]));
        assert!(matches!(
            learnable_range(&t, false, Some(&factors)),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_select_prefers_call_options() {
        let spec_opts = MseOptions::default();
        let call_opts = MseOptions { grid: 10, ..MseOptions::default() };
        let args = CalibArgs::default().with_mse(call_opts);
        match RangeCalibrator::select(CalibAlgo::Mse, &spec_opts, &args) {
            RangeCalibrator::Mse(opts) => assert_eq!(opts.grid, 10),
            other => panic!("unexpected calibrator {other:?}"),
        }
        assert!(matches!(
            RangeCalibrator::select(CalibAlgo::Mse, &spec_opts, &CalibArgs::default()),
            RangeCalibrator::Mse(opts) if opts.grid == 100
        ));
    }

    #[test]
    fn test_sigmoid() {
        assert_abs_diff_eq!(sigmoid(0.0), 0.5, epsilon = 1e-7);
        assert!(sigmoid(20.0) > 0.999);
        assert!(sigmoid(-20.0) < 0.001);
    }
}
