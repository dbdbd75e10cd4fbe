//! Quantization error analysis
//!
//! Reconstruction error statistics between an original tensor and its
//! fake-quantized counterpart:
//! - MSE / MAE / max error / SQNR summaries
//! - Per-row Lp error (the objective of the MSE range search)
//! - Theoretical bounds for a set of parameters

use super::calibration::CalibArgs;
use super::params::QParams;
use super::quantizer::{QuantOptions, Quantizer};
use super::spec::QuantizationSpec;
use crate::error::{Error, Result};
use ndarray::{Array1, Array2, ArrayD, Axis, Zip};
use serde::{Deserialize, Serialize};

/// Error statistics for quantization analysis
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QuantErrorStats {
    /// Mean Squared Error
    pub mse: f32,
    /// Mean Absolute Error
    pub mae: f32,
    /// Maximum absolute error
    pub max_error: f32,
    /// Signal-to-Quantization-Noise Ratio (SQNR) in dB
    pub sqnr_db: f32,
    /// Fraction of values with error > threshold
    pub outlier_rate: f32,
    /// Number of samples
    pub num_samples: usize,
}

impl QuantErrorStats {
    /// Root Mean Squared Error
    pub fn rmse(&self) -> f32 {
        self.mse.sqrt()
    }
}

/// Compare an original tensor with its reconstruction
///
/// # Arguments
/// * `original` - Original values
/// * `reconstructed` - Quantize-dequantized values, same shape
/// * `outlier_threshold` - Error threshold counted into `outlier_rate`
pub fn analyze_error(
    original: &ArrayD<f32>,
    reconstructed: &ArrayD<f32>,
    outlier_threshold: f32,
) -> Result<QuantErrorStats> {
    if original.shape() != reconstructed.shape() {
        return Err(Error::ShapeMismatch {
            expected: original.shape().to_vec(),
            got: reconstructed.shape().to_vec(),
        });
    }
    if original.is_empty() {
        return Ok(QuantErrorStats::default());
    }

    let n = original.len() as f32;
    let errors = Zip::from(original)
        .and(reconstructed)
        .map_collect(|o, r| (o - r).abs());

    let mse = errors.iter().map(|e| e * e).sum::<f32>() / n;
    let mae = errors.sum() / n;
    let max_error = errors.iter().copied().fold(0.0f32, f32::max);
    let outlier_rate = errors.iter().filter(|&&e| e > outlier_threshold).count() as f32 / n;

    // SQNR = 10 * log10(signal_power / noise_power)
    let signal_power = original.iter().map(|x| x * x).sum::<f32>() / n;
    let sqnr_db = if mse > 1e-10 {
        10.0 * (signal_power / mse).log10()
    } else {
        f32::INFINITY
    };

    Ok(QuantErrorStats {
        mse,
        mae,
        max_error,
        sqnr_db,
        outlier_rate,
        num_samples: original.len(),
    })
}

/// Per-row `sum |x - x_hat|^norm`
pub fn lp_row_error(original: &Array2<f32>, reconstructed: &Array2<f32>, norm: f32) -> Result<Array1<f32>> {
    if original.shape() != reconstructed.shape() {
        return Err(Error::ShapeMismatch {
            expected: original.shape().to_vec(),
            got: reconstructed.shape().to_vec(),
        });
    }
    Ok((original - reconstructed)
        .mapv(|d| d.abs().powf(norm))
        .sum_axis(Axis(1)))
}

/// Mean absolute error, the objective tracked by HQQ refinement
pub fn mean_abs_error(original: &Array2<f32>, reconstructed: &Array2<f32>) -> f32 {
    if original.is_empty() {
        return 0.0;
    }
    Zip::from(original)
        .and(reconstructed)
        .fold(0.0f32, |acc, o, r| acc + (o - r).abs())
        / original.len() as f32
}

/// Largest error reachable inside the code range: half a quantization step
pub fn theoretical_max_error(params: &QParams) -> f32 {
    let max_scale = params.scales.iter().copied().fold(0.0f32, f32::max);
    max_scale / 2.0
}

/// Theoretical SQNR for b-bit uniform quantization: 6.02 * b + 1.76 dB
pub fn theoretical_sqnr(bits: u32) -> f32 {
    6.02 * bits as f32 + 1.76
}

/// Check if the observed max error is within the half-step bound
pub fn error_within_bounds(stats: &QuantErrorStats, params: &QParams, tolerance: f32) -> bool {
    stats.max_error <= theoretical_max_error(params) * (1.0 + tolerance)
}

/// MSE of per-channel min-max fake quantization at 2, 4 and 8 bits
///
/// Returns `(mse_2bit, mse_4bit, mse_8bit)`.
pub fn compare_bit_widths(weight: &Array2<f32>, symmetric: bool) -> Result<(f32, f32, f32)> {
    let mut out = [0.0f32; 3];
    for (slot, bit) in out.iter_mut().zip([2u32, 4, 8]) {
        let quantizer = Quantizer::new(QuantizationSpec::new(bit, symmetric).per_channel())?;
        let recon = quantizer.fake_quant_weight_dynamic(weight, &QuantOptions::default())?;
        let stats = analyze_error(&weight.clone().into_dyn(), &recon.into_dyn(), f32::INFINITY)?;
        *slot = stats.mse;
    }
    Ok((out[0], out[1], out[2]))
}

/// Error of `quantizer` on `tensor` with parameters computed from the tensor
pub fn quantizer_error(quantizer: &Quantizer, tensor: &Array2<f32>) -> Result<QuantErrorStats> {
    let (reshaped, params) = quantizer.get_tensor_qparams(tensor.view(), &CalibArgs::default())?;
    let recon = quantizer.quant_dequant(&reshaped, &params)?;
    let recon = quantizer.restore_tensor(&recon, tensor.shape())?;
    analyze_error(&tensor.clone().into_dyn(), &recon, theoretical_max_error(&params))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2, Array};
    use proptest::prelude::*;

    #[test]
    fn test_error_stats_basic() {
        let a = arr1(&[1.0f32, 2.0, 3.0, 4.0]).into_dyn();
        let b = arr1(&[1.0f32, 2.5, 3.0, 3.0]).into_dyn();
        let stats = analyze_error(&a, &b, 0.6).unwrap();
        assert_abs_diff_eq!(stats.mse, (0.25 + 1.0) / 4.0, epsilon = 1e-6);
        assert_abs_diff_eq!(stats.mae, 1.5 / 4.0, epsilon = 1e-6);
        assert_eq!(stats.max_error, 1.0);
        assert_abs_diff_eq!(stats.outlier_rate, 0.25, epsilon = 1e-6);
        assert_eq!(stats.num_samples, 4);
    }

    #[test]
    fn test_rmse_calculation() {
        let stats = QuantErrorStats {
            mse: 4.0,
            ..Default::default()
        };
        assert_eq!(stats.rmse(), 2.0);
    }

    #[test]
    fn test_identical_tensors_infinite_sqnr() {
        let a = arr1(&[1.0f32, -1.0]).into_dyn();
        let stats = analyze_error(&a, &a, 0.1).unwrap();
        assert_eq!(stats.mse, 0.0);
        assert!(stats.sqnr_db.is_infinite());
    }

    #[test]
    fn test_shape_mismatch() {
        let a = arr1(&[1.0f32, 2.0]).into_dyn();
        let b = arr1(&[1.0f32]).into_dyn();
        assert!(analyze_error(&a, &b, 0.1).is_err());
        assert!(lp_row_error(&arr2(&[[1.0]]), &arr2(&[[1.0, 2.0]]), 2.0).is_err());
    }

    #[test]
    fn test_empty_values() {
        let a = ArrayD::<f32>::zeros(ndarray::IxDyn(&[0]));
        let stats = analyze_error(&a, &a, 0.1).unwrap();
        assert_eq!(stats.num_samples, 0);
    }

    #[test]
    fn test_lp_row_error() {
        let a = arr2(&[[1.0, 2.0], [0.0, 0.0]]);
        let b = arr2(&[[0.0, 2.0], [2.0, 2.0]]);
        let err = lp_row_error(&a, &b, 2.0).unwrap();
        assert_abs_diff_eq!(err[0], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(err[1], 8.0, epsilon = 1e-5);
    }

    #[test]
    fn test_mean_abs_error() {
        let a = arr2(&[[1.0, -1.0]]);
        let b = arr2(&[[0.5, 0.0]]);
        assert_abs_diff_eq!(mean_abs_error(&a, &b), 0.75, epsilon = 1e-6);
    }

    #[test]
    fn test_theoretical_sqnr() {
        assert_abs_diff_eq!(theoretical_sqnr(8), 49.92, epsilon = 0.01);
        assert_abs_diff_eq!(theoretical_sqnr(4), 25.84, epsilon = 0.01);
    }

    #[test]
    fn test_compare_bit_widths() {
        let w = Array::from_shape_fn((4, 16), |(i, j)| ((i * 16 + j) as f32 * 0.37).sin());
        let (e2, e4, e8) = compare_bit_widths(&w, true).unwrap();
        assert!(e8 < e4);
        assert!(e4 < e2);
    }

    proptest! {
        #[test]
        fn prop_mse_non_negative(values in proptest::collection::vec(-100.0f32..100.0, 10..100)) {
            let n = values.len();
            let w = Array::from_shape_vec((1, n), values).unwrap();
            let q = Quantizer::new(QuantizationSpec::new(4, false)).unwrap();
            let stats = quantizer_error(&q, &w).unwrap();
            prop_assert!(stats.mse >= 0.0);
            prop_assert!(stats.outlier_rate >= 0.0 && stats.outlier_rate <= 1.0);
        }

        #[test]
        fn prop_error_bounded(values in proptest::collection::vec(-100.0f32..100.0, 10..100)) {
            let n = values.len();
            let w = Array::from_shape_vec((1, n), values).unwrap();
            let q = Quantizer::new(QuantizationSpec::new(8, true)).unwrap();
            let (reshaped, params) = q.get_tensor_qparams(w.view(), &CalibArgs::default()).unwrap();
            let recon = q.quant_dequant(&reshaped, &params).unwrap();
            let stats = analyze_error(&reshaped.into_dyn(), &recon.into_dyn(), 1.0).unwrap();
            // Symmetric codes reach -max_int exactly, so the half-step bound holds
            prop_assert!(error_within_bounds(&stats, &params, 1e-3));
        }
    }
}
