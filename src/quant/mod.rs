//! Quantization: affine quantizers and post-training calibration
//!
//! Provides the post-training quantization core:
//! - Affine quantize/dequantize with per-tensor, per-channel, per-group and
//!   per-head granularity
//! - Range calibration (min-max, MSE grid search, learnable factors)
//! - HQQ half-quadratic zero-point refinement
//! - LLM.int8-style outlier-aware mixed precision
//! - Fake-quantized linear layers driven by method hooks

mod benchmarks;
mod calibration;
mod error_analysis;
mod hqq;
mod linear;
mod outlier;
mod params;
mod quantizer;
mod spec;
mod state;

pub use benchmarks::{
    compare_bit_width_degradation, compare_methods, generate_activations_with_outliers,
    generate_gaussian_weights, generate_weights_with_outliers, BenchInputs, BenchPlan,
    BenchmarkSuite, MethodReport,
};
pub use calibration::{
    learnable_range, minmax_range, mse_range, sigmoid, CalibArgs, LearnableFactors,
    RangeCalibrator,
};
pub use error_analysis::{
    analyze_error, compare_bit_widths, error_within_bounds, lp_row_error, mean_abs_error,
    quantizer_error, theoretical_max_error, theoretical_sqnr, QuantErrorStats,
};
pub use hqq::{HqqConfig, HqqRefiner, HqqReport, HqqState, ShrinkOp};
pub use linear::{FakeQuantLinear, QdqHooks, RtnHooks};
pub use outlier::{outlier_mask, OutlierConfig, OutlierMask, OutlierSplitter};
pub use params::{
    PackedInts, PackedZeros, QParams, QuantizedTensor, RealQuantized, TensorRange,
    SCALE_CLAMP_MIN,
};
pub use quantizer::{QuantOptions, Quantizer, UNROUNDED_ZP_SCALE_FLOOR};
pub use spec::{
    int_bounds, CalibAlgo, Granularity, GranularityKind, IntBounds, MseOptions,
    QuantizationSpec, MAX_BITS, MIN_BITS,
};
pub use state::{LayerState, LayerStateMap};
