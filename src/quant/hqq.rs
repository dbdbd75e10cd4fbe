//! Half-quadratic proximal refinement (HQQ)
//!
//! Starting from min-max parameters, the zero-points of a weight are refined
//! by alternating a quantization step with a proximal shrinkage of the
//! residual, under a penalty `beta` that grows by `kappa` each round. Scales
//! stay at their min-max estimate; only zero-points move.
//!
//! The search is greedy: it stops the first round whose mean absolute error
//! does not improve on the best seen so far, so it finds a local optimum.
//!
//! Refined zero-points are fractional. Inference applies them as they are,
//! without rounding, whatever `round_zp` the weight spec asks for.

use super::calibration::minmax_range;
use super::error_analysis::mean_abs_error;
use super::linear::QdqHooks;
use super::params::{row_value, QParams};
use super::quantizer::{QuantOptions, Quantizer};
use super::state::LayerStateMap;
use crate::error::{Error, Result};
use ndarray::{Array1, Array2, ArrayD, Axis, Zip};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

fn default_lp_norm() -> f32 {
    0.7
}

fn default_beta() -> f32 {
    10.0
}

fn default_kappa() -> f32 {
    1.01
}

fn default_iters() -> usize {
    20
}

fn default_axis() -> usize {
    1
}

/// HQQ options
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HqqConfig {
    /// Exponent of the sparsity-promoting norm (default 0.7)
    #[serde(default = "default_lp_norm")]
    pub lp_norm: f32,
    /// Initial penalty (default 10.0)
    #[serde(default = "default_beta")]
    pub beta: f32,
    /// Penalty growth per round (default 1.01)
    #[serde(default = "default_kappa")]
    pub kappa: f32,
    /// Maximum number of rounds (default 20)
    #[serde(default = "default_iters")]
    pub iters: usize,
    /// 1 quantizes along output channels, 0 along input channels (default 1)
    #[serde(default = "default_axis")]
    pub axis: usize,
}

impl Default for HqqConfig {
    fn default() -> Self {
        Self {
            lp_norm: default_lp_norm(),
            beta: default_beta(),
            kappa: default_kappa(),
            iters: default_iters(),
            axis: default_axis(),
        }
    }
}

impl HqqConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.lp_norm.is_finite() && self.lp_norm > 0.0) {
            return Err(Error::config(format!("hqq lp_norm must be > 0, got {}", self.lp_norm)));
        }
        if !(self.beta.is_finite() && self.beta > 0.0) {
            return Err(Error::config(format!("hqq beta must be > 0, got {}", self.beta)));
        }
        if !(self.kappa.is_finite() && self.kappa > 0.0) {
            return Err(Error::config(format!("hqq kappa must be > 0, got {}", self.kappa)));
        }
        if self.iters == 0 {
            return Err(Error::config("hqq iters must be > 0"));
        }
        if self.axis > 1 {
            return Err(Error::config(format!("hqq axis must be 0 or 1, got {}", self.axis)));
        }
        Ok(())
    }

    /// Whether the weight is transposed before quantization
    pub fn transpose(&self) -> bool {
        self.axis == 0
    }
}

/// Proximal shrinkage of a residual
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ShrinkOp {
    /// `sign(r) * relu(|r| - 1/beta)` (p = 1)
    SoftThreshold,
    /// `sign(r) * relu(|r| - |r|^(p-1) / beta)`
    Lp(f32),
}

impl ShrinkOp {
    pub fn for_norm(p: f32) -> Self {
        if p == 1.0 {
            ShrinkOp::SoftThreshold
        } else {
            ShrinkOp::Lp(p)
        }
    }

    #[inline]
    pub fn apply(&self, r: f32, beta: f32) -> f32 {
        let mag = r.abs();
        let shrunk = match self {
            ShrinkOp::SoftThreshold => mag - 1.0 / beta,
            ShrinkOp::Lp(p) => mag - mag.powf(p - 1.0) / beta,
        };
        // sign(0) == 0
        if r == 0.0 {
            0.0
        } else {
            r.signum() * shrunk.max(0.0)
        }
    }
}

/// Refined parameters persisted for a layer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HqqState {
    /// Min-max scales in their original orientation
    pub scales: Array1<f32>,
    /// Refined zero-points, one per row of the reshaped weight
    pub zeros: Array1<f32>,
    /// Upper code bound of the weight bit width
    pub max_int: i32,
    /// Lower code bound of the weight bit width
    pub min_int: i32,
    /// Quantize the transposed weight
    pub transpose: bool,
}

impl HqqState {
    pub fn qparams(&self) -> QParams {
        QParams {
            scales: self.scales.clone(),
            zeros: Some(self.zeros.clone()),
            max_int: self.max_int,
            min_int: self.min_int,
        }
    }
}

/// Outcome of one refinement
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HqqReport {
    /// Rounds executed, including a final non-improving round
    pub rounds: usize,
    /// Mean absolute error of the min-max parameters
    pub initial_error: f32,
    /// Errors of the accepted rounds, strictly decreasing
    pub errors: Vec<f32>,
    /// Stopped before `iters` because a round did not improve
    pub early_stopped: bool,
}

impl HqqReport {
    /// Error of the returned parameters
    pub fn final_error(&self) -> f32 {
        self.errors.last().copied().unwrap_or(self.initial_error)
    }
}

/// HQQ zero-point refiner bound to an asymmetric weight quantizer
#[derive(Clone, Debug)]
pub struct HqqRefiner {
    quantizer: Quantizer,
    /// Same spec with `round_zp` off, used to apply refined zero-points
    inference: Quantizer,
    config: HqqConfig,
    shrink: ShrinkOp,
}

impl HqqRefiner {
    pub fn new(quantizer: Quantizer, config: HqqConfig) -> Result<Self> {
        config.validate()?;
        if quantizer.is_symmetric() {
            return Err(Error::config("hqq refines zero-points and requires an asymmetric weight spec"));
        }
        let inference = Quantizer::new(quantizer.spec().clone().with_round_zp(false))?;
        Ok(Self {
            quantizer,
            inference,
            shrink: ShrinkOp::for_norm(config.lp_norm),
            config,
        })
    }

    pub fn config(&self) -> &HqqConfig {
        &self.config
    }

    pub fn quantizer(&self) -> &Quantizer {
        &self.quantizer
    }

    pub fn shrink(&self) -> ShrinkOp {
        self.shrink
    }

    /// Refine the zero-points of a `[out, in]` weight
    pub fn refine(&self, weight: &Array2<f32>) -> Result<(HqqState, HqqReport)> {
        let transpose = self.config.transpose();
        let oriented = if transpose {
            weight.t().to_owned()
        } else {
            weight.clone()
        };

        let tensor = self.quantizer.reshape_tensor(oriented.view())?;
        let range = minmax_range(&tensor, self.quantizer.granularity().is_per_tensor());
        let init = self.quantizer.get_qparams(&range)?;
        let rows = tensor.nrows();
        let init_zeros = init
            .zeros
            .as_ref()
            .ok_or_else(|| Error::config("hqq requires zero-points"))?;

        let inv_scales = init.scales.mapv(|s| 1.0 / s);
        let mut zeros = Array1::from_shape_fn(rows, |r| row_value(init_zeros, r));
        let lo = init.min_int as f32;
        let hi = init.max_int as f32;

        let mut beta = self.config.beta;
        let mut best_error = f32::INFINITY;
        let mut best_zeros = zeros.clone();
        let mut errors = Vec::new();
        let mut initial_error = f32::NAN;
        let mut rounds = 0;
        let mut early_stopped = false;

        for iter in 0..self.config.iters {
            rounds = iter + 1;
            let mut recon = Array2::<f32>::zeros(tensor.raw_dim());
            let mut next_zeros = Array1::<f32>::zeros(rows);

            for (r, (w, mut wr)) in tensor
                .axis_iter(Axis(0))
                .zip(recon.axis_iter_mut(Axis(0)))
                .enumerate()
            {
                let s = row_value(&inv_scales, r);
                let z = zeros[r];
                let mut acc = 0.0f32;
                Zip::from(&w).and(&mut wr).for_each(|&x, xr| {
                    let q = (x * s + z).round_ties_even().clamp(lo, hi);
                    *xr = (q - z) / s;
                    let e = self.shrink.apply(x - *xr, beta);
                    acc += q - (x - e) * s;
                });
                next_zeros[r] = if w.is_empty() { z } else { acc / w.len() as f32 };
            }

            let error = mean_abs_error(&tensor, &recon);
            if iter == 0 {
                initial_error = error;
            }
            debug!(iter, error, "hqq round");

            if error < best_error {
                best_error = error;
                best_zeros = zeros.clone();
                errors.push(error);
            } else {
                early_stopped = true;
                break;
            }

            zeros = next_zeros;
            beta *= self.config.kappa;
        }

        if errors.len() <= 1 {
            warn!(initial_error, "hqq refinement did not improve on min-max parameters");
        }

        let state = HqqState {
            scales: init.scales,
            zeros: best_zeros,
            max_int: init.max_int,
            min_int: init.min_int,
            transpose,
        };
        let report = HqqReport {
            rounds,
            initial_error,
            errors,
            early_stopped,
        };
        Ok((state, report))
    }

    /// Refine every layer of a block in order and record the results
    pub fn calibrate_block<'w, I, N>(&self, linears: I, states: &mut LayerStateMap) -> Result<Vec<(String, HqqReport)>>
    where
        I: IntoIterator<Item = (N, &'w Array2<f32>)>,
        N: AsRef<str>,
    {
        let mut reports = Vec::new();
        for (name, weight) in linears {
            let name = name.as_ref();
            info!(layer = name, shape = ?weight.shape(), "optimizing weights proximally");
            let (state, report) = self.refine(weight)?;
            if report.early_stopped {
                info!(layer = name, rounds = report.rounds, "hqq stopped early");
            }
            info!(
                layer = name,
                initial_error = report.initial_error,
                final_error = report.final_error(),
                "hqq layer refined"
            );
            states.set_hqq(name, state);
            reports.push((name.to_string(), report));
        }
        Ok(reports)
    }

    /// Weight hook: fake-quantize with the recorded parameters
    ///
    /// Zero-points are used unrounded, the rule `refine` measured its errors
    /// under, so the result matches [`HqqReport::final_error`].
    pub fn w_qdq(&self, layer: &str, weight: &Array2<f32>, states: &LayerStateMap) -> Result<Array2<f32>> {
        let state = states.hqq(layer)?;
        let opts = QuantOptions {
            transpose: state.transpose,
            ..QuantOptions::default()
        };
        self.inference
            .fake_quant_weight_static(weight, &state.qparams(), &opts)
    }
}

impl QdqHooks for HqqRefiner {
    /// Activations stay in full precision
    fn a_qdq(&self, _layer: &str, act: &ArrayD<f32>, _states: &mut LayerStateMap) -> Result<ArrayD<f32>> {
        Ok(act.clone())
    }

    fn w_qdq(&self, layer: &str, weight: &Array2<f32>, states: &LayerStateMap) -> Result<Array2<f32>> {
        HqqRefiner::w_qdq(self, layer, weight, states)
    }
}
