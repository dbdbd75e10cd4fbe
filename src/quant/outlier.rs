//! Outlier-aware mixed precision (LLM.int8 style)
//!
//! Feature channels whose peak magnitude reaches a threshold stay in full
//! precision; every other channel is fake-quantized. The activation hook
//! decides the split per call and records it for the layer so the paired
//! weight hook quantizes the matching weight columns.

use super::linear::QdqHooks;
use super::quantizer::{QuantOptions, Quantizer};
use super::state::LayerStateMap;
use crate::error::{Error, Result};
use ndarray::{Array2, ArrayD, Axis};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Partition of `0..width` into quantized and full-precision channels
///
/// Both index lists are sorted, disjoint and together cover every channel
/// exactly once.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "MaskRepr", into = "MaskRepr")]
pub struct OutlierMask {
    int_indices: Vec<usize>,
    fp_indices: Vec<usize>,
    width: usize,
}

#[derive(Clone, Serialize, Deserialize)]
struct MaskRepr {
    int_indices: Vec<usize>,
    fp_indices: Vec<usize>,
    width: usize,
}

impl TryFrom<MaskRepr> for OutlierMask {
    type Error = Error;

    fn try_from(repr: MaskRepr) -> Result<Self> {
        OutlierMask::new(repr.int_indices, repr.fp_indices, repr.width)
    }
}

impl From<OutlierMask> for MaskRepr {
    fn from(mask: OutlierMask) -> Self {
        MaskRepr {
            int_indices: mask.int_indices,
            fp_indices: mask.fp_indices,
            width: mask.width,
        }
    }
}

impl OutlierMask {
    /// Build a mask from both index lists, checking they partition `0..width`
    pub fn new(mut int_indices: Vec<usize>, mut fp_indices: Vec<usize>, width: usize) -> Result<Self> {
        let mut seen = vec![false; width];
        for &idx in int_indices.iter().chain(fp_indices.iter()) {
            match seen.get_mut(idx) {
                Some(slot) if !*slot => *slot = true,
                Some(_) => {
                    return Err(Error::config(format!("channel {idx} appears twice in outlier mask")))
                }
                None => {
                    return Err(Error::config(format!(
                        "channel {idx} out of range for width {width}"
                    )))
                }
            }
        }
        if seen.iter().any(|s| !s) {
            return Err(Error::config(format!(
                "outlier mask does not cover all {width} channels"
            )));
        }
        int_indices.sort_unstable();
        fp_indices.sort_unstable();
        Ok(Self {
            int_indices,
            fp_indices,
            width,
        })
    }

    /// Mask whose int channels are the complement of `fp_indices`
    ///
    /// Duplicates in `fp_indices` are ignored.
    pub fn from_fp_indices(mut fp_indices: Vec<usize>, width: usize) -> Result<Self> {
        fp_indices.sort_unstable();
        fp_indices.dedup();
        if let Some(&idx) = fp_indices.last() {
            if idx >= width {
                return Err(Error::config(format!(
                    "channel {idx} out of range for width {width}"
                )));
            }
        }
        let mut is_fp = vec![false; width];
        for &idx in &fp_indices {
            is_fp[idx] = true;
        }
        let int_indices = (0..width).filter(|&i| !is_fp[i]).collect();
        Ok(Self {
            int_indices,
            fp_indices,
            width,
        })
    }

    /// Every channel quantized
    pub fn all_int(width: usize) -> Self {
        Self {
            int_indices: (0..width).collect(),
            fp_indices: Vec::new(),
            width,
        }
    }

    pub fn int_indices(&self) -> &[usize] {
        &self.int_indices
    }

    pub fn fp_indices(&self) -> &[usize] {
        &self.fp_indices
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn num_outliers(&self) -> usize {
        self.fp_indices.len()
    }

    /// Fail unless the mask was built for `width` channels
    pub fn check_width(&self, width: usize) -> Result<()> {
        if width == self.width {
            Ok(())
        } else {
            Err(Error::ShapeMismatch {
                expected: vec![self.width],
                got: vec![width],
            })
        }
    }
}

fn default_threshold() -> f32 {
    6.0
}

/// Outlier split options
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutlierConfig {
    /// Channels with `max |x| >= threshold` stay in full precision (default 6.0)
    #[serde(default = "default_threshold")]
    pub threshold: f32,
}

impl Default for OutlierConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
        }
    }
}

/// Threshold-based mixed-precision quantization of a linear layer
#[derive(Clone, Debug)]
pub struct OutlierSplitter {
    weight_quantizer: Quantizer,
    act_quantizer: Quantizer,
    threshold: f32,
}

impl OutlierSplitter {
    pub fn new(weight_quantizer: Quantizer, act_quantizer: Quantizer, config: &OutlierConfig) -> Result<Self> {
        if !(config.threshold.is_finite() && config.threshold > 0.0) {
            return Err(Error::config(format!(
                "outlier threshold must be > 0, got {}",
                config.threshold
            )));
        }
        Ok(Self {
            weight_quantizer,
            act_quantizer,
            threshold: config.threshold,
        })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn weight_quantizer(&self) -> &Quantizer {
        &self.weight_quantizer
    }

    pub fn act_quantizer(&self) -> &Quantizer {
        &self.act_quantizer
    }

    /// Split the last-axis channels of `act` by their peak magnitude
    pub fn get_outlier_indices(&self, act: &ArrayD<f32>) -> Result<OutlierMask> {
        outlier_mask(act, self.threshold)
    }

    /// Activation hook: fresh split, quantize the int channels, record the mask
    pub fn a_qdq(&self, layer: &str, act: &ArrayD<f32>, states: &mut LayerStateMap) -> Result<ArrayD<f32>> {
        let mask = self.get_outlier_indices(act)?;
        debug!(
            layer,
            outliers = mask.num_outliers(),
            channels = mask.width(),
            "outlier split"
        );
        let out = self
            .act_quantizer
            .fake_quant_act_dynamic(act, &QuantOptions::default().with_mask(&mask))?;
        states.set_outlier_mask(layer, mask);
        Ok(out)
    }

    /// Weight hook: quantize the columns the last activation split kept as int
    pub fn w_qdq(&self, layer: &str, weight: &Array2<f32>, states: &LayerStateMap) -> Result<Array2<f32>> {
        let mask = states.outlier_mask(layer)?;
        self.weight_quantizer
            .fake_quant_weight_dynamic(weight, &QuantOptions::default().with_mask(mask))
    }
}

impl QdqHooks for OutlierSplitter {
    fn a_qdq(&self, layer: &str, act: &ArrayD<f32>, states: &mut LayerStateMap) -> Result<ArrayD<f32>> {
        OutlierSplitter::a_qdq(self, layer, act, states)
    }

    fn w_qdq(&self, layer: &str, weight: &Array2<f32>, states: &LayerStateMap) -> Result<Array2<f32>> {
        OutlierSplitter::w_qdq(self, layer, weight, states)
    }
}

/// Channels of the last axis whose `max |x|` over every other axis reaches `threshold`
pub fn outlier_mask(act: &ArrayD<f32>, threshold: f32) -> Result<OutlierMask> {
    if act.ndim() == 0 {
        return Err(Error::ShapeMismatch {
            expected: vec![1],
            got: vec![],
        });
    }
    let axis = Axis(act.ndim() - 1);
    let width = act.len_of(axis);
    let fp_indices = (0..width)
        .filter(|&c| {
            let peak = act
                .index_axis(axis, c)
                .fold(0.0f32, |m, v| m.max(v.abs()));
            peak >= threshold
        })
        .collect();
    OutlierMask::from_fp_indices(fp_indices, width)
}
