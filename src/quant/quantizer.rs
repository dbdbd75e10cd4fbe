//! Affine quantizer
//!
//! Provides the quantize/dequantize primitives and the entry points built
//! on top of them:
//! - `quant`: `round(x / scale) [+ zero]`, clamped to `[min_int, max_int]`
//! - `dequant`: `(q - zero) * scale` or `q * scale`
//! - `reshape_tensor` / `restore_tensor`: grouped 2-D view and its exact inverse
//! - fake quantization of weights and activations (static or dynamic
//!   parameters, optional mixed precision, transient bit override)
//! - real quantization of weights into a narrow integer container
//!
//! All rounding is round-half-to-even.

use super::calibration::{CalibArgs, RangeCalibrator};
use super::outlier::OutlierMask;
use super::params::{
    PackedInts, PackedZeros, QParams, QuantizedTensor, RealQuantized, TensorRange,
    SCALE_CLAMP_MIN,
};
use super::spec::{Granularity, IntBounds, QuantizationSpec};
use crate::error::{Error, Result};
use ndarray::{Array2, ArrayD, ArrayView, Axis, Dimension, Ix2, IxDyn, Zip};
use std::borrow::Cow;

/// Scale floor used by the unrounded zero-point branch of `quant`
pub const UNROUNDED_ZP_SCALE_FLOOR: f32 = 1e-9;

/// Per-call options shared by the fake quantization entry points
#[derive(Clone, Copy, Debug, Default)]
pub struct QuantOptions<'a> {
    /// Quantize only `int_indices` along the feature axis, pass `fp_indices` through
    pub mask: Option<&'a OutlierMask>,
    /// Transient bit width for this call only
    pub current_bit: Option<u32>,
    /// Quantize the transposed weight (input-channel axis); ignored with a mask
    pub transpose: bool,
    /// Calibration arguments for dynamic parameters
    pub calib: CalibArgs<'a>,
}

impl<'a> QuantOptions<'a> {
    pub fn with_mask(mut self, mask: &'a OutlierMask) -> Self {
        self.mask = Some(mask);
        self
    }

    pub fn with_bit(mut self, bit: u32) -> Self {
        self.current_bit = Some(bit);
        self
    }

    pub fn transposed(mut self) -> Self {
        self.transpose = true;
        self
    }

    pub fn with_calib(mut self, calib: CalibArgs<'a>) -> Self {
        self.calib = calib;
        self
    }
}

/// Affine quantizer bound to one validated [`QuantizationSpec`]
#[derive(Clone, Debug)]
pub struct Quantizer {
    spec: QuantizationSpec,
    granularity: Granularity,
    bounds: IntBounds,
}

impl Quantizer {
    /// Validate the spec and build a quantizer
    pub fn new(spec: QuantizationSpec) -> Result<Self> {
        spec.validate()?;
        let granularity = spec.granularity()?;
        let bounds = spec.bounds();
        Ok(Self {
            spec,
            granularity,
            bounds,
        })
    }

    pub fn spec(&self) -> &QuantizationSpec {
        &self.spec
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn bounds(&self) -> IntBounds {
        self.bounds
    }

    pub fn bit(&self) -> u32 {
        self.spec.bit
    }

    pub fn is_symmetric(&self) -> bool {
        self.spec.symmetric
    }

    /// Quantizer for a transient bit width, leaving `self` untouched
    fn at_bit(&self, current_bit: Option<u32>) -> Result<Cow<'_, Quantizer>> {
        match current_bit {
            Some(bit) if bit != self.spec.bit => {
                let mut spec = self.spec.clone();
                spec.bit = bit;
                Ok(Cow::Owned(Quantizer::new(spec)?))
            }
            _ => Ok(Cow::Borrowed(self)),
        }
    }

    // ------------------------------------------------------------------
    // Parameters
    // ------------------------------------------------------------------

    /// Scale and zero-point for a range
    ///
    /// Symmetric: `scale = max(|min|, |max|) / max_int`, no zero-point.
    /// Asymmetric: `scale = (max - min) / max_int`, `zero = round(-min / scale)`
    /// clamped to the code range, or the raw `-min / scale` when `round_zp`
    /// is disabled. The range numerator is clamped to [`SCALE_CLAMP_MIN`].
    pub fn get_qparams(&self, range: &TensorRange) -> Result<QParams> {
        if range.min.len() != range.max.len() {
            return Err(Error::ShapeMismatch {
                expected: vec![range.min.len()],
                got: vec![range.max.len()],
            });
        }
        let IntBounds { max_int, min_int } = self.bounds;
        let qmax = max_int as f32;

        if self.spec.symmetric {
            let scales = Zip::from(&range.min)
                .and(&range.max)
                .map_collect(|&lo, &hi| lo.abs().max(hi.abs()).max(SCALE_CLAMP_MIN) / qmax);
            return Ok(QParams {
                scales,
                zeros: None,
                max_int,
                min_int,
            });
        }

        let scales = Zip::from(&range.min)
            .and(&range.max)
            .map_collect(|&lo, &hi| (hi - lo).max(SCALE_CLAMP_MIN) / qmax);
        let round_zp = self.spec.round_zp;
        let zeros = Zip::from(&range.min).and(&scales).map_collect(|&lo, &scale| {
            if round_zp {
                (-lo / scale).round_ties_even().clamp(min_int as f32, qmax)
            } else {
                -lo / scale
            }
        });

        Ok(QParams {
            scales,
            zeros: Some(zeros),
            max_int,
            min_int,
        })
    }

    /// Calibrated range of a reshaped tensor
    pub fn get_tensor_range(&self, tensor: &Array2<f32>, args: &CalibArgs<'_>) -> Result<TensorRange> {
        RangeCalibrator::select(self.spec.calib_algo, &self.spec.calib_args, args)
            .calibrate(self, tensor)
    }

    /// Reshape a tensor and compute its parameters from its own values
    pub fn get_tensor_qparams<D: Dimension>(
        &self,
        tensor: ArrayView<'_, f32, D>,
        args: &CalibArgs<'_>,
    ) -> Result<(Array2<f32>, QParams)> {
        let reshaped = self.reshape_tensor(tensor)?;
        let range = self.get_tensor_range(&reshaped, args)?;
        let params = self.get_qparams(&range)?;
        Ok((reshaped, params))
    }

    // ------------------------------------------------------------------
    // Primitives
    // ------------------------------------------------------------------

    /// Integer codes (as integer-valued floats) clamped to `[min_int, max_int]`
    ///
    /// Three distinct policies: no zero-point, rounded zero-point (round then
    /// add), unrounded zero-point (add to the floored quotient, then round).
    pub fn quant(&self, tensor: &Array2<f32>, params: &QParams) -> Result<Array2<f32>> {
        params.check_rows(tensor.nrows())?;
        let lo = params.min_int as f32;
        let hi = params.max_int as f32;
        let round_zp = self.spec.round_zp;

        let mut out = tensor.to_owned();
        for (r, mut row) in out.axis_iter_mut(Axis(0)).enumerate() {
            let scale = params.scale_at(r);
            match params.zero_at(r) {
                None => row.mapv_inplace(|x| (x / scale).round_ties_even().clamp(lo, hi)),
                Some(zero) if round_zp => {
                    row.mapv_inplace(|x| ((x / scale).round_ties_even() + zero).clamp(lo, hi))
                }
                Some(zero) => {
                    let scale = scale.max(UNROUNDED_ZP_SCALE_FLOOR);
                    row.mapv_inplace(|x| (x / scale + zero).round_ties_even().clamp(lo, hi))
                }
            }
        }
        Ok(out)
    }

    /// Map codes back to real values
    pub fn dequant(&self, tensor: &Array2<f32>, params: &QParams) -> Result<Array2<f32>> {
        params.check_rows(tensor.nrows())?;
        let mut out = tensor.to_owned();
        for (r, mut row) in out.axis_iter_mut(Axis(0)).enumerate() {
            let scale = params.scale_at(r);
            match params.zero_at(r) {
                None => row.mapv_inplace(|q| q * scale),
                Some(zero) => row.mapv_inplace(|q| (q - zero) * scale),
            }
        }
        Ok(out)
    }

    /// Fake quantization: `dequant(quant(x))`
    pub fn quant_dequant(&self, tensor: &Array2<f32>, params: &QParams) -> Result<Array2<f32>> {
        let codes = self.quant(tensor, params)?;
        self.dequant(&codes, params)
    }

    // ------------------------------------------------------------------
    // Reshape
    // ------------------------------------------------------------------

    /// 2-D view whose rows each share one scale/zero-point
    ///
    /// - per_tensor / per_channel: leading dims flattened, last dim kept
    /// - per_group: rows of exactly `group_size` values; the last dim must be
    ///   a multiple of `group_size`
    /// - per_head: `head_num` rows; the element count must be a multiple of it
    pub fn reshape_tensor<D: Dimension>(&self, tensor: ArrayView<'_, f32, D>) -> Result<Array2<f32>> {
        let shape = tensor.shape();
        let len = tensor.len();
        let (rows, cols) = match self.granularity {
            Granularity::PerTensor | Granularity::PerChannel => natural_dims(shape),
            Granularity::PerGroup(group_size) => {
                let (_, last) = natural_dims(shape);
                if last % group_size != 0 {
                    return Err(Error::config(format!(
                        "row length {last} is not a multiple of group_size {group_size}"
                    )));
                }
                (len / group_size, group_size)
            }
            Granularity::PerHead(head_num) => {
                if len % head_num != 0 {
                    return Err(Error::config(format!(
                        "{len} elements cannot be split into {head_num} heads"
                    )));
                }
                (head_num, len / head_num)
            }
        };

        Array2::from_shape_vec((rows, cols), tensor.iter().copied().collect()).map_err(|_| {
            Error::ShapeMismatch {
                expected: vec![rows, cols],
                got: shape.to_vec(),
            }
        })
    }

    /// Exact inverse of [`Quantizer::reshape_tensor`]
    pub fn restore_tensor(&self, tensor: &Array2<f32>, shape: &[usize]) -> Result<ArrayD<f32>> {
        let expected: usize = shape.iter().product();
        if tensor.len() != expected {
            return Err(Error::ShapeMismatch {
                expected: shape.to_vec(),
                got: tensor.shape().to_vec(),
            });
        }
        ArrayD::from_shape_vec(IxDyn(shape), tensor.iter().copied().collect()).map_err(|_| {
            Error::ShapeMismatch {
                expected: shape.to_vec(),
                got: tensor.shape().to_vec(),
            }
        })
    }

    // ------------------------------------------------------------------
    // Fake quantization entry points
    // ------------------------------------------------------------------

    /// Fake-quantize an activation with externally supplied parameters
    pub fn fake_quant_act_static(
        &self,
        act: &ArrayD<f32>,
        params: &QParams,
        opts: &QuantOptions<'_>,
    ) -> Result<ArrayD<f32>> {
        let q = self.at_bit(opts.current_bit)?;
        let params = transient_params(params, &q, opts.current_bit);
        let last = Axis(act.ndim().saturating_sub(1));
        apply_masked(act, last, opts.mask, |sub| q.qdq_static(sub, &params))
    }

    /// Fake-quantize an activation with parameters computed from itself
    pub fn fake_quant_act_dynamic(
        &self,
        act: &ArrayD<f32>,
        opts: &QuantOptions<'_>,
    ) -> Result<ArrayD<f32>> {
        let q = self.at_bit(opts.current_bit)?;
        let last = Axis(act.ndim().saturating_sub(1));
        apply_masked(act, last, opts.mask, |sub| q.qdq_dynamic(sub, &opts.calib))
    }

    /// Fake-quantize a `[out, in]` weight with externally supplied parameters
    pub fn fake_quant_weight_static(
        &self,
        weight: &Array2<f32>,
        params: &QParams,
        opts: &QuantOptions<'_>,
    ) -> Result<Array2<f32>> {
        let q = self.at_bit(opts.current_bit)?;
        let params = transient_params(params, &q, opts.current_bit);
        q.weight_path(weight, opts, |sub| q.qdq_static(sub, &params))
    }

    /// Fake-quantize a `[out, in]` weight with parameters computed from itself
    pub fn fake_quant_weight_dynamic(
        &self,
        weight: &Array2<f32>,
        opts: &QuantOptions<'_>,
    ) -> Result<Array2<f32>> {
        let q = self.at_bit(opts.current_bit)?;
        q.weight_path(weight, opts, |sub| q.qdq_dynamic(sub, &opts.calib))
    }

    // ------------------------------------------------------------------
    // Real quantization entry points
    // ------------------------------------------------------------------

    /// Integer codes of a weight for externally supplied parameters
    pub fn real_quant_weight_static(
        &self,
        weight: &Array2<f32>,
        params: &QParams,
    ) -> Result<RealQuantized> {
        let reshaped = self.reshape_tensor(weight.view())?;
        let codes = self.quant(&reshaped, params)?;
        let codes = self.restore_tensor(&codes, weight.shape())?;
        Ok(self.pack(&codes, params))
    }

    /// Integer codes of a weight with parameters computed from itself
    pub fn real_quant_weight_dynamic(
        &self,
        weight: &Array2<f32>,
        args: &CalibArgs<'_>,
    ) -> Result<RealQuantized> {
        let (reshaped, params) = self.get_tensor_qparams(weight.view(), args)?;
        let codes = self.quant(&reshaped, &params)?;
        let codes = self.restore_tensor(&codes, weight.shape())?;
        Ok(self.pack(&codes, &params))
    }

    /// Quantize any tensor into codes tagged with parameters and shape
    pub fn quantize_tensor<D: Dimension>(
        &self,
        tensor: ArrayView<'_, f32, D>,
        args: &CalibArgs<'_>,
    ) -> Result<QuantizedTensor> {
        let shape = tensor.shape().to_vec();
        let (reshaped, params) = self.get_tensor_qparams(tensor, args)?;
        let codes = self.quant(&reshaped, &params)?;
        Ok(QuantizedTensor {
            codes,
            params,
            shape,
        })
    }

    /// Dequantize codes back into the original shape
    pub fn dequantize_tensor(&self, quantized: &QuantizedTensor) -> Result<ArrayD<f32>> {
        let values = self.dequant(&quantized.codes, &quantized.params)?;
        self.restore_tensor(&values, &quantized.shape)
    }

    /// Gradient of the rounding step
    ///
    /// With STE the gradient passes through unchanged; without it the
    /// derivative of `round` is zero almost everywhere.
    pub fn ste_backward(&self, grad_output: &ArrayD<f32>) -> ArrayD<f32> {
        if self.spec.ste {
            grad_output.clone()
        } else {
            ArrayD::zeros(grad_output.raw_dim())
        }
    }

    // ------------------------------------------------------------------
    // Internal
    // ------------------------------------------------------------------

    fn qdq_static(&self, tensor: &ArrayD<f32>, params: &QParams) -> Result<ArrayD<f32>> {
        let reshaped = self.reshape_tensor(tensor.view())?;
        let out = self.quant_dequant(&reshaped, params)?;
        self.restore_tensor(&out, tensor.shape())
    }

    fn qdq_dynamic(&self, tensor: &ArrayD<f32>, args: &CalibArgs<'_>) -> Result<ArrayD<f32>> {
        let (reshaped, params) = self.get_tensor_qparams(tensor.view(), args)?;
        let out = self.quant_dequant(&reshaped, &params)?;
        self.restore_tensor(&out, tensor.shape())
    }

    fn weight_path<F>(&self, weight: &Array2<f32>, opts: &QuantOptions<'_>, qdq: F) -> Result<Array2<f32>>
    where
        F: FnOnce(&ArrayD<f32>) -> Result<ArrayD<f32>>,
    {
        if let Some(mask) = opts.mask {
            if let Granularity::PerGroup(group_size) = self.granularity {
                if mask.int_indices().len() % group_size != 0 {
                    return Err(Error::config(format!(
                        "{} quantized columns are not a multiple of group_size {group_size}",
                        mask.int_indices().len()
                    )));
                }
            }
            let mixed = apply_masked(&weight.clone().into_dyn(), Axis(1), Some(mask), qdq)?;
            return into_2d(mixed);
        }

        if opts.transpose {
            let out = into_2d(qdq(&weight.t().to_owned().into_dyn())?)?;
            Ok(out.reversed_axes())
        } else {
            into_2d(qdq(&weight.clone().into_dyn())?)
        }
    }

    fn pack(&self, codes: &ArrayD<f32>, params: &QParams) -> RealQuantized {
        let bit = self.spec.bit;
        let symmetric = self.spec.symmetric;
        let zeros = params.zeros.as_ref().map(|z| {
            if self.spec.round_zp {
                PackedZeros::Int(PackedInts::pack(&z.clone().into_dyn(), bit, symmetric))
            } else {
                PackedZeros::Float(z.clone())
            }
        });
        RealQuantized {
            weight: PackedInts::pack(codes, bit, symmetric),
            scales: params.scales.clone(),
            zeros,
        }
    }
}

/// `(rows, cols)` of the natural 2-D view: leading dims flattened, last kept
fn natural_dims(shape: &[usize]) -> (usize, usize) {
    match shape.split_last() {
        Some((&last, leading)) => (leading.iter().product(), last),
        None => (1, 1),
    }
}

/// Static parameters re-bounded to a transient bit width
fn transient_params<'p>(
    params: &'p QParams,
    quantizer: &Quantizer,
    current_bit: Option<u32>,
) -> Cow<'p, QParams> {
    match current_bit {
        Some(_) => Cow::Owned(params.clone().with_bounds(quantizer.bounds())),
        None => Cow::Borrowed(params),
    }
}

fn into_2d(tensor: ArrayD<f32>) -> Result<Array2<f32>> {
    let got = tensor.shape().to_vec();
    tensor
        .into_dimensionality::<Ix2>()
        .map_err(|_| Error::ShapeMismatch {
            expected: vec![0, 0],
            got,
        })
}

/// Copy the `indices` slices of `tensor` along `axis`
pub(crate) fn gather(tensor: &ArrayD<f32>, axis: Axis, indices: &[usize]) -> ArrayD<f32> {
    let mut shape = tensor.shape().to_vec();
    shape[axis.index()] = indices.len();
    let mut out = ArrayD::zeros(IxDyn(&shape));
    for (k, &idx) in indices.iter().enumerate() {
        out.index_axis_mut(axis, k).assign(&tensor.index_axis(axis, idx));
    }
    out
}

/// Run `qdq` on the masked subset only and recombine into a full-size tensor
fn apply_masked<F>(
    tensor: &ArrayD<f32>,
    axis: Axis,
    mask: Option<&OutlierMask>,
    qdq: F,
) -> Result<ArrayD<f32>>
where
    F: FnOnce(&ArrayD<f32>) -> Result<ArrayD<f32>>,
{
    let Some(mask) = mask else {
        return qdq(tensor);
    };
    if tensor.ndim() == 0 {
        return Err(Error::ShapeMismatch {
            expected: vec![mask.width()],
            got: vec![],
        });
    }
    mask.check_width(tensor.len_of(axis))?;

    let subset = gather(tensor, axis, mask.int_indices());
    if subset.is_empty() {
        return Ok(tensor.clone());
    }
    let quantized = qdq(&subset)?;

    // fp columns are already in place
    let mut mixed = tensor.clone();
    for (k, &idx) in mask.int_indices().iter().enumerate() {
        mixed
            .index_axis_mut(axis, idx)
            .assign(&quantized.index_axis(axis, k));
    }
    Ok(mixed)
}
