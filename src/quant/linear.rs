//! Fake-quantized linear layer
//!
//! Deployment wrapper that replaces a linear layer's forward pass with
//! `a_qdq(x)` then `w_qdq(W)` followed by `y = x · Wᵀ + b`. The hooks are
//! supplied by a quantization method through [`QdqHooks`].

use super::quantizer::{QuantOptions, Quantizer};
use super::state::LayerStateMap;
use crate::error::{Error, Result};
use ndarray::{Array1, Array2, ArrayD, Axis, IxDyn};

/// Inference-time quantization hooks of a method
pub trait QdqHooks {
    /// Fake-quantize an activation entering `layer`; may record state for it
    fn a_qdq(&self, layer: &str, act: &ArrayD<f32>, states: &mut LayerStateMap) -> Result<ArrayD<f32>>;

    /// Fake-quantize the `[out, in]` weight of `layer`
    fn w_qdq(&self, layer: &str, weight: &Array2<f32>, states: &LayerStateMap) -> Result<Array2<f32>>;
}

/// Round-to-nearest hooks: dynamic fake quantization of weights and,
/// optionally, activations
#[derive(Clone, Debug)]
pub struct RtnHooks {
    weight: Quantizer,
    act: Option<Quantizer>,
}

impl RtnHooks {
    pub fn new(weight: Quantizer, act: Option<Quantizer>) -> Self {
        Self { weight, act }
    }
}

impl QdqHooks for RtnHooks {
    fn a_qdq(&self, _layer: &str, act: &ArrayD<f32>, _states: &mut LayerStateMap) -> Result<ArrayD<f32>> {
        match &self.act {
            Some(q) => q.fake_quant_act_dynamic(act, &QuantOptions::default()),
            None => Ok(act.clone()),
        }
    }

    fn w_qdq(&self, _layer: &str, weight: &Array2<f32>, _states: &LayerStateMap) -> Result<Array2<f32>> {
        self.weight
            .fake_quant_weight_dynamic(weight, &QuantOptions::default())
    }
}

/// Linear layer whose forward pass goes through [`QdqHooks`]
#[derive(Clone, Debug)]
pub struct FakeQuantLinear {
    name: String,
    /// Weight `[out_features, in_features]`
    weight: Array2<f32>,
    bias: Option<Array1<f32>>,
}

impl FakeQuantLinear {
    pub fn new(name: impl Into<String>, weight: Array2<f32>, bias: Option<Array1<f32>>) -> Result<Self> {
        if let Some(b) = &bias {
            if b.len() != weight.nrows() {
                return Err(Error::ShapeMismatch {
                    expected: vec![weight.nrows()],
                    got: vec![b.len()],
                });
            }
        }
        Ok(Self {
            name: name.into(),
            weight,
            bias,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn weight(&self) -> &Array2<f32> {
        &self.weight
    }

    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    /// Quantized forward pass over the last axis of `x`
    pub fn forward(&self, x: &ArrayD<f32>, hooks: &dyn QdqHooks, states: &mut LayerStateMap) -> Result<ArrayD<f32>> {
        self.check_input(x)?;
        let xq = hooks.a_qdq(&self.name, x, states)?;
        let wq = hooks.w_qdq(&self.name, &self.weight, states)?;
        self.affine(&xq, &wq)
    }

    /// Full-precision forward pass
    pub fn forward_float(&self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        self.check_input(x)?;
        self.affine(x, &self.weight)
    }

    fn check_input(&self, x: &ArrayD<f32>) -> Result<()> {
        let width = x.shape().last().copied().unwrap_or(0);
        if x.ndim() == 0 || width != self.in_features() {
            return Err(Error::ShapeMismatch {
                expected: vec![self.in_features()],
                got: x.shape().to_vec(),
            });
        }
        Ok(())
    }

    fn affine(&self, x: &ArrayD<f32>, weight: &Array2<f32>) -> Result<ArrayD<f32>> {
        let in_features = weight.ncols();
        let rows = x.len() / in_features.max(1);
        let flat = Array2::from_shape_vec((rows, in_features), x.iter().copied().collect()).map_err(|_| {
            Error::ShapeMismatch {
                expected: vec![rows, in_features],
                got: x.shape().to_vec(),
            }
        })?;

        let mut y = flat.dot(&weight.t());
        if let Some(b) = &self.bias {
            y += &b.view().insert_axis(Axis(0));
        }

        let mut shape = x.shape().to_vec();
        if let Some(last) = shape.last_mut() {
            *last = weight.nrows();
        }
        ArrayD::from_shape_vec(IxDyn(&shape), y.iter().copied().collect()).map_err(|_| {
            Error::ShapeMismatch {
                expected: shape.clone(),
                got: y.shape().to_vec(),
            }
        })
    }
}
