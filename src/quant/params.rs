//! Quantization parameters and quantized containers
//!
//! Ranges and parameters are stored as 1-D arrays that are either of length
//! one (a scalar shared by every row) or of length `rows` (one entry per row
//! of the reshaped 2-D tensor).

use super::spec::IntBounds;
use crate::error::{Error, Result};
use ndarray::{Array1, Array2, ArrayD};
use serde::{Deserialize, Serialize};

/// Lower bound applied to the numerator of every scale computation
pub const SCALE_CLAMP_MIN: f32 = 1e-5;

/// Value of a per-row (or scalar) array at `row`
#[inline]
pub(crate) fn row_value(values: &Array1<f32>, row: usize) -> f32 {
    if values.len() == 1 {
        values[0]
    } else {
        values[row]
    }
}

fn check_row_len(len: usize, rows: usize) -> Result<()> {
    if len == 1 || len == rows {
        Ok(())
    } else {
        Err(Error::ShapeMismatch {
            expected: vec![rows],
            got: vec![len],
        })
    }
}

/// Observed (or calibrated) value range
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TensorRange {
    pub min: Array1<f32>,
    pub max: Array1<f32>,
}

impl TensorRange {
    /// Scalar range shared by the whole tensor
    pub fn scalar(min: f32, max: f32) -> Self {
        Self {
            min: Array1::from_elem(1, min),
            max: Array1::from_elem(1, max),
        }
    }

    /// Per-row range
    pub fn per_row(min: Array1<f32>, max: Array1<f32>) -> Result<Self> {
        if min.len() != max.len() {
            return Err(Error::ShapeMismatch {
                expected: vec![min.len()],
                got: vec![max.len()],
            });
        }
        Ok(Self { min, max })
    }

    /// Number of entries (1 for a scalar range)
    pub fn len(&self) -> usize {
        self.min.len()
    }

    pub fn is_empty(&self) -> bool {
        self.min.is_empty()
    }

    /// Range with both sides multiplied by `p`
    pub fn shrunk(&self, p: f32) -> Self {
        Self {
            min: self.min.mapv(|v| v * p),
            max: self.max.mapv(|v| v * p),
        }
    }
}

/// Affine quantization parameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QParams {
    /// Strictly positive scale(s)
    pub scales: Array1<f32>,
    /// Zero-point(s); `None` for symmetric quantization
    pub zeros: Option<Array1<f32>>,
    pub max_int: i32,
    pub min_int: i32,
}

impl QParams {
    /// Integer code range of these parameters
    pub fn bounds(&self) -> IntBounds {
        IntBounds {
            max_int: self.max_int,
            min_int: self.min_int,
        }
    }

    /// Same scales/zeros clamped to other bounds
    pub fn with_bounds(mut self, bounds: IntBounds) -> Self {
        self.max_int = bounds.max_int;
        self.min_int = bounds.min_int;
        self
    }

    #[inline]
    pub fn scale_at(&self, row: usize) -> f32 {
        row_value(&self.scales, row)
    }

    #[inline]
    pub fn zero_at(&self, row: usize) -> Option<f32> {
        self.zeros.as_ref().map(|z| row_value(z, row))
    }

    /// Check that the parameters broadcast over `rows` rows
    pub fn check_rows(&self, rows: usize) -> Result<()> {
        check_row_len(self.scales.len(), rows)?;
        if let Some(zeros) = &self.zeros {
            check_row_len(zeros.len(), rows)?;
        }
        Ok(())
    }
}

/// Integer codes of a reshaped tensor, tagged with what is needed to invert it
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuantizedTensor {
    /// Integer-valued codes in `[min_int, max_int]`, in the reshaped 2-D layout
    pub codes: Array2<f32>,
    /// Parameters used to produce the codes
    pub params: QParams,
    /// Original tensor shape
    pub shape: Vec<usize>,
}

impl QuantizedTensor {
    pub fn num_elements(&self) -> usize {
        self.codes.len()
    }
}

/// Narrow integer container for packed storage
#[derive(Clone, Debug, PartialEq)]
pub enum PackedInts {
    I8(ArrayD<i8>),
    U8(ArrayD<u8>),
    I32(ArrayD<i32>),
}

impl PackedInts {
    /// Cast integer-valued floats into the container chosen for `(bit, symmetric)`
    ///
    /// 8-bit codes go to `i8`/`u8`; every other width uses `i32`.
    pub fn pack(values: &ArrayD<f32>, bit: u32, symmetric: bool) -> Self {
        match (bit, symmetric) {
            (8, true) => PackedInts::I8(values.mapv(|v| v as i8)),
            (8, false) => PackedInts::U8(values.mapv(|v| v as u8)),
            _ => PackedInts::I32(values.mapv(|v| v as i32)),
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            PackedInts::I8(a) => a.shape(),
            PackedInts::U8(a) => a.shape(),
            PackedInts::I32(a) => a.shape(),
        }
    }

    /// Container element name
    pub fn dtype(&self) -> &'static str {
        match self {
            PackedInts::I8(_) => "i8",
            PackedInts::U8(_) => "u8",
            PackedInts::I32(_) => "i32",
        }
    }

    pub fn to_f32(&self) -> ArrayD<f32> {
        match self {
            PackedInts::I8(a) => a.mapv(f32::from),
            PackedInts::U8(a) => a.mapv(f32::from),
            PackedInts::I32(a) => a.mapv(|v| v as f32),
        }
    }
}

/// Zero-points of a real-quantized tensor
#[derive(Clone, Debug, PartialEq)]
pub enum PackedZeros {
    /// Rounded zero-points stored in the weight's container
    Int(PackedInts),
    /// Fractional zero-points (round_zp disabled)
    Float(Array1<f32>),
}

/// Output of the real (packed) quantization entry points
#[derive(Clone, Debug, PartialEq)]
pub struct RealQuantized {
    /// Integer codes in the original tensor shape
    pub weight: PackedInts,
    pub scales: Array1<f32>,
    pub zeros: Option<PackedZeros>,
}
