//! Quantization specification
//!
//! A [`QuantizationSpec`] is built once by the driver (usually from YAML) and
//! shared read-only by every quantizer call. The integer code range is never
//! configured directly: it is always derived from `(bit, symmetric)`.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Smallest supported bit width
pub const MIN_BITS: u32 = 2;
/// Largest supported bit width (codes must fit an `i32` container)
pub const MAX_BITS: u32 = 16;

/// Granularity tag as written in configuration files
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GranularityKind {
    /// Single scale/zero-point for the entire tensor
    #[default]
    PerTensor,
    /// One scale/zero-point per row of the natural 2-D view
    PerChannel,
    /// One scale/zero-point per contiguous group of `group_size` values
    PerGroup,
    /// One scale/zero-point per attention head
    PerHead,
}

/// Resolved granularity, carrying the sizes it needs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Granularity {
    PerTensor,
    PerChannel,
    PerGroup(usize),
    PerHead(usize),
}

impl Granularity {
    /// Whether the range is a single scalar
    pub fn is_per_tensor(&self) -> bool {
        matches!(self, Granularity::PerTensor)
    }
}

/// Range calibration algorithm
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CalibAlgo {
    /// Observed row-wise (or tensor-wise) min/max
    #[default]
    Minmax,
    /// Grid search over shrunk ranges minimizing Lp reconstruction error
    Mse,
    /// Min/max scaled by sigmoid-gated external factors
    Learnable,
}

impl FromStr for CalibAlgo {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "minmax" => Ok(CalibAlgo::Minmax),
            "mse" => Ok(CalibAlgo::Mse),
            "learnable" => Ok(CalibAlgo::Learnable),
            other => Err(Error::config(format!(
                "unknown calibration algorithm '{other}' (expected minmax, mse or learnable)"
            ))),
        }
    }
}

impl fmt::Display for CalibAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CalibAlgo::Minmax => "minmax",
            CalibAlgo::Mse => "mse",
            CalibAlgo::Learnable => "learnable",
        };
        f.write_str(name)
    }
}

/// Options for the MSE grid search
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MseOptions {
    /// Number of grid steps per unit of shrink (default 100)
    #[serde(default = "default_grid")]
    pub grid: usize,
    /// Exponent of the per-row Lp error (default 2.4)
    #[serde(default = "default_norm")]
    pub norm: f32,
    /// Fraction of the grid that is scanned (default 0.8)
    #[serde(default = "default_maxshrink")]
    pub maxshrink: f32,
    /// Rows per search batch; must divide the row count (default 1024)
    #[serde(default = "default_bs")]
    pub bs: usize,
}

impl Default for MseOptions {
    fn default() -> Self {
        Self {
            grid: default_grid(),
            norm: default_norm(),
            maxshrink: default_maxshrink(),
            bs: default_bs(),
        }
    }
}

impl MseOptions {
    /// Number of shrink candidates scanned per batch
    pub fn steps(&self) -> usize {
        (self.maxshrink * self.grid as f32) as usize
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.grid == 0 {
            return Err(Error::config("mse grid must be > 0"));
        }
        if self.bs == 0 {
            return Err(Error::config("mse batch size must be > 0"));
        }
        if !(self.norm.is_finite() && self.norm > 0.0) {
            return Err(Error::config(format!("mse norm must be > 0, got {}", self.norm)));
        }
        if !(self.maxshrink > 0.0 && self.maxshrink <= 1.0) {
            return Err(Error::config(format!(
                "mse maxshrink must be in (0, 1], got {}",
                self.maxshrink
            )));
        }
        Ok(())
    }
}

fn default_grid() -> usize {
    100
}

fn default_norm() -> f32 {
    2.4
}

fn default_maxshrink() -> f32 {
    0.8
}

fn default_bs() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

/// Integer code range `[min_int, max_int]`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntBounds {
    pub max_int: i32,
    pub min_int: i32,
}

/// Code range for a bit width
///
/// Symmetric: `[-2^(bit-1), 2^(bit-1) - 1]`. Asymmetric: `[0, 2^bit - 1]`.
pub fn int_bounds(bit: u32, symmetric: bool) -> IntBounds {
    if symmetric {
        IntBounds {
            max_int: (1i32 << (bit - 1)) - 1,
            min_int: -(1i32 << (bit - 1)),
        }
    } else {
        IntBounds {
            max_int: (1i32 << bit) - 1,
            min_int: 0,
        }
    }
}

/// Quantization specification
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuantizationSpec {
    /// Bit width (>= 2)
    pub bit: u32,
    /// Symmetric (no zero-point) or asymmetric quantization
    pub symmetric: bool,
    /// Granularity tag
    #[serde(default)]
    pub granularity: GranularityKind,
    /// Group size, required iff granularity is per_group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_size: Option<usize>,
    /// Head count, required iff granularity is per_head
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_num: Option<usize>,
    /// Calibration algorithm
    #[serde(default)]
    pub calib_algo: CalibAlgo,
    /// Straight-through estimator for the rounding step
    #[serde(default)]
    pub ste: bool,
    /// Round the zero-point to an integer (default true)
    #[serde(default = "default_true")]
    pub round_zp: bool,
    /// MSE search options (used when calib_algo is mse)
    #[serde(default)]
    pub calib_args: MseOptions,
}

impl QuantizationSpec {
    /// Per-tensor minmax spec with rounded zero-point
    pub fn new(bit: u32, symmetric: bool) -> Self {
        Self {
            bit,
            symmetric,
            granularity: GranularityKind::PerTensor,
            group_size: None,
            head_num: None,
            calib_algo: CalibAlgo::Minmax,
            ste: false,
            round_zp: true,
            calib_args: MseOptions::default(),
        }
    }

    pub fn per_channel(mut self) -> Self {
        self.granularity = GranularityKind::PerChannel;
        self
    }

    pub fn per_group(mut self, group_size: usize) -> Self {
        self.granularity = GranularityKind::PerGroup;
        self.group_size = Some(group_size);
        self
    }

    pub fn per_head(mut self, head_num: usize) -> Self {
        self.granularity = GranularityKind::PerHead;
        self.head_num = Some(head_num);
        self
    }

    pub fn with_calib(mut self, algo: CalibAlgo) -> Self {
        self.calib_algo = algo;
        self
    }

    pub fn with_mse_options(mut self, options: MseOptions) -> Self {
        self.calib_algo = CalibAlgo::Mse;
        self.calib_args = options;
        self
    }

    pub fn with_round_zp(mut self, round_zp: bool) -> Self {
        self.round_zp = round_zp;
        self
    }

    pub fn with_ste(mut self, ste: bool) -> Self {
        self.ste = ste;
        self
    }

    /// Integer code range derived from `(bit, symmetric)`
    pub fn bounds(&self) -> IntBounds {
        int_bounds(self.bit, self.symmetric)
    }

    /// Resolve the granularity tag, checking its required size
    pub fn granularity(&self) -> Result<Granularity> {
        match self.granularity {
            GranularityKind::PerTensor => Ok(Granularity::PerTensor),
            GranularityKind::PerChannel => Ok(Granularity::PerChannel),
            GranularityKind::PerGroup => match self.group_size {
                Some(size) if size > 0 => Ok(Granularity::PerGroup(size)),
                Some(_) => Err(Error::config("group_size must be > 0")),
                None => Err(Error::config("per_group granularity requires group_size")),
            },
            GranularityKind::PerHead => match self.head_num {
                Some(n) if n > 0 => Ok(Granularity::PerHead(n)),
                Some(_) => Err(Error::config("head_num must be > 0")),
                None => Err(Error::config("per_head granularity requires head_num")),
            },
        }
    }

    /// Check every invariant of the spec
    pub fn validate(&self) -> Result<()> {
        if !(MIN_BITS..=MAX_BITS).contains(&self.bit) {
            return Err(Error::config(format!(
                "bit must be in [{MIN_BITS}, {MAX_BITS}], got {}",
                self.bit
            )));
        }
        self.granularity()?;
        if self.calib_algo == CalibAlgo::Mse {
            self.calib_args.validate()?;
        }
        Ok(())
    }
}
