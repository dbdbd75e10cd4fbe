//! # Cuantizar: Post-Training Quantization Library
//!
//! Cuantizar provides the numeric core of post-training quantization for
//! linear layers: affine quantizers, range calibration, HQQ refinement and
//! outlier-aware mixed precision.
//!
//! ## Architecture
//!
//! - **quant**: Quantizer, calibration, HQQ, outlier splitting, fake-quant linear layers
//! - **config**: Declarative YAML configuration and CLI arguments
//! - **error**: Crate-wide error type
//!
//! ## Example
//!
//! ```
//! use cuantizar::quant::{QuantOptions, Quantizer, QuantizationSpec};
//! use ndarray::arr2;
//!
//! let quantizer = Quantizer::new(QuantizationSpec::new(4, true).per_channel())?;
//! let weight = arr2(&[[0.5, -1.0, 0.25], [2.0, 0.0, -0.75]]);
//! let fake = quantizer.fake_quant_weight_dynamic(&weight, &QuantOptions::default())?;
//! assert_eq!(fake.shape(), weight.shape());
//! # Ok::<(), cuantizar::Error>(())
//! ```

pub mod config;
pub mod quant;

pub mod error;

pub use error::{Error, Result};
