//! YAML schema definitions for declarative quantization configuration

use crate::error::{Error, Result};
use crate::quant::{HqqConfig, OutlierConfig, QuantizationSpec};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Complete quantization configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuantConfig {
    /// Quantization method
    #[serde(default)]
    pub method: QuantMethod,

    /// Weight quantizer
    pub weight: QuantizationSpec,

    /// Optional activation quantizer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub act: Option<QuantizationSpec>,

    /// Method-specific options
    #[serde(default)]
    pub special: SpecialConfig,
}

/// Quantization method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QuantMethod {
    /// Round-to-nearest with calibrated ranges
    #[default]
    Rtn,
    /// Half-quadratic zero-point refinement
    Hqq,
    /// Outlier channels in full precision, the rest quantized
    LlmInt8,
}

impl FromStr for QuantMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "rtn" => Ok(QuantMethod::Rtn),
            "hqq" => Ok(QuantMethod::Hqq),
            "llm_int8" | "llmint8" => Ok(QuantMethod::LlmInt8),
            _ => Err(Error::ConfigError(format!(
                "Unknown quantization method: {s}. Valid methods: rtn, hqq, llm_int8"
            ))),
        }
    }
}

impl fmt::Display for QuantMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QuantMethod::Rtn => "rtn",
            QuantMethod::Hqq => "hqq",
            QuantMethod::LlmInt8 => "llm_int8",
        };
        f.write_str(name)
    }
}

/// Method-specific options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpecialConfig {
    /// HQQ refinement options
    #[serde(default)]
    pub hqq: HqqConfig,

    /// Outlier split options
    #[serde(default)]
    pub llm_int8: OutlierConfig,
}
