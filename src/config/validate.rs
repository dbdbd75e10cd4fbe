//! Configuration validation

use super::schema::{QuantConfig, QuantMethod};
use crate::error::Error;
use crate::quant::{GranularityKind, QuantizationSpec, MAX_BITS, MIN_BITS};

/// Validation error type
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid {role} bit width: {bit} (must be in [{MIN_BITS}, {MAX_BITS}])")]
    InvalidBits { role: &'static str, bit: u32 },

    #[error("{role} granularity per_group requires group_size")]
    MissingGroupSize { role: &'static str },

    #[error("{role} granularity per_head requires head_num")]
    MissingHeadNum { role: &'static str },

    #[error("Invalid {role} {field}: 0 (must be > 0)")]
    ZeroSize {
        role: &'static str,
        field: &'static str,
    },

    #[error("Invalid {role} mse option: {reason}")]
    InvalidMseOptions { role: &'static str, reason: String },

    #[error("hqq requires an asymmetric weight quantizer")]
    HqqRequiresAsymmetric,

    #[error("Invalid hqq option: {0}")]
    InvalidHqq(String),

    #[error("llm_int8 requires an activation quantizer (act)")]
    MissingActivationSpec,

    #[error("llm_int8 cannot use per_group weights: outlier columns break fixed-size groups")]
    GroupedMixedPrecision,

    #[error("Invalid llm_int8 threshold: {0} (must be > 0.0)")]
    InvalidThreshold(f32),
}

/// Validate a quantization configuration
///
/// Checks:
/// - Bit widths and granularity sizes of every quantizer
/// - MSE options (also used by the benchmark comparison)
/// - Method requirements (asymmetric weights for hqq, activation spec for llm_int8)
/// - Method option ranges
pub fn validate_config(config: &QuantConfig) -> Result<(), ValidationError> {
    validate_spec("weight", &config.weight)?;
    if let Some(act) = &config.act {
        validate_spec("act", act)?;
    }

    match config.method {
        QuantMethod::Rtn => {}
        QuantMethod::Hqq => {
            if config.weight.symmetric {
                return Err(ValidationError::HqqRequiresAsymmetric);
            }
            config
                .special
                .hqq
                .validate()
                .map_err(|e| ValidationError::InvalidHqq(reason(e)))?;
        }
        QuantMethod::LlmInt8 => {
            if config.act.is_none() {
                return Err(ValidationError::MissingActivationSpec);
            }
            if config.weight.granularity == GranularityKind::PerGroup {
                return Err(ValidationError::GroupedMixedPrecision);
            }
            let threshold = config.special.llm_int8.threshold;
            if !(threshold.is_finite() && threshold > 0.0) {
                return Err(ValidationError::InvalidThreshold(threshold));
            }
        }
    }

    Ok(())
}

fn validate_spec(role: &'static str, spec: &QuantizationSpec) -> Result<(), ValidationError> {
    if !(MIN_BITS..=MAX_BITS).contains(&spec.bit) {
        return Err(ValidationError::InvalidBits { role, bit: spec.bit });
    }

    match spec.granularity {
        GranularityKind::PerGroup => match spec.group_size {
            None => return Err(ValidationError::MissingGroupSize { role }),
            Some(0) => {
                return Err(ValidationError::ZeroSize {
                    role,
                    field: "group_size",
                })
            }
            Some(_) => {}
        },
        GranularityKind::PerHead => match spec.head_num {
            None => return Err(ValidationError::MissingHeadNum { role }),
            Some(0) => {
                return Err(ValidationError::ZeroSize {
                    role,
                    field: "head_num",
                })
            }
            Some(_) => {}
        },
        GranularityKind::PerTensor | GranularityKind::PerChannel => {}
    }

    // `calib_args` also feeds the MSE comparison run of `bench`, whatever the algorithm
    spec.calib_args
        .validate()
        .map_err(|e| ValidationError::InvalidMseOptions {
            role,
            reason: reason(e),
        })?;

    Ok(())
}

fn reason(err: Error) -> String {
    match err {
        Error::ConfigError(msg) => msg,
        other => other.to_string(),
    }
}
