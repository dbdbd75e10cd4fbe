//! Loading quantization configuration from YAML

use super::schema::QuantConfig;
use super::validate::validate_config;
use crate::error::{Error, Result};
use std::fs;
use std::path::Path;
use tracing::debug;

/// Load, parse and validate a YAML configuration file
///
/// # Example
///
/// ```no_run
/// use cuantizar::config::load_config;
///
/// let config = load_config("hqq_w4.yaml")?;
/// println!("method: {}", config.method);
/// # Ok::<(), cuantizar::Error>(())
/// ```
pub fn load_config<P: AsRef<Path>>(config_path: P) -> Result<QuantConfig> {
    let path = config_path.as_ref();
    debug!(path = %path.display(), "loading config");
    let yaml_content = fs::read_to_string(path)?;
    parse_config(&yaml_content)
}

/// Parse and validate a YAML configuration document
pub fn parse_config(yaml: &str) -> Result<QuantConfig> {
    let config: QuantConfig = serde_yaml::from_str(yaml)
        .map_err(|e| Error::ConfigError(format!("Failed to parse YAML config: {e}")))?;

    validate_config(&config).map_err(|e| Error::ConfigError(format!("Invalid config: {e}")))?;

    Ok(config)
}
