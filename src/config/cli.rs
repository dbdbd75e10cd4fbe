//! CLI argument parsing
//!
//! # Usage
//!
//! ```bash
//! cuantizar validate hqq_w4.yaml
//! cuantizar info hqq_w4.yaml --format json
//! cuantizar bench hqq_w4.yaml --rows 64 --cols 256 --seed 7
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Cuantizar: post-training quantization toolkit
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "cuantizar")]
#[command(version)]
#[command(about = "Post-training quantization with calibrated ranges, HQQ refinement and outlier splitting")]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

/// Available commands
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Validate a configuration file
    Validate(ValidateArgs),

    /// Display the resolved quantization plan of a configuration
    Info(InfoArgs),

    /// Compare quantization methods on synthetic tensors
    Bench(BenchArgs),
}

/// Arguments for the validate command
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct ValidateArgs {
    /// Path to YAML configuration file
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,

    /// Show the resolved plan after validation
    #[arg(short, long)]
    pub detailed: bool,
}

/// Arguments for the info command
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct InfoArgs {
    /// Path to YAML configuration file
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,

    /// Output format (text, json, yaml)
    #[arg(short, long, default_value = "text")]
    pub format: OutputFormat,
}

/// Arguments for the bench command
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct BenchArgs {
    /// Path to YAML configuration file
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,

    /// Rows of the synthetic weight (output features)
    #[arg(long, default_value = "64")]
    pub rows: usize,

    /// Columns of the synthetic weight (input features)
    #[arg(long, default_value = "128")]
    pub cols: usize,

    /// Seed for the synthetic tensors
    #[arg(long, default_value = "42")]
    pub seed: u64,

    /// Output format (text, json, yaml)
    #[arg(short, long, default_value = "text")]
    pub format: OutputFormat,
}

/// Output format for reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    Yaml,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "yaml" => Ok(OutputFormat::Yaml),
            _ => Err(format!("Unknown output format: {s}. Valid formats: text, json, yaml")),
        }
    }
}

/// Parse CLI arguments from an iterator
pub fn parse_args<I, T>(args: I) -> Result<Cli, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    Cli::try_parse_from(args)
}
