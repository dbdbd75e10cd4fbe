//! Declarative YAML configuration
//!
//! A configuration names a quantization method, the weight quantizer, an
//! optional activation quantizer and method-specific options.
//!
//! # Example
//!
//! ```yaml
//! method: hqq
//!
//! weight:
//!   bit: 4
//!   symmetric: false
//!   granularity: per_group
//!   group_size: 64
//!   round_zp: false
//!
//! special:
//!   hqq:
//!     lp_norm: 0.7
//!     iters: 20
//! ```

mod builder;
mod cli;
mod load;
mod schema;
mod validate;


pub use builder::{
    bench_plan, build_act_quantizer, build_hooks, build_refiner, build_splitter, build_weight_quantizer,
    summarize, PlanSummary, QuantizerSummary,
};
pub use cli::{parse_args, BenchArgs, Cli, Command, InfoArgs, OutputFormat, ValidateArgs};
pub use load::{load_config, parse_config};
pub use schema::{QuantConfig, QuantMethod, SpecialConfig};
pub use validate::{validate_config, ValidationError};
