//! Build quantization components from configuration

use super::schema::{QuantConfig, QuantMethod};
use crate::error::{Error, Result};
use crate::quant::{
    BenchPlan, Granularity, HqqConfig, HqqRefiner, OutlierConfig, OutlierSplitter, QdqHooks,
    QuantizationSpec, Quantizer, RtnHooks,
};
use serde::{Deserialize, Serialize};

/// Build the weight quantizer
pub fn build_weight_quantizer(config: &QuantConfig) -> Result<Quantizer> {
    Quantizer::new(config.weight.clone())
}

/// Build the activation quantizer, if configured
pub fn build_act_quantizer(config: &QuantConfig) -> Result<Option<Quantizer>> {
    config.act.clone().map(Quantizer::new).transpose()
}

/// Build the HQQ refiner from the weight quantizer and `special.hqq`
pub fn build_refiner(config: &QuantConfig) -> Result<HqqRefiner> {
    HqqRefiner::new(build_weight_quantizer(config)?, config.special.hqq)
}

/// Build the outlier splitter from both quantizers and `special.llm_int8`
pub fn build_splitter(config: &QuantConfig) -> Result<OutlierSplitter> {
    let act = build_act_quantizer(config)?
        .ok_or_else(|| Error::ConfigError("llm_int8 requires an activation quantizer".to_string()))?;
    OutlierSplitter::new(build_weight_quantizer(config)?, act, &config.special.llm_int8)
}

/// Build the inference hooks of the configured method
pub fn build_hooks(config: &QuantConfig) -> Result<Box<dyn QdqHooks>> {
    match config.method {
        QuantMethod::Rtn => Ok(Box::new(RtnHooks::new(
            build_weight_quantizer(config)?,
            build_act_quantizer(config)?,
        ))),
        QuantMethod::Hqq => Ok(Box::new(build_refiner(config)?)),
        QuantMethod::LlmInt8 => Ok(Box::new(build_splitter(config)?)),
    }
}

/// Benchmark settings derived from the configuration
pub fn bench_plan(config: &QuantConfig) -> BenchPlan<'_> {
    BenchPlan {
        weight: &config.weight,
        act: config.act.as_ref(),
        hqq: config.special.hqq,
        outlier: config.special.llm_int8,
    }
}

/// Resolved view of one quantizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizerSummary {
    pub bit: u32,
    pub symmetric: bool,
    pub max_int: i32,
    pub min_int: i32,
    pub granularity: String,
    pub calib_algo: String,
    pub round_zp: bool,
    pub ste: bool,
}

impl QuantizerSummary {
    fn from_quantizer(quantizer: &Quantizer) -> Self {
        let spec: &QuantizationSpec = quantizer.spec();
        let bounds = quantizer.bounds();
        let granularity = match quantizer.granularity() {
            Granularity::PerTensor => "per_tensor".to_string(),
            Granularity::PerChannel => "per_channel".to_string(),
            Granularity::PerGroup(size) => format!("per_group({size})"),
            Granularity::PerHead(heads) => format!("per_head({heads})"),
        };
        Self {
            bit: spec.bit,
            symmetric: spec.symmetric,
            max_int: bounds.max_int,
            min_int: bounds.min_int,
            granularity,
            calib_algo: spec.calib_algo.to_string(),
            round_zp: spec.round_zp,
            ste: spec.ste,
        }
    }
}

/// Resolved quantization plan, as printed by `cuantizar info`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub method: QuantMethod,
    pub weight: QuantizerSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub act: Option<QuantizerSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hqq: Option<HqqConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_int8: Option<OutlierConfig>,
}

/// Resolve the plan of a configuration
pub fn summarize(config: &QuantConfig) -> Result<PlanSummary> {
    let weight = build_weight_quantizer(config)?;
    let act = build_act_quantizer(config)?;
    Ok(PlanSummary {
        method: config.method,
        weight: QuantizerSummary::from_quantizer(&weight),
        act: act.as_ref().map(QuantizerSummary::from_quantizer),
        hqq: (config.method == QuantMethod::Hqq).then_some(config.special.hqq),
        llm_int8: (config.method == QuantMethod::LlmInt8).then_some(config.special.llm_int8),
    })
}
