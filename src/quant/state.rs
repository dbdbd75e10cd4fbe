//! Per-layer calibration state
//!
//! The driver owns one [`LayerStateMap`] and passes it by reference into the
//! refiner and the inference hooks. Re-recording a layer overwrites its
//! previous state.

use super::hqq::HqqState;
use super::outlier::OutlierMask;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// State recorded for one linear layer
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerState {
    /// Refined parameters from HQQ calibration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hqq: Option<HqqState>,
    /// Channel split from the most recent activation hook call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outlier_mask: Option<OutlierMask>,
}

/// Layer name to [`LayerState`]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerStateMap {
    layers: BTreeMap<String, LayerState>,
}

impl LayerStateMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, layer: &str) -> Option<&LayerState> {
        self.layers.get(layer)
    }

    /// State of `layer`, created empty on first use
    pub fn entry(&mut self, layer: &str) -> &mut LayerState {
        self.layers.entry(layer.to_string()).or_default()
    }

    pub fn set_hqq(&mut self, layer: &str, state: HqqState) {
        self.entry(layer).hqq = Some(state);
    }

    pub fn set_outlier_mask(&mut self, layer: &str, mask: OutlierMask) {
        self.entry(layer).outlier_mask = Some(mask);
    }

    pub fn hqq(&self, layer: &str) -> Result<&HqqState> {
        self.get(layer)
            .and_then(|s| s.hqq.as_ref())
            .ok_or_else(|| Error::MissingState(format!("no HQQ parameters recorded for '{layer}'")))
    }

    pub fn outlier_mask(&self, layer: &str) -> Result<&OutlierMask> {
        self.get(layer)
            .and_then(|s| s.outlier_mask.as_ref())
            .ok_or_else(|| Error::MissingState(format!("no outlier mask recorded for '{layer}'")))
    }

    pub fn remove(&mut self, layer: &str) -> Option<LayerState> {
        self.layers.remove(layer)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Layer names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.layers.keys().map(String::as_str)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Serialization(e.to_string()))
    }
}
