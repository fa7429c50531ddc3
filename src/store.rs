use std::collections::HashMap;

use log::warn;
use serde::Deserialize;

use crate::evaluation::{EvaluationDetails, EvaluationReason};
use crate::spec::ConfigSpec;

// The wire shape of one downloaded rule set. A typed parse gives the
// all-or-nothing update semantics for free: any missing section, non-array
// section or unparseable record fails the whole payload.
#[derive(Debug, Deserialize)]
struct SpecsPayload {
    feature_gates: Vec<ConfigSpec>,
    dynamic_configs: Vec<ConfigSpec>,
    layer_configs: Vec<ConfigSpec>,
    #[serde(default)]
    time: u64,
}

/// Holds the currently active rule set plus its last-update-time and the
/// reason it was obtained. A refresh replaces the whole set as a unit; a
/// rejected payload leaves the previous set untouched.
pub struct SpecStore {
    feature_gates: HashMap<String, ConfigSpec>,
    dynamic_configs: HashMap<String, ConfigSpec>,
    layer_configs: HashMap<String, ConfigSpec>,
    lcut: u64,
    reason: EvaluationReason,
}

impl SpecStore {
    pub fn new() -> Self {
        Self {
            feature_gates: HashMap::new(),
            dynamic_configs: HashMap::new(),
            layer_configs: HashMap::new(),
            lcut: 0,
            reason: EvaluationReason::Uninitialized,
        }
    }

    /// Install a parsed rule-set payload. Returns false (and keeps the
    /// previous set, time and reason) when the payload is malformed.
    pub fn set_values(&mut self, values: &serde_json::Value, reason: EvaluationReason) -> bool {
        match serde_json::from_value::<SpecsPayload>(values.clone()) {
            Ok(payload) => {
                self.install(payload, reason);
                true
            }
            Err(e) => {
                warn!("rejecting rule set update: {}", e);
                false
            }
        }
    }

    /// Install a rule-set payload from its raw JSON text, e.g. a bootstrap
    /// string handed over by the embedding application.
    pub fn set_values_str(&mut self, values: &str, reason: EvaluationReason) -> bool {
        match serde_json::from_str::<SpecsPayload>(values) {
            Ok(payload) => {
                self.install(payload, reason);
                true
            }
            Err(e) => {
                warn!("rejecting rule set update: {}", e);
                false
            }
        }
    }

    fn install(&mut self, payload: SpecsPayload, reason: EvaluationReason) {
        self.feature_gates = index_by_name(payload.feature_gates);
        self.dynamic_configs = index_by_name(payload.dynamic_configs);
        self.layer_configs = index_by_name(payload.layer_configs);
        self.lcut = payload.time;
        self.reason = reason;
    }

    pub fn feature_gate(&self, name: &str) -> Option<&ConfigSpec> {
        self.feature_gates.get(name)
    }

    pub fn dynamic_config(&self, name: &str) -> Option<&ConfigSpec> {
        self.dynamic_configs.get(name)
    }

    pub fn layer_config(&self, name: &str) -> Option<&ConfigSpec> {
        self.layer_configs.get(name)
    }

    /// The `time` field of the most recently accepted payload.
    pub fn last_update_time(&self) -> u64 {
        self.lcut
    }

    /// The reason and time every fresh evaluation is stamped with.
    pub fn evaluation_details(&self) -> EvaluationDetails {
        EvaluationDetails {
            reason: self.reason,
            time: self.lcut,
        }
    }
}

impl Default for SpecStore {
    fn default() -> Self {
        Self::new()
    }
}

fn index_by_name(specs: Vec<ConfigSpec>) -> HashMap<String, ConfigSpec> {
    specs
        .into_iter()
        .map(|spec| (spec.name.clone(), spec))
        .collect()
}
