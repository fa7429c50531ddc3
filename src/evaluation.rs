use serde::{Deserialize, Serialize};

use crate::persisted::StickyValues;

/// Provenance tag describing how the rule set behind an evaluation was
/// obtained, or why the evaluation fell back to a default.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvaluationReason {
    /// The active rule set came from a network fetch.
    Network,
    /// The active rule set was bootstrapped by the caller.
    Bootstrap,
    /// A bootstrap payload was supplied but could not be used.
    InvalidBootstrap,
    /// The active rule set was read back from a local cache.
    Cache,
    /// A cached rule set existed but could not be parsed.
    CacheFailure,
    /// The evaluation was reconstructed from a persisted assignment.
    Persisted,
    /// The requested name is absent from the current rule set.
    Unrecognized,
    /// No rule set has been installed yet.
    Uninitialized,
    /// An unexpected error occurred while obtaining the rule set.
    Error,
    /// The evaluation hit a condition or operator this engine cannot
    /// evaluate and failed closed.
    Unsupported,
    /// The server reported the cached rule set is still current.
    NetworkNotModified,
}

/// The provenance attached to every [ConfigEvaluation].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct EvaluationDetails {
    pub reason: EvaluationReason,
    /// Last-update-time of the rule set the evaluation was computed against,
    /// or the stored assignment time for persisted results.
    pub time: u64,
}

/// A record of a dependency consulted while evaluating the primary spec,
/// typically a nested gate. Order is causal evaluation order and identical
/// records are deliberately not de-duplicated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondaryExposure {
    pub gate: String,
    #[serde(rename = "gateValue")]
    pub gate_value: String,
    #[serde(rename = "ruleID")]
    pub rule_id: String,
}

impl SecondaryExposure {
    pub(crate) fn new(
        gate: impl Into<String>,
        gate_value: bool,
        rule_id: impl Into<String>,
    ) -> Self {
        Self {
            gate: gate.into(),
            gate_value: gate_value.to_string(),
            rule_id: rule_id.into(),
        }
    }
}

/// The result of evaluating a gate, config, experiment or layer for one user.
/// Each evaluation owns its instance; nothing is shared between calls except
/// via the serialized [StickyValues] record.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigEvaluation {
    /// Boolean outcome: the gate value, or whether a config rule matched.
    pub value: bool,
    /// Id of the rule that decided the outcome, or one of the synthetic ids
    /// "default" and "disabled".
    pub rule_id: String,
    pub secondary_exposures: Vec<SecondaryExposure>,
    /// The JSON parameters produced by the evaluation.
    pub json_value: serde_json::Value,
    pub explicit_parameters: Option<Vec<String>>,
    /// Name of the experiment a layer delegated to, when it did.
    pub config_delegate: Option<String>,
    /// Exposures accumulated before delegation took over.
    pub undelegated_secondary_exposures: Vec<SecondaryExposure>,
    /// Whether the matched rule is a concrete experiment group; gates whether
    /// the sticky overlay persists this result.
    pub is_experiment_group: bool,
    pub group_name: Option<String>,
    pub evaluation_details: EvaluationDetails,
}

impl ConfigEvaluation {
    pub fn new(
        value: bool,
        rule_id: impl Into<String>,
        secondary_exposures: Vec<SecondaryExposure>,
        json_value: serde_json::Value,
    ) -> Self {
        Self {
            value,
            rule_id: rule_id.into(),
            undelegated_secondary_exposures: secondary_exposures.clone(),
            secondary_exposures,
            json_value: normalize_json_value(json_value),
            explicit_parameters: None,
            config_delegate: None,
            is_experiment_group: false,
            group_name: None,
            evaluation_details: EvaluationDetails {
                reason: EvaluationReason::Uninitialized,
                time: 0,
            },
        }
    }

    pub fn with_group_name(mut self, group_name: Option<String>) -> Self {
        self.group_name = group_name;
        self
    }

    pub fn with_explicit_parameters(mut self, parameters: Option<Vec<String>>) -> Self {
        self.explicit_parameters = parameters;
        self
    }

    pub fn with_is_experiment_group(mut self, is_experiment_group: bool) -> Self {
        self.is_experiment_group = is_experiment_group;
        self
    }

    pub fn with_evaluation_details(mut self, reason: EvaluationReason, time: u64) -> Self {
        self.evaluation_details = EvaluationDetails { reason, time };
        self
    }

    /// Reconstruct an evaluation from a persisted assignment record. The
    /// result carries reason [EvaluationReason::Persisted] and the time the
    /// record was written.
    pub fn from_sticky(sticky: &StickyValues) -> Self {
        let mut evaluation = ConfigEvaluation::new(
            sticky.value,
            sticky.rule_id.clone(),
            sticky.secondary_exposures.clone(),
            sticky.json_value.clone(),
        );
        evaluation.undelegated_secondary_exposures =
            sticky.undelegated_secondary_exposures.clone();
        evaluation.config_delegate = sticky.config_delegate.clone();
        evaluation.explicit_parameters = sticky.explicit_parameters.clone();
        evaluation.is_experiment_group = sticky.is_experiment_group;
        evaluation
            .with_group_name(sticky.group_name.clone())
            .with_evaluation_details(EvaluationReason::Persisted, sticky.time)
    }

    /// The subset of this evaluation written to persistent storage.
    pub fn to_sticky(&self) -> StickyValues {
        StickyValues {
            value: self.value,
            rule_id: self.rule_id.clone(),
            json_value: self.json_value.clone(),
            secondary_exposures: self.secondary_exposures.clone(),
            undelegated_secondary_exposures: self.undelegated_secondary_exposures.clone(),
            config_delegate: self.config_delegate.clone(),
            explicit_parameters: self.explicit_parameters.clone(),
            is_experiment_group: self.is_experiment_group,
            group_name: self.group_name.clone(),
            time: self.evaluation_details.time,
        }
    }
}

// Legacy gate payloads carry booleans (and occasionally nothing) where configs
// carry parameter objects; both normalize to an empty object.
fn normalize_json_value(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Bool(_) | serde_json::Value::Null => {
            serde_json::Value::Object(serde_json::Map::new())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use assert_json_diff::assert_json_eq;
    use serde_json::json;
    use spectral::prelude::*;

    use super::*;

    #[test]
    fn boolean_and_missing_values_normalize_to_empty_objects() {
        let from_bool = ConfigEvaluation::new(true, "r", Vec::new(), json!(true));
        assert_json_eq!(from_bool.json_value, json!({}));

        let from_null = ConfigEvaluation::new(false, "r", Vec::new(), serde_json::Value::Null);
        assert_json_eq!(from_null.json_value, json!({}));

        let from_object = ConfigEvaluation::new(true, "r", Vec::new(), json!({"k": 1}));
        assert_json_eq!(from_object.json_value, json!({"k": 1}));
    }

    #[test]
    fn sticky_round_trip_preserves_the_evaluation() {
        let exposures = vec![
            SecondaryExposure::new("dependency_gate", true, "rule_1"),
            SecondaryExposure::new("dependency_gate", true, "rule_1"),
        ];
        let evaluation =
            ConfigEvaluation::new(true, "control_rule", exposures, json!({"color": "blue"}))
                .with_group_name(Some("Control".to_string()))
                .with_explicit_parameters(Some(vec!["color".to_string()]))
                .with_is_experiment_group(true)
                .with_evaluation_details(EvaluationReason::Network, 1_700_000_000_000);

        let serialized = serde_json::to_string(&evaluation.to_sticky()).unwrap();
        let restored: StickyValues = serde_json::from_str(&serialized).unwrap();
        let rebuilt = ConfigEvaluation::from_sticky(&restored);

        assert_that!(rebuilt.value).is_equal_to(evaluation.value);
        assert_that!(&rebuilt.rule_id).is_equal_to(&evaluation.rule_id);
        assert_json_eq!(rebuilt.json_value, evaluation.json_value);
        assert_that!(&rebuilt.secondary_exposures).is_equal_to(&evaluation.secondary_exposures);
        assert_that!(&rebuilt.group_name).is_equal_to(&evaluation.group_name);
        assert_that!(rebuilt.is_experiment_group).is_true();
        assert_that!(rebuilt.evaluation_details.reason)
            .is_equal_to(EvaluationReason::Persisted);
        assert_that!(rebuilt.evaluation_details.time).is_equal_to(1_700_000_000_000);
    }

    #[test]
    fn duplicate_exposures_survive_serialization() {
        let exposures = vec![
            SecondaryExposure::new("g", true, "r"),
            SecondaryExposure::new("g", true, "r"),
        ];
        let evaluation = ConfigEvaluation::new(true, "rule", exposures, json!({}));
        let rebuilt = ConfigEvaluation::from_sticky(&evaluation.to_sticky());
        assert_that!(rebuilt.secondary_exposures).has_length(2);
    }

    #[test]
    fn exposure_wire_names() {
        let exposure = SecondaryExposure::new("holdout_gate", false, "default");
        let json = serde_json::to_value(&exposure).unwrap();
        assert_json_eq!(
            json,
            json!({"gate": "holdout_gate", "gateValue": "false", "ruleID": "default"})
        );
    }
}
