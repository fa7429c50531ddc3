use std::sync::Arc;

use log::debug;

use crate::bucketing::{user_hash, PASS_PERCENTAGE_SEGMENTS, USER_BUCKET_SEGMENTS};
use crate::evaluation::{ConfigEvaluation, EvaluationReason, SecondaryExposure};
use crate::persisted::{PersistedValueStore, PersistentStorage, UserPersistedValues};
use crate::rule::{ConditionKind, ConfigCondition, ConfigRule, Unsupported};
use crate::spec::ConfigSpec;
use crate::store::SpecStore;
use crate::user::{now_millis, AttributeValue, User};

struct ConditionOutcome {
    passed: bool,
    exposures: Vec<SecondaryExposure>,
}

impl ConditionOutcome {
    fn passed(passed: bool) -> Self {
        Self {
            passed,
            exposures: Vec::new(),
        }
    }
}

struct RuleOutcome {
    passed: bool,
    exposures: Vec<SecondaryExposure>,
}

/// Evaluates gates, dynamic configs, experiments and layers against the
/// currently installed rule set.
///
/// Evaluation is synchronous and side-effect-free except for reads and writes
/// against the optional persistent-storage collaborator used for sticky
/// experiment assignments. The evaluator does not know anything about
/// exposure events; acting on [ConfigEvaluation::secondary_exposures] is the
/// responsibility of the caller.
pub struct Evaluator {
    store: SpecStore,
    sticky: PersistedValueStore,
}

impl Evaluator {
    /// An evaluator with no persistent storage: every evaluation is fresh.
    pub fn new() -> Self {
        Self::with_persistent_storage(None)
    }

    /// An evaluator using `storage` for sticky experiment assignments.
    pub fn with_persistent_storage(storage: Option<Arc<dyn PersistentStorage>>) -> Self {
        Self {
            store: SpecStore::new(),
            sticky: PersistedValueStore::new(storage),
        }
    }

    /// Install a rule-set payload; see [SpecStore::set_values].
    pub fn set_values(&mut self, values: &serde_json::Value, reason: EvaluationReason) -> bool {
        self.store.set_values(values, reason)
    }

    /// Install a rule-set payload from raw JSON text.
    pub fn set_values_str(&mut self, values: &str, reason: EvaluationReason) -> bool {
        self.store.set_values_str(values, reason)
    }

    /// The reason and last-update-time of the active rule set.
    pub fn global_evaluation_details(&self) -> crate::evaluation::EvaluationDetails {
        self.store.evaluation_details()
    }

    /// Evaluate the feature gate `gate_name` for `user`.
    pub fn check_gate(&self, user: &User, gate_name: &str) -> ConfigEvaluation {
        match self.store.feature_gate(gate_name) {
            Some(spec) => self.eval_spec(user, spec),
            None => self.unrecognized(),
        }
    }

    /// Evaluate the dynamic config or experiment `config_name` for `user`.
    ///
    /// Callers opting into sticky assignments pass the map produced by
    /// [Evaluator::get_user_persisted_values]; passing None opts out and
    /// deletes any stored assignment for this config.
    pub fn get_config(
        &self,
        user: &User,
        config_name: &str,
        persisted: Option<&UserPersistedValues>,
    ) -> ConfigEvaluation {
        match self.store.dynamic_config(config_name) {
            Some(spec) => self.eval_config_with_persisted_values(user, spec, persisted),
            None => self.unrecognized(),
        }
    }

    /// Evaluate the layer `layer_name` for `user`, with the same sticky
    /// opt-in shape as [Evaluator::get_config].
    pub fn get_layer(
        &self,
        user: &User,
        layer_name: &str,
        persisted: Option<&UserPersistedValues>,
    ) -> ConfigEvaluation {
        match self.store.layer_config(layer_name) {
            Some(spec) => self.eval_layer_with_persisted_values(user, spec, persisted),
            None => self.unrecognized(),
        }
    }

    /// Load the user's sticky assignments for `id_type` from the storage
    /// collaborator. Storage failures fail open to None.
    pub fn get_user_persisted_values(
        &self,
        user: &User,
        id_type: &str,
    ) -> Option<UserPersistedValues> {
        self.sticky.get_user_persisted_values(user, id_type)
    }

    /// Awaitable variant of [Evaluator::get_user_persisted_values].
    pub async fn get_user_persisted_values_async(
        &self,
        user: &User,
        id_type: &str,
    ) -> Option<UserPersistedValues> {
        self.sticky.get_user_persisted_values_async(user, id_type).await
    }

    fn unrecognized(&self) -> ConfigEvaluation {
        ConfigEvaluation::new(false, "", Vec::new(), serde_json::Value::Null)
            .with_evaluation_details(
                EvaluationReason::Unrecognized,
                self.store.last_update_time(),
            )
    }

    fn eval_config_with_persisted_values(
        &self,
        user: &User,
        config: &ConfigSpec,
        persisted: Option<&UserPersistedValues>,
    ) -> ConfigEvaluation {
        let values = match persisted {
            Some(values) if config.is_active() => values,
            // Not running as an experiment, or the caller opted out: drop any
            // stored assignment and evaluate fresh.
            _ => return self.eval_and_delete_from_storage(user, config),
        };

        if let Some(sticky) = values.get(&config.name) {
            return ConfigEvaluation::from_sticky(sticky);
        }
        self.eval_and_save_to_storage(user, config)
    }

    fn eval_layer_with_persisted_values(
        &self,
        user: &User,
        layer: &ConfigSpec,
        persisted: Option<&UserPersistedValues>,
    ) -> ConfigEvaluation {
        let values = match persisted {
            Some(values) => values,
            None => return self.eval_and_delete_from_storage(user, layer),
        };

        match values.get(&layer.name) {
            Some(sticky) => {
                let evaluation = ConfigEvaluation::from_sticky(sticky);
                // A layer is only as sticky as the experiment it delegated
                // to; once that winds down the stored assignment is stale.
                if self.allocated_experiment_active(&evaluation) {
                    evaluation
                } else {
                    self.eval_and_delete_from_storage(user, layer)
                }
            }
            None => {
                let evaluation = self.eval_spec(user, layer);
                if self.allocated_experiment_active(&evaluation) {
                    if evaluation.is_experiment_group {
                        self.sticky
                            .save(user, &layer.id_type, &layer.name, &evaluation.to_sticky());
                    }
                } else {
                    self.sticky.delete(user, &layer.id_type, &layer.name);
                }
                evaluation
            }
        }
    }

    fn allocated_experiment_active(&self, evaluation: &ConfigEvaluation) -> bool {
        evaluation
            .config_delegate
            .as_deref()
            .and_then(|name| self.store.dynamic_config(name))
            .map(|delegate| delegate.is_active())
            .unwrap_or(false)
    }

    fn eval_and_save_to_storage(&self, user: &User, config: &ConfigSpec) -> ConfigEvaluation {
        let evaluation = self.eval_spec(user, config);
        if evaluation.is_experiment_group {
            self.sticky
                .save(user, &config.id_type, &config.name, &evaluation.to_sticky());
        }
        evaluation
    }

    fn eval_and_delete_from_storage(&self, user: &User, config: &ConfigSpec) -> ConfigEvaluation {
        self.sticky.delete(user, &config.id_type, &config.name);
        self.eval_spec(user, config)
    }

    // Full spec evaluation plus the global provenance stamp. An evaluation
    // already tagged Unsupported keeps its tag.
    fn eval_spec(&self, user: &User, spec: &ConfigSpec) -> ConfigEvaluation {
        let evaluation = self.eval_spec_internal(user, spec);
        if evaluation.evaluation_details.reason == EvaluationReason::Unsupported {
            return evaluation;
        }
        let details = self.store.evaluation_details();
        evaluation.with_evaluation_details(details.reason, details.time)
    }

    fn eval_spec_internal(&self, user: &User, spec: &ConfigSpec) -> ConfigEvaluation {
        if !spec.enabled {
            return ConfigEvaluation::new(
                false,
                "disabled",
                Vec::new(),
                spec.default_value.clone(),
            );
        }

        let mut exposures: Vec<SecondaryExposure> = Vec::new();
        match self.walk_rules(user, spec, &mut exposures) {
            Ok(Some(evaluation)) => evaluation,
            Ok(None) => {
                ConfigEvaluation::new(false, "default", exposures, spec.default_value.clone())
                    .with_explicit_parameters(spec.explicit_parameters.clone())
            }
            Err(unsupported) => {
                debug!("{} in {}; failing closed", unsupported, spec.name);
                ConfigEvaluation::new(false, "default", exposures, spec.default_value.clone())
                    .with_explicit_parameters(spec.explicit_parameters.clone())
                    .with_evaluation_details(
                        EvaluationReason::Unsupported,
                        self.store.last_update_time(),
                    )
            }
        }
    }

    fn walk_rules(
        &self,
        user: &User,
        spec: &ConfigSpec,
        exposures: &mut Vec<SecondaryExposure>,
    ) -> Result<Option<ConfigEvaluation>, Unsupported> {
        for rule in &spec.rules {
            let outcome = self.eval_rule(user, rule)?;
            // Exposures accumulate whether or not the rule matched.
            exposures.extend(outcome.exposures);
            if !outcome.passed {
                continue;
            }

            // Delegation fires on condition match alone; it is not gated by
            // the rule's pass percentage.
            if let Some(delegated) = self.eval_delegate(user, rule, exposures) {
                return Ok(Some(delegated));
            }

            let passed = self.eval_pass_percent(user, rule, spec);
            let json_value = if passed {
                rule.return_value.clone()
            } else {
                spec.default_value.clone()
            };
            return Ok(Some(
                ConfigEvaluation::new(passed, rule.id.clone(), exposures.clone(), json_value)
                    .with_explicit_parameters(spec.explicit_parameters.clone())
                    .with_group_name(rule.group_name.clone())
                    .with_is_experiment_group(rule.is_experiment_group.unwrap_or(false)),
            ));
        }
        Ok(None)
    }

    fn eval_delegate(
        &self,
        user: &User,
        rule: &ConfigRule,
        exposures: &[SecondaryExposure],
    ) -> Option<ConfigEvaluation> {
        let delegate_name = rule.config_delegate.as_deref()?;
        let delegate = self.store.dynamic_config(delegate_name)?;

        let mut evaluation = self.eval_spec_internal(user, delegate);
        evaluation.config_delegate = Some(delegate_name.to_string());
        evaluation.undelegated_secondary_exposures = exposures.to_vec();
        evaluation.explicit_parameters = delegate.explicit_parameters.clone();

        let mut combined = exposures.to_vec();
        combined.append(&mut evaluation.secondary_exposures);
        evaluation.secondary_exposures = combined;

        Some(evaluation)
    }

    fn eval_rule(&self, user: &User, rule: &ConfigRule) -> Result<RuleOutcome, Unsupported> {
        let mut passed = true;
        let mut exposures = Vec::new();
        for condition in &rule.conditions {
            let outcome = self.eval_condition(user, condition)?;
            if !outcome.passed {
                passed = false;
            }
            exposures.extend(outcome.exposures);
        }
        Ok(RuleOutcome { passed, exposures })
    }

    #[allow(clippy::float_cmp)]
    fn eval_pass_percent(&self, user: &User, rule: &ConfigRule, spec: &ConfigSpec) -> bool {
        // 0 and 100 decide without hashing, so even a malformed salt cannot
        // make them non-deterministic.
        if rule.pass_percentage == 100.0 {
            return true;
        }
        if rule.pass_percentage == 0.0 {
            return false;
        }
        let unit_id = user.unit_id(&rule.id_type).unwrap_or("");
        let hash = user_hash(&format!(
            "{}.{}.{}",
            spec.salt,
            rule.bucketing_salt(),
            unit_id
        ));
        ((hash % PASS_PERCENTAGE_SEGMENTS) as f64) < rule.pass_percentage * 100.0
    }

    fn eval_condition(
        &self,
        user: &User,
        condition: &ConfigCondition,
    ) -> Result<ConditionOutcome, Unsupported> {
        let value: Option<AttributeValue> = match &condition.kind {
            ConditionKind::Public => return Ok(ConditionOutcome::passed(true)),
            ConditionKind::PassGate | ConditionKind::FailGate => {
                return Ok(self.eval_nested_gate(user, condition));
            }
            ConditionKind::IpBased | ConditionKind::UaBased | ConditionKind::UserField => {
                condition
                    .field
                    .as_deref()
                    .and_then(|field| user.get_attribute(field))
            }
            ConditionKind::EnvironmentField => condition
                .field
                .as_deref()
                .and_then(|field| user.get_environment(field)),
            ConditionKind::CurrentTime => Some(AttributeValue::Number(now_millis())),
            ConditionKind::UserBucket => {
                let salt = condition
                    .additional_values
                    .get("salt")
                    .and_then(AttributeValue::as_str)
                    .unwrap_or("");
                let unit_id = user.unit_id(&condition.id_type).unwrap_or("");
                let hash = user_hash(&format!("{}.{}", salt, unit_id));
                Some(AttributeValue::Number((hash % USER_BUCKET_SEGMENTS) as f64))
            }
            ConditionKind::UnitId => user
                .unit_id(&condition.id_type)
                .map(AttributeValue::from),
            ConditionKind::Other(tag) => {
                return Err(Unsupported(format!("condition: {}", tag)));
            }
        };

        let operator = condition
            .operator
            .as_ref()
            .ok_or_else(|| Unsupported("condition with no operator".to_string()))?;
        let passed = operator.apply(value.as_ref(), condition.target_value.as_ref())?;
        Ok(ConditionOutcome::passed(passed))
    }

    // A nested gate check is a full spec-level evaluation. It contributes the
    // nested evaluation's own exposures plus one synthetic record for the
    // nested gate itself, in that order.
    fn eval_nested_gate(&self, user: &User, condition: &ConfigCondition) -> ConditionOutcome {
        let gate_name = condition
            .target_value
            .as_ref()
            .and_then(AttributeValue::as_str)
            .unwrap_or("");
        let gate_result = match self.store.feature_gate(gate_name) {
            Some(spec) => self.eval_spec(user, spec),
            None => self.unrecognized(),
        };

        let mut exposures = gate_result.secondary_exposures.clone();
        exposures.push(SecondaryExposure::new(
            gate_name,
            gate_result.value,
            gate_result.rule_id.clone(),
        ));

        let passed = if condition.kind == ConditionKind::FailGate {
            !gate_result.value
        } else {
            gate_result.value
        };
        ConditionOutcome { passed, exposures }
    }
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}
