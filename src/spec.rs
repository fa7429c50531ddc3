use serde::{Deserialize, Deserializer};

use crate::rule::ConfigRule;

/// What a spec record represents. Layers are listed in their own payload
/// section, so the tag is informational; lookups go by section.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpecKind {
    FeatureGate,
    DynamicConfig,
    Layer,
    Unknown,
}

impl Default for SpecKind {
    fn default() -> Self {
        SpecKind::Unknown
    }
}

impl From<&str> for SpecKind {
    fn from(tag: &str) -> Self {
        match tag.to_lowercase().as_str() {
            "feature_gate" => SpecKind::FeatureGate,
            "dynamic_config" => SpecKind::DynamicConfig,
            "layer" => SpecKind::Layer,
            _ => SpecKind::Unknown,
        }
    }
}

impl<'de> Deserialize<'de> for SpecKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let tag = String::deserialize(deserializer)?;
        Ok(SpecKind::from(tag.as_str()))
    }
}

/// One downloaded gate, dynamic config, experiment or layer: an ordered list
/// of [ConfigRule]s plus the value returned when nothing matches.
///
/// Rules are evaluated in array order; the first rule whose conditions all
/// pass decides the outcome, subject to its pass percentage.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSpec {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: SpecKind,
    pub salt: String,
    #[serde(default)]
    pub default_value: serde_json::Value,
    pub enabled: bool,
    #[serde(default = "crate::rule::default_id_type")]
    pub id_type: String,
    #[serde(default)]
    pub rules: Vec<ConfigRule>,
    #[serde(default)]
    pub entity: String,
    #[serde(default)]
    pub explicit_parameters: Option<Vec<String>>,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub has_shared_params: bool,
    // Tri-state on the wire: only present (and true) while the spec is
    // running as an experiment.
    #[serde(default)]
    pub is_active: Option<bool>,
}

impl ConfigSpec {
    /// Whether this spec is currently running as an experiment. Absent and
    /// explicit-null both mean "not an experiment".
    pub fn is_active(&self) -> bool {
        self.is_active == Some(true)
    }
}

fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    T: Default + Deserialize<'de>,
    D: Deserializer<'de>,
{
    let opt = Option::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use spectral::prelude::*;

    use super::*;

    #[test]
    fn parses_a_gate_record() {
        let spec: ConfigSpec = serde_json::from_str(
            r#"{
                "name": "employee_gate",
                "type": "feature_gate",
                "salt": "4815162342",
                "defaultValue": false,
                "enabled": true,
                "idType": "userID",
                "entity": "feature_gate",
                "rules": [
                    {
                        "name": "employees",
                        "passPercentage": 100,
                        "conditions": [
                            {
                                "type": "user_field",
                                "targetValue": ["@example.com"],
                                "operator": "str_contains_any",
                                "field": "email",
                                "idType": "userID"
                            }
                        ],
                        "returnValue": true,
                        "id": "rule_employees",
                        "idType": "userID"
                    }
                ]
            }"#,
        )
        .unwrap();

        assert_that!(spec.kind).is_equal_to(SpecKind::FeatureGate);
        assert_that!(spec.enabled).is_true();
        assert_that!(spec.rules).has_length(1);
        assert_that!(spec.is_active()).is_false();
        assert_that!(spec.explicit_parameters).is_none();
    }

    #[test]
    fn is_active_is_tri_state() {
        let base = r#"{
            "name": "exp",
            "type": "dynamic_config",
            "salt": "s",
            "defaultValue": {},
            "enabled": true,
            "idType": "userID",
            "rules": []ACTIVE
        }"#;

        let absent: ConfigSpec = serde_json::from_str(&base.replace("ACTIVE", "")).unwrap();
        assert_that!(absent.is_active).is_none();
        assert_that!(absent.is_active()).is_false();

        let null: ConfigSpec =
            serde_json::from_str(&base.replace("ACTIVE", r#", "isActive": null"#)).unwrap();
        assert_that!(null.is_active).is_none();

        let active: ConfigSpec =
            serde_json::from_str(&base.replace("ACTIVE", r#", "isActive": true"#)).unwrap();
        assert_that!(active.is_active()).is_true();

        let inactive: ConfigSpec =
            serde_json::from_str(&base.replace("ACTIVE", r#", "isActive": false"#)).unwrap();
        assert_that!(inactive.is_active).contains_value(false);
        assert_that!(inactive.is_active()).is_false();
    }

    #[test]
    fn tolerates_null_and_unknown_metadata() {
        let spec: ConfigSpec = serde_json::from_str(
            r#"{
                "name": "layer",
                "type": "mystery_kind",
                "salt": "s",
                "defaultValue": {"p": 1},
                "enabled": true,
                "idType": "userID",
                "rules": [],
                "explicitParameters": null,
                "hasSharedParams": null,
                "somethingNew": {"ignored": true}
            }"#,
        )
        .unwrap();

        assert_that!(spec.kind).is_equal_to(SpecKind::Unknown);
        assert_that!(spec.explicit_parameters).is_none();
        assert_that!(spec.has_shared_params).is_false();
    }
}
