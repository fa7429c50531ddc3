use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use log::warn;
use regex::Regex;
use serde::{Deserialize, Deserializer};

use crate::user::AttributeValue;

// Inputs at or above this length are never handed to the regex engine.
const MATCH_INPUT_LIMIT: usize = 1000;

/// Signal raised when a rule references a condition kind or operator this
/// engine cannot evaluate. It is caught at the top of spec evaluation and
/// converted into a fail-closed result; it never escapes the evaluator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Unsupported(pub(crate) String);

impl fmt::Display for Unsupported {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unsupported {}", self.0)
    }
}

/// One condition inside a [ConfigRule]. All of a rule's conditions must pass
/// for the rule to match.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigCondition {
    #[serde(rename = "type")]
    pub kind: ConditionKind,
    #[serde(default)]
    pub target_value: Option<AttributeValue>,
    #[serde(default)]
    pub operator: Option<Operator>,
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub additional_values: HashMap<String, AttributeValue>,
    #[serde(default = "default_id_type")]
    pub id_type: String,
}

pub(crate) fn default_id_type() -> String {
    "userID".to_string()
}

/// An ordered rule inside a spec: conditions are AND-ed, and the rule's pass
/// percentage is applied only after every condition passes.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigRule {
    #[serde(default)]
    pub name: String,
    pub pass_percentage: f64,
    #[serde(default)]
    pub conditions: Vec<ConfigCondition>,
    #[serde(default)]
    pub return_value: serde_json::Value,
    pub id: String,
    #[serde(default)]
    pub salt: Option<String>,
    #[serde(default = "default_id_type")]
    pub id_type: String,
    #[serde(default)]
    pub config_delegate: Option<String>,
    #[serde(default)]
    pub is_experiment_group: Option<bool>,
    #[serde(default)]
    pub group_name: Option<String>,
}

impl ConfigRule {
    // Salt precedence for pass-percentage hashing: an explicit rule salt wins
    // over the rule id. Server-computed buckets depend on this exact order.
    pub(crate) fn bucketing_salt(&self) -> &str {
        self.salt.as_deref().unwrap_or(&self.id)
    }
}

/// The closed set of condition kinds. Tags are matched case-insensitively;
/// anything unrecognized (including conditions that would require executing
/// caller-supplied code) lands in [ConditionKind::Other] and fails closed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConditionKind {
    Public,
    PassGate,
    FailGate,
    IpBased,
    UaBased,
    UserField,
    EnvironmentField,
    CurrentTime,
    UserBucket,
    UnitId,
    Other(String),
}

impl From<&str> for ConditionKind {
    fn from(tag: &str) -> Self {
        match tag.to_lowercase().as_str() {
            "public" => ConditionKind::Public,
            "pass_gate" => ConditionKind::PassGate,
            "fail_gate" => ConditionKind::FailGate,
            "ip_based" => ConditionKind::IpBased,
            "ua_based" => ConditionKind::UaBased,
            "user_field" => ConditionKind::UserField,
            "environment_field" => ConditionKind::EnvironmentField,
            "current_time" => ConditionKind::CurrentTime,
            "user_bucket" => ConditionKind::UserBucket,
            "unit_id" => ConditionKind::UnitId,
            other => ConditionKind::Other(other.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for ConditionKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let tag = String::deserialize(deserializer)?;
        Ok(ConditionKind::from(tag.as_str()))
    }
}

/// The closed set of condition operators, matched case-insensitively from the
/// payload. Segment-list operators parse but always fail closed, as does
/// anything unrecognized.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operator {
    Gt,
    Gte,
    Lt,
    Lte,
    VersionGt,
    VersionGte,
    VersionLt,
    VersionLte,
    VersionEq,
    VersionNeq,
    Any,
    None,
    AnyCaseSensitive,
    NoneCaseSensitive,
    StrStartsWithAny,
    StrEndsWithAny,
    StrContainsAny,
    StrContainsNone,
    StrMatches,
    Eq,
    Neq,
    Before,
    After,
    On,
    InSegmentList,
    NotInSegmentList,
    Other(String),
}

impl From<&str> for Operator {
    fn from(tag: &str) -> Self {
        match tag.to_lowercase().as_str() {
            "gt" => Operator::Gt,
            "gte" => Operator::Gte,
            "lt" => Operator::Lt,
            "lte" => Operator::Lte,
            "version_gt" => Operator::VersionGt,
            "version_gte" => Operator::VersionGte,
            "version_lt" => Operator::VersionLt,
            "version_lte" => Operator::VersionLte,
            "version_eq" => Operator::VersionEq,
            "version_neq" => Operator::VersionNeq,
            "any" => Operator::Any,
            "none" => Operator::None,
            "any_case_sensitive" => Operator::AnyCaseSensitive,
            "none_case_sensitive" => Operator::NoneCaseSensitive,
            "str_starts_with_any" => Operator::StrStartsWithAny,
            "str_ends_with_any" => Operator::StrEndsWithAny,
            "str_contains_any" => Operator::StrContainsAny,
            "str_contains_none" => Operator::StrContainsNone,
            "str_matches" => Operator::StrMatches,
            "eq" => Operator::Eq,
            "neq" => Operator::Neq,
            "before" => Operator::Before,
            "after" => Operator::After,
            "on" => Operator::On,
            "in_segment_list" => Operator::InSegmentList,
            "not_in_segment_list" => Operator::NotInSegmentList,
            other => Operator::Other(other.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for Operator {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let tag = String::deserialize(deserializer)?;
        Ok(Operator::from(tag.as_str()))
    }
}

impl Operator {
    pub(crate) fn apply(
        &self,
        value: Option<&AttributeValue>,
        target: Option<&AttributeValue>,
    ) -> Result<bool, Unsupported> {
        let result = match self {
            Operator::Gt => number_op(value, target, |a, b| a > b),
            Operator::Gte => number_op(value, target, |a, b| a >= b),
            Operator::Lt => number_op(value, target, |a, b| a < b),
            Operator::Lte => number_op(value, target, |a, b| a <= b),

            Operator::VersionGt => version_op(value, target, |ord| ord == Ordering::Greater),
            Operator::VersionGte => version_op(value, target, |ord| ord != Ordering::Less),
            Operator::VersionLt => version_op(value, target, |ord| ord == Ordering::Less),
            Operator::VersionLte => version_op(value, target, |ord| ord != Ordering::Greater),
            Operator::VersionEq => version_op(value, target, |ord| ord == Ordering::Equal),
            Operator::VersionNeq => version_op(value, target, |ord| ord != Ordering::Equal),

            Operator::Any => set_op(value, target, true, |a, b| a == b),
            Operator::None => !set_op(value, target, true, |a, b| a == b),
            Operator::AnyCaseSensitive => set_op(value, target, false, |a, b| a == b),
            Operator::NoneCaseSensitive => !set_op(value, target, false, |a, b| a == b),

            Operator::StrStartsWithAny => set_op(value, target, true, |a, b| a.starts_with(b)),
            Operator::StrEndsWithAny => set_op(value, target, true, |a, b| a.ends_with(b)),
            Operator::StrContainsAny => set_op(value, target, true, |a, b| a.contains(b)),
            Operator::StrContainsNone => !set_op(value, target, true, |a, b| a.contains(b)),
            Operator::StrMatches => regex_op(value, target),

            Operator::Eq => loose_equals(value, target),
            Operator::Neq => !loose_equals(value, target),

            Operator::Before => date_op(value, target, |a, b| a < b),
            Operator::After => date_op(value, target, |a, b| a > b),
            Operator::On => date_op(value, target, |a, b| a.date_naive() == b.date_naive()),

            Operator::InSegmentList | Operator::NotInSegmentList => {
                return Err(Unsupported(format!("condition operator: {:?}", self)))
            }
            Operator::Other(tag) => {
                return Err(Unsupported(format!("condition operator: {}", tag)))
            }
        };
        Ok(result)
    }
}

fn number_op<F: Fn(f64, f64) -> bool>(
    value: Option<&AttributeValue>,
    target: Option<&AttributeValue>,
    f: F,
) -> bool {
    match (
        value.and_then(AttributeValue::to_f64),
        target.and_then(AttributeValue::to_f64),
    ) {
        (Some(a), Some(b)) => f(a, b),
        _ => false,
    }
}

fn version_op<F: Fn(Ordering) -> bool>(
    value: Option<&AttributeValue>,
    target: Option<&AttributeValue>,
    f: F,
) -> bool {
    match (
        value.and_then(AttributeValue::as_str),
        target.and_then(AttributeValue::as_str),
    ) {
        (Some(a), Some(b)) => compare_versions(a, b).map(f).unwrap_or(false),
        _ => false,
    }
}

/// Compare two version strings without their extensions: any `-suffix` is
/// stripped, the remainders are compared as dot-separated numeric segments
/// left to right, and missing trailing segments count as 0. A non-numeric
/// segment makes the versions incomparable.
pub(crate) fn compare_versions(first: &str, second: &str) -> Option<Ordering> {
    let first = strip_version_extension(first);
    let second = strip_version_extension(second);
    if first.is_empty() || second.is_empty() {
        return None;
    }

    let parts1: Vec<&str> = first.split('.').collect();
    let parts2: Vec<&str> = second.split('.').collect();
    for i in 0..parts1.len().max(parts2.len()) {
        let n1 = parts1.get(i).unwrap_or(&"0").parse::<f64>().ok()?;
        let n2 = parts2.get(i).unwrap_or(&"0").parse::<f64>().ok()?;
        match n1.partial_cmp(&n2)? {
            Ordering::Equal => continue,
            unequal => return Some(unequal),
        }
    }
    Some(Ordering::Equal)
}

fn strip_version_extension(version: &str) -> &str {
    match version.find('-') {
        Some(idx) => &version[..idx],
        None => version,
    }
}

// The set-style operators stringify the single user value and test it against
// each element of the target array. A non-array target never matches.
fn set_op<F: Fn(&str, &str) -> bool>(
    value: Option<&AttributeValue>,
    target: Option<&AttributeValue>,
    ignore_case: bool,
    f: F,
) -> bool {
    let value = match value.and_then(AttributeValue::to_match_string) {
        Some(v) => v,
        None => return false,
    };
    let candidates = match target {
        Some(AttributeValue::Array(values)) => values,
        _ => return false,
    };

    candidates
        .iter()
        .filter_map(AttributeValue::to_match_string)
        .any(|candidate| {
            if ignore_case {
                f(&value.to_lowercase(), &candidate.to_lowercase())
            } else {
                f(&value, &candidate)
            }
        })
}

fn regex_op(value: Option<&AttributeValue>, target: Option<&AttributeValue>) -> bool {
    let value = match value.and_then(AttributeValue::to_match_string) {
        Some(v) => v,
        None => return false,
    };
    // Cost bound, not an error: oversized inputs are treated as non-matching
    // without running the regex.
    if value.len() >= MATCH_INPUT_LIMIT {
        return false;
    }
    let pattern = match target.and_then(AttributeValue::as_str) {
        Some(p) => p,
        None => return false,
    };
    match Regex::new(pattern) {
        Ok(re) => re.is_match(&value),
        Err(e) => {
            warn!("invalid pattern for 'str_matches' operator ({}): {}", e, pattern);
            false
        }
    }
}

// Equality in the loose sense of the source payloads: null and a missing
// attribute are equal, and numeric strings compare as numbers.
fn loose_equals(value: Option<&AttributeValue>, target: Option<&AttributeValue>) -> bool {
    let value = match value {
        None | Some(AttributeValue::Null) => None,
        Some(other) => Some(other),
    };
    let target = match target {
        None | Some(AttributeValue::Null) => None,
        Some(other) => Some(other),
    };
    match (value, target) {
        (None, None) => true,
        (Some(a), Some(b)) => match (a.to_f64(), b.to_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => a == b,
        },
        _ => false,
    }
}

fn date_op<F: Fn(chrono::DateTime<chrono::Utc>, chrono::DateTime<chrono::Utc>) -> bool>(
    value: Option<&AttributeValue>,
    target: Option<&AttributeValue>,
    f: F,
) -> bool {
    match (
        value.and_then(AttributeValue::to_datetime),
        target.and_then(AttributeValue::to_datetime),
    ) {
        (Some(a), Some(b)) => f(a, b),
        _ => false,
    }
}
