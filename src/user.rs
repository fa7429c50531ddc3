use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

const FLOAT_TO_INT_MAX: f64 = 9007199254740991_f64;

/// Converting float to int has undefined behaviour for huge floats. Refuse to
/// convert floats with magnitude greater than 2**53 - 1, after which 64-bit
/// floats no longer retain integer precision.
pub(crate) fn f64_to_i64_safe(f: f64) -> Option<i64> {
    if f.abs() <= FLOAT_TO_INT_MAX {
        Some(f as i64)
    } else {
        None
    }
}

/// Milliseconds since the Unix epoch, as observed by the `current_time`
/// condition.
pub(crate) fn now_millis() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as f64)
        .unwrap_or(0.0)
}

/// AttributeValue is an enum representing possible values that can be stored
/// in a user attribute or a condition target.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// Used when storing a string value.
    String(String),
    /// Used when storing an array of AttributeValues.
    Array(Vec<AttributeValue>),
    /// Used when storing a number.
    Number(f64),
    /// Used when storing a boolean.
    Bool(bool),
    /// Used when storing a complex map of values.
    Object(HashMap<String, AttributeValue>),
    /// Used to represent a null value.
    Null,
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> AttributeValue {
        AttributeValue::String(s.to_owned())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> AttributeValue {
        AttributeValue::String(s)
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> AttributeValue {
        AttributeValue::Bool(b)
    }
}

impl From<i64> for AttributeValue {
    fn from(i: i64) -> Self {
        AttributeValue::Number(i as f64)
    }
}

impl From<f64> for AttributeValue {
    fn from(f: f64) -> Self {
        AttributeValue::Number(f)
    }
}

impl<T> From<Vec<T>> for AttributeValue
where
    AttributeValue: From<T>,
{
    fn from(v: Vec<T>) -> AttributeValue {
        AttributeValue::Array(v.into_iter().map(AttributeValue::from).collect())
    }
}

impl AttributeValue {
    /// Returns None unless self is a String. It will not convert.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the wrapped value as a float for numeric types. Numeric strings
    /// are converted, matching the coercion the rule payloads were authored
    /// against. Everything else returns None.
    pub fn to_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(f) => Some(*f),
            AttributeValue::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    /// Returns None unless self is a bool. It will not convert.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Attempt to convert any of the following into a chrono::DateTime in UTC:
    ///  * RFC3339/ISO8601 timestamp (example: "2016-04-16T17:09:12.759-07:00")
    ///  * calendar date (example: "2016-04-16")
    ///  * Unix epoch milliseconds as a number or numeric string
    /// It will return None if no conversion is possible.
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            AttributeValue::Number(millis) => epoch_millis_to_datetime(*millis),
            AttributeValue::String(s) => DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
                .or_else(|| {
                    NaiveDate::parse_from_str(s, "%Y-%m-%d")
                        .ok()
                        .and_then(|d| d.and_hms_opt(0, 0, 0))
                        .map(|ndt| Utc.from_utc_datetime(&ndt))
                })
                .or_else(|| s.trim().parse::<f64>().ok().and_then(epoch_millis_to_datetime)),
            _ => None,
        }
    }

    /// The string form used by the string operators. Arrays, objects and null
    /// never participate in string matching.
    pub(crate) fn to_match_string(&self) -> Option<String> {
        match self {
            AttributeValue::String(s) => Some(s.clone()),
            AttributeValue::Number(f) => Some(if *f == f.trunc() && f64_to_i64_safe(*f).is_some() {
                format!("{}", *f as i64)
            } else {
                format!("{}", f)
            }),
            AttributeValue::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

fn epoch_millis_to_datetime(millis: f64) -> Option<DateTime<Utc>> {
    f64_to_i64_safe(millis).and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

/// A User describes the person a gate, config, experiment or layer is being
/// evaluated for. All properties are optional; conditions that reference a
/// missing attribute simply do not match.
///
/// Users are built with [User::with_user_id] or [User::anonymous]:
///
/// ```
/// # use switchboard_client_sdk_evaluation::User;
/// let user = User::with_user_id("user-123")
///     .email("user-123@example.com")
///     .build();
/// ```
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(rename = "userID", skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    locale: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    app_version: Option<String>,

    #[serde(default)]
    custom: HashMap<String, AttributeValue>,
    #[serde(default, skip_serializing)]
    private_attributes: HashMap<String, AttributeValue>,
    #[serde(rename = "customIDs", default)]
    custom_ids: HashMap<String, String>,
    #[serde(default)]
    environment: HashMap<String, String>,
}

impl User {
    /// Create a builder for a user identified by `user_id`.
    pub fn with_user_id(user_id: impl Into<String>) -> UserBuilder {
        UserBuilder::new(Some(user_id.into()))
    }

    /// Create a builder for a user with no unit id. Conditions and rollouts
    /// keyed on "userID" hash the empty string for such users.
    pub fn anonymous() -> UserBuilder {
        UserBuilder::new(None)
    }

    /// Resolve the unit id for the given id type: the user id for "userID"
    /// (any casing), otherwise the matching custom id.
    pub fn unit_id(&self, id_type: &str) -> Option<&str> {
        if !id_type.eq_ignore_ascii_case("userid") {
            return self
                .custom_ids
                .get(id_type)
                .or_else(|| self.custom_ids.get(&id_type.to_lowercase()))
                .map(String::as_str);
        }
        self.user_id.as_deref()
    }

    /// Attribute lookup used by the `user_field`, `ip_based` and `ua_based`
    /// conditions. Priority order: direct field, case-insensitive field,
    /// custom attributes (direct then case-insensitive), private attributes
    /// (direct then case-insensitive).
    pub fn get_attribute(&self, field: &str) -> Option<AttributeValue> {
        self.direct_field(field)
            .or_else(|| self.direct_field_ci(field))
            .or_else(|| lookup(&self.custom, field))
            .or_else(|| lookup(&self.private_attributes, field))
    }

    /// Case-insensitive lookup in the user's environment map.
    pub fn get_environment(&self, field: &str) -> Option<AttributeValue> {
        let wanted = field.to_lowercase();
        self.environment
            .iter()
            .find(|(k, _)| k.to_lowercase() == wanted)
            .map(|(_, v)| AttributeValue::String(v.clone()))
    }

    fn direct_field(&self, field: &str) -> Option<AttributeValue> {
        let v = match field {
            "userID" => &self.user_id,
            "email" => &self.email,
            "ip" => &self.ip,
            "userAgent" => &self.user_agent,
            "country" => &self.country,
            "locale" => &self.locale,
            "appVersion" => &self.app_version,
            _ => return None,
        };
        v.clone().map(AttributeValue::String)
    }

    fn direct_field_ci(&self, field: &str) -> Option<AttributeValue> {
        let v = match field.to_lowercase().as_str() {
            "userid" => &self.user_id,
            "email" => &self.email,
            "ip" => &self.ip,
            "useragent" => &self.user_agent,
            "country" => &self.country,
            "locale" => &self.locale,
            "appversion" => &self.app_version,
            _ => return None,
        };
        v.clone().map(AttributeValue::String)
    }
}

fn lookup(map: &HashMap<String, AttributeValue>, field: &str) -> Option<AttributeValue> {
    if let Some(v) = map.get(field) {
        return Some(v.clone());
    }
    let wanted = field.to_lowercase();
    map.iter()
        .find(|(k, _)| k.to_lowercase() == wanted)
        .map(|(_, v)| v.clone())
}

/// Contains methods for configuring a user.
pub struct UserBuilder {
    user_id: Option<String>,
    email: Option<String>,
    ip: Option<String>,
    user_agent: Option<String>,
    country: Option<String>,
    locale: Option<String>,
    app_version: Option<String>,
    custom: HashMap<String, AttributeValue>,
    private_attributes: HashMap<String, AttributeValue>,
    custom_ids: HashMap<String, String>,
    environment: HashMap<String, String>,
}

impl UserBuilder {
    fn new(user_id: Option<String>) -> Self {
        Self {
            user_id,
            email: None,
            ip: None,
            user_agent: None,
            country: None,
            locale: None,
            app_version: None,
            custom: HashMap::new(),
            private_attributes: HashMap::new(),
            custom_ids: HashMap::new(),
            environment: HashMap::new(),
        }
    }

    /// Set the user's email address.
    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Set the user's IP address.
    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    /// Set the user's user-agent string.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Set the user's country.
    pub fn country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    /// Set the user's locale.
    pub fn locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }

    /// Set the user's application version.
    pub fn app_version(mut self, app_version: impl Into<String>) -> Self {
        self.app_version = Some(app_version.into());
        self
    }

    /// Set the user's custom attributes, replacing any existing ones.
    pub fn custom(mut self, custom: HashMap<String, AttributeValue>) -> Self {
        self.custom = custom;
        self
    }

    /// Set the user's private attributes. These participate in condition
    /// matching but are never serialized.
    pub fn private_attributes(mut self, attrs: HashMap<String, AttributeValue>) -> Self {
        self.private_attributes = attrs;
        self
    }

    /// Add a single custom id, e.g. a stable device id.
    pub fn custom_id(mut self, id_type: impl Into<String>, id: impl Into<String>) -> Self {
        self.custom_ids.insert(id_type.into(), id.into());
        self
    }

    /// Set the user's environment map (e.g. tier).
    pub fn environment(mut self, environment: HashMap<String, String>) -> Self {
        self.environment = environment;
        self
    }

    /// Construct the [User].
    pub fn build(self) -> User {
        User {
            user_id: self.user_id,
            email: self.email,
            ip: self.ip,
            user_agent: self.user_agent,
            country: self.country,
            locale: self.locale,
            app_version: self.app_version,
            custom: self.custom,
            private_attributes: self.private_attributes,
            custom_ids: self.custom_ids,
            environment: self.environment,
        }
    }
}
