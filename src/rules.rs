//! Condition predicates that gate a feature flag on attributes of the evaluating installation.
//!
//! A flag's `conditions` map is keyed by attribute. Each entry is either an explicit
//! `{"operator": ..., "value": ...}` object or a shorthand value whose meaning depends on the key:
//!
//! | key                       | scalar                   | array   |
//! |---------------------------|--------------------------|---------|
//! | `platform`, `country`     | equals                   | one of  |
//! | `version`                 | at least (semver)        | one of  |
//! | `userLevel`/`user_level`  | at least (numeric)       | one of  |
//!
//! All conditions must pass (AND). Shorthand entries under any other key are "unrecognized" and
//! resolved by [`UnknownConditionPolicy`].
use std::collections::HashMap;

use derive_more::From;
use regex::Regex;
use semver::Version;
use serde::{Deserialize, Serialize};

pub type SubjectAttributes = HashMap<String, AttributeValue>;

#[derive(Debug, Serialize, Deserialize, PartialEq, PartialOrd, From, Clone)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Number(f64),
    Boolean(bool),
    Null,
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

/// What to do with a condition whose key is not recognized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnknownConditionPolicy {
    /// Treat the condition as passing (legacy behavior).
    #[default]
    Ignore,
    /// Treat the condition as failing, which disables the flag.
    FailClosed,
}

impl UnknownConditionPolicy {
    fn resolve(self, key: &str) -> bool {
        log::trace!(target: "flagkit", condition_key = key, policy:? = self; "unrecognized condition key");
        matches!(self, UnknownConditionPolicy::Ignore)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    Explicit {
        operator: Operator,
        value: ConditionValue,
    },
    Shorthand(ConditionValue),
    /// Anything else (nested objects, nulls). Handled like an unrecognized key.
    Unsupported(serde_json::Value),
}

/// Evaluate `conditions` against `attributes` with AND semantics.
pub fn eval_conditions(
    conditions: &HashMap<String, Condition>,
    attributes: &SubjectAttributes,
    policy: UnknownConditionPolicy,
) -> bool {
    conditions
        .iter()
        .all(|(key, condition)| condition.eval(key, attributes, policy))
}

impl Condition {
    pub fn eval(
        &self,
        key: &str,
        attributes: &SubjectAttributes,
        policy: UnknownConditionPolicy,
    ) -> bool {
        match self {
            Condition::Explicit { operator, value } => {
                let attribute = KnownKey::parse(key).map_or(key, |known| known.attribute());
                operator.eval(attributes.get(attribute), value)
            }
            Condition::Shorthand(value) => match KnownKey::parse(key) {
                Some(known) => known
                    .shorthand_operator(value)
                    .eval(attributes.get(known.attribute()), value),
                None => policy.resolve(key),
            },
            Condition::Unsupported(_) => policy.resolve(key),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KnownKey {
    Platform,
    Version,
    UserLevel,
    Country,
}

impl KnownKey {
    fn parse(key: &str) -> Option<KnownKey> {
        match key {
            "platform" => Some(KnownKey::Platform),
            "version" => Some(KnownKey::Version),
            "userLevel" | "user_level" => Some(KnownKey::UserLevel),
            "country" => Some(KnownKey::Country),
            _ => None,
        }
    }

    /// Attribute name the key reads from.
    fn attribute(self) -> &'static str {
        match self {
            KnownKey::Platform => "platform",
            KnownKey::Version => "version",
            KnownKey::UserLevel => "user_level",
            KnownKey::Country => "country",
        }
    }

    fn shorthand_operator(self, value: &ConditionValue) -> Operator {
        match (self, value) {
            (_, ConditionValue::Multiple(_)) => Operator::OneOf,
            (KnownKey::Platform | KnownKey::Country, _) => Operator::OneOf,
            (KnownKey::Version | KnownKey::UserLevel, _) => Operator::Gte,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionValue {
    Multiple(Vec<Value>),
    Single(Value),
}

impl<T: Into<Value>> From<T> for ConditionValue {
    fn from(value: T) -> Self {
        Self::Single(value.into())
    }
}
impl<T: Into<Value>> From<Vec<T>> for ConditionValue {
    fn from(value: Vec<T>) -> Self {
        Self::Multiple(value.into_iter().map(Into::into).collect())
    }
}

/// Scalar JSON value used in conditions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, From)]
#[serde(untagged)]
pub enum Value {
    Boolean(bool),
    Number(f64),
    String(String),
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operator {
    Matches,
    NotMatches,
    Gte,
    Gt,
    Lte,
    Lt,
    OneOf,
    NotOneOf,
    IsNull,
}

impl Operator {
    /// Applying `Operator` to the values. Returns `false` if the operator cannot be applied or
    /// there's a misconfiguration.
    pub fn eval(
        &self,
        attribute: Option<&AttributeValue>,
        condition_value: &ConditionValue,
    ) -> bool {
        self.try_eval(attribute, condition_value).unwrap_or(false)
    }

    /// Try applying `Operator` to the values, returning `None` if the operator cannot be applied.
    fn try_eval(
        &self,
        attribute: Option<&AttributeValue>,
        condition_value: &ConditionValue,
    ) -> Option<bool> {
        match self {
            Self::Matches | Self::NotMatches => {
                let s = match attribute {
                    Some(AttributeValue::String(s)) => s,
                    _ => return None,
                };
                let regex = match condition_value {
                    ConditionValue::Single(Value::String(s)) => Regex::new(s).ok()?,
                    _ => return None,
                };
                let matches = regex.is_match(s);
                Some(if *self == Self::Matches {
                    matches
                } else {
                    !matches
                })
            }

            Self::OneOf | Self::NotOneOf => {
                let s = match attribute {
                    Some(AttributeValue::String(s)) => s.clone(),
                    Some(AttributeValue::Number(n)) => n.to_string(),
                    Some(AttributeValue::Boolean(b)) => b.to_string(),
                    _ => return None,
                };
                let values = match condition_value {
                    ConditionValue::Multiple(v) => v.as_slice(),
                    ConditionValue::Single(v) => std::slice::from_ref(v),
                };
                let is_one_of = values.iter().any(|v| match v {
                    Value::String(v) => v == &s,
                    Value::Number(n) => n.to_string() == s,
                    Value::Boolean(_) => false,
                });
                Some(if *self == Self::OneOf {
                    is_one_of
                } else {
                    !is_one_of
                })
            }

            Self::IsNull => {
                let is_null =
                    attribute.is_none() || attribute.is_some_and(|v| v == &AttributeValue::Null);
                match condition_value {
                    ConditionValue::Single(Value::Boolean(true)) => Some(is_null),
                    ConditionValue::Single(Value::Boolean(false)) => Some(!is_null),
                    _ => None,
                }
            }

            Self::Gte | Self::Gt | Self::Lte | Self::Lt => {
                let condition_value = match condition_value {
                    ConditionValue::Single(v) => v,
                    ConditionValue::Multiple(_) => return None,
                };

                // Two version-like strings compare as versions, so "1.10" sorts after "1.9".
                if let (Value::String(condition), Some(AttributeValue::String(attribute))) =
                    (condition_value, attribute)
                {
                    if let (Some(condition), Some(attribute)) =
                        (parse_version(condition), parse_version(attribute))
                    {
                        return Some(self.compare(&attribute, &condition));
                    }
                }

                let condition_value = match condition_value {
                    Value::Number(n) => *n,
                    Value::String(s) => s.parse().ok()?,
                    Value::Boolean(_) => return None,
                };
                let attribute_value = match attribute {
                    Some(AttributeValue::Number(n)) => *n,
                    Some(AttributeValue::String(s)) => s.parse().ok()?,
                    _ => return None,
                };
                Some(self.compare(&attribute_value, &condition_value))
            }
        }
    }

    fn compare<T: PartialOrd>(&self, attribute: &T, condition: &T) -> bool {
        match self {
            Self::Gt => attribute > condition,
            Self::Gte => attribute >= condition,
            Self::Lt => attribute < condition,
            Self::Lte => attribute <= condition,
            _ => false,
        }
    }
}

/// Semver, also accepting `v` prefixes and the `major` and `major.minor` shorthands.
pub(crate) fn parse_version(version: &str) -> Option<Version> {
    let version = version.trim().trim_start_matches('v');
    let padded = match version.matches('.').count() {
        0 => format!("{version}.0.0"),
        1 => format!("{version}.0"),
        _ => version.to_owned(),
    };
    Version::parse(&padded).ok()
}
