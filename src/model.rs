use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{rules::Condition, Error, Result};

/// Opaque JSON object carried through from the backend (variant configs, metadata, UI config).
pub type ConfigMap = serde_json::Map<String, serde_json::Value>;

pub type Timestamp = DateTime<Utc>;

/// One of the three backend resources that make up a [`ConfigSnapshot`](crate::ConfigSnapshot).
/// Each resource is fetched, cached, and falls back independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    RemoteConfig,
    FeatureFlags,
    Experiments,
}

impl Resource {
    pub const ALL: [Resource; 3] = [
        Resource::RemoteConfig,
        Resource::FeatureFlags,
        Resource::Experiments,
    ];

    /// Backend table name. Also used as the change notification channel key.
    pub fn table(self) -> &'static str {
        match self {
            Resource::RemoteConfig => "remote_config",
            Resource::FeatureFlags => "feature_flags",
            Resource::Experiments => "experiments",
        }
    }

    /// Local cache key holding the last-known-good copy.
    pub fn cache_key(self) -> &'static str {
        self.table()
    }

    pub fn from_table(table: &str) -> Option<Resource> {
        Resource::ALL.into_iter().find(|r| r.table() == table)
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table())
    }
}

/// The single app-wide settings document.
///
/// `feature_flags` is a flat override map: when a flag name is present here, its value wins over
/// the richer [`FeatureFlag`] entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub app_version: String,
    pub min_version: String,
    pub force_update: bool,
    pub maintenance_mode: bool,
    pub api_endpoints: HashMap<String, String>,
    pub feature_flags: HashMap<String, bool>,
    pub experiments: HashMap<String, String>,
    pub ui_config: ConfigMap,
    pub content: ConfigMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureFlag {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub enabled: bool,
    #[serde(default = "full_rollout")]
    pub rollout_percentage: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<HashMap<String, Condition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variants: Option<Vec<Variant>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ConfigMap>,
}

fn full_rollout() -> f64 {
    100.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub weight: f64,
    #[serde(default)]
    pub config: ConfigMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Draft,
    Running,
    Completed,
    /// Any status this version does not know about. Never participates in assignment.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub status: ExperimentStatus,
    pub variants: Vec<Variant>,
    #[serde(default)]
    pub metrics: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<Timestamp>,
}

/// Outcome of checking an experiment's variant weights.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WeightCheck {
    /// Weights sum to 100.
    Exact,
    /// Weights are usable but sum to something other than 100.
    Skewed(f64),
    /// No variants, a negative or non-finite weight, or a non-positive total.
    Invalid,
}

impl Experiment {
    pub fn is_running(&self) -> bool {
        self.status == ExperimentStatus::Running
    }

    /// Return `true` if the experiment accepts new assignments at `now`.
    pub fn is_active_at(&self, now: Timestamp) -> bool {
        let forbidden = matches!(self.start_date, Some(t) if now < t)
            || matches!(self.end_date, Some(t) if now > t);
        self.is_running() && !forbidden
    }

    pub fn total_weight(&self) -> f64 {
        self.variants.iter().map(|v| v.weight).sum()
    }

    pub fn check_weights(&self) -> WeightCheck {
        if self.variants.is_empty()
            || self
                .variants
                .iter()
                .any(|v| !v.weight.is_finite() || v.weight < 0.0)
        {
            return WeightCheck::Invalid;
        }
        let total = self.total_weight();
        if total <= 0.0 {
            WeightCheck::Invalid
        } else if (total - 100.0).abs() < 1e-9 {
            WeightCheck::Exact
        } else {
            WeightCheck::Skewed(total)
        }
    }

    pub fn variant(&self, variant_id: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.id == variant_id)
    }
}

/// `TryParse` allows a single row to fail parsing without failing the parsing of the whole
/// resource.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TryParse<T> {
    Parsed(T),
    ParseFailed(serde_json::Value),
}

impl<T> From<TryParse<T>> for Option<T> {
    fn from(value: TryParse<T>) -> Self {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

/// Keep successfully parsed rows and log the ones that failed.
pub(crate) fn parsed_rows<T>(rows: Vec<TryParse<T>>, resource: Resource) -> Vec<T> {
    rows.into_iter()
        .filter_map(|row| match row {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(raw) => {
                log::warn!(target: "flagkit",
                           resource:display = resource,
                           row:serde = raw;
                           "skipping row that failed to parse");
                None
            }
        })
        .collect()
}

/// Last line of the offline fallback chain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
    pub remote_config: RemoteConfig,
    pub feature_flags: Vec<FeatureFlag>,
    pub experiments: Vec<Experiment>,
}

const COMPILED_DEFAULTS: &str = include_str!("defaults.json");

impl Defaults {
    /// Parse the defaults embedded in the binary.
    ///
    /// A failure here is a packaging error, not a runtime condition.
    pub fn compiled() -> Result<Defaults> {
        serde_json::from_str(COMPILED_DEFAULTS)
            .map_err(|err| Error::MissingDefaults(std::sync::Arc::new(err)))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::{
        Defaults, Experiment, ExperimentStatus, FeatureFlag, Resource, TryParse, WeightCheck,
    };

    fn experiment(weights: &[f64]) -> Experiment {
        serde_json::from_value(serde_json::json!({
            "id": "exp",
            "status": "running",
            "variants": weights
                .iter()
                .enumerate()
                .map(|(i, w)| serde_json::json!({"id": format!("v{i}"), "weight": w}))
                .collect::<Vec<_>>(),
        }))
        .unwrap()
    }

    #[test]
    fn compiled_defaults_parse() {
        let defaults = Defaults::compiled().unwrap();
        assert_eq!(
            defaults.remote_config.feature_flags.get("daily_challenge"),
            Some(&true)
        );
        assert!(!defaults.remote_config.maintenance_mode);
    }

    #[test]
    fn flag_defaults_to_full_rollout() {
        let flag: FeatureFlag =
            serde_json::from_str(r#"{"name": "leaderboard", "enabled": true}"#).unwrap();
        assert_eq!(flag.rollout_percentage, 100.0);
        assert!(flag.conditions.is_none());
    }

    #[test]
    fn parse_partially_if_unexpected() {
        let rows: Vec<TryParse<FeatureFlag>> = serde_json::from_str(
            r#"[
                {"name": "ok", "enabled": true, "rollout_percentage": 50},
                {"name": "broken", "enabled": "yes"}
            ]"#,
        )
        .unwrap();
        let flags = super::parsed_rows(rows, Resource::FeatureFlags);
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].name, "ok");
    }

    #[test]
    fn unknown_status_is_not_running() {
        let experiment: Experiment = serde_json::from_str(
            r#"{"id": "e", "status": "paused", "variants": []}"#,
        )
        .unwrap();
        assert_eq!(experiment.status, ExperimentStatus::Unknown);
        assert!(!experiment.is_running());
    }

    #[test]
    fn weight_checks() {
        assert_eq!(experiment(&[30.0, 70.0]).check_weights(), WeightCheck::Exact);
        assert_eq!(
            experiment(&[1.0, 1.0]).check_weights(),
            WeightCheck::Skewed(2.0)
        );
        assert_eq!(experiment(&[]).check_weights(), WeightCheck::Invalid);
        assert_eq!(experiment(&[0.0, 0.0]).check_weights(), WeightCheck::Invalid);
        assert_eq!(
            experiment(&[-10.0, 110.0]).check_weights(),
            WeightCheck::Invalid
        );
    }

    #[test]
    fn date_window() {
        let now = Utc::now();
        let mut e = experiment(&[100.0]);
        assert!(e.is_active_at(now));

        e.start_date = Some(now + Duration::days(1));
        assert!(!e.is_active_at(now));

        e.start_date = Some(now - Duration::days(2));
        e.end_date = Some(now - Duration::days(1));
        assert!(!e.is_active_at(now));
    }

    #[test]
    fn resource_tables() {
        for resource in Resource::ALL {
            assert_eq!(Resource::from_table(resource.table()), Some(resource));
        }
        assert_eq!(Resource::from_table("quiz_questions"), None);
    }
}
