use serde::Serialize;

use crate::{
    configuration_store::ConfigSnapshot,
    rules::{eval_conditions, SubjectAttributes, UnknownConditionPolicy},
    sharder::BucketHasher,
};

/// Why a flag evaluated the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reason {
    /// The remote config override map had an entry for the flag.
    Override,
    /// No flag with that name; the caller's default was returned.
    FlagNotFound,
    /// Partial rollout decided by the identity's bucket.
    Rollout { bucket: u32 },
    /// Condition predicates decided.
    Conditions,
    /// The flag's own `enabled` field decided.
    Enabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlagEvaluation {
    pub enabled: bool,
    pub reason: Reason,
}

/// Answers "is flag X enabled for identity Y" against a snapshot. Holds no mutable state, so a
/// single instance can be shared between any number of readers.
#[derive(Debug, Clone, Default)]
pub struct Evaluator {
    hasher: BucketHasher,
    unknown_condition_policy: UnknownConditionPolicy,
}

impl Evaluator {
    pub fn new(
        hasher: BucketHasher,
        unknown_condition_policy: UnknownConditionPolicy,
    ) -> Evaluator {
        Evaluator {
            hasher,
            unknown_condition_policy,
        }
    }

    pub fn is_enabled(
        &self,
        snapshot: &ConfigSnapshot,
        flag_name: &str,
        identity: &str,
        attributes: &SubjectAttributes,
        default_value: bool,
    ) -> bool {
        self.evaluate(snapshot, flag_name, identity, attributes, default_value)
            .enabled
    }

    /// Resolve a flag, first match wins: override map, missing flag, partial rollout,
    /// conditions, `enabled`.
    pub fn evaluate(
        &self,
        snapshot: &ConfigSnapshot,
        flag_name: &str,
        identity: &str,
        attributes: &SubjectAttributes,
        default_value: bool,
    ) -> FlagEvaluation {
        let result = self.resolve(snapshot, flag_name, identity, attributes, default_value);
        log::trace!(target: "flagkit",
                    flag_name = flag_name,
                    identity = identity,
                    enabled = result.enabled,
                    reason:serde = result.reason;
                    "evaluated flag");
        result
    }

    fn resolve(
        &self,
        snapshot: &ConfigSnapshot,
        flag_name: &str,
        identity: &str,
        attributes: &SubjectAttributes,
        default_value: bool,
    ) -> FlagEvaluation {
        if let Some(&enabled) = snapshot.remote_config().feature_flags.get(flag_name) {
            return FlagEvaluation {
                enabled,
                reason: Reason::Override,
            };
        }

        let Some(flag) = snapshot.flag(flag_name) else {
            return FlagEvaluation {
                enabled: default_value,
                reason: Reason::FlagNotFound,
            };
        };

        if flag.rollout_percentage < 100.0 {
            let bucket = self.hasher.bucket(identity, flag_name);
            return FlagEvaluation {
                enabled: f64::from(bucket) < flag.rollout_percentage,
                reason: Reason::Rollout { bucket },
            };
        }

        if let Some(conditions) = &flag.conditions {
            return FlagEvaluation {
                enabled: eval_conditions(conditions, attributes, self.unknown_condition_policy),
                reason: Reason::Conditions,
            };
        }

        FlagEvaluation {
            enabled: flag.enabled,
            reason: Reason::Enabled,
        }
    }
}
