//! An offline-first feature flag and experiment assignment engine.
//!
//! # Overview
//!
//! The crate revolves around a [`Client`] that answers two questions for an [`Identity`] (a
//! signed-in user id, or a persisted per-installation device id):
//!
//! - is feature flag X enabled? ([`Client::is_enabled`])
//! - which variant of experiment Y applies? ([`Client::get_variant`])
//!
//! Answers are computed against an immutable [`ConfigSnapshot`] holding the remote config
//! document, the feature flags, and the running experiments. Each of the three resources is
//! resolved independently through the fallback chain `live fetch > cached copy > compiled-in
//! default`, so a usable answer is available without network access. Snapshots are replaced
//! wholesale by [`Client::refresh`] or by a [`SyncSubscriber`] reacting to change notifications.
//!
//! Experiment assignments are sticky: once an identity is assigned a variant, it keeps it for the
//! life of the experiment. New assignments are reported to an [`AssignmentLogger`] and recorded
//! with the backend.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum. Only configuration problems (bad base URL, missing
//! API key, unusable compiled defaults) are returned to the caller. Network, cache, and storage
//! failures are logged and degrade to the fallback chain; evaluation never fails.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate with the `flagkit`
//! target. Consider integrating a `log`-compatible logger implementation for better visibility
//! into fetches, fallbacks, and assignments.
//!
//! # Examples
//!
//! A runnable example lives in `demos/simple`.

#![warn(rustdoc::missing_crate_level_docs)]

mod assignment;
mod assignment_logger;
mod client;
mod config;
mod configuration_store;
mod error;
mod eval;
mod fetcher;
mod identity;
mod model;
mod rules;
mod sharder;
mod storage;
mod sync;

#[cfg(test)]
mod testing;

pub use assignment::{Assignment, AssignmentEngine, AssignmentRecord};
pub use assignment_logger::{AssignmentEvent, AssignmentLogger, ExperimentEvent};
pub use client::Client;
pub use config::ClientConfig;
pub use configuration_store::{
    ConfigSnapshot, ConfigStore, ConfigStoreConfig, Source, WeightPolicy,
};
pub use error::{Error, Result};
pub use eval::{Evaluator, FlagEvaluation, Reason};
pub use fetcher::{ConfigBackend, HttpBackend};
pub use identity::{generate_device_id, Identity, IdentityProvider};
pub use model::{
    ConfigMap, Defaults, Experiment, ExperimentStatus, FeatureFlag, RemoteConfig, Resource,
    Timestamp, Variant, WeightCheck,
};
pub use rules::{
    AttributeValue, Condition, ConditionValue, Operator, SubjectAttributes,
    UnknownConditionPolicy, Value,
};
pub use sharder::{BucketHasher, BucketingMode, LegacySharder, Md5Sharder, Sharder, TOTAL_BUCKETS};
pub use storage::{FileStore, InMemoryStore, KeyValueStore};
pub use sync::{
    ChangeFeed, ChangeListener, ChangeNotification, LocalChangeFeed, RefreshTarget, SyncConfig,
    SyncSubscriber,
};
