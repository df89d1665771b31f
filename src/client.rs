use std::{
    borrow::Cow,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError, RwLock,
    },
};

use chrono::Utc;
use serde::de::DeserializeOwned;

use crate::{
    assignment::AssignmentEngine,
    assignment_logger::{AssignmentEvent, ExperimentEvent},
    config::BackendConfig,
    configuration_store::{ConfigSnapshot, ConfigStore, ConfigStoreConfig, Source},
    eval::Evaluator,
    fetcher::{ConfigBackend, HttpBackend},
    identity::{Identity, IdentityProvider},
    model::{ConfigMap, Resource},
    rules::{parse_version, AttributeValue, SubjectAttributes},
    sharder::BucketHasher,
    sync::{ChangeFeed, RefreshTarget, SyncConfig, SyncSubscriber},
    AssignmentLogger, ClientConfig, Result,
};

/// Entry point for flag evaluation and experiment assignment.
///
/// In order to create a client instance, first create [`ClientConfig`]. Cloning a `Client` is
/// cheap and every clone shares the same state.
///
/// # Examples
/// ```
/// # use flagkit::{Client, ClientConfig};
/// let client = ClientConfig::new("https://project.supabase.co/rest/v1", "api-key")
///     .to_client()
///     .unwrap();
/// // Before `initialize` every read returns the caller's default.
/// assert!(client.is_enabled("leaderboard", true));
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    store: ConfigStore,
    backend: Arc<dyn ConfigBackend>,
    identity: IdentityProvider,
    user_id: RwLock<Option<String>>,
    /// Serializes first-time initialization only; readers check `initialized`.
    init_lock: Mutex<()>,
    initialized: AtomicBool,
    evaluator: Evaluator,
    assignments: AssignmentEngine,
    assignment_logger: Arc<dyn AssignmentLogger + Send + Sync>,
    app_version: Option<String>,
    attributes: SubjectAttributes,
    sync: SyncConfig,
}

impl Client {
    /// Create a new `Client` using the specified configuration.
    ///
    /// Nothing is fetched until [`Client::initialize`].
    pub fn new(config: ClientConfig) -> Result<Client> {
        let backend: Arc<dyn ConfigBackend> = match config.backend {
            BackendConfig::Http { base_url, api_key } => Arc::new(HttpBackend::new(
                &base_url,
                &api_key,
                config.fetch_timeout,
            )?),
            BackendConfig::Custom(backend) => backend,
        };

        let platform = match config.attributes.get("platform") {
            Some(AttributeValue::String(platform)) => platform.clone(),
            _ => std::env::consts::OS.to_owned(),
        };
        let hasher = BucketHasher::new(config.sharder, config.bucketing_mode);

        let store = ConfigStore::new(
            backend.clone(),
            config.storage.clone(),
            ConfigStoreConfig {
                fetch_timeout: config.fetch_timeout,
                weight_policy: config.weight_policy,
                defaults: config.defaults,
            },
        );

        Ok(Client {
            inner: Arc::new(ClientInner {
                store,
                backend,
                identity: IdentityProvider::new(config.storage.clone(), platform),
                user_id: RwLock::new(None),
                init_lock: Mutex::new(()),
                initialized: AtomicBool::new(false),
                evaluator: Evaluator::new(hasher.clone(), config.unknown_condition_policy),
                assignments: AssignmentEngine::new(hasher, config.storage),
                assignment_logger: config.assignment_logger,
                app_version: config.app_version,
                attributes: config.attributes,
                sync: config.sync,
            }),
        })
    }

    /// Load configuration and assign the current identity to every running experiment.
    ///
    /// The first call resolves every resource through live fetch, cache, or compiled defaults;
    /// later calls only switch the identity (e.g. after sign-in) and assign it. Network failures
    /// never surface here. The only error is missing compiled defaults, a packaging bug.
    pub fn initialize(&self, user_id: Option<&str>) -> Result<()> {
        let user_id = user_id.filter(|id| !id.is_empty()).map(str::to_owned);
        *self
            .inner
            .user_id
            .write()
            .unwrap_or_else(PoisonError::into_inner) = user_id;

        if !self.inner.is_initialized() {
            let _init = self
                .inner
                .init_lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !self.inner.is_initialized() {
                self.inner.store.initialize()?;
                self.inner.assignments.restore();
                self.inner.initialized.store(true, Ordering::Release);
            }
        }

        let identity = self.identity();
        self.inner.assignments.persist_identity(&identity.device_id);
        if let Some(user_id) = &identity.user_id {
            self.inner.assignments.persist_identity(user_id);
        }

        self.inner.assign_running();
        log::debug!(target: "flagkit",
                    identity = self.identity().key();
                    "client initialized");
        Ok(())
    }

    /// The identity reads are evaluated for: the user id given to [`Client::initialize`], or the
    /// persisted device id.
    pub fn identity(&self) -> Identity {
        self.inner.identity()
    }

    /// The active snapshot, or `None` before [`Client::initialize`].
    pub fn snapshot(&self) -> Option<Arc<ConfigSnapshot>> {
        self.inner.store.get_snapshot()
    }

    /// Check whether `flag_name` is enabled for the current identity.
    pub fn is_enabled(&self, flag_name: &str, default_value: bool) -> bool {
        self.is_enabled_for(
            flag_name,
            &self.identity(),
            &SubjectAttributes::new(),
            default_value,
        )
    }

    /// Check whether `flag_name` is enabled for `identity`. `attributes` are layered over the
    /// ones set on [`ClientConfig`].
    pub fn is_enabled_for(
        &self,
        flag_name: &str,
        identity: &Identity,
        attributes: &SubjectAttributes,
        default_value: bool,
    ) -> bool {
        let Some(snapshot) = self.snapshot() else {
            log::warn!(target: "flagkit", flag_name = flag_name; "evaluating a flag before the client was initialized");
            return default_value;
        };

        let attributes = if attributes.is_empty() {
            Cow::Borrowed(&self.inner.attributes)
        } else {
            let mut merged = self.inner.attributes.clone();
            merged.extend(attributes.iter().map(|(k, v)| (k.clone(), v.clone())));
            Cow::Owned(merged)
        };

        self.inner.evaluator.is_enabled(
            &snapshot,
            flag_name,
            identity.key(),
            &attributes,
            default_value,
        )
    }

    /// Variant id of the current identity for `experiment_id`, assigning one on first access.
    pub fn get_variant(&self, experiment_id: &str) -> Option<String> {
        self.get_variant_for(experiment_id, &self.identity())
    }

    pub fn get_variant_for(&self, experiment_id: &str, identity: &Identity) -> Option<String> {
        let Some(snapshot) = self.snapshot() else {
            log::warn!(target: "flagkit", experiment_id = experiment_id; "getting a variant before the client was initialized");
            return self
                .inner
                .assignments
                .assigned(experiment_id, identity.key())
                .map(|record| record.variant_id);
        };

        let assignment =
            self.inner
                .assignments
                .get_variant(&snapshot, experiment_id, identity, Utc::now())?;
        if let Some(event) = assignment.event {
            self.inner.log_assignment(event);
        }
        Some(assignment.record.variant_id)
    }

    /// `config` map of the current identity's variant, or `None` if it has none.
    pub fn get_variant_config(&self, experiment_id: &str) -> Option<ConfigMap> {
        let variant_id = self.get_variant(experiment_id)?;
        let snapshot = self.snapshot()?;
        let variant = snapshot.experiment(experiment_id)?.variant(&variant_id)?;
        Some(variant.config.clone())
    }

    /// Look up a value in the remote config document by dotted path, e.g.
    /// `"content.xp_multiplier"`. Returns `default_value` if the path is missing or the value
    /// does not deserialize into `T`.
    pub fn get_config<T: DeserializeOwned>(&self, path: &str, default_value: T) -> T {
        let Some(snapshot) = self.snapshot() else {
            log::warn!(target: "flagkit", path = path; "reading config before the client was initialized");
            return default_value;
        };

        let document = match serde_json::to_value(snapshot.remote_config()) {
            Ok(document) => document,
            Err(err) => {
                log::warn!(target: "flagkit", "failed to serialize remote config: {}", err);
                return default_value;
            }
        };

        let Some(value) = path
            .split('.')
            .try_fold(&document, |value, key| value.get(key))
        else {
            return default_value;
        };

        match T::deserialize(value) {
            Ok(value) => value,
            Err(err) => {
                log::debug!(target: "flagkit", path = path; "config value has unexpected type: {}", err);
                default_value
            }
        }
    }

    /// Record an event for the current identity's variant of `experiment_id`. Nothing is recorded
    /// when the identity has no assignment. Backend failures are logged.
    pub fn track_experiment_event(
        &self,
        experiment_id: &str,
        event_name: &str,
        properties: Option<ConfigMap>,
    ) {
        let identity = self.identity();
        let Some(record) = self.inner.assignments.assigned(experiment_id, identity.key()) else {
            log::debug!(target: "flagkit",
                        experiment_id = experiment_id,
                        event_name = event_name;
                        "identity has no assignment, not tracking event");
            return;
        };

        let event = ExperimentEvent {
            experiment_id: record.experiment_id,
            variant_id: record.variant_id,
            user_id: identity.user_id,
            device_id: identity.device_id,
            event_name: event_name.to_owned(),
            properties,
            created_at: Utc::now(),
        };
        if let Err(err) = self.inner.backend.record_event(&event) {
            log::warn!(target: "flagkit", event:serde = event; "failed to record experiment event: {}", err);
        }
    }

    /// `true` if the backend forces an update or the configured app version is below
    /// `min_version`.
    pub fn needs_update(&self) -> bool {
        let Some(snapshot) = self.snapshot() else {
            return false;
        };
        let remote_config = snapshot.remote_config();
        if remote_config.force_update {
            return true;
        }
        let Some(app_version) = &self.inner.app_version else {
            return false;
        };
        match (
            parse_version(app_version),
            parse_version(&remote_config.min_version),
        ) {
            (Some(current), Some(min)) => current < min,
            _ => {
                log::debug!(target: "flagkit",
                            app_version = app_version.as_str(),
                            min_version = remote_config.min_version.as_str();
                            "cannot compare versions");
                false
            }
        }
    }

    pub fn is_maintenance_mode(&self) -> bool {
        self.snapshot()
            .is_some_and(|snapshot| snapshot.remote_config().maintenance_mode)
    }

    /// Refresh every resource now. Never fails on network errors; the outcome per resource tells
    /// where its data came from.
    pub fn refresh(&self) -> Vec<(Resource, Result<Source>)> {
        let outcomes = self.inner.store.refresh_all();
        if self.inner.is_initialized() {
            self.inner.assign_running();
        }
        outcomes
    }

    pub fn refresh_resource(&self, resource: Resource) -> Result<Source> {
        self.inner.refresh(resource)
    }

    /// Start a thread that refreshes resources when `feed` reports changes, and polls
    /// periodically as configured on [`ClientConfig`].
    pub fn start_sync(&self, feed: &dyn ChangeFeed) -> Result<SyncSubscriber> {
        SyncSubscriber::start(feed, self.inner.clone(), self.inner.sync.clone())
    }
}

impl ClientInner {
    fn identity(&self) -> Identity {
        let user_id = self
            .user_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Identity::new(user_id, self.identity.device_id())
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn assign_running(&self) {
        let Some(snapshot) = self.store.get_snapshot() else {
            return;
        };
        let events = self
            .assignments
            .assign_running(&snapshot, &self.identity(), Utc::now());
        for event in events {
            self.log_assignment(event);
        }
    }

    /// Hand the event to the logger, then record it with the backend off the caller's thread.
    fn log_assignment(&self, event: AssignmentEvent) {
        log::trace!(target: "flagkit", event:serde = event; "logging assignment");
        self.assignment_logger.log_assignment(event.clone());

        let backend = self.backend.clone();
        let spawned = std::thread::Builder::new()
            .name("flagkit-record".to_owned())
            .spawn(move || {
                if let Err(err) = backend.record_assignment(&event) {
                    log::warn!(target: "flagkit", event:serde = event; "failed to record assignment: {}", err);
                }
            });
        if let Err(err) = spawned {
            log::warn!(target: "flagkit", "failed to spawn assignment recorder: {:?}", err);
        }
    }
}

impl RefreshTarget for ClientInner {
    fn refresh(&self, resource: Resource) -> Result<Source> {
        let source = self.store.refresh(resource)?;
        if resource == Resource::Experiments && self.is_initialized() {
            self.assign_running();
        }
        Ok(source)
    }
}
