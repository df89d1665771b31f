use std::{sync::Arc, time::Duration};

use crate::{
    assignment_logger::NoopAssignmentLogger,
    configuration_store::{ConfigStoreConfig, WeightPolicy},
    fetcher::ConfigBackend,
    model::Defaults,
    rules::{AttributeValue, SubjectAttributes, UnknownConditionPolicy},
    sharder::{BucketingMode, Md5Sharder, Sharder},
    storage::{InMemoryStore, KeyValueStore},
    sync::SyncConfig,
    AssignmentLogger, Client, Result,
};

pub(crate) enum BackendConfig {
    Http { base_url: String, api_key: String },
    Custom(Arc<dyn ConfigBackend>),
}

/// Configuration for [`Client`].
pub struct ClientConfig {
    pub(crate) backend: BackendConfig,
    pub(crate) storage: Arc<dyn KeyValueStore>,
    pub(crate) assignment_logger: Arc<dyn AssignmentLogger + Send + Sync>,
    pub(crate) fetch_timeout: Duration,
    pub(crate) bucketing_mode: BucketingMode,
    pub(crate) sharder: Arc<dyn Sharder + Send + Sync>,
    pub(crate) weight_policy: WeightPolicy,
    pub(crate) unknown_condition_policy: UnknownConditionPolicy,
    pub(crate) app_version: Option<String>,
    pub(crate) attributes: SubjectAttributes,
    pub(crate) defaults: Option<Defaults>,
    pub(crate) sync: SyncConfig,
}

impl ClientConfig {
    /// Create a configuration talking to a PostgREST-style backend at `base_url`.
    ///
    /// Credentials are validated by [`ClientConfig::to_client`]; an empty `api_key` is rejected
    /// there instead of falling back to anything built in.
    ///
    /// ```
    /// # use flagkit::ClientConfig;
    /// ClientConfig::new("https://project.supabase.co/rest/v1", "api-key");
    /// ```
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> ClientConfig {
        ClientConfig::with_backend(BackendConfig::Http {
            base_url: base_url.into(),
            api_key: api_key.into(),
        })
    }

    /// Create a configuration using a custom backend implementation.
    pub fn from_backend(backend: Arc<dyn ConfigBackend>) -> ClientConfig {
        ClientConfig::with_backend(BackendConfig::Custom(backend))
    }

    fn with_backend(backend: BackendConfig) -> ClientConfig {
        ClientConfig {
            backend,
            storage: Arc::new(InMemoryStore::new()),
            assignment_logger: Arc::new(NoopAssignmentLogger),
            fetch_timeout: ConfigStoreConfig::DEFAULT_FETCH_TIMEOUT,
            bucketing_mode: BucketingMode::default(),
            sharder: Arc::new(Md5Sharder),
            weight_policy: WeightPolicy::default(),
            unknown_condition_policy: UnknownConditionPolicy::default(),
            app_version: None,
            attributes: SubjectAttributes::from([(
                "platform".to_owned(),
                std::env::consts::OS.into(),
            )]),
            defaults: None,
            sync: SyncConfig::default(),
        }
    }

    /// Where cached resources, assignments, and the device id are persisted. Defaults to an
    /// in-memory store, so nothing survives a restart unless this is set.
    pub fn storage(&mut self, storage: Arc<dyn KeyValueStore>) -> &mut Self {
        self.storage = storage;
        self
    }

    /// Set assignment logger to pass variant assignments to your data warehouse.
    ///
    /// ```
    /// # use flagkit::{AssignmentEvent, ClientConfig};
    /// let mut config = ClientConfig::new("https://project.supabase.co/rest/v1", "api-key");
    /// config.assignment_logger(|event: AssignmentEvent| {
    ///   println!("{:?}", event);
    /// });
    /// ```
    pub fn assignment_logger(
        &mut self,
        assignment_logger: impl AssignmentLogger + Send + Sync + 'static,
    ) -> &mut Self {
        self.assignment_logger = Arc::new(assignment_logger);
        self
    }

    pub fn fetch_timeout(&mut self, fetch_timeout: Duration) -> &mut Self {
        self.fetch_timeout = fetch_timeout;
        self
    }

    pub fn bucketing_mode(&mut self, bucketing_mode: BucketingMode) -> &mut Self {
        self.bucketing_mode = bucketing_mode;
        self
    }

    /// Replace the md5 sharder, e.g. with [`LegacySharder`](crate::LegacySharder) to keep buckets
    /// compatible with earlier clients.
    pub fn sharder(&mut self, sharder: impl Sharder + Send + Sync + 'static) -> &mut Self {
        self.sharder = Arc::new(sharder);
        self
    }

    pub fn weight_policy(&mut self, weight_policy: WeightPolicy) -> &mut Self {
        self.weight_policy = weight_policy;
        self
    }

    pub fn unknown_condition_policy(&mut self, policy: UnknownConditionPolicy) -> &mut Self {
        self.unknown_condition_policy = policy;
        self
    }

    /// Version of the running application. Used by [`Client::needs_update`] and exposed to
    /// flag conditions as the `version` attribute.
    pub fn app_version(&mut self, app_version: impl Into<String>) -> &mut Self {
        let app_version = app_version.into();
        self.attributes
            .insert("version".to_owned(), app_version.as_str().into());
        self.app_version = Some(app_version);
        self
    }

    /// Set an attribute visible to flag conditions (`platform`, `country`, `user_level`, ...).
    /// `platform` is pre-filled with the host OS.
    pub fn attribute(
        &mut self,
        key: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> &mut Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Replace the compiled-in defaults used when neither the backend nor the cache can answer.
    pub fn defaults(&mut self, defaults: Defaults) -> &mut Self {
        self.defaults = Some(defaults);
        self
    }

    /// How often the sync thread refreshes everything without a notification. `None` disables
    /// polling.
    pub fn poll_interval(&mut self, poll_interval: Option<Duration>) -> &mut Self {
        self.sync.poll_interval = poll_interval;
        self
    }

    pub fn poll_jitter(&mut self, poll_jitter: Duration) -> &mut Self {
        self.sync.poll_jitter = poll_jitter;
        self
    }

    /// Create a new [`Client`] using the specified configuration.
    ///
    /// Fails on an empty API key or unparsable base URL.
    ///
    /// ```
    /// # use flagkit::{ClientConfig, Client};
    /// let client: Client = ClientConfig::new("https://project.supabase.co/rest/v1", "api-key")
    ///     .to_client()
    ///     .unwrap();
    /// ```
    pub fn to_client(self) -> Result<Client> {
        Client::new(self)
    }
}
