//! Owner of the current [`ConfigSnapshot`] and of the fetch → cache → default lifecycle that
//! produces it.
//!
//! Every resource is resolved independently through the fallback chain
//! `live fetch > last-known-good cache > compiled default`. Readers get an `Arc` to an immutable
//! snapshot; writers build a complete new snapshot and swap the pointer, so a reader never sees a
//! half-updated map and keeps a consistent view for as long as it holds its `Arc`.
use std::{
    collections::HashMap,
    sync::{
        mpsc::{self, RecvTimeoutError},
        Arc, Condvar, Mutex, OnceLock, PoisonError, RwLock,
    },
    time::{Duration, Instant},
};

use chrono::Utc;
use serde::Serialize;

use crate::{
    fetcher::ConfigBackend,
    model::{
        Defaults, Experiment, FeatureFlag, RemoteConfig, Resource, Timestamp, WeightCheck,
    },
    storage::KeyValueStore,
    Error, Result,
};

/// Where a resource in the snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Live,
    Cache,
    Default,
}

/// How to treat experiments whose variant weights do not sum to 100.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WeightPolicy {
    /// Keep the experiment and scale selection to the actual total.
    #[default]
    Normalize,
    /// Drop the experiment; nobody gets assigned.
    Reject,
}

/// Immutable bundle read by evaluation and assignment.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    remote_config: Arc<RemoteConfig>,
    flags: Arc<HashMap<String, FeatureFlag>>,
    experiments: Arc<HashMap<String, Experiment>>,
    sources: HashMap<Resource, Source>,
    updated_at: Timestamp,
}

impl ConfigSnapshot {
    /// Assemble a snapshot directly. Experiments are validated with `weight_policy`.
    pub fn from_parts(
        remote_config: RemoteConfig,
        flags: Vec<FeatureFlag>,
        experiments: Vec<Experiment>,
        weight_policy: WeightPolicy,
    ) -> ConfigSnapshot {
        ConfigSnapshot {
            remote_config: Arc::new(remote_config),
            flags: Arc::new(index_flags(flags)),
            experiments: Arc::new(index_experiments(experiments, weight_policy)),
            sources: Resource::ALL.map(|r| (r, Source::Default)).into(),
            updated_at: Utc::now(),
        }
    }

    fn from_defaults(defaults: &Defaults, weight_policy: WeightPolicy) -> ConfigSnapshot {
        ConfigSnapshot::from_parts(
            defaults.remote_config.clone(),
            defaults.feature_flags.clone(),
            defaults.experiments.clone(),
            weight_policy,
        )
    }

    /// Copy of `self` with one resource replaced. Only `Arc`s are cloned.
    fn with(&self, part: Part, source: Source) -> ConfigSnapshot {
        let mut next = self.clone();
        let resource = match part {
            Part::RemoteConfig(remote_config) => {
                next.remote_config = remote_config;
                Resource::RemoteConfig
            }
            Part::FeatureFlags(flags) => {
                next.flags = flags;
                Resource::FeatureFlags
            }
            Part::Experiments(experiments) => {
                next.experiments = experiments;
                Resource::Experiments
            }
        };
        next.sources.insert(resource, source);
        next.updated_at = Utc::now();
        next
    }

    pub fn remote_config(&self) -> &RemoteConfig {
        &self.remote_config
    }

    pub fn flag(&self, name: &str) -> Option<&FeatureFlag> {
        self.flags.get(name)
    }

    pub fn flags(&self) -> &HashMap<String, FeatureFlag> {
        &self.flags
    }

    pub fn experiment(&self, id: &str) -> Option<&Experiment> {
        self.experiments.get(id)
    }

    pub fn experiments(&self) -> &HashMap<String, Experiment> {
        &self.experiments
    }

    pub fn source(&self, resource: Resource) -> Source {
        self.sources
            .get(&resource)
            .copied()
            .unwrap_or(Source::Default)
    }

    /// When any resource of this snapshot was last replaced.
    pub fn updated_at(&self) -> Timestamp {
        self.updated_at
    }
}

fn index_flags(flags: Vec<FeatureFlag>) -> HashMap<String, FeatureFlag> {
    flags.into_iter().map(|f| (f.name.clone(), f)).collect()
}

fn index_experiments(
    experiments: Vec<Experiment>,
    weight_policy: WeightPolicy,
) -> HashMap<String, Experiment> {
    experiments
        .into_iter()
        .filter(|experiment| match (experiment.check_weights(), weight_policy) {
            (WeightCheck::Exact, _) => true,
            (WeightCheck::Skewed(total), WeightPolicy::Normalize) => {
                log::warn!(target: "flagkit",
                           experiment_id = experiment.id.as_str(),
                           total_weight = total;
                           "variant weights do not sum to 100, normalizing");
                true
            }
            (WeightCheck::Skewed(total), WeightPolicy::Reject) => {
                log::warn!(target: "flagkit",
                           experiment_id = experiment.id.as_str(),
                           total_weight = total;
                           "variant weights do not sum to 100, dropping experiment");
                false
            }
            (WeightCheck::Invalid, _) => {
                log::warn!(target: "flagkit",
                           experiment_id = experiment.id.as_str();
                           "experiment has no usable variant weights, dropping experiment");
                false
            }
        })
        .map(|e| (e.id.clone(), e))
        .collect()
}

/// A resource as fetched, cached, or defaulted.
#[derive(Debug)]
enum Loaded {
    RemoteConfig(RemoteConfig),
    FeatureFlags(Vec<FeatureFlag>),
    Experiments(Vec<Experiment>),
}

impl Loaded {
    fn fetch(backend: &dyn ConfigBackend, resource: Resource) -> Result<Loaded> {
        Ok(match resource {
            Resource::RemoteConfig => Loaded::RemoteConfig(backend.fetch_remote_config()?),
            Resource::FeatureFlags => Loaded::FeatureFlags(backend.fetch_feature_flags()?),
            Resource::Experiments => {
                Loaded::Experiments(backend.fetch_running_experiments()?)
            }
        })
    }

    fn from_cache(resource: Resource, json: &str) -> Result<Loaded> {
        Ok(match resource {
            Resource::RemoteConfig => Loaded::RemoteConfig(serde_json::from_str(json)?),
            Resource::FeatureFlags => Loaded::FeatureFlags(serde_json::from_str(json)?),
            Resource::Experiments => Loaded::Experiments(serde_json::from_str(json)?),
        })
    }

    fn from_defaults(resource: Resource, defaults: &Defaults) -> Loaded {
        match resource {
            Resource::RemoteConfig => Loaded::RemoteConfig(defaults.remote_config.clone()),
            Resource::FeatureFlags => Loaded::FeatureFlags(defaults.feature_flags.clone()),
            Resource::Experiments => Loaded::Experiments(defaults.experiments.clone()),
        }
    }

    fn to_cache(&self) -> Result<String> {
        Ok(match self {
            Loaded::RemoteConfig(v) => serde_json::to_string(v)?,
            Loaded::FeatureFlags(v) => serde_json::to_string(v)?,
            Loaded::Experiments(v) => serde_json::to_string(v)?,
        })
    }

    fn into_part(self, weight_policy: WeightPolicy) -> Part {
        match self {
            Loaded::RemoteConfig(v) => Part::RemoteConfig(Arc::new(v)),
            Loaded::FeatureFlags(v) => Part::FeatureFlags(Arc::new(index_flags(v))),
            Loaded::Experiments(v) => {
                Part::Experiments(Arc::new(index_experiments(v, weight_policy)))
            }
        }
    }
}

/// A resource ready to be swapped into a snapshot.
enum Part {
    RemoteConfig(Arc<RemoteConfig>),
    FeatureFlags(Arc<HashMap<String, FeatureFlag>>),
    Experiments(Arc<HashMap<String, Experiment>>),
}

/// Configuration for [`ConfigStore`].
#[derive(Debug, Clone)]
pub struct ConfigStoreConfig {
    /// Upper bound for a single resource fetch. A fetch that does not finish in time is treated
    /// as failed.
    ///
    /// Defaults to [`ConfigStoreConfig::DEFAULT_FETCH_TIMEOUT`].
    pub fetch_timeout: Duration,
    pub weight_policy: WeightPolicy,
    /// Replaces the compiled-in defaults when set.
    pub defaults: Option<Defaults>,
}

impl ConfigStoreConfig {
    pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new() -> ConfigStoreConfig {
        ConfigStoreConfig::default()
    }

    pub fn with_fetch_timeout(mut self, fetch_timeout: Duration) -> ConfigStoreConfig {
        self.fetch_timeout = fetch_timeout;
        self
    }

    pub fn with_weight_policy(mut self, weight_policy: WeightPolicy) -> ConfigStoreConfig {
        self.weight_policy = weight_policy;
        self
    }

    pub fn with_defaults(mut self, defaults: Defaults) -> ConfigStoreConfig {
        self.defaults = Some(defaults);
        self
    }
}

impl Default for ConfigStoreConfig {
    fn default() -> ConfigStoreConfig {
        ConfigStoreConfig {
            fetch_timeout: ConfigStoreConfig::DEFAULT_FETCH_TIMEOUT,
            weight_policy: WeightPolicy::default(),
            defaults: None,
        }
    }
}

/// Holds `None` while the refresh is running, and its outcome once it finished.
#[derive(Default)]
struct Flight {
    outcome: Mutex<Option<Result<Source>>>,
    done: Condvar,
}

impl Flight {
    fn wait(&self) -> Result<Source> {
        let mut outcome = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(outcome) = &*outcome {
                return outcome.clone();
            }
            outcome = self
                .done
                .wait(outcome)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn complete(&self, value: Result<Source>) {
        *self.outcome.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
        self.done.notify_all();
    }
}

/// Completes the flight and unregisters it even if the leading refresh panics.
struct FlightGuard<'a> {
    store: &'a ConfigStore,
    resource: Resource,
    flight: Arc<Flight>,
    outcome: Option<Result<Source>>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.store
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.resource);
        self.flight
            .complete(self.outcome.take().unwrap_or(Err(Error::RefreshAborted)));
    }
}

/// Outcome of registering for a resource's refresh.
enum Role<'a> {
    /// No refresh was running; the caller performs it and publishes the outcome through the guard.
    Leader(FlightGuard<'a>),
    /// Another caller is refreshing the resource.
    Follower(Arc<Flight>),
}

/// `ConfigStore` provides a thread-safe (`Sync`) home for the active [`ConfigSnapshot`].
pub struct ConfigStore {
    snapshot: RwLock<Option<Arc<ConfigSnapshot>>>,
    backend: Arc<dyn ConfigBackend>,
    storage: Arc<dyn KeyValueStore>,
    defaults: OnceLock<Arc<Defaults>>,
    fetch_timeout: Duration,
    weight_policy: WeightPolicy,
    in_flight: Mutex<HashMap<Resource, Arc<Flight>>>,
}

impl ConfigStore {
    pub fn new(
        backend: Arc<dyn ConfigBackend>,
        storage: Arc<dyn KeyValueStore>,
        config: ConfigStoreConfig,
    ) -> ConfigStore {
        let defaults = OnceLock::new();
        if let Some(overridden) = config.defaults {
            let _ = defaults.set(Arc::new(overridden));
        }
        ConfigStore {
            snapshot: RwLock::new(None),
            backend,
            storage,
            defaults,
            fetch_timeout: config.fetch_timeout,
            weight_policy: config.weight_policy,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Get the active snapshot. Returns `None` only before [`ConfigStore::initialize`].
    pub fn get_snapshot(&self) -> Option<Arc<ConfigSnapshot>> {
        let snapshot = self.snapshot.read().unwrap_or_else(PoisonError::into_inner);
        snapshot.clone()
    }

    /// Resolve all resources and publish the first snapshot.
    ///
    /// Resources are fetched concurrently under one shared deadline. A resource that is already
    /// being refreshed is not fetched again; its refresh is awaited instead, and refreshes started
    /// while this runs share its outcome. Network and cache failures never surface here; the only
    /// error is missing compiled defaults, which is a packaging bug.
    pub fn initialize(&self) -> Result<Arc<ConfigSnapshot>> {
        let defaults = self.defaults()?;
        let deadline = Instant::now() + self.fetch_timeout;

        let mut leading = Vec::new();
        let mut joined = Vec::new();
        for resource in Resource::ALL {
            match self.enter_flight(resource) {
                Role::Leader(guard) => leading.push((guard, self.spawn_fetch(resource))),
                Role::Follower(flight) => joined.push((resource, flight)),
            }
        }

        let settled: Vec<_> = leading
            .into_iter()
            .map(|(guard, receiver)| {
                let fetched = await_fetch(receiver, deadline);
                let (loaded, source) = self.settle(guard.resource, fetched, &defaults);
                (guard, loaded.into_part(self.weight_policy), source)
            })
            .collect();

        // A joined refresh publishes into the snapshot itself before completing.
        for (resource, flight) in joined {
            if let Err(err) = flight.wait() {
                log::warn!(target: "flagkit", resource:display = resource; "joined refresh failed: {}", err);
            }
        }

        let mut slot = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        let mut snapshot = match slot.as_deref() {
            Some(current) => current.clone(),
            None => ConfigSnapshot::from_defaults(&defaults, self.weight_policy),
        };
        let mut guards = Vec::with_capacity(settled.len());
        for (mut guard, part, source) in settled {
            snapshot = snapshot.with(part, source);
            guard.outcome = Some(Ok(source));
            guards.push(guard);
        }
        let snapshot = Arc::new(snapshot);
        *slot = Some(snapshot.clone());
        drop(slot);
        // Completes the flights only once their outcome is visible.
        drop(guards);

        log::debug!(target: "flagkit",
                    remote_config:serde = snapshot.source(Resource::RemoteConfig),
                    feature_flags:serde = snapshot.source(Resource::FeatureFlags),
                    experiments:serde = snapshot.source(Resource::Experiments);
                    "configuration initialized");
        Ok(snapshot)
    }

    /// Re-resolve one resource and swap it into the snapshot, bounded by the configured fetch
    /// timeout.
    pub fn refresh(&self, resource: Resource) -> Result<Source> {
        self.refresh_within(resource, self.fetch_timeout)
    }

    /// Like [`ConfigStore::refresh`] with an explicit deadline.
    ///
    /// Only one refresh per resource runs at a time. Callers arriving while one is in progress
    /// wait for it and share its outcome.
    pub fn refresh_within(&self, resource: Resource, timeout: Duration) -> Result<Source> {
        let mut guard = match self.enter_flight(resource) {
            Role::Leader(guard) => guard,
            Role::Follower(flight) => {
                log::trace!(target: "flagkit", resource:display = resource; "joining in-flight refresh");
                return flight.wait();
            }
        };

        let outcome = self.refresh_now(resource, Instant::now() + timeout);
        guard.outcome = Some(outcome.clone());
        outcome
    }

    /// Refresh every resource concurrently.
    pub fn refresh_all(&self) -> Vec<(Resource, Result<Source>)> {
        std::thread::scope(|scope| {
            let handles: Vec<_> = Resource::ALL
                .into_iter()
                .map(|resource| (resource, scope.spawn(move || self.refresh(resource))))
                .collect();
            handles
                .into_iter()
                .map(|(resource, handle)| {
                    let outcome = handle.join().unwrap_or(Err(Error::RefreshAborted));
                    (resource, outcome)
                })
                .collect()
        })
    }

    fn enter_flight(&self, resource: Resource) -> Role<'_> {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(flight) = in_flight.get(&resource) {
            return Role::Follower(flight.clone());
        }
        let flight = Arc::new(Flight::default());
        in_flight.insert(resource, flight.clone());
        Role::Leader(FlightGuard {
            store: self,
            resource,
            flight,
            outcome: None,
        })
    }

    fn refresh_now(&self, resource: Resource, deadline: Instant) -> Result<Source> {
        let defaults = self.defaults()?;
        let fetched = await_fetch(self.spawn_fetch(resource), deadline);
        let (loaded, source) = self.settle(resource, fetched, &defaults);
        let part = loaded.into_part(self.weight_policy);

        let mut slot = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        let next = match slot.as_deref() {
            Some(current) => current.with(part, source),
            None => ConfigSnapshot::from_defaults(&defaults, self.weight_policy).with(part, source),
        };
        *slot = Some(Arc::new(next));
        drop(slot);

        log::debug!(target: "flagkit",
                    resource:display = resource,
                    source:serde = source;
                    "resource refreshed");
        Ok(source)
    }

    /// Run the backend call on its own thread so the caller can stop waiting at the deadline.
    /// A fetch that outlives its deadline finishes in the background and its result is dropped.
    fn spawn_fetch(&self, resource: Resource) -> mpsc::Receiver<Result<Loaded>> {
        let (sender, receiver) = mpsc::sync_channel(1);
        let backend = Arc::clone(&self.backend);
        let spawned = std::thread::Builder::new()
            .name(format!("flagkit-fetch-{resource}"))
            .spawn(move || {
                // Receiver is gone if the caller already gave up.
                let _ = sender.send(Loaded::fetch(&*backend, resource));
            });
        if let Err(err) = spawned {
            log::warn!(target: "flagkit", resource:display = resource; "failed to spawn fetch thread: {:?}", err);
        }
        receiver
    }

    /// Apply the fallback chain to a fetch outcome.
    fn settle(
        &self,
        resource: Resource,
        fetched: Result<Loaded>,
        defaults: &Defaults,
    ) -> (Loaded, Source) {
        match fetched {
            Ok(loaded) => {
                let cached = loaded
                    .to_cache()
                    .and_then(|json| self.storage.set(resource.cache_key(), &json));
                if let Err(err) = cached {
                    log::warn!(target: "flagkit", resource:display = resource; "failed to cache resource: {:?}", err);
                }
                return (loaded, Source::Live);
            }
            Err(err) => {
                log::warn!(target: "flagkit", resource:display = resource; "failed to fetch resource, falling back to cache: {}", err);
            }
        }

        match self.storage.get(resource.cache_key()) {
            Ok(Some(json)) => match Loaded::from_cache(resource, &json) {
                Ok(loaded) => return (loaded, Source::Cache),
                Err(err) => {
                    log::warn!(target: "flagkit", resource:display = resource; "discarding corrupt cache entry: {}", err);
                }
            },
            Ok(None) => {
                log::debug!(target: "flagkit", resource:display = resource; "no cached copy, using compiled default");
            }
            Err(err) => {
                log::warn!(target: "flagkit", resource:display = resource; "failed to read cache: {:?}", err);
            }
        }

        (Loaded::from_defaults(resource, defaults), Source::Default)
    }

    fn defaults(&self) -> Result<Arc<Defaults>> {
        if let Some(defaults) = self.defaults.get() {
            return Ok(defaults.clone());
        }
        let compiled = Arc::new(Defaults::compiled().inspect_err(|err| {
            log::error!(target: "flagkit", "compiled-in defaults are unusable: {}", err);
        })?);
        Ok(self.defaults.get_or_init(|| compiled).clone())
    }
}

fn await_fetch(receiver: mpsc::Receiver<Result<Loaded>>, deadline: Instant) -> Result<Loaded> {
    let timeout = deadline.saturating_duration_since(Instant::now());
    match receiver.recv_timeout(timeout) {
        Ok(fetched) => fetched,
        Err(RecvTimeoutError::Timeout) => Err(Error::Timeout),
        // Fetch thread panicked or never started.
        Err(RecvTimeoutError::Disconnected) => Err(Error::RefreshAborted),
    }
}
