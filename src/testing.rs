//! Test doubles shared by unit tests.
use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use crate::{
    assignment_logger::{AssignmentEvent, ExperimentEvent},
    fetcher::ConfigBackend,
    model::{Experiment, ExperimentStatus, FeatureFlag, RemoteConfig, Resource, Variant},
    Error, Result,
};

/// A backend whose responses are set by the test.
pub struct ScriptedBackend {
    remote_config: Mutex<Result<RemoteConfig>>,
    flags: Mutex<Result<Vec<FeatureFlag>>>,
    experiments: Mutex<Result<Vec<Experiment>>>,
    delay: Mutex<Duration>,
    fetches: Mutex<HashMap<Resource, usize>>,
    pub assignments: Mutex<Vec<AssignmentEvent>>,
    pub events: Mutex<Vec<ExperimentEvent>>,
}

impl ScriptedBackend {
    pub fn serving(
        remote_config: RemoteConfig,
        flags: Vec<FeatureFlag>,
        experiments: Vec<Experiment>,
    ) -> ScriptedBackend {
        ScriptedBackend {
            remote_config: Mutex::new(Ok(remote_config)),
            flags: Mutex::new(Ok(flags)),
            experiments: Mutex::new(Ok(experiments)),
            delay: Mutex::new(Duration::ZERO),
            fetches: Mutex::new(HashMap::new()),
            assignments: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Every fetch fails as if the network were down.
    pub fn offline() -> ScriptedBackend {
        let backend = ScriptedBackend::serving(RemoteConfig::default(), vec![], vec![]);
        for resource in Resource::ALL {
            backend.fail(resource);
        }
        backend
    }

    pub fn fail(&self, resource: Resource) {
        let err = Error::Http(503);
        match resource {
            Resource::RemoteConfig => *lock(&self.remote_config) = Err(err),
            Resource::FeatureFlags => *lock(&self.flags) = Err(err),
            Resource::Experiments => *lock(&self.experiments) = Err(err),
        }
    }

    pub fn set_remote_config(&self, remote_config: RemoteConfig) {
        *lock(&self.remote_config) = Ok(remote_config);
    }

    pub fn set_flags(&self, flags: Vec<FeatureFlag>) {
        *lock(&self.flags) = Ok(flags);
    }

    pub fn set_experiments(&self, experiments: Vec<Experiment>) {
        *lock(&self.experiments) = Ok(experiments);
    }

    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    pub fn fetch_count(&self, resource: Resource) -> usize {
        lock(&self.fetches).get(&resource).copied().unwrap_or(0)
    }

    fn before_fetch(&self, resource: Resource) {
        *lock(&self.fetches).entry(resource).or_default() += 1;
        let delay = *lock(&self.delay);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }
}

impl ConfigBackend for ScriptedBackend {
    fn fetch_remote_config(&self) -> Result<RemoteConfig> {
        self.before_fetch(Resource::RemoteConfig);
        lock(&self.remote_config).clone()
    }

    fn fetch_feature_flags(&self) -> Result<Vec<FeatureFlag>> {
        self.before_fetch(Resource::FeatureFlags);
        lock(&self.flags).clone()
    }

    fn fetch_running_experiments(&self) -> Result<Vec<Experiment>> {
        self.before_fetch(Resource::Experiments);
        lock(&self.experiments).clone()
    }

    fn record_assignment(&self, event: &AssignmentEvent) -> Result<()> {
        lock(&self.assignments).push(event.clone());
        Ok(())
    }

    fn record_event(&self, event: &ExperimentEvent) -> Result<()> {
        lock(&self.events).push(event.clone());
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn flag(name: &str, rollout_percentage: f64) -> FeatureFlag {
    FeatureFlag {
        id: None,
        name: name.to_owned(),
        enabled: true,
        rollout_percentage,
        conditions: None,
        variants: None,
        metadata: None,
    }
}

pub fn experiment(id: &str, weights: &[(&str, f64)]) -> Experiment {
    Experiment {
        id: id.to_owned(),
        name: id.to_owned(),
        status: ExperimentStatus::Running,
        variants: weights
            .iter()
            .map(|(variant_id, weight)| Variant {
                id: (*variant_id).to_owned(),
                name: (*variant_id).to_owned(),
                weight: *weight,
                config: serde_json::Map::new(),
            })
            .collect(),
        metrics: vec![],
        start_date: None,
        end_date: None,
    }
}

/// Install a logger for the duration of the test binary. Safe to call more than once.
pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}
