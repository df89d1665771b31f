//! Sticky experiment assignments.
//!
//! Once an identity has been assigned a variant for an experiment, that record is returned
//! unconditionally for the rest of the experiment's life, including across refreshes that change
//! the experiment's weights and across restarts.
//!
//! Only records of the identities registered with [`AssignmentEngine::persist_identity`] (the
//! installation's device id and signed-in user) are written to storage. Records for any other
//! identity passed to [`AssignmentEngine::get_variant`] are kept in memory for the life of the
//! process, so persistence cost does not grow with the number of identities served.
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
};

use serde::{Deserialize, Serialize};

use crate::{
    assignment_logger::AssignmentEvent,
    configuration_store::ConfigSnapshot,
    identity::Identity,
    model::{Experiment, Timestamp, Variant, WeightCheck},
    sharder::BucketHasher,
    storage::{KeyValueStore, ASSIGNED_VARIANTS_KEY},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentRecord {
    pub experiment_id: String,
    pub variant_id: String,
    /// Bucketing key of the identity the record belongs to.
    pub identity: String,
    pub assigned_at: Timestamp,
}

/// Result of [`AssignmentEngine::get_variant`].
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub record: AssignmentRecord,
    /// Present only when this call created the record.
    pub event: Option<AssignmentEvent>,
}

type RecordKey = (String, String);

pub struct AssignmentEngine {
    hasher: BucketHasher,
    storage: Arc<dyn KeyValueStore>,
    /// Keyed by `(experiment_id, identity)`. The lock also serializes check-then-act for first
    /// assignments, so two racing callers can never record different variants.
    records: Mutex<HashMap<RecordKey, AssignmentRecord>>,
    persisted: RwLock<HashSet<String>>,
}

impl AssignmentEngine {
    pub fn new(hasher: BucketHasher, storage: Arc<dyn KeyValueStore>) -> AssignmentEngine {
        AssignmentEngine {
            hasher,
            storage,
            records: Mutex::new(HashMap::new()),
            persisted: RwLock::new(HashSet::new()),
        }
    }

    /// Write records of `identity` to storage from now on.
    pub fn persist_identity(&self, identity: &str) {
        self.persisted
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(identity.to_owned());
    }

    fn is_persisted(&self, identity: &str) -> bool {
        self.persisted
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(identity)
    }

    /// Load persisted records. Records already held in memory win. Returns the number of records
    /// loaded.
    pub fn restore(&self) -> usize {
        let stored = match self.storage.get(ASSIGNED_VARIANTS_KEY) {
            Ok(Some(json)) => json,
            Ok(None) => return 0,
            Err(err) => {
                log::warn!(target: "flagkit", "failed to read assignments: {:?}", err);
                return 0;
            }
        };
        let stored: Vec<AssignmentRecord> = match serde_json::from_str(&stored) {
            Ok(stored) => stored,
            Err(err) => {
                log::warn!(target: "flagkit", "discarding corrupt assignments: {}", err);
                return 0;
            }
        };

        let mut records = self.lock();
        let mut loaded = 0;
        for record in stored {
            // Keep rewriting what was stored, even for an identity not registered this run.
            self.persist_identity(&record.identity);
            let key = (record.experiment_id.clone(), record.identity.clone());
            records.entry(key).or_insert_with(|| {
                loaded += 1;
                record
            });
        }
        log::debug!(target: "flagkit", loaded = loaded; "restored assignments");
        loaded
    }

    /// Existing record for `(experiment_id, identity)`, without assigning.
    pub fn assigned(&self, experiment_id: &str, identity: &str) -> Option<AssignmentRecord> {
        self.lock()
            .get(&(experiment_id.to_owned(), identity.to_owned()))
            .cloned()
    }

    /// Return the identity's variant for `experiment_id`, assigning one if the experiment is
    /// active in `snapshot` and no record exists yet.
    pub fn get_variant(
        &self,
        snapshot: &ConfigSnapshot,
        experiment_id: &str,
        identity: &Identity,
        now: Timestamp,
    ) -> Option<Assignment> {
        let mut records = self.lock();
        let key = (experiment_id.to_owned(), identity.key().to_owned());
        if let Some(record) = records.get(&key) {
            return Some(Assignment {
                record: record.clone(),
                event: None,
            });
        }

        let experiment = snapshot.experiment(experiment_id)?;
        let (record, event) = self.assign(experiment, identity, now)?;
        records.insert(key, record.clone());
        if self.is_persisted(identity.key()) {
            self.persist(&records);
        }

        Some(Assignment {
            record,
            event: Some(event),
        })
    }

    /// Assign every active experiment in `snapshot` the identity has no record for. Returns the
    /// events for the new assignments.
    pub fn assign_running(
        &self,
        snapshot: &ConfigSnapshot,
        identity: &Identity,
        now: Timestamp,
    ) -> Vec<AssignmentEvent> {
        let mut records = self.lock();
        let mut events = Vec::new();
        for experiment in snapshot.experiments().values() {
            let key = (experiment.id.clone(), identity.key().to_owned());
            if records.contains_key(&key) {
                continue;
            }
            if let Some((record, event)) = self.assign(experiment, identity, now) {
                records.insert(key, record);
                events.push(event);
            }
        }
        if !events.is_empty() && self.is_persisted(identity.key()) {
            self.persist(&records);
        }
        events
    }

    /// Pick a variant by walking declared variants and accumulating weight until the cumulative
    /// weight exceeds the identity's bucket. Weights are scaled to their actual total.
    pub fn select_variant<'a>(&self, experiment: &'a Experiment, key: &str) -> Option<&'a Variant> {
        let total = match experiment.check_weights() {
            WeightCheck::Exact => 100.0,
            WeightCheck::Skewed(total) => total,
            WeightCheck::Invalid => return None,
        };

        let bucket = self.hasher.bucket(key, &experiment.id);
        let threshold = f64::from(bucket) * total / 100.0;

        let mut cumulative = 0.0;
        for variant in &experiment.variants {
            cumulative += variant.weight;
            if threshold < cumulative {
                return Some(variant);
            }
        }
        // Only reachable through float rounding at the top of the range.
        experiment.variants.iter().rev().find(|v| v.weight > 0.0)
    }

    fn assign(
        &self,
        experiment: &Experiment,
        identity: &Identity,
        now: Timestamp,
    ) -> Option<(AssignmentRecord, AssignmentEvent)> {
        if !experiment.is_active_at(now) {
            log::trace!(target: "flagkit",
                        experiment_id = experiment.id.as_str();
                        "experiment is not accepting assignments");
            return None;
        }
        let variant = self.select_variant(experiment, identity.key())?;

        log::debug!(target: "flagkit",
                    experiment_id = experiment.id.as_str(),
                    variant_id = variant.id.as_str(),
                    identity = identity.key();
                    "assigned variant");

        let record = AssignmentRecord {
            experiment_id: experiment.id.clone(),
            variant_id: variant.id.clone(),
            identity: identity.key().to_owned(),
            assigned_at: now,
        };
        let event = AssignmentEvent {
            experiment_id: experiment.id.clone(),
            variant_id: variant.id.clone(),
            user_id: identity.user_id.clone(),
            device_id: identity.device_id.clone(),
            assigned_at: now,
        };
        Some((record, event))
    }

    /// Write the records of persisted identities. Called with the lock held so writes land in
    /// assignment order.
    fn persist(&self, records: &HashMap<RecordKey, AssignmentRecord>) {
        let persisted = self.persisted.read().unwrap_or_else(PoisonError::into_inner);
        let kept: Vec<&AssignmentRecord> = records
            .values()
            .filter(|record| persisted.contains(&record.identity))
            .collect();
        let written = serde_json::to_string(&kept)
            .map_err(crate::Error::from)
            .and_then(|json| self.storage.set(ASSIGNED_VARIANTS_KEY, &json));
        if let Err(err) = written {
            // Still sticky for the lifetime of this process.
            log::warn!(target: "flagkit", "failed to persist assignments: {:?}", err);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RecordKey, AssignmentRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Barrier,
        },
    };

    use chrono::{Duration, Utc};

    use super::{AssignmentEngine, AssignmentRecord};
    use crate::{
        error::Result,
        configuration_store::{ConfigSnapshot, WeightPolicy},
        identity::Identity,
        model::{Experiment, RemoteConfig},
        sharder::{BucketHasher, BucketingMode, DeterministicSharder},
        storage::{InMemoryStore, KeyValueStore, ASSIGNED_VARIANTS_KEY},
        testing::experiment,
    };

    fn snapshot(experiments: Vec<Experiment>) -> ConfigSnapshot {
        ConfigSnapshot::from_parts(
            RemoteConfig::default(),
            vec![],
            experiments,
            WeightPolicy::Normalize,
        )
    }

    fn engine_with_buckets(
        buckets: &[(&str, u64)],
        storage: Arc<InMemoryStore>,
    ) -> AssignmentEngine {
        let sharder = DeterministicSharder(
            buckets
                .iter()
                .map(|(input, bucket)| ((*input).to_owned(), *bucket))
                .collect(),
        );
        AssignmentEngine::new(
            BucketHasher::new(Arc::new(sharder), BucketingMode::Salted),
            storage,
        )
    }

    fn device(id: &str) -> Identity {
        Identity::new(None, id)
    }

    #[test]
    fn sticky_across_refresh() {
        let engine = engine_with_buckets(
            &[("device-abc:exp1", 10)],
            Arc::new(InMemoryStore::new()),
        );
        let identity = device("device-abc");

        let before = snapshot(vec![experiment("exp1", &[("A", 50.0), ("B", 50.0)])]);
        let first = engine
            .get_variant(&before, "exp1", &identity, Utc::now())
            .unwrap();
        assert_eq!(first.record.variant_id, "A");
        assert!(first.event.is_some());

        // Same experiment id, but weights now send bucket 10 to B.
        let after = snapshot(vec![experiment("exp1", &[("A", 5.0), ("B", 95.0)])]);
        for _ in 0..10 {
            let again = engine
                .get_variant(&after, "exp1", &identity, Utc::now())
                .unwrap();
            assert_eq!(again.record.variant_id, "A");
            assert!(again.event.is_none());
        }
    }

    #[test]
    fn sticky_across_restart() {
        let storage = Arc::new(InMemoryStore::new());
        let identity = device("device-abc");
        let variant = {
            let engine = AssignmentEngine::new(BucketHasher::default(), storage.clone());
            engine.persist_identity("device-abc");
            let snapshot = snapshot(vec![experiment("exp1", &[("A", 50.0), ("B", 50.0)])]);
            engine
                .get_variant(&snapshot, "exp1", &identity, Utc::now())
                .unwrap()
                .record
                .variant_id
        };

        let engine = AssignmentEngine::new(BucketHasher::default(), storage);
        assert_eq!(engine.restore(), 1);
        // Experiment no longer served; the record still answers.
        let assignment = engine
            .get_variant(&snapshot(vec![]), "exp1", &identity, Utc::now())
            .unwrap();
        assert_eq!(assignment.record.variant_id, variant);
    }

    #[test]
    fn unknown_or_inactive_experiment_is_not_assigned() {
        let engine = AssignmentEngine::new(BucketHasher::default(), Arc::new(InMemoryStore::new()));
        let identity = device("device-abc");
        let now = Utc::now();

        assert!(engine
            .get_variant(&snapshot(vec![]), "exp1", &identity, now)
            .is_none());

        let mut future = experiment("exp1", &[("A", 100.0)]);
        future.start_date = Some(now + Duration::days(1));
        assert!(engine
            .get_variant(&snapshot(vec![future]), "exp1", &identity, now)
            .is_none());
        assert!(engine.assigned("exp1", "device-abc").is_none());
    }

    #[test]
    fn weighted_distribution() {
        let engine = AssignmentEngine::new(BucketHasher::default(), Arc::new(InMemoryStore::new()));
        let snapshot = snapshot(vec![experiment("exp1", &[("A", 30.0), ("B", 70.0)])]);
        let now = Utc::now();

        let n = 10_000;
        let a = (0..n)
            .filter(|i| {
                engine
                    .get_variant(&snapshot, "exp1", &device(&format!("device-{i}")), now)
                    .unwrap()
                    .record
                    .variant_id
                    == "A"
            })
            .count();
        let fraction = a as f64 / n as f64;
        assert!((fraction - 0.30).abs() < 0.02, "{fraction}");
    }

    #[test]
    fn skewed_weights_are_normalized() {
        let engine = AssignmentEngine::new(BucketHasher::default(), Arc::new(InMemoryStore::new()));
        let experiment = experiment("exp1", &[("A", 1.0), ("B", 3.0)]);

        let n = 10_000;
        let a = (0..n)
            .filter(|i| {
                engine
                    .select_variant(&experiment, &format!("device-{i}"))
                    .unwrap()
                    .id
                    == "A"
            })
            .count();
        let fraction = a as f64 / n as f64;
        assert!((fraction - 0.25).abs() < 0.02, "{fraction}");
    }

    #[test]
    fn invalid_weights_select_nothing() {
        let engine = AssignmentEngine::new(BucketHasher::default(), Arc::new(InMemoryStore::new()));
        assert!(engine
            .select_variant(&experiment("exp1", &[("A", 0.0), ("B", 0.0)]), "device-abc")
            .is_none());
        assert!(engine
            .select_variant(&experiment("exp1", &[]), "device-abc")
            .is_none());
    }

    #[test]
    fn bucket_boundaries() {
        let engine = engine_with_buckets(
            &[("low:exp1", 0), ("edge:exp1", 30), ("high:exp1", 99)],
            Arc::new(InMemoryStore::new()),
        );
        let experiment = experiment("exp1", &[("A", 30.0), ("B", 70.0)]);
        assert_eq!(engine.select_variant(&experiment, "low").unwrap().id, "A");
        assert_eq!(engine.select_variant(&experiment, "edge").unwrap().id, "B");
        assert_eq!(engine.select_variant(&experiment, "high").unwrap().id, "B");
    }

    #[test]
    fn concurrent_first_assignment_records_once() {
        let storage = Arc::new(InMemoryStore::new());
        let engine = Arc::new(AssignmentEngine::new(BucketHasher::default(), storage.clone()));
        engine.persist_identity("device-abc");
        let snapshot = Arc::new(snapshot(vec![experiment("exp1", &[("A", 50.0), ("B", 50.0)])]));
        let barrier = Arc::new(Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let engine = engine.clone();
                let snapshot = snapshot.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    engine
                        .get_variant(&snapshot, "exp1", &device("device-abc"), Utc::now())
                        .unwrap()
                })
            })
            .collect();
        let assignments: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(assignments.iter().filter(|a| a.event.is_some()).count(), 1);
        let variant = &assignments[0].record.variant_id;
        assert!(assignments.iter().all(|a| &a.record.variant_id == variant));

        let stored: Vec<AssignmentRecord> =
            serde_json::from_str(&storage.get(ASSIGNED_VARIANTS_KEY).unwrap().unwrap()).unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[test]
    fn assign_running_assigns_each_experiment_once() {
        let engine = AssignmentEngine::new(BucketHasher::default(), Arc::new(InMemoryStore::new()));
        let snapshot = snapshot(vec![
            experiment("exp1", &[("A", 50.0), ("B", 50.0)]),
            experiment("exp2", &[("control", 100.0)]),
        ]);
        let identity = Identity::new(Some("user-1".to_owned()), "device-abc");

        let mut events = engine.assign_running(&snapshot, &identity, Utc::now());
        events.sort_by(|a, b| a.experiment_id.cmp(&b.experiment_id));
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].variant_id, "control");
        assert_eq!(events[0].user_id.as_deref(), Some("user-1"));
        assert_eq!(events[0].device_id, "device-abc");

        assert!(engine
            .assign_running(&snapshot, &identity, Utc::now())
            .is_empty());
        assert_eq!(
            engine.assigned("exp2", "user-1").unwrap().variant_id,
            "control"
        );
    }

    #[test]
    fn corrupt_persisted_assignments_are_discarded() {
        let storage = Arc::new(InMemoryStore::new());
        storage.set(ASSIGNED_VARIANTS_KEY, "{\"exp1\":").unwrap();
        let engine = AssignmentEngine::new(BucketHasher::default(), storage);
        assert_eq!(engine.restore(), 0);

        let snapshot = snapshot(vec![experiment("exp1", &[("A", 100.0)])]);
        let assignment = engine
            .get_variant(&snapshot, "exp1", &device("device-abc"), Utc::now())
            .unwrap();
        assert_eq!(assignment.record.variant_id, "A");
    }

    #[test]
    fn records_are_keyed_per_identity() {
        let engine = AssignmentEngine::new(BucketHasher::default(), Arc::new(InMemoryStore::new()));
        let snapshot = snapshot(vec![experiment("exp1", &[("A", 50.0), ("B", 50.0)])]);
        let mut seen = HashMap::new();
        for i in 0..50 {
            let id = format!("device-{i}");
            let assignment = engine
                .get_variant(&snapshot, "exp1", &device(&id), Utc::now())
                .unwrap();
            seen.insert(id, assignment.record.variant_id);
        }
        for (id, variant) in seen {
            assert_eq!(engine.assigned("exp1", &id).unwrap().variant_id, variant);
        }
    }

    #[derive(Default)]
    struct CountingStore {
        inner: InMemoryStore,
        writes: AtomicUsize,
        bytes: AtomicUsize,
    }

    impl KeyValueStore for CountingStore {
        fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> Result<()> {
            self.writes.fetch_add(1, Ordering::Relaxed);
            self.bytes.fetch_add(value.len(), Ordering::Relaxed);
            self.inner.set(key, value)
        }

        fn remove(&self, key: &str) -> Result<()> {
            self.inner.remove(key)
        }
    }

    #[test]
    fn serving_other_identities_does_not_grow_persistence() {
        let storage = Arc::new(CountingStore::default());
        let engine = AssignmentEngine::new(BucketHasher::default(), storage.clone());
        engine.persist_identity("device-local");
        let snapshot = snapshot(vec![
            experiment("exp1", &[("A", 50.0), ("B", 50.0)]),
            experiment("exp2", &[("control", 100.0)]),
        ]);

        for i in 0..2_000 {
            let identity = device(&format!("device-{i}"));
            engine.get_variant(&snapshot, "exp1", &identity, Utc::now());
            engine.assign_running(&snapshot, &identity, Utc::now());
        }
        assert_eq!(storage.writes.load(Ordering::Relaxed), 0);
        assert!(engine.assigned("exp1", "device-1999").is_some());

        let local = device("device-local");
        engine.assign_running(&snapshot, &local, Utc::now());
        assert_eq!(storage.writes.load(Ordering::Relaxed), 1);
        // Only the local identity's two records are written.
        assert!(storage.bytes.load(Ordering::Relaxed) < 1_000);
        let stored: Vec<AssignmentRecord> = serde_json::from_str(
            &storage.get(ASSIGNED_VARIANTS_KEY).unwrap().unwrap(),
        )
        .unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|r| r.identity == "device-local"));
    }
}
