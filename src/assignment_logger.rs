use serde::{Deserialize, Serialize};

use crate::model::{ConfigMap, Timestamp};

/// Emitted once, when an identity is first assigned a variant. Matches the
/// `experiment_assignments` row shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentEvent {
    pub experiment_id: String,
    pub variant_id: String,
    pub user_id: Option<String>,
    pub device_id: String,
    pub assigned_at: Timestamp,
}

/// A caller-tracked experiment event. Matches the `experiment_events` row shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentEvent {
    pub experiment_id: String,
    pub variant_id: String,
    pub user_id: Option<String>,
    pub device_id: String,
    pub event_name: String,
    pub properties: Option<ConfigMap>,
    pub created_at: Timestamp,
}

/// Receives assignment events, typically to forward them to an analytics pipeline.
///
/// Called synchronously on the thread that made the assignment, so implementations should not
/// block.
pub trait AssignmentLogger {
    fn log_assignment(&self, event: AssignmentEvent);
}

pub(crate) struct NoopAssignmentLogger;
impl AssignmentLogger for NoopAssignmentLogger {
    fn log_assignment(&self, _event: AssignmentEvent) {}
}

impl<T: Fn(AssignmentEvent)> AssignmentLogger for T {
    fn log_assignment(&self, event: AssignmentEvent) {
        self(event);
    }
}
