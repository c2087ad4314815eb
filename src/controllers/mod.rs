//! Kubernetes controllers for PostgreSQL CRDs
//!
//! This module contains the controller implementations that watch for CRD changes
//! and trigger reconciliation.
//!
//! The controllers keep a per-object record of the last handled state. A
//! pass runs only when the spec or labels differ from that record, or a
//! retry is due. Retryable failures leave the record untouched so the next
//! pass sees the same changes again; permanent failures are recorded as
//! handled and wait for the next user change.
//!
//! The handled state is also written to the [`LAST_HANDLED_ANNOTATION`]
//! so that changes made while the operator was down are seen on restart.

mod database_controller;
mod server_controller;

pub use database_controller::run as run_database_controller;
pub use server_controller::run as run_server_controller;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, warn};

use crate::adapters::{ResourceClient, ResourceKind, ResourceRef};
use crate::crd::{
    DeploymentPhase, PostgresqlDatabase, PostgresqlDatabaseSpec, PostgresqlServer, PostgresqlServerSpec,
    ResourceStatus,
};
use crate::error::{Error, ErrorKind, Result};
use crate::metrics;
use crate::reconcilers::{diff, DiffEntry, ReconcileContext, ReconcileRequest};

/// Shared context for all controllers
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    pub reconcile: ReconcileContext,
    pub tracker: ReconcileTracker,
}

impl Context {
    /// Create a new context
    pub fn new(client: Client, reconcile: ReconcileContext) -> Self {
        Self {
            client,
            reconcile,
            tracker: ReconcileTracker::default(),
        }
    }
}

/// Operator resource as seen by the controllers
pub trait Observed: Resource + Sized {
    const KIND: ResourceKind;
    type Spec: Serialize + Clone;

    fn spec(&self) -> &Self::Spec;
    fn status(&self) -> Option<&ResourceStatus>;
}

impl Observed for PostgresqlServer {
    const KIND: ResourceKind = ResourceKind::Server;
    type Spec = PostgresqlServerSpec;

    fn spec(&self) -> &PostgresqlServerSpec {
        &self.spec
    }

    fn status(&self) -> Option<&ResourceStatus> {
        self.status.as_ref()
    }
}

impl Observed for PostgresqlDatabase {
    const KIND: ResourceKind = ResourceKind::Database;
    type Spec = PostgresqlDatabaseSpec;

    fn spec(&self) -> &PostgresqlDatabaseSpec {
        &self.spec
    }

    fn status(&self) -> Option<&ResourceStatus> {
        self.status.as_ref()
    }
}

/// Annotation holding the JSON of the last handled state
pub const LAST_HANDLED_ANNOTATION: &str = "postgres.oso.sh/last-handled";

/// Tracker key: kind, namespace, name
pub type ObjectKey = (ResourceKind, String, String);

pub fn object_key<K: Observed>(obj: &K) -> ObjectKey {
    (K::KIND, namespace_of(obj), obj.name_any())
}

fn namespace_of<K: Resource>(obj: &K) -> String {
    obj.namespace().unwrap_or_else(|| "default".to_string())
}

/// The parts of an object a pass reacts to
pub fn snapshot<K: Observed>(obj: &K) -> Result<Value> {
    let mut metadata = json!({ "labels": obj.labels() });
    if let Some(deleted) = &obj.meta().deletion_timestamp {
        metadata["deletionTimestamp"] = serde_json::to_value(deleted)?;
    }
    Ok(json!({
        "spec": serde_json::to_value(obj.spec())?,
        "metadata": metadata,
    }))
}

/// Handled state stored on the object; unreadable values count as absent
pub fn persisted_snapshot<K: Observed>(obj: &K) -> Option<Value> {
    let raw = obj.annotations().get(LAST_HANDLED_ANNOTATION)?;
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(name = %obj.name_any(), error = %e, "Ignoring unreadable last-handled annotation");
            None
        }
    }
}

/// Write the handled state to the object when it differs from the stored one.
///
/// Failures are logged only; the in-memory record still covers this process.
pub async fn persist_handled<K: Observed>(resources: &dyn ResourceClient, obj: &K, state: &Value) {
    if persisted_snapshot(obj).as_ref() == Some(state) {
        return;
    }
    let resource = ResourceRef::new(K::KIND, namespace_of(obj), obj.name_any()).with_uid(obj.uid());
    let result = match serde_json::to_string(state) {
        Ok(raw) => resources.record_handled(&resource, &raw).await,
        Err(e) => Err(e.into()),
    };
    if let Err(e) = result {
        warn!(name = %resource.name, namespace = %resource.namespace, error = %e, "Failed to store last handled state");
    }
}

/// Build the reconciler input for an object
pub fn request_for<K: Observed>(obj: &K, diff: Vec<DiffEntry>, retry: u32) -> ReconcileRequest<K::Spec> {
    let labels: BTreeMap<String, String> = obj.labels().clone();
    ReconcileRequest {
        namespace: namespace_of(obj),
        name: obj.name_any(),
        uid: obj.uid(),
        spec: obj.spec().clone(),
        status: obj.status().cloned(),
        labels,
        diff,
        retry,
    }
}

fn is_finished<K: Observed>(obj: &K) -> bool {
    obj.status().and_then(|s| s.phase()) == Some(DeploymentPhase::Finished)
}

/// What to do with an observed object
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Plan {
    Run { diff: Vec<DiffEntry>, retry: u32 },
    Skip,
    Wait(Duration),
}

struct PendingRetry {
    attempts: u32,
    not_before: Instant,
    snapshot: Value,
}

#[derive(Default)]
struct ObjectRecord {
    handled: Option<Value>,
    retry: Option<PendingRetry>,
}

/// Last handled state and pending retries per object
#[derive(Default)]
pub struct ReconcileTracker {
    objects: Mutex<HashMap<ObjectKey, ObjectRecord>>,
}

impl ReconcileTracker {
    fn lock(&self) -> MutexGuard<'_, HashMap<ObjectKey, ObjectRecord>> {
        self.objects.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Decide whether an observed state needs a pass.
    ///
    /// On first sight the `persisted` state stored on the object stands in
    /// for the in-memory record. Without one, `finished` objects are taken
    /// as handled unless `handler_on_resume` is set.
    pub fn plan(
        &self,
        key: &ObjectKey,
        snapshot: &Value,
        persisted: Option<&Value>,
        finished: bool,
        handler_on_resume: bool,
    ) -> Plan {
        self.plan_at(key, snapshot, persisted, finished, handler_on_resume, Instant::now())
    }

    fn plan_at(
        &self,
        key: &ObjectKey,
        snapshot: &Value,
        persisted: Option<&Value>,
        finished: bool,
        handler_on_resume: bool,
        now: Instant,
    ) -> Plan {
        let objects = self.lock();
        let record = objects.get(key);

        if let Some(retry) = record.and_then(|r| r.retry.as_ref()) {
            if retry.snapshot == *snapshot && now < retry.not_before {
                return Plan::Wait(retry.not_before - now);
            }
            let none = Value::Null;
            let handled = record.and_then(|r| r.handled.as_ref()).unwrap_or(&none);
            return Plan::Run {
                diff: diff::compute(handled, snapshot),
                retry: retry.attempts,
            };
        }

        let handled = match record.and_then(|r| r.handled.as_ref()) {
            Some(handled) => Some(handled),
            None if handler_on_resume => None,
            None => persisted,
        };

        match handled {
            None if finished && !handler_on_resume => Plan::Skip,
            None => Plan::Run {
                diff: diff::compute(&Value::Null, snapshot),
                retry: 0,
            },
            Some(handled) => {
                let diff = diff::compute(handled, snapshot);
                if diff.is_empty() {
                    Plan::Skip
                } else {
                    Plan::Run { diff, retry: 0 }
                }
            }
        }
    }

    /// Remaining backoff for an unchanged object, if any
    pub fn pending_wait(&self, key: &ObjectKey, snapshot: &Value) -> Option<Duration> {
        let now = Instant::now();
        self.lock()
            .get(key)
            .and_then(|r| r.retry.as_ref())
            .filter(|retry| retry.snapshot == *snapshot && now < retry.not_before)
            .map(|retry| retry.not_before - now)
    }

    /// Consecutive retryable failures recorded for an object
    pub fn attempts(&self, key: &ObjectKey) -> u32 {
        self.lock()
            .get(key)
            .and_then(|r| r.retry.as_ref())
            .map_or(0, |retry| retry.attempts)
    }

    /// Store a state as handled and drop any pending retry
    pub fn record_handled(&self, key: &ObjectKey, snapshot: Value) {
        let mut objects = self.lock();
        let record = objects.entry(key.clone()).or_default();
        record.handled = Some(snapshot);
        record.retry = None;
    }

    /// Schedule a retry; returns the attempt count so far
    pub fn record_retry(&self, key: &ObjectKey, snapshot: Value, delay: Duration) -> u32 {
        let mut objects = self.lock();
        let record = objects.entry(key.clone()).or_default();
        let attempts = record.retry.as_ref().map_or(0, |r| r.attempts) + 1;
        record.retry = Some(PendingRetry {
            attempts,
            not_before: Instant::now() + delay,
            snapshot,
        });
        attempts
    }

    pub fn forget(&self, key: &ObjectKey) {
        self.lock().remove(key);
    }
}

/// Delay for retryable errors that carry no hint: 10s with 5s of jitter
pub fn ambient_backoff() -> Duration {
    Duration::from_millis(rand::rng().random_range(5_000..=15_000))
}

/// Error policy shared by both controllers
pub fn error_policy<K: Observed>(obj: Arc<K>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = object_key(obj.as_ref());
    let kind = error.kind();
    let class = match kind {
        ErrorKind::Permanent => "permanent",
        ErrorKind::Retryable { .. } => "retryable",
    };
    metrics::RECONCILIATION_ERRORS
        .with_label_values(&[K::KIND.as_str(), class])
        .inc();

    let snapshot = match snapshot(obj.as_ref()) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            error!(name = %key.2, error = %e, "Failed to snapshot object");
            return Action::requeue(ambient_backoff());
        }
    };

    match kind {
        ErrorKind::Permanent => {
            error!(name = %key.2, namespace = %key.1, error = %error, "Reconciliation failed permanently, waiting for a change");
            ctx.tracker.record_handled(&key, snapshot);
            Action::await_change()
        }
        ErrorKind::Retryable { delay } => {
            let delay = delay.unwrap_or_else(ambient_backoff);
            let attempts = ctx.tracker.record_retry(&key, snapshot, delay);
            warn!(
                name = %key.2,
                namespace = %key.1,
                error = %error,
                attempt = attempts,
                delay_secs = delay.as_secs(),
                "Reconciliation failed, scheduling retry"
            );
            Action::requeue(delay)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ObjectKey {
        (ResourceKind::Server, "ns".to_string(), "a".to_string())
    }

    fn state(class: &str) -> Value {
        json!({"spec": {"size": {"class": class}}, "metadata": {"labels": {}}})
    }

    #[test]
    fn test_first_sight_runs_with_full_diff() {
        let tracker = ReconcileTracker::default();
        match tracker.plan(&key(), &state("small"), None, false, false) {
            Plan::Run { diff, retry } => {
                assert!(!diff.is_empty());
                assert_eq!(retry, 0);
            }
            other => panic!("unexpected plan {:?}", other),
        }
    }

    #[test]
    fn test_finished_object_skipped_on_resume() {
        let tracker = ReconcileTracker::default();
        assert_eq!(tracker.plan(&key(), &state("small"), None, true, false), Plan::Skip);
        assert!(matches!(
            tracker.plan(&key(), &state("small"), None, true, true),
            Plan::Run { .. }
        ));
    }

    fn labelled(class: &str, action: &str) -> Value {
        json!({
            "spec": {"size": {"class": class}},
            "metadata": {"labels": {"postgres.oso.sh/action": action}}
        })
    }

    #[test]
    fn test_changes_made_while_down_run_after_restart() {
        let tracker = ReconcileTracker::default();
        let stored = state("small");
        let observed = labelled("small", "reset-password");

        match tracker.plan(&key(), &observed, Some(&stored), true, false) {
            Plan::Run { diff, retry } => {
                assert_eq!(retry, 0);
                assert_eq!(diff.len(), 1);
                assert_eq!(
                    diff[0].path,
                    vec!["metadata", "labels", "postgres.oso.sh/action"]
                );
            }
            other => panic!("unexpected plan {:?}", other),
        }

        match tracker.plan(&key(), &state("large"), Some(&stored), true, false) {
            Plan::Run { diff, .. } => assert_eq!(diff.len(), 1),
            other => panic!("unexpected plan {:?}", other),
        }
    }

    #[test]
    fn test_stored_state_unchanged_after_restart_is_skipped() {
        let tracker = ReconcileTracker::default();
        let stored = state("small");
        assert_eq!(tracker.plan(&key(), &state("small"), Some(&stored), false, false), Plan::Skip);
    }

    #[test]
    fn test_memory_record_wins_over_stored_state() {
        let tracker = ReconcileTracker::default();
        tracker.record_handled(&key(), state("large"));
        let stale = state("small");
        assert_eq!(tracker.plan(&key(), &state("large"), Some(&stale), false, false), Plan::Skip);
    }

    #[test]
    fn test_unchanged_handled_state_is_skipped() {
        let tracker = ReconcileTracker::default();
        tracker.record_handled(&key(), state("small"));
        assert_eq!(tracker.plan(&key(), &state("small"), None, true, true), Plan::Skip);
        assert!(matches!(
            tracker.plan(&key(), &state("large"), None, true, true),
            Plan::Run { .. }
        ));
    }

    #[test]
    fn test_retry_waits_then_runs_with_attempt_count() {
        let tracker = ReconcileTracker::default();
        tracker.record_handled(&key(), state("small"));
        assert_eq!(tracker.record_retry(&key(), state("large"), Duration::from_secs(20)), 1);

        let now = Instant::now();
        assert!(matches!(
            tracker.plan_at(&key(), &state("large"), None, false, false, now),
            Plan::Wait(_)
        ));

        match tracker.plan_at(&key(), &state("large"), None, false, false, now + Duration::from_secs(21)) {
            Plan::Run { diff, retry } => {
                assert_eq!(retry, 1);
                assert_eq!(diff.len(), 1);
            }
            other => panic!("unexpected plan {:?}", other),
        }
    }

    #[test]
    fn test_user_change_cuts_backoff_short() {
        let tracker = ReconcileTracker::default();
        tracker.record_retry(&key(), state("large"), Duration::from_secs(60));
        assert!(matches!(
            tracker.plan(&key(), &state("xlarge"), None, false, false),
            Plan::Run { retry: 1, .. }
        ));
    }

    #[test]
    fn test_handled_clears_attempts() {
        let tracker = ReconcileTracker::default();
        tracker.record_retry(&key(), state("large"), Duration::from_secs(20));
        tracker.record_retry(&key(), state("large"), Duration::from_secs(20));
        assert_eq!(tracker.attempts(&key()), 2);
        tracker.record_handled(&key(), state("large"));
        assert_eq!(tracker.attempts(&key()), 0);
        assert_eq!(tracker.pending_wait(&key(), &state("large")), None);
    }

    #[test]
    fn test_ambient_backoff_range() {
        for _ in 0..50 {
            let delay = ambient_backoff();
            assert!(delay >= Duration::from_secs(5) && delay <= Duration::from_secs(15));
        }
    }
}
