//! Reconcilers for PostgreSQL resources
//!
//! This module contains the business logic for reconciling each CRD type.
//! Reconcilers are responsible for:
//! - Selecting and validating against a backend
//! - Driving the credential protocol around provider calls
//! - Executing operator commands from the action label
//! - Updating resource status
//!
//! They see the world only through [`ReconcileContext`], so the Kubernetes
//! controllers and the tests drive the same code.

pub mod actions;
pub mod database;
pub mod diff;
pub mod server;

pub use actions::{ActionSlot, Command, ACTION_LABEL};
pub use diff::{DiffEntry, DiffOp};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::adapters::{ResourceClient, ResourceKind, ResourceRef, SecretStore};
use crate::backends::BackendRegistry;
use crate::config::OperatorSettings;
use crate::credentials::CredentialManager;
use crate::crd::{DeploymentPhase, DeploymentStatus, ResourceStatus};
use crate::error::Result;

/// Everything a reconcile pass needs from the outside world
#[derive(Clone)]
pub struct ReconcileContext {
    pub settings: OperatorSettings,
    pub registry: BackendRegistry,
    pub resources: Arc<dyn ResourceClient>,
    pub credentials: CredentialManager,
}

impl ReconcileContext {
    pub fn new(
        settings: OperatorSettings,
        registry: BackendRegistry,
        secrets: Arc<dyn SecretStore>,
        resources: Arc<dyn ResourceClient>,
    ) -> Self {
        let credentials = CredentialManager::new(secrets, settings.operator_namespace.clone(), settings.password);
        Self {
            settings,
            registry,
            resources,
            credentials,
        }
    }
}

/// One observed resource handed to a reconciler
#[derive(Clone, Debug)]
pub struct ReconcileRequest<S> {
    pub namespace: String,
    pub name: String,
    pub uid: Option<String>,
    pub spec: S,
    pub status: Option<ResourceStatus>,
    pub labels: BTreeMap<String, String>,
    /// Changes since the last handled state
    pub diff: Vec<DiffEntry>,
    /// Consecutive retryable failures so far
    pub retry: u32,
}

impl<S> ReconcileRequest<S> {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: S) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            uid: None,
            spec,
            status: None,
            labels: BTreeMap::new(),
            diff: Vec::new(),
            retry: 0,
        }
    }

    pub fn resource(&self, kind: ResourceKind) -> ResourceRef {
        ResourceRef::new(kind, &self.namespace, &self.name).with_uid(self.uid.clone())
    }

    /// Backend recorded by an earlier pass
    pub fn pinned_backend(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.backend.as_deref())
    }
}

/// Result of a pass that did not fail
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Provisioning ran to completion
    Finished,
    /// Nothing relevant changed; no side effects
    Unchanged,
}

/// Patch the deployment status, keeping a previously recorded backend
/// unless a new one is given
pub async fn update_status(
    resources: &dyn ResourceClient,
    resource: &ResourceRef,
    previous: Option<&ResourceStatus>,
    phase: DeploymentPhase,
    reason: Option<String>,
    backend: Option<&str>,
) -> Result<()> {
    let status = ResourceStatus {
        backend: backend
            .map(str::to_string)
            .or_else(|| previous.and_then(|s| s.backend.clone())),
        deployment: Some(DeploymentStatus {
            status: phase,
            reason,
            latest_update: Some(Utc::now()),
        }),
    };
    debug!(name = %resource.name, phase = phase.as_str(), "Updating status");
    resources.patch_status(resource, &status).await
}

/// Backoff while waiting for a dependency, growing with the attempt count
pub fn dependency_backoff(retry: u32) -> Duration {
    match retry {
        0..=4 => Duration::from_secs(20),
        5..=9 => Duration::from_secs(30),
        _ => Duration::from_secs(60),
    }
}

/// Database and role name derived from a resource name
pub fn canonical_identifier(name: &str) -> String {
    name.replace(['-', '.'], "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependency_backoff_steps() {
        assert_eq!(dependency_backoff(0), Duration::from_secs(20));
        assert_eq!(dependency_backoff(4), Duration::from_secs(20));
        assert_eq!(dependency_backoff(5), Duration::from_secs(30));
        assert_eq!(dependency_backoff(9), Duration::from_secs(30));
        assert_eq!(dependency_backoff(10), Duration::from_secs(60));
        assert_eq!(dependency_backoff(250), Duration::from_secs(60));
    }

    #[test]
    fn test_canonical_identifier() {
        assert_eq!(canonical_identifier("orders-db.v2"), "orders_db_v2");
        assert_eq!(canonical_identifier("plain"), "plain");
    }

    #[test]
    fn test_pinned_backend() {
        let mut request = ReconcileRequest::new("ns", "a", ());
        assert_eq!(request.pinned_backend(), None);
        request.status = Some(ResourceStatus {
            backend: Some("helmbitnami".into()),
            deployment: None,
        });
        assert_eq!(request.pinned_backend(), Some("helmbitnami"));
    }
}
