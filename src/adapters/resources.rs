//! Access to the operator's own custom resources

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, Time};
use kube::{
    api::{ObjectMeta, Patch, PatchParams, PostParams},
    Api, Client, Resource,
};
use serde_json::json;
use tracing::{debug, warn};

use super::secrets::FIELD_MANAGER;
use crate::controllers::LAST_HANDLED_ANNOTATION;
use crate::crd::{PostgresqlDatabase, PostgresqlServer, ResourceStatus};
use crate::error::Result;
use crate::reconcilers::ACTION_LABEL;

/// Kind of operator resource
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Server,
    Database,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Server => "PostgresqlServer",
            ResourceKind::Database => "PostgresqlDatabase",
        }
    }
}

/// Identity of one operator resource
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
    pub uid: Option<String>,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
            uid: None,
        }
    }

    pub fn with_uid(mut self, uid: Option<String>) -> Self {
        self.uid = uid;
        self
    }
}

/// Severity of an advisory event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdvisoryLevel {
    Normal,
    Warning,
}

impl AdvisoryLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdvisoryLevel::Normal => "Normal",
            AdvisoryLevel::Warning => "Warning",
        }
    }
}

/// Human-readable notice attached to a resource
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Advisory {
    pub level: AdvisoryLevel,
    pub reason: String,
    pub message: String,
}

impl Advisory {
    pub fn normal(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: AdvisoryLevel::Normal,
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn warning(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: AdvisoryLevel::Warning,
            reason: reason.into(),
            message: message.into(),
        }
    }
}

/// Writes against operator resources
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Replace the status subresource
    async fn patch_status(&self, resource: &ResourceRef, status: &ResourceStatus) -> Result<()>;

    /// Remove the action label
    async fn clear_action_label(&self, resource: &ResourceRef) -> Result<()>;

    /// Store the last handled state on the object so it outlives a restart
    async fn record_handled(&self, resource: &ResourceRef, snapshot: &str) -> Result<()>;

    /// Publish an advisory event; failures are logged, never fatal
    async fn publish(&self, resource: &ResourceRef, advisory: &Advisory);

    /// Look up a server; `None` when absent
    async fn get_server(&self, namespace: &str, name: &str) -> Result<Option<PostgresqlServer>>;
}

/// [`ResourceClient`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeResourceClient {
    client: Client,
}

impl KubeResourceClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn patch(&self, resource: &ResourceRef, subresource_status: bool, body: serde_json::Value) -> Result<()> {
        let params = PatchParams::apply(FIELD_MANAGER);
        let patch = Patch::Merge(&body);
        match resource.kind {
            ResourceKind::Server => {
                let api: Api<PostgresqlServer> = Api::namespaced(self.client.clone(), &resource.namespace);
                if subresource_status {
                    api.patch_status(&resource.name, &params, &patch).await?;
                } else {
                    api.patch(&resource.name, &params, &patch).await?;
                }
            }
            ResourceKind::Database => {
                let api: Api<PostgresqlDatabase> = Api::namespaced(self.client.clone(), &resource.namespace);
                if subresource_status {
                    api.patch_status(&resource.name, &params, &patch).await?;
                } else {
                    api.patch(&resource.name, &params, &patch).await?;
                }
            }
        }
        Ok(())
    }
}

/// Merge patch body replacing the status
pub fn status_patch(status: &ResourceStatus) -> serde_json::Value {
    json!({ "status": status })
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    async fn patch_status(&self, resource: &ResourceRef, status: &ResourceStatus) -> Result<()> {
        self.patch(resource, true, status_patch(status)).await
    }

    async fn clear_action_label(&self, resource: &ResourceRef) -> Result<()> {
        let body = json!({ "metadata": { "labels": { ACTION_LABEL: null } } });
        self.patch(resource, false, body).await?;
        debug!(name = %resource.name, namespace = %resource.namespace, "Cleared action label");
        Ok(())
    }

    async fn record_handled(&self, resource: &ResourceRef, snapshot: &str) -> Result<()> {
        let body = json!({ "metadata": { "annotations": { LAST_HANDLED_ANNOTATION: snapshot } } });
        self.patch(resource, false, body).await
    }

    async fn publish(&self, resource: &ResourceRef, advisory: &Advisory) {
        let now = Utc::now();
        let api_version = match resource.kind {
            ResourceKind::Server => PostgresqlServer::api_version(&()),
            ResourceKind::Database => PostgresqlDatabase::api_version(&()),
        };
        let event = Event {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}.", resource.name)),
                namespace: Some(resource.namespace.clone()),
                ..Default::default()
            },
            involved_object: ObjectReference {
                api_version: Some(api_version.to_string()),
                kind: Some(resource.kind.as_str().to_string()),
                name: Some(resource.name.clone()),
                namespace: Some(resource.namespace.clone()),
                uid: resource.uid.clone(),
                ..Default::default()
            },
            type_: Some(advisory.level.as_str().to_string()),
            reason: Some(advisory.reason.clone()),
            message: Some(advisory.message.clone()),
            count: Some(1),
            first_timestamp: Some(Time(now)),
            last_timestamp: Some(Time(now)),
            event_time: Some(MicroTime(now)),
            action: Some("Reconcile".to_string()),
            reporting_component: Some(FIELD_MANAGER.to_string()),
            reporting_instance: Some(FIELD_MANAGER.to_string()),
            source: Some(EventSource {
                component: Some(FIELD_MANAGER.to_string()),
                host: None,
            }),
            ..Default::default()
        };

        let api: Api<Event> = Api::namespaced(self.client.clone(), &resource.namespace);
        if let Err(e) = api.create(&PostParams::default(), &event).await {
            warn!(
                name = %resource.name,
                reason = %advisory.reason,
                error = %e,
                "Failed to publish event"
            );
        }
    }

    async fn get_server(&self, namespace: &str, name: &str) -> Result<Option<PostgresqlServer>> {
        let api: Api<PostgresqlServer> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{DeploymentPhase, DeploymentStatus};

    #[test]
    fn test_status_patch_clears_previous_reason() {
        let working = ResourceStatus {
            backend: Some("awsrds".into()),
            deployment: Some(DeploymentStatus {
                status: DeploymentPhase::Working,
                reason: None,
                latest_update: None,
            }),
        };
        let body = status_patch(&working);
        assert_eq!(body["status"]["deployment"]["status"], "working");
        assert!(body["status"]["deployment"]
            .as_object()
            .unwrap()
            .get("reason")
            .is_some_and(|r| r.is_null()));
    }
}
