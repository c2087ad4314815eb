//! Custom Resource Definitions for the PostgreSQL Provisioning Operator

mod postgresql_database;
mod postgresql_server;

pub use postgresql_database::*;
pub use postgresql_server::*;

use chrono::{DateTime, Utc};
use kube::CustomResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// API group shared by all operator resources
pub const API_GROUP: &str = "postgres.oso.sh";

/// Generate all CRD YAML manifests
pub fn generate_crds() -> Result<Vec<String>> {
    Ok(vec![
        serde_yaml::to_string(&PostgresqlServer::crd())?,
        serde_yaml::to_string(&PostgresqlDatabase::crd())?,
    ])
}

/// Status shared by servers and databases
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct ResourceStatus {
    /// Backend the resource was provisioned with; fixed once set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,

    /// Progress of the last reconcile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<DeploymentStatus>,
}

impl ResourceStatus {
    /// Current phase, if any pass has run
    pub fn phase(&self) -> Option<DeploymentPhase> {
        self.deployment.as_ref().map(|d| d.status)
    }
}

/// Deployment progress
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct DeploymentStatus {
    pub status: DeploymentPhase,

    /// Always serialized so a merge patch clears an earlier reason
    #[serde(default)]
    pub reason: Option<String>,

    #[serde(rename = "latest-update", default, skip_serializing_if = "Option::is_none")]
    pub latest_update: Option<DateTime<Utc>>,
}

/// Deployment phase
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentPhase {
    Working,
    Finished,
    Failed,
}

impl DeploymentPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentPhase::Working => "working",
            DeploymentPhase::Finished => "finished",
            DeploymentPhase::Failed => "failed",
        }
    }
}
