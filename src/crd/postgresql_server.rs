//! PostgresqlServer Custom Resource Definition

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ResourceStatus;

/// PostgresqlServer resource specification
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "postgres.oso.sh",
    version = "v1alpha1",
    kind = "PostgresqlServer",
    plural = "postgresqlservers",
    singular = "postgresqlserver",
    shortname = "pgs",
    namespaced,
    status = "ResourceStatus",
    printcolumn = r#"{"name": "Backend", "type": "string", "jsonPath": ".status.backend"}"#,
    printcolumn = r#"{"name": "Status", "type": "string", "jsonPath": ".status.deployment.status"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PostgresqlServerSpec {
    /// Backend to provision with (defaults to the operator's configured backend)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,

    /// Size of the server
    #[serde(default)]
    pub size: SizeSpec,

    /// PostgreSQL version, either `major` or `major.minor`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Maintenance settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance: Option<MaintenanceSpec>,

    /// Network access settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkSpec>,

    /// Backup settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupSpec>,

    /// High availability settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_availability: Option<HighAvailabilitySpec>,

    /// Extensions to allow on the server
    #[serde(default)]
    pub extensions: Vec<String>,

    /// Name of the secret receiving the admin credentials
    pub credentials_secret: String,
}

/// Server size, either a named class or raw values (self-hosted backends only)
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SizeSpec {
    /// Named size class from the backend's catalog
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,

    /// CPU request, Kubernetes quantity format
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    /// Memory in MiB
    #[serde(rename = "memoryMB", default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u32>,

    /// Storage in GiB
    #[serde(rename = "storageGB", default, skip_serializing_if = "Option::is_none")]
    pub storage_gb: Option<u32>,

    /// Let the provider grow storage automatically
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_auto_grow: Option<bool>,
}

/// Maintenance settings
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct MaintenanceSpec {
    pub window: MaintenanceWindowSpec,
}

/// Weekly maintenance window start
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct MaintenanceWindowSpec {
    /// `mon`..`sun` (or `0`..`6`, Monday first)
    pub weekday: String,

    /// Start time `HH:MM` (UTC)
    pub starttime: String,
}

/// Network access settings
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_access: Option<bool>,

    #[serde(default)]
    pub firewall_rules: Vec<FirewallRule>,
}

/// Allowed address range
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FirewallRule {
    pub name: String,
    pub start_ip: String,
    pub end_ip: String,
}

/// Backup settings
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_days: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo_redundant: Option<bool>,
}

/// High availability settings
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct HighAvailabilitySpec {
    #[serde(default)]
    pub enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_field_names() {
        let spec: PostgresqlServerSpec = serde_json::from_value(serde_json::json!({
            "backend": "helmbitnami",
            "size": {"cpu": "500m", "memoryMB": 512, "storageGB": 20},
            "maintenance": {"window": {"weekday": "sun", "starttime": "23:30"}},
            "credentialsSecret": "pg-admin"
        }))
        .unwrap();
        assert_eq!(spec.size.memory_mb, Some(512));
        assert_eq!(spec.size.storage_gb, Some(20));
        assert_eq!(spec.credentials_secret, "pg-admin");
        assert_eq!(spec.maintenance.unwrap().window.weekday, "sun");
    }
}
