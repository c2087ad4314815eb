//! PostgresqlDatabase Custom Resource Definition

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ResourceStatus;

/// PostgresqlDatabase resource specification
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "postgres.oso.sh",
    version = "v1alpha1",
    kind = "PostgresqlDatabase",
    plural = "postgresqldatabases",
    singular = "postgresqldatabase",
    shortname = "pgdb",
    namespaced,
    status = "ResourceStatus",
    printcolumn = r#"{"name": "Server", "type": "string", "jsonPath": ".spec.serverRef.name"}"#,
    printcolumn = r#"{"name": "Backend", "type": "string", "jsonPath": ".status.backend"}"#,
    printcolumn = r#"{"name": "Status", "type": "string", "jsonPath": ".status.deployment.status"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PostgresqlDatabaseSpec {
    /// Server hosting the database
    pub server_ref: ServerReference,

    /// Name of the secret receiving the database credentials
    pub credentials_secret: String,

    /// Database options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseOptions>,
}

impl PostgresqlDatabaseSpec {
    /// Namespace of the referenced server, defaulting to the database's own
    pub fn server_namespace<'a>(&'a self, own_namespace: &'a str) -> &'a str {
        self.server_ref.namespace.as_deref().unwrap_or(own_namespace)
    }
}

/// Reference to a PostgresqlServer
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct ServerReference {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Database creation options
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct DatabaseOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charset: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collation: Option<String>,

    #[serde(default)]
    pub extensions: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_namespace_defaults_to_own() {
        let spec: PostgresqlDatabaseSpec = serde_json::from_value(serde_json::json!({
            "serverRef": {"name": "shared"},
            "credentialsSecret": "app-db"
        }))
        .unwrap();
        assert_eq!(spec.server_namespace("team-a"), "team-a");
        assert!(spec.database.is_none());

        let spec = PostgresqlDatabaseSpec {
            server_ref: ServerReference {
                name: "shared".into(),
                namespace: Some("platform".into()),
            },
            ..spec
        };
        assert_eq!(spec.server_namespace("team-a"), "platform");
    }
}
