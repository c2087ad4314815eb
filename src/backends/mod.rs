//! Provisioning backends
//!
//! Every provider implements [`Backend`]. Managed cloud backends drive a
//! provider control plane through [`InstanceApi`]; self-hosted backends
//! install Helm releases through [`HelmRunner`]. Both create databases
//! and users over SQL through [`SqlAdmin`].

mod helm;
mod maintenance;
mod managed;
mod registry;
mod sizing;
mod sql;

pub use helm::*;
pub use maintenance::*;
pub use managed::*;
pub use registry::*;
pub use sizing::*;
pub use sql::*;

use std::fmt;

use async_trait::async_trait;

use crate::credentials::CredentialBundle;
use crate::crd::{DatabaseOptions, PostgresqlServerSpec};
use crate::error::Result;

/// Identity of a server resource
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServerRef {
    pub namespace: String,
    pub name: String,
}

impl ServerRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ServerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Result of provisioning a server
#[derive(Clone, Debug)]
pub struct ProvisionedServer {
    /// Admin credentials
    pub credentials: CredentialBundle,
    /// Non-fatal notices (size fallbacks and similar)
    pub warnings: Vec<String>,
}

/// Result of provisioning a database user
#[derive(Clone, Debug)]
pub struct ProvisionedUser {
    /// The role did not exist before this call
    pub newly_created: bool,
    pub credentials: CredentialBundle,
}

/// Contract every provider implements.
///
/// `create_or_update_*` calls are idempotent: repeating them with the same
/// input performs no provider mutation. They return once the object is
/// ready, or a retryable error when it is not ready in time. Deleting an
/// absent object succeeds.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Which backend this is
    fn kind(&self) -> BackendKind;

    /// Check a server spec; `Err` carries a human-readable reason
    fn validate(&self, server: &ServerRef, spec: &PostgresqlServerSpec) -> std::result::Result<(), String>;

    async fn server_exists(&self, server: &ServerRef) -> Result<bool>;

    async fn create_or_update_server(
        &self,
        server: &ServerRef,
        spec: &PostgresqlServerSpec,
        password: &str,
        password_changed: bool,
    ) -> Result<ProvisionedServer>;

    async fn delete_server(&self, server: &ServerRef) -> Result<()>;

    async fn database_exists(&self, server: &ServerRef, admin: &CredentialBundle, database: &str) -> Result<bool>;

    /// Create the database if missing, revoke public access, enable extensions
    async fn create_or_update_database(
        &self,
        server: &ServerRef,
        admin: &CredentialBundle,
        database: &str,
        options: &DatabaseOptions,
    ) -> Result<()>;

    async fn delete_database(&self, server: &ServerRef, admin: &CredentialBundle, database: &str) -> Result<()>;

    async fn create_or_update_user(
        &self,
        server: &ServerRef,
        admin: &CredentialBundle,
        database: &str,
        username: &str,
        password: &str,
    ) -> Result<ProvisionedUser>;

    async fn delete_user(&self, server: &ServerRef, admin: &CredentialBundle, username: &str) -> Result<()>;

    async fn update_user_password(
        &self,
        server: &ServerRef,
        admin: &CredentialBundle,
        username: &str,
        password: &str,
    ) -> Result<()>;
}
