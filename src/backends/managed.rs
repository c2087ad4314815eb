//! Managed cloud backends (AWS RDS, AWS Aurora, Azure Database for PostgreSQL
//! flexible server)
//!
//! The provider control plane is reached through [`InstanceApi`], which the
//! host wires to the provider SDK. This module owns everything above it:
//! naming, validation, desired state, change detection and readiness waits.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use super::{
    parse_cpu, Backend, BackendKind, MaintenanceWindow, ProvisionedServer, ProvisionedUser, ServerRef,
    SizeCatalog, SqlAdmin, SqlDatabases, VersionPolicy,
};
use crate::config::{Configuration, ProvisioningTiming};
use crate::credentials::{CredentialBundle, MAX_IDENTIFIER_LENGTH};
use crate::crd::{DatabaseOptions, PostgresqlServerSpec, API_GROUP};
use crate::error::{Error, Result};

/// Provider status of a usable instance
pub const AVAILABLE: &str = "available";

/// Provider status of an instance being removed
pub const DELETING: &str = "deleting";

/// Delay before retrying against an instance that is busy
const NOT_AVAILABLE_DELAY: std::time::Duration = std::time::Duration::from_secs(20);

/// Delay before retrying after a readiness wait timed out
const READY_TIMEOUT_DELAY: std::time::Duration = std::time::Duration::from_secs(30);

/// Provider-side settings of one database instance, compared field by field
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InstanceSpec {
    pub instance_class: String,
    pub tier: Option<String>,
    pub storage_type: Option<String>,
    pub iops: Option<u32>,
    pub scaling: Option<ServerlessScaling>,
    pub storage_gb: u32,
    pub storage_auto_grow: bool,
    pub engine_version: String,
    pub admin_username: String,
    pub high_availability: bool,
    pub backup_retention_days: u32,
    pub geo_redundant_backup: bool,
    /// `ddd:HH:MM-ddd:HH:MM`
    pub maintenance_window: Option<String>,
    pub public_access: bool,
    pub firewall_rules: Vec<AllowedRange>,
    pub deletion_protection: bool,
    pub tags: BTreeMap<String, String>,
    /// Allow-listed server extensions, sorted
    pub extensions: Vec<String>,
    /// Subset of `extensions` loaded at server start; changing it restarts the server
    pub preload_libraries: Vec<String>,
}

/// Capacity range of a serverless cluster, in capacity units
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
pub struct ServerlessScaling {
    #[serde(default = "default_min_capacity")]
    pub min_capacity: f64,
    #[serde(default = "default_max_capacity")]
    pub max_capacity: f64,
}

fn default_min_capacity() -> f64 {
    0.5
}

fn default_max_capacity() -> f64 {
    1.0
}

/// Address range allowed through the provider firewall
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowedRange {
    pub name: String,
    pub start_ip: String,
    pub end_ip: String,
}

/// Observed instance
#[derive(Clone, Debug, PartialEq)]
pub struct Instance {
    pub identifier: String,
    pub status: String,
    pub endpoint: Option<String>,
    pub spec: InstanceSpec,
}

impl Instance {
    pub fn is_available(&self) -> bool {
        self.status == AVAILABLE
    }
}

/// Provider control plane for database instances.
///
/// For cluster flavors an identifier names the cluster; the host also
/// manages its `{identifier}-primary` instance.
#[async_trait]
pub trait InstanceApi: Send + Sync {
    /// Describe an instance; `None` when it does not exist
    async fn describe(&self, identifier: &str) -> Result<Option<Instance>>;

    async fn create(&self, identifier: &str, spec: &InstanceSpec, password: &str) -> Result<()>;

    /// Apply `spec`; the admin password is only sent when it changed
    async fn modify(&self, identifier: &str, spec: &InstanceSpec, password: Option<&str>) -> Result<()>;

    async fn delete(&self, identifier: &str) -> Result<()>;
}

/// Instance class entry of a size catalog
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct InstanceClass {
    #[serde(alias = "name")]
    pub instance_type: String,
    #[serde(default)]
    pub tier: Option<String>,
    #[serde(default)]
    pub storage_type: Option<String>,
    #[serde(default)]
    pub iops: Option<u32>,
    #[serde(default)]
    pub scaling_configuration: Option<ServerlessScaling>,
}

/// Provider name for a resource that predates the naming pattern
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct NameOverride {
    pub namespace: String,
    pub name: String,
    #[serde(alias = "aws_identifier", alias = "azure_name")]
    pub identifier: String,
}

/// Server-level extension handling of a provider
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerExtensions {
    /// `spec.extensions` is ignored with a warning
    Unsupported,
    /// Extensions are allow-listed on the server
    AllowList {
        /// Enabled on every server
        always: &'static [&'static str],
        /// Extensions that must also be preloaded
        preload: &'static [&'static str],
    },
}

impl ServerExtensions {
    /// Allow list and preload list for the requested extensions
    pub fn resolve(&self, requested: &[String]) -> (Vec<String>, Vec<String>) {
        match self {
            ServerExtensions::Unsupported => (Vec::new(), Vec::new()),
            ServerExtensions::AllowList { always, preload } => {
                let mut extensions: Vec<String> = requested
                    .iter()
                    .map(|e| e.trim().to_string())
                    .filter(|e| !e.is_empty())
                    .chain(always.iter().map(|e| e.to_string()))
                    .collect();
                extensions.sort();
                extensions.dedup();
                let preloaded = extensions
                    .iter()
                    .filter(|e| preload.contains(&e.as_str()))
                    .cloned()
                    .collect();
                (extensions, preloaded)
            }
        }
    }
}

/// Fixed characteristics of a managed provider
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ManagedFlavor {
    pub kind: BackendKind,
    /// Shared config section (`backends.aws`, `backends.azure`)
    pub family: &'static str,
    pub min_storage_gb: u32,
    pub versions: VersionPolicy,
    pub builtin_class: &'static str,
    pub builtin_tier: Option<&'static str>,
    pub default_storage_type: Option<&'static str>,
    pub default_public_access: bool,
    pub default_backup_retention_days: u32,
    pub extensions: ServerExtensions,
}

pub const AWS_RDS: ManagedFlavor = ManagedFlavor {
    kind: BackendKind::AwsRds,
    family: "aws",
    min_storage_gb: 20,
    versions: VersionPolicy {
        default: "15.3",
        pinned: &[
            ("11", "11.20"),
            ("12", "12.15"),
            ("13", "13.11"),
            ("14", "14.8"),
            ("15", "15.3"),
        ],
    },
    builtin_class: "db.m5.large",
    builtin_tier: None,
    default_storage_type: Some("gp2"),
    default_public_access: false,
    default_backup_retention_days: 7,
    extensions: ServerExtensions::Unsupported,
};

/// Aurora PostgreSQL cluster with a single primary instance
pub const AWS_AURORA: ManagedFlavor = ManagedFlavor {
    kind: BackendKind::AwsAurora,
    family: "aws",
    min_storage_gb: 20,
    versions: VersionPolicy {
        default: "15.2",
        pinned: &[
            ("11", "11.19"),
            ("12", "12.14"),
            ("13", "13.10"),
            ("14", "14.7"),
            ("15", "15.2"),
        ],
    },
    builtin_class: "db.m5.large",
    builtin_tier: None,
    default_storage_type: Some("aurora"),
    default_public_access: false,
    default_backup_retention_days: 1,
    extensions: ServerExtensions::Unsupported,
};

pub const AZURE_FLEXIBLE: ManagedFlavor = ManagedFlavor {
    kind: BackendKind::AzurePostgresFlexible,
    family: "azure",
    min_storage_gb: 32,
    versions: VersionPolicy {
        default: "13",
        pinned: &[("11", "11"), ("12", "12"), ("13", "13"), ("14", "14")],
    },
    builtin_class: "Standard_D2ds_v4",
    builtin_tier: Some("GeneralPurpose"),
    default_storage_type: None,
    default_public_access: true,
    default_backup_retention_days: 7,
    extensions: ServerExtensions::AllowList {
        always: &["pg_cron", "pg_stat_statements"],
        preload: &[
            "timescaledb",
            "pg_cron",
            "pg_partman_bgw",
            "pg_partman",
            "pg_prewarm",
            "pg_stat_statements",
            "pgaudit",
            "pglogical",
            "wal2json",
        ],
    },
};

/// Name of the built-in default size class
pub const BUILTIN_DEFAULT_CLASS: &str = "operator_default";

/// Configuration of one managed backend
#[derive(Clone, Debug)]
pub struct ManagedSettings {
    pub name_pattern: String,
    pub name_overrides: Vec<NameOverride>,
    pub admin_username: String,
    pub catalog: SizeCatalog<InstanceClass>,
    pub cpu_limit: Option<f64>,
    pub storage_limit_gb: Option<u32>,
    pub backup_retention_days: u32,
    pub geo_redundant_backup: bool,
    pub public_access: bool,
    pub firewall_rules: Vec<AllowedRange>,
    pub deletion_protection: bool,
    pub tags: BTreeMap<String, String>,
    pub retain_on_delete: bool,
}

impl ManagedSettings {
    /// Read settings from `backends.<kind>.*`, falling back to `backends.<family>.*`
    pub fn from_config(flavor: &ManagedFlavor, config: &Configuration) -> Result<Self> {
        let lookup = Lookup { flavor, config };

        let classes: BTreeMap<String, InstanceClass> = config
            .get(&format!("backends.{}.classes", flavor.kind))?
            .unwrap_or_default();
        let default_class: String = config
            .get(&format!("backends.{}.default_class", flavor.kind))?
            .unwrap_or_else(|| BUILTIN_DEFAULT_CLASS.to_string());
        let builtin = InstanceClass {
            instance_type: flavor.builtin_class.to_string(),
            tier: flavor.builtin_tier.map(str::to_string),
            storage_type: None,
            iops: None,
            scaling_configuration: None,
        };

        Ok(Self {
            name_pattern: lookup.get_or("name_pattern", "{namespace}-{name}".to_string())?,
            name_overrides: lookup.get_or("name_overrides", Vec::new())?,
            admin_username: lookup.get_or("admin_username", "postgres".to_string())?,
            catalog: SizeCatalog::new(classes, default_class, Some(builtin))?,
            cpu_limit: lookup.get::<f64>("cpu_limit")?.filter(|l| *l > 0.0),
            storage_limit_gb: lookup.get::<u32>("storage_limit_gb")?.filter(|l| *l > 0),
            backup_retention_days: lookup.get_or("parameters.backup_retention_days", flavor.default_backup_retention_days)?,
            geo_redundant_backup: lookup.get_or("parameters.geo_redundant_backup", false)?,
            public_access: lookup.get_or("network.public_access", flavor.default_public_access)?,
            firewall_rules: lookup.get_or("parameters.network.firewall_rules", Vec::new())?,
            deletion_protection: lookup.get_or("deletion_protection", false)?,
            tags: lookup.get_or("tags", BTreeMap::new())?,
            retain_on_delete: lookup.get_or("retain_on_delete", false)?,
        })
    }
}

struct Lookup<'a> {
    flavor: &'a ManagedFlavor,
    config: &'a Configuration,
}

impl Lookup<'_> {
    fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let specific = format!("backends.{}.{}", self.flavor.kind, key);
        let family = format!("backends.{}.{}", self.flavor.family, key);
        self.config.get_one_of(&[specific.as_str(), family.as_str()])
    }

    fn get_or<T: serde::de::DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        Ok(self.get(key)?.unwrap_or(default))
    }
}

/// Backend provisioning servers as managed cloud instances
pub struct ManagedBackend {
    flavor: ManagedFlavor,
    settings: ManagedSettings,
    timing: ProvisioningTiming,
    api: Arc<dyn InstanceApi>,
    databases: SqlDatabases,
}

impl ManagedBackend {
    pub fn new(
        flavor: ManagedFlavor,
        settings: ManagedSettings,
        timing: ProvisioningTiming,
        api: Arc<dyn InstanceApi>,
        sql: Arc<dyn SqlAdmin>,
    ) -> Self {
        Self {
            flavor,
            settings,
            timing,
            api,
            databases: SqlDatabases::new(sql),
        }
    }

    /// Provider identifier of a server
    pub fn identifier(&self, server: &ServerRef) -> String {
        self.settings
            .name_overrides
            .iter()
            .find(|o| o.namespace == server.namespace && o.name == server.name)
            .map(|o| o.identifier.clone())
            .unwrap_or_else(|| render_template(&self.settings.name_pattern, server))
    }

    /// Desired provider state for a spec, plus sizing warnings
    pub fn desired_state(&self, server: &ServerRef, spec: &PostgresqlServerSpec) -> Result<(InstanceSpec, Vec<String>)> {
        let sizing = self.settings.catalog.resolve(spec.size.class.as_deref());
        let mut warnings = sizing.warnings;

        let (extensions, preload_libraries) = self.flavor.extensions.resolve(&spec.extensions);
        if self.flavor.extensions == ServerExtensions::Unsupported && !spec.extensions.is_empty() {
            warnings.push(format!(
                "{} does not support server extensions, ignoring spec.extensions",
                self.flavor.kind
            ));
        }

        let maintenance_window = MaintenanceWindow::from_spec(spec.maintenance.as_ref())
            .map_err(Error::validation)?
            .map(|w| w.to_string());

        let mut firewall_rules = self.settings.firewall_rules.clone();
        if let Some(network) = &spec.network {
            firewall_rules.extend(network.firewall_rules.iter().map(|r| AllowedRange {
                name: r.name.clone(),
                start_ip: r.start_ip.clone(),
                end_ip: r.end_ip.clone(),
            }));
        }

        let mut tags = BTreeMap::from([
            (format!("{}/namespace", API_GROUP), server.namespace.clone()),
            (format!("{}/name", API_GROUP), server.name.clone()),
        ]);
        for (key, value) in &self.settings.tags {
            tags.insert(key.clone(), render_template(value, server));
        }

        let desired = InstanceSpec {
            instance_class: sizing.params.instance_type.clone(),
            tier: sizing.params.tier.clone(),
            storage_type: sizing
                .params
                .storage_type
                .clone()
                .or_else(|| self.flavor.default_storage_type.map(str::to_string)),
            iops: sizing.params.iops,
            scaling: sizing.params.scaling_configuration,
            storage_gb: spec.size.storage_gb.unwrap_or(self.flavor.min_storage_gb),
            storage_auto_grow: spec.size.storage_auto_grow.unwrap_or(false),
            engine_version: self.flavor.versions.resolve(spec.version.as_deref()),
            admin_username: self.settings.admin_username.clone(),
            high_availability: spec.high_availability.as_ref().is_some_and(|ha| ha.enabled),
            backup_retention_days: spec
                .backup
                .as_ref()
                .and_then(|b| b.retention_days)
                .unwrap_or(self.settings.backup_retention_days),
            geo_redundant_backup: spec
                .backup
                .as_ref()
                .and_then(|b| b.geo_redundant)
                .unwrap_or(self.settings.geo_redundant_backup),
            maintenance_window,
            public_access: spec
                .network
                .as_ref()
                .and_then(|n| n.public_access)
                .unwrap_or(self.settings.public_access),
            firewall_rules,
            deletion_protection: self.settings.deletion_protection,
            tags,
            extensions,
            preload_libraries,
        };

        Ok((desired, warnings))
    }

    async fn wait_until_ready(&self, identifier: &str) -> Result<Instance> {
        let started = Instant::now();
        loop {
            if let Some(instance) = self.api.describe(identifier).await? {
                if instance.is_available() && instance.endpoint.is_some() {
                    return Ok(instance);
                }
                debug!(identifier = %identifier, status = %instance.status, "Waiting for instance");
            }
            if started.elapsed() >= self.timing.ready_timeout {
                return Err(Error::temporary(
                    format!("Timed out waiting for instance {} to be available", identifier),
                    READY_TIMEOUT_DELAY,
                ));
            }
            sleep(self.timing.poll_interval).await;
        }
    }
}

fn render_template(template: &str, server: &ServerRef) -> String {
    template
        .replace("{namespace}", &server.namespace)
        .replace("{name}", &server.name)
}

#[async_trait]
impl Backend for ManagedBackend {
    fn kind(&self) -> BackendKind {
        self.flavor.kind
    }

    fn validate(&self, server: &ServerRef, spec: &PostgresqlServerSpec) -> std::result::Result<(), String> {
        let identifier = self.identifier(server);
        if identifier.len() > MAX_IDENTIFIER_LENGTH {
            return Err(format!(
                "calculated server name '{}' is longer than {} characters",
                identifier, MAX_IDENTIFIER_LENGTH
            ));
        }

        let storage = spec.size.storage_gb.unwrap_or(self.flavor.min_storage_gb);
        if storage < self.flavor.min_storage_gb {
            return Err(format!(
                "size.storageGB must be at least {} GB",
                self.flavor.min_storage_gb
            ));
        }
        if let Some(limit) = self.settings.storage_limit_gb {
            if storage > limit {
                return Err(format!("size.storageGB is limited to {} GB", limit));
            }
        }

        if let (Some(limit), Some(cpu)) = (self.settings.cpu_limit, spec.size.cpu.as_deref()) {
            let cores = parse_cpu(cpu).ok_or_else(|| format!("size.cpu '{}' is not a valid quantity", cpu))?;
            if cores > limit {
                return Err(format!("size.cpu is limited to {}", limit));
            }
        }

        MaintenanceWindow::from_spec(spec.maintenance.as_ref())?;
        Ok(())
    }

    async fn server_exists(&self, server: &ServerRef) -> Result<bool> {
        Ok(self.api.describe(&self.identifier(server)).await?.is_some())
    }

    async fn create_or_update_server(
        &self,
        server: &ServerRef,
        spec: &PostgresqlServerSpec,
        password: &str,
        password_changed: bool,
    ) -> Result<ProvisionedServer> {
        let identifier = self.identifier(server);
        let (desired, warnings) = self.desired_state(server, spec)?;

        match self.api.describe(&identifier).await? {
            None => {
                info!(identifier = %identifier, class = %desired.instance_class, "Creating instance");
                self.api.create(&identifier, &desired, password).await?;
            }
            Some(existing) if !existing.is_available() => {
                info!(identifier = %identifier, status = %existing.status, "Instance busy, cannot update");
                return Err(Error::temporary(
                    format!("Waiting for instance {} to be available", identifier),
                    NOT_AVAILABLE_DELAY,
                ));
            }
            Some(existing) if existing.spec == desired && !password_changed => {
                debug!(identifier = %identifier, "Instance up to date");
            }
            Some(_) => {
                info!(identifier = %identifier, password_changed, "Updating instance");
                self.api
                    .modify(&identifier, &desired, password_changed.then_some(password))
                    .await?;
            }
        }

        let instance = self.wait_until_ready(&identifier).await?;
        let host = instance.endpoint.unwrap_or_default();

        Ok(ProvisionedServer {
            credentials: CredentialBundle {
                username: desired.admin_username,
                password: password.to_string(),
                dbname: "postgres".to_string(),
                host,
                port: "5432".to_string(),
                sslmode: "require".to_string(),
            },
            warnings,
        })
    }

    async fn delete_server(&self, server: &ServerRef) -> Result<()> {
        let identifier = self.identifier(server);
        if self.settings.retain_on_delete {
            info!(identifier = %identifier, "Retaining instance on delete");
            return Ok(());
        }
        match self.api.describe(&identifier).await? {
            None => Ok(()),
            Some(instance) if instance.status == DELETING => Ok(()),
            Some(_) => {
                info!(identifier = %identifier, "Deleting instance");
                self.api.delete(&identifier).await
            }
        }
    }

    async fn database_exists(&self, _server: &ServerRef, admin: &CredentialBundle, database: &str) -> Result<bool> {
        self.databases.exists(admin, database).await
    }

    async fn create_or_update_database(
        &self,
        _server: &ServerRef,
        admin: &CredentialBundle,
        database: &str,
        options: &DatabaseOptions,
    ) -> Result<()> {
        self.databases.provision(admin, database, options).await
    }

    async fn delete_database(&self, _server: &ServerRef, admin: &CredentialBundle, database: &str) -> Result<()> {
        self.databases.drop(admin, database).await
    }

    async fn create_or_update_user(
        &self,
        _server: &ServerRef,
        admin: &CredentialBundle,
        database: &str,
        username: &str,
        password: &str,
    ) -> Result<ProvisionedUser> {
        self.databases
            .provision_user(admin, database, username, password)
            .await
    }

    async fn delete_user(&self, _server: &ServerRef, admin: &CredentialBundle, username: &str) -> Result<()> {
        self.databases.drop_user(admin, username).await
    }

    async fn update_user_password(
        &self,
        _server: &ServerRef,
        admin: &CredentialBundle,
        username: &str,
        password: &str,
    ) -> Result<()> {
        self.databases.set_password(admin, username, password).await
    }
}
