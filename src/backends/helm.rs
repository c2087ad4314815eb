//! Self-hosted backends installed as Helm releases

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{
    Backend, BackendKind, ProvisionedServer, ProvisionedUser, ServerRef, SizeCatalog, SqlAdmin, SqlDatabases,
};
use crate::adapters::VolumeClaimStore;
use crate::config::Configuration;
use crate::credentials::{CredentialBundle, MAX_IDENTIFIER_LENGTH};
use crate::crd::{DatabaseOptions, PostgresqlServerSpec};
use crate::error::{Error, Result};

/// Delay before retrying against a release with an operation in flight
const PENDING_DELAY: Duration = Duration::from_secs(20);

/// Delay before retrying after helm timed out waiting for readiness
const TIMEOUT_DELAY: Duration = Duration::from_secs(30);

/// Helm operations used by the self-hosted backends
#[async_trait]
pub trait HelmRunner: Send + Sync {
    /// Release status (`deployed`, `pending-upgrade`, ...); `None` when not installed
    async fn status(&self, namespace: &str, release: &str) -> Result<Option<String>>;

    /// User-supplied values of an installed release
    async fn values(&self, namespace: &str, release: &str) -> Result<Option<Value>>;

    /// `upgrade --install --wait` with the given values
    async fn upgrade_install(&self, namespace: &str, release: &str, chart: &str, values: &Value) -> Result<()>;

    /// Uninstall; an absent release is success
    async fn uninstall(&self, namespace: &str, release: &str) -> Result<()>;
}

/// [`HelmRunner`] shelling out to the `helm` binary
#[derive(Clone, Debug)]
pub struct HelmCli {
    binary: String,
    timeout: Duration,
}

impl HelmCli {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    async fn run(&self, args: &[&str], stdin: Option<String>) -> Result<std::result::Result<String, String>> {
        debug!(args = ?args, "Running helm");
        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await?;
            pipe.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if output.status.success() {
            Ok(Ok(String::from_utf8_lossy(&output.stdout).into_owned()))
        } else {
            Ok(Err(String::from_utf8_lossy(&output.stderr).trim().to_string()))
        }
    }
}

fn is_not_found(stderr: &str) -> bool {
    stderr.contains("not found")
}

#[async_trait]
impl HelmRunner for HelmCli {
    async fn status(&self, namespace: &str, release: &str) -> Result<Option<String>> {
        match self
            .run(&["status", release, "--namespace", namespace, "--output", "json"], None)
            .await?
        {
            Ok(stdout) => {
                let parsed: Value = serde_json::from_str(&stdout)?;
                Ok(Some(
                    parsed["info"]["status"]
                        .as_str()
                        .unwrap_or("unknown")
                        .to_string(),
                ))
            }
            Err(stderr) if is_not_found(&stderr) => Ok(None),
            Err(stderr) => Err(Error::helm(format!("helm status {}: {}", release, stderr))),
        }
    }

    async fn values(&self, namespace: &str, release: &str) -> Result<Option<Value>> {
        match self
            .run(&["get", "values", release, "--namespace", namespace, "--output", "json"], None)
            .await?
        {
            Ok(stdout) => Ok(Some(serde_json::from_str(&stdout)?)),
            Err(stderr) if is_not_found(&stderr) => Ok(None),
            Err(stderr) => Err(Error::helm(format!("helm get values {}: {}", release, stderr))),
        }
    }

    async fn upgrade_install(&self, namespace: &str, release: &str, chart: &str, values: &Value) -> Result<()> {
        let timeout = format!("{}s", self.timeout.as_secs());
        let rendered = serde_yaml::to_string(values)?;
        let args = [
            "upgrade", "--install", release, chart, "--namespace", namespace, "--wait", "--timeout", timeout.as_str(),
            "--values", "-",
        ];
        match self.run(&args, Some(rendered)).await? {
            Ok(_) => Ok(()),
            Err(stderr) if stderr.contains("timed out") => Err(Error::temporary(
                format!("Timed out waiting for release {} to become ready", release),
                TIMEOUT_DELAY,
            )),
            Err(stderr) => Err(Error::helm(format!("helm upgrade {}: {}", release, stderr))),
        }
    }

    async fn uninstall(&self, namespace: &str, release: &str) -> Result<()> {
        match self
            .run(&["uninstall", release, "--namespace", namespace, "--wait"], None)
            .await?
        {
            Ok(_) => Ok(()),
            Err(stderr) if is_not_found(&stderr) => Ok(()),
            Err(stderr) => Err(Error::helm(format!("helm uninstall {}: {}", release, stderr))),
        }
    }
}

/// CPU and memory for one component
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ComputeResources {
    #[serde(deserialize_with = "quantity")]
    pub cpu: String,
    #[serde(deserialize_with = "quantity")]
    pub memory: String,
}

/// Size class of a chart; yugabyte classes size master and tserver separately
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum HelmClass {
    Split {
        master: ComputeResources,
        tserver: ComputeResources,
    },
    Uniform(ComputeResources),
}

impl HelmClass {
    fn master(&self) -> &ComputeResources {
        match self {
            HelmClass::Split { master, .. } => master,
            HelmClass::Uniform(resources) => resources,
        }
    }

    fn tserver(&self) -> &ComputeResources {
        match self {
            HelmClass::Split { tserver, .. } => tserver,
            HelmClass::Uniform(resources) => resources,
        }
    }
}

fn quantity<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Quantity {
        Text(String),
        Integer(i64),
        Float(f64),
    }
    Ok(match Quantity::deserialize(deserializer)? {
        Quantity::Text(s) => s,
        Quantity::Integer(i) => i.to_string(),
        Quantity::Float(f) => f.to_string(),
    })
}

/// Chart the release is built from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChartFlavor {
    Bitnami,
    Yugabyte,
}

impl ChartFlavor {
    pub fn kind(&self) -> BackendKind {
        match self {
            ChartFlavor::Bitnami => BackendKind::HelmBitnami,
            ChartFlavor::Yugabyte => BackendKind::HelmYugabyte,
        }
    }

    fn default_chart(&self) -> &'static str {
        match self {
            ChartFlavor::Bitnami => "oci://registry-1.docker.io/bitnamicharts/postgresql",
            ChartFlavor::Yugabyte => "yugabytedb/yugabyte",
        }
    }

    /// Release name of a server
    pub fn release_name(&self, server: &ServerRef) -> String {
        match self {
            ChartFlavor::Bitnami => format!("{}-postgresql", server.name),
            ChartFlavor::Yugabyte => format!("{}-yugabyte", server.name),
        }
    }

    /// Whether a volume claim belongs to a release of this chart
    pub fn owns_claim(&self, release: &str, claim: &str) -> bool {
        match self {
            ChartFlavor::Bitnami => claim == format!("data-{}-0", release),
            ChartFlavor::Yugabyte => {
                claim.starts_with("datadir") && claim.contains(&format!("-{}-yb-", release))
            }
        }
    }

    fn admin_credentials(&self, server: &ServerRef, release: &str, password: &str) -> CredentialBundle {
        let (username, host, port) = match self {
            ChartFlavor::Bitnami => (
                "postgres",
                format!("{}.{}.svc.cluster.local", release, server.namespace),
                "5432",
            ),
            ChartFlavor::Yugabyte => (
                "yugabyte",
                format!("yb-tservers.{}.svc.cluster.local", server.namespace),
                "5433",
            ),
        };
        CredentialBundle {
            username: username.to_string(),
            password: password.to_string(),
            dbname: "postgres".to_string(),
            host,
            port: port.to_string(),
            sslmode: "disable".to_string(),
        }
    }
}

/// Configuration of one Helm backend
#[derive(Clone, Debug)]
pub struct HelmSettings {
    pub chart: String,
    pub storage_class: String,
    pub catalog: Option<SizeCatalog<HelmClass>>,
    pub replicas_master: u32,
    pub replicas_tserver: u32,
    pub partitions_master: u32,
    pub partitions_tserver: u32,
    /// Delete the release's volume claims after uninstall
    pub pvc_cleanup: bool,
}

impl HelmSettings {
    /// Read settings from `backends.<kind>.*`
    pub fn from_config(flavor: ChartFlavor, config: &Configuration) -> Result<Self> {
        let key = |k: &str| format!("backends.{}.{}", flavor.kind(), k);

        let catalog = match config.get::<String>(&key("default_class"))? {
            Some(default_class) => {
                let classes: BTreeMap<String, HelmClass> = config.get(&key("classes"))?.unwrap_or_default();
                Some(SizeCatalog::new(classes, default_class, None)?)
            }
            None => None,
        };

        Ok(Self {
            chart: config.get_or(&key("chart"), flavor.default_chart().to_string())?,
            storage_class: config.get_or(&key("storage_class"), String::new())?,
            catalog,
            replicas_master: config.get_or(&key("replicas_master"), 1)?,
            replicas_tserver: config.get_or(&key("replicas_tserver"), 1)?,
            partitions_master: config.get_or(&key("partitions_master"), 1)?,
            partitions_tserver: config.get_or(&key("partitions_tserver"), 1)?,
            pvc_cleanup: config.get_or(&key("pvc_cleanup"), false)?,
        })
    }
}

/// Backend provisioning servers as Helm releases
pub struct HelmBackend {
    flavor: ChartFlavor,
    settings: HelmSettings,
    helm: Arc<dyn HelmRunner>,
    volumes: Option<Arc<dyn VolumeClaimStore>>,
    databases: SqlDatabases,
}

impl HelmBackend {
    pub fn new(flavor: ChartFlavor, settings: HelmSettings, helm: Arc<dyn HelmRunner>, sql: Arc<dyn SqlAdmin>) -> Self {
        Self {
            flavor,
            settings,
            helm,
            volumes: None,
            databases: SqlDatabases::new(sql),
        }
    }

    /// Volume claims to clean up on delete when `pvc_cleanup` is set
    pub fn with_volume_claims(mut self, volumes: Arc<dyn VolumeClaimStore>) -> Self {
        self.volumes = Some(volumes);
        self
    }

    async fn delete_claims(&self, server: &ServerRef, release: &str) -> Result<()> {
        let Some(volumes) = &self.volumes else {
            warn!(release = %release, "Volume claim cleanup enabled but no claim store is configured");
            return Ok(());
        };
        for claim in volumes.list(&server.namespace).await? {
            if self.flavor.owns_claim(release, &claim) {
                info!(release = %release, claim = %claim, "Deleting volume claim");
                volumes.delete(&server.namespace, &claim).await?;
            }
        }
        Ok(())
    }

    /// Resources for a spec: a catalog class when one is named, raw values otherwise
    pub fn resources(&self, spec: &PostgresqlServerSpec) -> (HelmClass, Vec<String>) {
        let raw = || {
            HelmClass::Uniform(ComputeResources {
                cpu: spec.size.cpu.clone().unwrap_or_else(|| "1".to_string()),
                memory: format!("{}Mi", spec.size.memory_mb.unwrap_or(256)),
            })
        };

        match (spec.size.class.as_deref(), &self.settings.catalog) {
            (Some(class), Some(catalog)) => {
                let resolution = catalog.resolve(Some(class));
                (resolution.params, resolution.warnings)
            }
            (Some(class), None) => (
                raw(),
                vec![format!(
                    "Size classes are not configured for {}, ignoring class '{}' and using raw size values",
                    self.flavor.kind(),
                    class
                )],
            ),
            (None, _) => (raw(), Vec::new()),
        }
    }

    /// Chart values for a spec
    pub fn values(&self, server: &ServerRef, spec: &PostgresqlServerSpec, password: &str, resources: &HelmClass) -> Value {
        let release = self.flavor.release_name(server);
        let disk = format!("{}Gi", spec.size.storage_gb.unwrap_or(10));
        let limits = |r: &ComputeResources| json!({ "cpu": r.cpu, "memory": r.memory });

        match self.flavor {
            ChartFlavor::Bitnami => json!({
                "fullnameOverride": release,
                "global": {
                    "storageClass": self.settings.storage_class,
                    "postgresql": { "auth": { "postgresPassword": password } }
                },
                "primary": {
                    "resources": {
                        "limits": limits(resources.master()),
                        "requests": limits(resources.master())
                    },
                    "persistence": { "size": disk }
                }
            }),
            ChartFlavor::Yugabyte => json!({
                "Component": release,
                "storage": {
                    "ephemeral": false,
                    "master": { "count": 1, "size": disk, "storageClass": self.settings.storage_class },
                    "tserver": { "count": 1, "size": disk, "storageClass": self.settings.storage_class }
                },
                "resource": {
                    "master": {
                        "requests": limits(resources.master()),
                        "limits": limits(resources.master())
                    },
                    "tserver": {
                        "requests": limits(resources.tserver()),
                        "limits": limits(resources.tserver())
                    }
                },
                "replicas": {
                    "master": self.settings.replicas_master,
                    "tserver": self.settings.replicas_tserver
                },
                "partition": {
                    "master": self.settings.partitions_master,
                    "tserver": self.settings.partitions_tserver
                },
                "authCredentials": { "ysql": { "password": password } },
                "serviceEndpoints": []
            }),
        }
    }
}

#[async_trait]
impl Backend for HelmBackend {
    fn kind(&self) -> BackendKind {
        self.flavor.kind()
    }

    fn validate(&self, server: &ServerRef, _spec: &PostgresqlServerSpec) -> std::result::Result<(), String> {
        let release = self.flavor.release_name(server);
        if release.len() > MAX_IDENTIFIER_LENGTH {
            return Err(format!(
                "calculated server name '{}' is longer than {} characters",
                release, MAX_IDENTIFIER_LENGTH
            ));
        }
        Ok(())
    }

    async fn server_exists(&self, server: &ServerRef) -> Result<bool> {
        let release = self.flavor.release_name(server);
        Ok(self.helm.status(&server.namespace, &release).await?.is_some())
    }

    async fn create_or_update_server(
        &self,
        server: &ServerRef,
        spec: &PostgresqlServerSpec,
        password: &str,
        password_changed: bool,
    ) -> Result<ProvisionedServer> {
        let release = self.flavor.release_name(server);
        let (resources, mut warnings) = self.resources(spec);
        if spec.version.is_some() {
            warnings.push(format!(
                "{} uses the engine version of its chart, ignoring spec.version",
                self.flavor.kind()
            ));
        }
        if !spec.extensions.is_empty() {
            warnings.push(format!(
                "{} does not support server extensions, ignoring spec.extensions",
                self.flavor.kind()
            ));
        }
        let desired = self.values(server, spec, password, &resources);

        let status = self.helm.status(&server.namespace, &release).await?;
        if let Some(status) = status.as_deref().filter(|s| s.starts_with("pending")) {
            return Err(Error::temporary(
                format!("Release {} is {}", release, status),
                PENDING_DELAY,
            ));
        }

        let installed = match status {
            Some(_) => self.helm.values(&server.namespace, &release).await?,
            None => None,
        };

        if installed.as_ref() == Some(&desired) && !password_changed {
            debug!(release = %release, "Release up to date");
        } else {
            info!(release = %release, chart = %self.settings.chart, "Installing or upgrading release");
            self.helm
                .upgrade_install(&server.namespace, &release, &self.settings.chart, &desired)
                .await?;
        }

        Ok(ProvisionedServer {
            credentials: self.flavor.admin_credentials(server, &release, password),
            warnings,
        })
    }

    async fn delete_server(&self, server: &ServerRef) -> Result<()> {
        let release = self.flavor.release_name(server);
        info!(release = %release, "Uninstalling release");
        self.helm.uninstall(&server.namespace, &release).await?;
        if self.settings.pvc_cleanup {
            self.delete_claims(server, &release).await?;
        }
        Ok(())
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_names() {
        let server = ServerRef::new("team-a", "main");
        assert_eq!(ChartFlavor::Bitnami.release_name(&server), "main-postgresql");
        assert_eq!(ChartFlavor::Yugabyte.release_name(&server), "main-yugabyte");
    }

    #[test]
    fn test_claim_ownership() {
        assert!(ChartFlavor::Bitnami.owns_claim("main-postgresql", "data-main-postgresql-0"));
        assert!(!ChartFlavor::Bitnami.owns_claim("main-postgresql", "data-other-postgresql-0"));
        assert!(!ChartFlavor::Bitnami.owns_claim("main-postgresql", "data-main-postgresql-1"));

        assert!(ChartFlavor::Yugabyte.owns_claim("main-yugabyte", "datadir0-main-yugabyte-yb-tserver-0"));
        assert!(ChartFlavor::Yugabyte.owns_claim("main-yugabyte", "datadir1-main-yugabyte-yb-master-2"));
        assert!(!ChartFlavor::Yugabyte.owns_claim("main-yugabyte", "datadir0-other-yugabyte-yb-tserver-0"));
        assert!(!ChartFlavor::Yugabyte.owns_claim("main-yugabyte", "data-main-yugabyte-0"));
    }

    #[test]
    fn test_admin_credentials() {
        let server = ServerRef::new("team-a", "main");
        let creds = ChartFlavor::Bitnami.admin_credentials(&server, "main-postgresql", "pw");
        assert_eq!(creds.host, "main-postgresql.team-a.svc.cluster.local");
        assert_eq!(creds.port, "5432");
        assert_eq!(creds.sslmode, "disable");

        let creds = ChartFlavor::Yugabyte.admin_credentials(&server, "main-yugabyte", "pw");
        assert_eq!(creds.username, "yugabyte");
        assert_eq!(creds.host, "yb-tservers.team-a.svc.cluster.local");
        assert_eq!(creds.port, "5433");
    }

    #[test]
    fn test_class_deserialization() {
        let uniform: HelmClass = serde_yaml::from_str("cpu: 2\nmemory: 4Gi\n").unwrap();
        assert_eq!(uniform.master().cpu, "2");
        let split: HelmClass = serde_yaml::from_str(
            "master: {cpu: 1, memory: 1Gi}\ntserver: {cpu: '500m', memory: 2Gi}\n",
        )
        .unwrap();
        assert_eq!(split.tserver().cpu, "500m");
        assert_eq!(split.master().memory, "1Gi");
    }

    #[test]
    fn test_settings_defaults() {
        let config = Configuration::from_yaml_str("{}").unwrap();
        let settings = HelmSettings::from_config(ChartFlavor::Bitnami, &config).unwrap();
        assert!(settings.catalog.is_none());
        assert_eq!(settings.chart, "oci://registry-1.docker.io/bitnamicharts/postgresql");
        assert_eq!(settings.replicas_master, 1);
        assert!(!settings.pvc_cleanup);

        let config = Configuration::from_yaml_str("backends:\n  helmyugabyte:\n    pvc_cleanup: true\n").unwrap();
        assert!(HelmSettings::from_config(ChartFlavor::Yugabyte, &config).unwrap().pvc_cleanup);
    }
}
