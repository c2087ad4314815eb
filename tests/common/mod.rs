//! In-memory fakes shared by the integration tests

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::Value;

use postgres_provisioning_operator::adapters::{Advisory, ResourceClient, ResourceRef, SecretStore, VolumeClaimStore};
use postgres_provisioning_operator::backends::{
    Backend, BackendKind, BackendRegistry, HelmRunner, Instance, InstanceApi, InstanceSpec, ProvisionedServer,
    ProvisionedUser, ServerRef, SqlAdmin, AVAILABLE,
};
use postgres_provisioning_operator::config::{OperatorSettings, ProvisioningTiming};
use postgres_provisioning_operator::credentials::{CredentialBundle, PasswordPolicy, SecretData};
use postgres_provisioning_operator::crd::{
    DatabaseOptions, DeploymentPhase, DeploymentStatus, PostgresqlServer, PostgresqlServerSpec, ResourceStatus,
};
use postgres_provisioning_operator::reconcilers::ReconcileContext;
use postgres_provisioning_operator::{Error, Result};

pub const OPERATOR_NAMESPACE: &str = "operator";

// ============================================================================
// Secrets
// ============================================================================

#[derive(Default)]
pub struct MemorySecretStore {
    secrets: Mutex<BTreeMap<(String, String), SecretData>>,
    fail_create: Mutex<HashSet<String>>,
}

impl MemorySecretStore {
    pub fn insert(&self, namespace: &str, name: &str, data: SecretData) {
        self.secrets
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name.to_string()), data);
    }

    pub fn data(&self, namespace: &str, name: &str) -> Option<SecretData> {
        self.secrets
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn contains(&self, namespace: &str, name: &str) -> bool {
        self.data(namespace, name).is_some()
    }

    pub fn len(&self) -> usize {
        self.secrets.lock().unwrap().len()
    }

    /// Make the next create of `name` fail
    pub fn fail_next_create(&self, name: &str) {
        self.fail_create.lock().unwrap().insert(name.to_string());
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<SecretData>> {
        Ok(self.data(namespace, name))
    }

    async fn create(&self, namespace: &str, name: &str, data: &SecretData) -> Result<()> {
        if self.fail_create.lock().unwrap().remove(name) {
            return Err(Error::provider(format!("injected create failure for {}", name)));
        }
        let mut secrets = self.secrets.lock().unwrap();
        let key = (namespace.to_string(), name.to_string());
        if secrets.contains_key(&key) {
            return Err(Error::provider(format!("secret {} already exists", name)));
        }
        secrets.insert(key, data.clone());
        Ok(())
    }

    async fn update(&self, namespace: &str, name: &str, data: &SecretData) -> Result<()> {
        let mut secrets = self.secrets.lock().unwrap();
        match secrets.get_mut(&(namespace.to_string(), name.to_string())) {
            Some(existing) => {
                existing.extend(data.clone());
                Ok(())
            }
            None => Err(Error::provider(format!("secret {} does not exist", name))),
        }
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.secrets
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }
}

// ============================================================================
// Resources
// ============================================================================

#[derive(Default)]
pub struct FakeResources {
    statuses: Mutex<Vec<(ResourceRef, ResourceStatus)>>,
    advisories: Mutex<Vec<(ResourceRef, Advisory)>>,
    cleared: Mutex<Vec<ResourceRef>>,
    handled: Mutex<Vec<(ResourceRef, String)>>,
    servers: Mutex<HashMap<(String, String), PostgresqlServer>>,
}

impl FakeResources {
    pub fn add_server(&self, namespace: &str, name: &str, spec: PostgresqlServerSpec, backend: Option<&str>) {
        let mut server = PostgresqlServer::new(name, spec);
        server.metadata = ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        };
        server.status = Some(ResourceStatus {
            backend: backend.map(str::to_string),
            deployment: Some(DeploymentStatus {
                status: DeploymentPhase::Finished,
                reason: None,
                latest_update: None,
            }),
        });
        self.servers
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name.to_string()), server);
    }

    pub fn remove_server(&self, namespace: &str, name: &str) {
        self.servers
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
    }

    pub fn last_status(&self, name: &str) -> Option<ResourceStatus> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(r, _)| r.name == name)
            .map(|(_, s)| s.clone())
    }

    pub fn phases(&self, name: &str) -> Vec<DeploymentPhase> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, _)| r.name == name)
            .filter_map(|(_, s)| s.phase())
            .collect()
    }

    pub fn advisories(&self) -> Vec<Advisory> {
        self.advisories
            .lock()
            .unwrap()
            .iter()
            .map(|(_, a)| a.clone())
            .collect()
    }

    pub fn has_advisory(&self, reason: &str, message: &str) -> bool {
        self.advisories()
            .iter()
            .any(|a| a.reason == reason && a.message == message)
    }

    pub fn cleared_labels(&self) -> usize {
        self.cleared.lock().unwrap().len()
    }

    /// Handled states written for `name`, oldest first
    pub fn handled(&self, name: &str) -> Vec<String> {
        self.handled
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, _)| r.name == name)
            .map(|(_, s)| s.clone())
            .collect()
    }
}

#[async_trait]
impl ResourceClient for FakeResources {
    async fn patch_status(&self, resource: &ResourceRef, status: &ResourceStatus) -> Result<()> {
        self.statuses
            .lock()
            .unwrap()
            .push((resource.clone(), status.clone()));
        Ok(())
    }

    async fn clear_action_label(&self, resource: &ResourceRef) -> Result<()> {
        self.cleared.lock().unwrap().push(resource.clone());
        Ok(())
    }

    async fn record_handled(&self, resource: &ResourceRef, snapshot: &str) -> Result<()> {
        self.handled
            .lock()
            .unwrap()
            .push((resource.clone(), snapshot.to_string()));
        Ok(())
    }

    async fn publish(&self, resource: &ResourceRef, advisory: &Advisory) {
        self.advisories
            .lock()
            .unwrap()
            .push((resource.clone(), advisory.clone()));
    }

    async fn get_server(&self, namespace: &str, name: &str) -> Result<Option<PostgresqlServer>> {
        Ok(self
            .servers
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }
}

// ============================================================================
// Backend
// ============================================================================

/// One recorded backend call
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    CreateOrUpdateServer { server: String, password: String, password_changed: bool },
    DeleteServer(String),
    CreateOrUpdateDatabase(String),
    DeleteDatabase(String),
    CreateOrUpdateUser { username: String, password: String },
    DeleteUser(String),
    UpdateUserPassword { username: String, password: String },
}

#[derive(Default)]
struct BackendState {
    servers: HashSet<ServerRef>,
    databases: HashSet<String>,
    /// Role name to password, including the admin role
    users: HashMap<String, String>,
    calls: Vec<Call>,
    pending_failures: u32,
    fail_delete: bool,
}

/// Backend keeping servers, databases and roles in memory
pub struct FakeBackend {
    kind: BackendKind,
    invalid: Option<String>,
    warnings: Vec<String>,
    state: Mutex<BackendState>,
}

pub const ADMIN_USER: &str = "postgres";

impl FakeBackend {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            invalid: None,
            warnings: Vec::new(),
            state: Mutex::new(BackendState::default()),
        }
    }

    pub fn rejecting(mut self, reason: &str) -> Self {
        self.invalid = Some(reason.to_string());
        self
    }

    pub fn warning(mut self, message: &str) -> Self {
        self.warnings.push(message.to_string());
        self
    }

    /// Fail the next `times` server provisioning calls as not ready
    pub fn fail_provisioning(&self, times: u32) {
        self.state.lock().unwrap().pending_failures = times;
    }

    pub fn fail_deletes(&self) {
        self.state.lock().unwrap().fail_delete = true;
    }

    pub fn add_server(&self, server: &ServerRef, admin_password: &str) {
        let mut state = self.state.lock().unwrap();
        state.servers.insert(server.clone());
        state
            .users
            .insert(ADMIN_USER.to_string(), admin_password.to_string());
    }

    pub fn add_user(&self, username: &str, password: &str) {
        self.state
            .lock()
            .unwrap()
            .users
            .insert(username.to_string(), password.to_string());
    }

    pub fn has_server(&self, server: &ServerRef) -> bool {
        self.state.lock().unwrap().servers.contains(server)
    }

    pub fn has_database(&self, name: &str) -> bool {
        self.state.lock().unwrap().databases.contains(name)
    }

    pub fn password_of(&self, username: &str) -> Option<String> {
        self.state.lock().unwrap().users.get(username).cloned()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn admin_bundle(server: &ServerRef, password: &str) -> CredentialBundle {
        CredentialBundle {
            username: ADMIN_USER.to_string(),
            password: password.to_string(),
            dbname: "postgres".to_string(),
            host: format!("{}.{}.svc.cluster.local", server.name, server.namespace),
            port: "5432".to_string(),
            sslmode: "disable".to_string(),
        }
    }
}

#[async_trait]
impl Backend for FakeBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn validate(&self, _server: &ServerRef, _spec: &PostgresqlServerSpec) -> std::result::Result<(), String> {
        match &self.invalid {
            Some(reason) => Err(reason.clone()),
            None => Ok(()),
        }
    }

    async fn server_exists(&self, server: &ServerRef) -> Result<bool> {
        Ok(self.has_server(server))
    }

    async fn create_or_update_server(
        &self,
        server: &ServerRef,
        _spec: &PostgresqlServerSpec,
        password: &str,
        password_changed: bool,
    ) -> Result<ProvisionedServer> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::CreateOrUpdateServer {
            server: server.to_string(),
            password: password.to_string(),
            password_changed,
        });
        if state.pending_failures > 0 {
            state.pending_failures -= 1;
            return Err(Error::temporary("Instance is not available yet", Duration::from_secs(20)));
        }
        let created = state.servers.insert(server.clone());
        if created || password_changed {
            state.users.insert(ADMIN_USER.to_string(), password.to_string());
        }
        Ok(ProvisionedServer {
            credentials: Self::admin_bundle(server, password),
            warnings: self.warnings.clone(),
        })
    }

    async fn delete_server(&self, server: &ServerRef) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::DeleteServer(server.to_string()));
        if state.fail_delete {
            return Err(Error::provider("delete rejected"));
        }
        state.servers.remove(server);
        Ok(())
    }

    async fn database_exists(&self, _server: &ServerRef, _admin: &CredentialBundle, database: &str) -> Result<bool> {
        Ok(self.has_database(database))
    }

    async fn create_or_update_database(
        &self,
        _server: &ServerRef,
        _admin: &CredentialBundle,
        database: &str,
        _options: &DatabaseOptions,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::CreateOrUpdateDatabase(database.to_string()));
        state.databases.insert(database.to_string());
        Ok(())
    }

    async fn delete_database(&self, _server: &ServerRef, _admin: &CredentialBundle, database: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::DeleteDatabase(database.to_string()));
        state.databases.remove(database);
        Ok(())
    }

    async fn create_or_update_user(
        &self,
        _server: &ServerRef,
        admin: &CredentialBundle,
        database: &str,
        username: &str,
        password: &str,
    ) -> Result<ProvisionedUser> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::CreateOrUpdateUser {
            username: username.to_string(),
            password: password.to_string(),
        });
        let newly_created = !state.users.contains_key(username);
        if newly_created {
            state.users.insert(username.to_string(), password.to_string());
        }
        Ok(ProvisionedUser {
            newly_created,
            credentials: admin.for_user(username, password, database),
        })
    }

    async fn delete_user(&self, _server: &ServerRef, _admin: &CredentialBundle, username: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::DeleteUser(username.to_string()));
        state.users.remove(username);
        Ok(())
    }

    async fn update_user_password(
        &self,
        _server: &ServerRef,
        _admin: &CredentialBundle,
        username: &str,
        password: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::UpdateUserPassword {
            username: username.to_string(),
            password: password.to_string(),
        });
        state.users.insert(username.to_string(), password.to_string());
        Ok(())
    }
}

// ============================================================================
// Context
// ============================================================================

pub struct Harness {
    pub ctx: ReconcileContext,
    pub secrets: Arc<MemorySecretStore>,
    pub resources: Arc<FakeResources>,
}

pub fn settings(backend: BackendKind) -> OperatorSettings {
    OperatorSettings {
        backend: backend.as_str().to_string(),
        operator_namespace: OPERATOR_NAMESPACE.to_string(),
        handler_on_resume: false,
        password: PasswordPolicy::default(),
        provisioning: ProvisioningTiming::default(),
        metrics_port: 8080,
    }
}

/// Context whose default backend is the first one given
pub fn harness(backends: Vec<Arc<FakeBackend>>) -> Harness {
    let default = backends[0].kind();
    let mut registry = BackendRegistry::new(default);
    for backend in backends {
        registry.register(backend);
    }
    let secrets = Arc::new(MemorySecretStore::default());
    let resources = Arc::new(FakeResources::default());
    let ctx = ReconcileContext::new(settings(default), registry, secrets.clone(), resources.clone());
    Harness {
        ctx,
        secrets,
        resources,
    }
}

// ============================================================================
// Provider fakes
// ============================================================================

#[derive(Default)]
pub struct FakeInstances {
    instances: Mutex<HashMap<String, Instance>>,
    /// Status new instances start in
    initial_status: Mutex<Option<String>>,
    pub created: Mutex<Vec<(String, String)>>,
    pub modified: Mutex<Vec<(String, Option<String>)>>,
    pub deleted: Mutex<Vec<String>>,
}

impl FakeInstances {
    pub fn start_in(&self, status: &str) {
        *self.initial_status.lock().unwrap() = Some(status.to_string());
    }

    pub fn set_status(&self, identifier: &str, status: &str) {
        if let Some(instance) = self.instances.lock().unwrap().get_mut(identifier) {
            instance.status = status.to_string();
        }
    }

    pub fn instance(&self, identifier: &str) -> Option<Instance> {
        self.instances.lock().unwrap().get(identifier).cloned()
    }
}

#[async_trait]
impl InstanceApi for FakeInstances {
    async fn describe(&self, identifier: &str) -> Result<Option<Instance>> {
        Ok(self.instance(identifier))
    }

    async fn create(&self, identifier: &str, spec: &InstanceSpec, password: &str) -> Result<()> {
        let status = self
            .initial_status
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| AVAILABLE.to_string());
        self.instances.lock().unwrap().insert(
            identifier.to_string(),
            Instance {
                identifier: identifier.to_string(),
                status,
                endpoint: Some(format!("{}.db.example.com", identifier)),
                spec: spec.clone(),
            },
        );
        self.created
            .lock()
            .unwrap()
            .push((identifier.to_string(), password.to_string()));
        Ok(())
    }

    async fn modify(&self, identifier: &str, spec: &InstanceSpec, password: Option<&str>) -> Result<()> {
        if let Some(instance) = self.instances.lock().unwrap().get_mut(identifier) {
            instance.spec = spec.clone();
        }
        self.modified
            .lock()
            .unwrap()
            .push((identifier.to_string(), password.map(str::to_string)));
        Ok(())
    }

    async fn delete(&self, identifier: &str) -> Result<()> {
        self.instances.lock().unwrap().remove(identifier);
        self.deleted.lock().unwrap().push(identifier.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeHelm {
    releases: Mutex<HashMap<(String, String), (String, Value)>>,
    pub upgrades: Mutex<Vec<(String, String, Value)>>,
    pub uninstalls: Mutex<Vec<String>>,
}

impl FakeHelm {
    pub fn set_status(&self, namespace: &str, release: &str, status: &str) {
        if let Some(entry) = self
            .releases
            .lock()
            .unwrap()
            .get_mut(&(namespace.to_string(), release.to_string()))
        {
            entry.0 = status.to_string();
        }
    }

    pub fn upgrade_count(&self) -> usize {
        self.upgrades.lock().unwrap().len()
    }
}

#[async_trait]
impl HelmRunner for FakeHelm {
    async fn status(&self, namespace: &str, release: &str) -> Result<Option<String>> {
        Ok(self
            .releases
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), release.to_string()))
            .map(|(status, _)| status.clone()))
    }

    async fn values(&self, namespace: &str, release: &str) -> Result<Option<Value>> {
        Ok(self
            .releases
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), release.to_string()))
            .map(|(_, values)| values.clone()))
    }

    async fn upgrade_install(&self, namespace: &str, release: &str, chart: &str, values: &Value) -> Result<()> {
        self.releases.lock().unwrap().insert(
            (namespace.to_string(), release.to_string()),
            ("deployed".to_string(), values.clone()),
        );
        self.upgrades
            .lock()
            .unwrap()
            .push((release.to_string(), chart.to_string(), values.clone()));
        Ok(())
    }

    async fn uninstall(&self, namespace: &str, release: &str) -> Result<()> {
        self.releases
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), release.to_string()));
        self.uninstalls.lock().unwrap().push(release.to_string());
        Ok(())
    }
}

/// Volume claims per namespace
#[derive(Default)]
pub struct FakeVolumes {
    claims: Mutex<BTreeMap<String, Vec<String>>>,
}

impl FakeVolumes {
    pub fn add(&self, namespace: &str, claim: &str) {
        self.claims
            .lock()
            .unwrap()
            .entry(namespace.to_string())
            .or_default()
            .push(claim.to_string());
    }

    pub fn names(&self, namespace: &str) -> Vec<String> {
        self.claims
            .lock()
            .unwrap()
            .get(namespace)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl VolumeClaimStore for FakeVolumes {
    async fn list(&self, namespace: &str) -> Result<Vec<String>> {
        Ok(self.names(namespace))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        if let Some(claims) = self.claims.lock().unwrap().get_mut(namespace) {
            claims.retain(|c| c != name);
        }
        Ok(())
    }
}

/// Records SQL statements by intent
#[derive(Default)]
pub struct FakeSql {
    databases: Mutex<HashSet<String>>,
    users: Mutex<HashMap<String, String>>,
    pub log: Mutex<Vec<String>>,
}

impl FakeSql {
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl SqlAdmin for FakeSql {
    async fn database_exists(&self, _admin: &CredentialBundle, name: &str) -> Result<bool> {
        Ok(self.databases.lock().unwrap().contains(name))
    }

    async fn create_database(&self, _admin: &CredentialBundle, name: &str, _options: &DatabaseOptions) -> Result<bool> {
        let created = self.databases.lock().unwrap().insert(name.to_string());
        if created {
            self.record(format!("create database {}", name));
        }
        Ok(created)
    }

    async fn revoke_public_access(&self, _admin: &CredentialBundle, name: &str) -> Result<()> {
        self.record(format!("revoke public on {}", name));
        Ok(())
    }

    async fn create_extension(&self, _admin: &CredentialBundle, database: &str, extension: &str) -> Result<()> {
        self.record(format!("create extension {} in {}", extension, database));
        Ok(())
    }

    async fn drop_database(&self, _admin: &CredentialBundle, name: &str) -> Result<()> {
        self.databases.lock().unwrap().remove(name);
        self.record(format!("drop database {}", name));
        Ok(())
    }

    async fn create_or_update_user(
        &self,
        _admin: &CredentialBundle,
        username: &str,
        password: &str,
        database: &str,
    ) -> Result<bool> {
        let mut users = self.users.lock().unwrap();
        let created = !users.contains_key(username);
        if created {
            users.insert(username.to_string(), password.to_string());
        }
        self.record(format!("grant {} on {}", username, database));
        Ok(created)
    }

    async fn drop_user(&self, _admin: &CredentialBundle, username: &str) -> Result<()> {
        self.users.lock().unwrap().remove(username);
        self.record(format!("drop user {}", username));
        Ok(())
    }

    async fn set_password(&self, _admin: &CredentialBundle, username: &str, password: &str) -> Result<()> {
        self.users
            .lock()
            .unwrap()
            .insert(username.to_string(), password.to_string());
        self.record(format!("set password for {}", username));
        Ok(())
    }
}
