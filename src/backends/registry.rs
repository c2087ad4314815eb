//! Backend selection

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::{info, warn};

use super::{
    Backend, ChartFlavor, HelmBackend, HelmRunner, HelmSettings, InstanceApi, ManagedBackend, ManagedSettings,
    SqlAdmin, AWS_AURORA, AWS_RDS, AZURE_FLEXIBLE,
};
use crate::adapters::VolumeClaimStore;
use crate::config::{Configuration, OperatorSettings};
use crate::error::{Error, Result};

/// Supported backends
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackendKind {
    AwsRds,
    AwsAurora,
    AzurePostgresFlexible,
    HelmBitnami,
    HelmYugabyte,
}

impl BackendKind {
    pub const ALL: [BackendKind; 5] = [
        BackendKind::AwsRds,
        BackendKind::AwsAurora,
        BackendKind::AzurePostgresFlexible,
        BackendKind::HelmBitnami,
        BackendKind::HelmYugabyte,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::AwsRds => "awsrds",
            BackendKind::AwsAurora => "awsaurora",
            BackendKind::AzurePostgresFlexible => "azurepostgresflexible",
            BackendKind::HelmBitnami => "helmbitnami",
            BackendKind::HelmYugabyte => "helmyugabyte",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        BackendKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::config(format!("Unknown backend: {}", s)))
    }
}

/// Backend chosen for one resource
#[derive(Clone)]
pub struct Selection {
    pub kind: BackendKind,
    pub backend: Arc<dyn Backend>,
    /// Set when the requested backend could not be used
    pub warning: Option<String>,
}

/// Backends available to the reconcilers, keyed by kind
#[derive(Clone)]
pub struct BackendRegistry {
    default: BackendKind,
    backends: HashMap<BackendKind, Arc<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new(default: BackendKind) -> Self {
        Self {
            default,
            backends: HashMap::new(),
        }
    }

    /// Add a backend, replacing any previous one of the same kind
    pub fn register(&mut self, backend: Arc<dyn Backend>) -> &mut Self {
        self.backends.insert(backend.kind(), backend);
        self
    }

    pub fn default_kind(&self) -> BackendKind {
        self.default
    }

    pub fn kinds(&self) -> Vec<BackendKind> {
        BackendKind::ALL
            .into_iter()
            .filter(|k| self.backends.contains_key(k))
            .collect()
    }

    /// The default backend must be usable before any reconcile runs
    pub fn verify(&self) -> Result<()> {
        if self.backends.contains_key(&self.default) {
            Ok(())
        } else {
            Err(Error::config(format!(
                "Default backend '{}' is not available; no provider client is configured for it",
                self.default
            )))
        }
    }

    /// Resolve a backend name.
    ///
    /// No name selects the default. A name that is unknown or not available
    /// also selects the default, with a warning.
    pub fn select(&self, requested: Option<&str>) -> Result<Selection> {
        let default = self.backends.get(&self.default).cloned().ok_or_else(|| {
            Error::config(format!("Default backend '{}' is not available", self.default))
        })?;

        let Some(name) = requested else {
            return Ok(Selection {
                kind: self.default,
                backend: default,
                warning: None,
            });
        };

        let found = BackendKind::from_str(name)
            .ok()
            .and_then(|kind| self.backends.get(&kind).map(|b| (kind, b.clone())));

        Ok(match found {
            Some((kind, backend)) => Selection {
                kind,
                backend,
                warning: None,
            },
            None => Selection {
                kind: self.default,
                backend: default,
                warning: Some(format!(
                    "Selected backend {} is unknown or not enabled. Defaulting to {}",
                    name, self.default
                )),
            },
        })
    }
}

/// Provider clients supplied by the host process
#[derive(Clone)]
pub struct ProviderClients {
    pub sql: Arc<dyn SqlAdmin>,
    pub helm: Option<Arc<dyn HelmRunner>>,
    /// Used by Helm backends with `pvc_cleanup` set
    pub volumes: Option<Arc<dyn VolumeClaimStore>>,
    pub instances: HashMap<BackendKind, Arc<dyn InstanceApi>>,
}

/// Build every backend the supplied clients allow
pub fn build_registry(
    config: &Configuration,
    settings: &OperatorSettings,
    clients: ProviderClients,
) -> Result<BackendRegistry> {
    let mut registry = BackendRegistry::new(BackendKind::from_str(&settings.backend)?);

    if let Some(helm) = &clients.helm {
        for flavor in [ChartFlavor::Bitnami, ChartFlavor::Yugabyte] {
            let helm_settings = HelmSettings::from_config(flavor, config)?;
            let mut backend = HelmBackend::new(flavor, helm_settings, helm.clone(), clients.sql.clone());
            if let Some(volumes) = &clients.volumes {
                backend = backend.with_volume_claims(volumes.clone());
            }
            registry.register(Arc::new(backend));
        }
    }

    for flavor in [AWS_RDS, AWS_AURORA, AZURE_FLEXIBLE] {
        if let Some(api) = clients.instances.get(&flavor.kind) {
            let managed_settings = ManagedSettings::from_config(&flavor, config)?;
            registry.register(Arc::new(ManagedBackend::new(
                flavor,
                managed_settings,
                settings.provisioning,
                api.clone(),
                clients.sql.clone(),
            )));
        } else {
            warn!(backend = %flavor.kind, "No instance client supplied, backend unavailable");
        }
    }

    registry.verify()?;
    info!(
        default = %registry.default_kind(),
        backends = ?registry.kinds(),
        "Backends configured"
    );
    Ok(registry)
}
