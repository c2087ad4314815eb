//! Operator configuration
//!
//! Configuration is a YAML document addressed with dotted keys
//! (`backends.awsrds.region`). Every key can be overridden from the
//! environment: `PG_OPERATOR_` followed by the key with dots replaced by
//! underscores, upper-cased (`PG_OPERATOR_BACKENDS_AWSRDS_REGION`).
//! Environment values are parsed as YAML so numbers, booleans and lists work.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_yaml::Value;
use tracing::debug;

use crate::backends::BackendKind;
use crate::credentials::PasswordPolicy;
use crate::error::{Error, Result};

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "PG_OPERATOR_";

/// Environment variable naming the configuration file
pub const CONFIG_PATH_ENV: &str = "OPERATOR_CONFIG";

/// Configuration file used when `OPERATOR_CONFIG` is unset
pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

/// Layered configuration: environment > file > caller default
#[derive(Clone, Debug, Default)]
pub struct Configuration {
    root: Value,
    env: HashMap<String, String>,
}

impl Configuration {
    /// Load configuration from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        debug!(path = %path.display(), "Loaded configuration file");
        Self::from_yaml_str(&raw)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let root: Value = serde_yaml::from_str(raw)?;
        let root = match root {
            Value::Null => Value::Mapping(Default::default()),
            Value::Mapping(_) => root,
            _ => return Err(Error::config("Configuration root must be a mapping")),
        };
        Ok(Self {
            root,
            env: HashMap::new(),
        })
    }

    /// Layer environment overrides on top of the file values.
    ///
    /// Only variables carrying [`ENV_PREFIX`] are kept.
    pub fn with_env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env.extend(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .filter(|(k, _)| k.starts_with(ENV_PREFIX)),
        );
        self
    }

    /// Layer the process environment on top of the file values
    pub fn with_process_env(self) -> Self {
        self.with_env(std::env::vars())
    }

    /// Environment variable that overrides `key`
    pub fn env_key(key: &str) -> String {
        format!("{}{}", ENV_PREFIX, key.replace('.', "_").to_uppercase())
    }

    fn lookup(&self, key: &str) -> Option<Value> {
        if let Some(raw) = self.env.get(&Self::env_key(key)) {
            return Some(
                serde_yaml::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.clone())),
            );
        }

        let mut current = &self.root;
        for part in key.split('.') {
            current = current.as_mapping()?.get(part)?;
        }
        match current {
            Value::Null => None,
            other => Some(other.clone()),
        }
    }

    /// Typed lookup; `None` when the key is absent everywhere
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.lookup(key)
            .map(|value| convert(key, value))
            .transpose()
    }

    /// Typed lookup with a default
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    /// Typed lookup of a key that must be present
    pub fn require<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.get(key)?.ok_or_else(|| {
            Error::config(format!(
                "Missing required configuration key '{}' (or env {})",
                key,
                Self::env_key(key)
            ))
        })
    }

    /// First of several keys that is present
    pub fn get_one_of<T: DeserializeOwned>(&self, keys: &[&str]) -> Result<Option<T>> {
        for key in keys {
            if let Some(value) = self.get(key)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }
}

fn convert<T: DeserializeOwned>(key: &str, value: Value) -> Result<T> {
    match serde_yaml::from_value(value.clone()) {
        Ok(v) => Ok(v),
        Err(first) => {
            // `version: 15` is still a string to whoever asks for one
            let text = match &value {
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return Err(Error::config(format!("Invalid value for '{}': {}", key, first))),
            };
            serde_yaml::from_value(Value::String(text))
                .map_err(|_| Error::config(format!("Invalid value for '{}': {}", key, first)))
        }
    }
}

/// Readiness wait bounds for provider calls
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProvisioningTiming {
    pub ready_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ProvisioningTiming {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(10),
        }
    }
}

/// Settings resolved once at startup
#[derive(Clone, Debug)]
pub struct OperatorSettings {
    /// Process-wide default backend
    pub backend: String,
    /// Namespace holding temporary credential holders
    pub operator_namespace: String,
    /// Reconcile already-finished objects seen again after a restart
    pub handler_on_resume: bool,
    pub password: PasswordPolicy,
    pub provisioning: ProvisioningTiming,
    pub metrics_port: u16,
}

impl OperatorSettings {
    /// Resolve settings from configuration.
    ///
    /// `pod_namespace` is the namespace the operator runs in, used when
    /// `operator_namespace` is not configured.
    pub fn from_config(config: &Configuration, pod_namespace: Option<String>) -> Result<Self> {
        let backend: String = config.require("backend")?;
        let operator_namespace = config
            .get::<String>("operator_namespace")?
            .or(pod_namespace)
            .unwrap_or_else(|| "default".to_string());

        let defaults = PasswordPolicy::default();
        let password = PasswordPolicy {
            length: config.get_or("security.password_length", defaults.length)?,
            special_characters: config
                .get_or("security.special_characters", defaults.special_characters)?,
        };

        let timing = ProvisioningTiming::default();
        let provisioning = ProvisioningTiming {
            ready_timeout: Duration::from_secs(config.get_or(
                "provisioning.ready_timeout_seconds",
                timing.ready_timeout.as_secs(),
            )?),
            poll_interval: Duration::from_secs(config.get_or(
                "provisioning.poll_interval_seconds",
                timing.poll_interval.as_secs(),
            )?),
        };

        Ok(Self {
            backend,
            operator_namespace,
            handler_on_resume: config.get_or("handler_on_resume", false)?,
            password,
            provisioning,
            metrics_port: config.get_or("metrics.port", 8080u16)?,
        })
    }

    /// Fail-fast checks run before any reconcile
    pub fn verify(&self) -> Result<()> {
        BackendKind::from_str(&self.backend)
            .map_err(|_| Error::config(format!("Unknown default backend '{}'", self.backend)))?;

        let minimum = self.password.minimum_length();
        if self.password.length < minimum {
            return Err(Error::config(format!(
                "security.password_length must be at least {} to cover every character class",
                minimum
            )));
        }

        if self.provisioning.poll_interval.is_zero() {
            return Err(Error::config("provisioning.poll_interval_seconds must be positive"));
        }

        Ok(())
    }
}
