//! Credential bundles and the crash-safe password protocol

mod lifecycle;
mod password;

pub use lifecycle::*;
pub use password::*;

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};

/// Flat string map stored in a secret
pub type SecretData = BTreeMap<String, String>;

/// Connection details handed to database clients
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialBundle {
    pub username: String,
    pub password: String,
    pub dbname: String,
    pub host: String,
    pub port: String,
    pub sslmode: String,
}

impl CredentialBundle {
    const KEYS: [&'static str; 6] = ["username", "password", "dbname", "host", "port", "sslmode"];

    /// Flatten into secret data
    pub fn to_secret_data(&self) -> SecretData {
        Self::KEYS
            .iter()
            .zip([
                &self.username,
                &self.password,
                &self.dbname,
                &self.host,
                &self.port,
                &self.sslmode,
            ])
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    /// Read back from secret data; `secret` is only used in errors
    pub fn from_secret_data(secret: &str, data: &SecretData) -> Result<Self> {
        let field = |key: &str| {
            data.get(key).cloned().ok_or_else(|| Error::SecretKeyNotFound {
                secret: secret.to_string(),
                key: key.to_string(),
            })
        };
        Ok(Self {
            username: field("username")?,
            password: field("password")?,
            dbname: field("dbname")?,
            host: field("host")?,
            port: field("port")?,
            sslmode: field("sslmode")?,
        })
    }

    /// Same endpoint, different login and database
    pub fn for_user(&self, username: &str, password: &str, dbname: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            dbname: dbname.to_string(),
            ..self.clone()
        }
    }
}

impl fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("dbname", &self.dbname)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("sslmode", &self.sslmode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle() -> CredentialBundle {
        CredentialBundle {
            username: "postgres".into(),
            password: "s3cr3T-pass".into(),
            dbname: "postgres".into(),
            host: "db.example.internal".into(),
            port: "5432".into(),
            sslmode: "require".into(),
        }
    }

    #[test]
    fn test_secret_data_keys() {
        let data = bundle().to_secret_data();
        assert_eq!(data.len(), 6);
        assert_eq!(data["sslmode"], "require");
        assert_eq!(CredentialBundle::from_secret_data("admin", &data).unwrap(), bundle());
    }

    #[test]
    fn test_missing_key_is_reported() {
        let mut data = bundle().to_secret_data();
        data.remove("host");
        let err = CredentialBundle::from_secret_data("admin", &data).unwrap_err();
        assert!(err.to_string().contains("'host'"));
    }

    #[test]
    fn test_debug_redacts_password() {
        let rendered = format!("{:?}", bundle());
        assert!(!rendered.contains("s3cr3T-pass"));
    }

    #[test]
    fn test_for_user_keeps_endpoint() {
        let user = bundle().for_user("app", "pw", "app");
        assert_eq!(user.host, "db.example.internal");
        assert_eq!(user.dbname, "app");
        assert_eq!(user.username, "app");
    }
}
