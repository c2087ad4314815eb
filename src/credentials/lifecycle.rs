//! Crash-safe password lifecycle
//!
//! A password is generated at most once per resource lifecycle. It is
//! written to a temporary holder secret before any provider sees it, and
//! the holder is only removed after the final credentials secret exists.
//! A crash at any point leaves one readable copy of the password the
//! provider may already expect.

use std::sync::Arc;

use tracing::{debug, info};

use super::{CredentialBundle, PasswordPolicy, SecretData};
use crate::adapters::SecretStore;
use crate::error::{Error, Result};

/// Key holding the password in both holder and final secrets
pub const PASSWORD_KEY: &str = "password";

/// Longest name accepted by every supported provider and by Kubernetes labels
pub const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Which resource kind a temporary holder belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HolderRole {
    Server,
    Database,
}

impl HolderRole {
    fn prefix(&self) -> &'static str {
        match self {
            HolderRole::Server => "pg",
            HolderRole::Database => "pgdb",
        }
    }
}

/// Where a resolved password came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PasswordSource {
    /// Read from the final credentials secret
    Committed,
    /// Read from a temporary holder left by an earlier attempt
    Pending,
    /// Freshly generated and stored in a new holder
    Generated,
}

/// Password resolved for one reconcile pass
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedPassword {
    pub password: String,
    pub source: PasswordSource,
}

impl ResolvedPassword {
    pub fn is_committed(&self) -> bool {
        self.source == PasswordSource::Committed
    }
}

impl std::fmt::Debug for ResolvedPassword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedPassword")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

/// Cut a name down to [`MAX_IDENTIFIER_LENGTH`] without leaving a trailing separator
pub fn shorten(name: &str) -> String {
    let mut short: String = name.chars().take(MAX_IDENTIFIER_LENGTH).collect();
    while short.ends_with(['-', '.']) {
        short.pop();
    }
    short
}

/// Drives the temporary holder / final secret protocol
#[derive(Clone)]
pub struct CredentialManager {
    store: Arc<dyn SecretStore>,
    holder_namespace: String,
    policy: PasswordPolicy,
}

impl CredentialManager {
    pub fn new(store: Arc<dyn SecretStore>, holder_namespace: impl Into<String>, policy: PasswordPolicy) -> Self {
        Self {
            store,
            holder_namespace: holder_namespace.into(),
            policy,
        }
    }

    /// Deterministic holder name for a resource
    pub fn holder_name(role: HolderRole, namespace: &str, name: &str) -> String {
        shorten(&format!("{}-{}-{}-tmp", role.prefix(), namespace, name))
    }

    /// Read the final credentials secret, if present
    pub async fn committed(&self, namespace: &str, name: &str) -> Result<Option<SecretData>> {
        self.store.get(namespace, name).await
    }

    /// Resolve the password for this pass.
    ///
    /// The final secret wins, then an existing holder. Only when neither
    /// exists is a new password generated, and it is persisted to a holder
    /// before being returned.
    pub async fn resolve(&self, namespace: &str, final_name: &str, holder: &str) -> Result<ResolvedPassword> {
        if let Some(data) = self.store.get(namespace, final_name).await? {
            return Ok(ResolvedPassword {
                password: password_from(final_name, &data)?,
                source: PasswordSource::Committed,
            });
        }

        if let Some(data) = self.store.get(&self.holder_namespace, holder).await? {
            debug!(holder = %holder, "Reusing password from earlier attempt");
            return Ok(ResolvedPassword {
                password: password_from(holder, &data)?,
                source: PasswordSource::Pending,
            });
        }

        let password = self.policy.generate();
        self.store
            .create(&self.holder_namespace, holder, &holder_data(&password))
            .await?;
        debug!(holder = %holder, "Generated new password");
        Ok(ResolvedPassword {
            password,
            source: PasswordSource::Generated,
        })
    }

    /// Replace the committed password with a new one.
    ///
    /// The new holder is written before the final secret is removed so a
    /// crash in between still leaves a recoverable copy.
    pub async fn reset(&self, namespace: &str, final_name: &str, holder: &str) -> Result<ResolvedPassword> {
        let password = self.policy.generate();
        self.store
            .create_or_update(&self.holder_namespace, holder, &holder_data(&password))
            .await?;
        self.store.delete(namespace, final_name).await?;
        info!(secret = %final_name, namespace = %namespace, "Invalidated committed credentials");
        Ok(ResolvedPassword {
            password,
            source: PasswordSource::Generated,
        })
    }

    /// Finish the protocol: write the final secret when asked, then drop the holder
    pub async fn commit(
        &self,
        namespace: &str,
        final_name: &str,
        holder: &str,
        bundle: &CredentialBundle,
        write_final: bool,
    ) -> Result<()> {
        if write_final {
            self.store
                .create_or_update(namespace, final_name, &bundle.to_secret_data())
                .await?;
        }
        self.store.delete(&self.holder_namespace, holder).await
    }

    /// Remove the final secret and any leftover holder
    pub async fn discard(&self, namespace: &str, final_name: &str, holder: &str) -> Result<()> {
        self.store.delete(namespace, final_name).await?;
        self.store.delete(&self.holder_namespace, holder).await
    }
}

fn holder_data(password: &str) -> SecretData {
    SecretData::from([(PASSWORD_KEY.to_string(), password.to_string())])
}

fn password_from(secret: &str, data: &SecretData) -> Result<String> {
    data.get(PASSWORD_KEY)
        .cloned()
        .ok_or_else(|| Error::SecretKeyNotFound {
            secret: secret.to_string(),
            key: PASSWORD_KEY.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_holder_names() {
        assert_eq!(
            CredentialManager::holder_name(HolderRole::Server, "team-a", "main"),
            "pg-team-a-main-tmp"
        );
        assert_eq!(
            CredentialManager::holder_name(HolderRole::Database, "team-a", "orders"),
            "pgdb-team-a-orders-tmp"
        );
    }

    #[test]
    fn test_holder_name_is_bounded() {
        let long = "x".repeat(80);
        let name = CredentialManager::holder_name(HolderRole::Database, "ns", &long);
        assert_eq!(name.len(), MAX_IDENTIFIER_LENGTH);
        assert_eq!(
            name,
            CredentialManager::holder_name(HolderRole::Database, "ns", &long)
        );
    }

    #[test]
    fn test_shorten_drops_trailing_separator() {
        let name = format!("{}-rest", "a".repeat(62));
        assert_eq!(shorten(&name), "a".repeat(62));
        assert_eq!(shorten("short"), "short");
    }
}
