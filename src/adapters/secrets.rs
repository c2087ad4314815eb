//! Secret storage for credential bundles and temporary holders

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::{DeleteParams, ObjectMeta, Patch, PatchParams, PostParams},
    Api, Client,
};
use serde_json::json;
use tracing::debug;

use crate::credentials::SecretData;
use crate::error::{Error, Result};

/// Label marking secrets written by the operator
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Field manager used for all writes
pub const FIELD_MANAGER: &str = "postgres-provisioning-operator";

/// Flat string-keyed secret storage
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Read a secret; `None` when absent
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<SecretData>>;

    /// Create a secret that must not exist yet
    async fn create(&self, namespace: &str, name: &str, data: &SecretData) -> Result<()>;

    /// Overwrite an existing secret
    async fn update(&self, namespace: &str, name: &str, data: &SecretData) -> Result<()>;

    /// Delete a secret; deleting an absent secret succeeds
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;

    /// Create or overwrite
    async fn create_or_update(&self, namespace: &str, name: &str, data: &SecretData) -> Result<()> {
        if self.get(namespace, name).await?.is_some() {
            self.update(namespace, name, data).await
        } else {
            self.create(namespace, name, data).await
        }
    }
}

/// [`SecretStore`] backed by Kubernetes secrets
#[derive(Clone)]
pub struct KubeSecretStore {
    client: Client,
}

impl KubeSecretStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<SecretData>> {
        match self.api(namespace).get_opt(name).await? {
            Some(secret) => Ok(Some(decode_secret(&secret)?)),
            None => Ok(None),
        }
    }

    async fn create(&self, namespace: &str, name: &str, data: &SecretData) -> Result<()> {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(BTreeMap::from([(
                    MANAGED_BY_LABEL.to_string(),
                    FIELD_MANAGER.to_string(),
                )])),
                ..Default::default()
            },
            type_: Some("Opaque".to_string()),
            string_data: Some(data.clone()),
            ..Default::default()
        };
        self.api(namespace)
            .create(&PostParams::default(), &secret)
            .await?;
        debug!(secret = %name, namespace = %namespace, "Created secret");
        Ok(())
    }

    async fn update(&self, namespace: &str, name: &str, data: &SecretData) -> Result<()> {
        let patch = json!({ "stringData": data });
        self.api(namespace)
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        debug!(secret = %name, namespace = %namespace, "Updated secret");
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        match self.api(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                debug!(secret = %name, namespace = %namespace, "Deleted secret");
                Ok(())
            }
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => Ok(()),
            Err(e) => Err(Error::Kube(e)),
        }
    }
}

/// Decode every key of a secret as UTF-8
pub fn decode_secret(secret: &Secret) -> Result<SecretData> {
    let name = secret.metadata.name.clone().unwrap_or_default();
    let mut data = SecretData::new();

    if let Some(raw) = &secret.data {
        for (key, bytes) in raw {
            let value = String::from_utf8(bytes.0.clone()).map_err(|e| {
                Error::Config(format!(
                    "Invalid UTF-8 in secret '{}' key '{}': {}",
                    name, key, e
                ))
            })?;
            data.insert(key.clone(), value);
        }
    }

    // stringData is write-only on the server but present on objects built locally
    if let Some(strings) = &secret.string_data {
        data.extend(strings.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;

    #[test]
    fn test_decode_secret() {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some("admin".into()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                "password".to_string(),
                ByteString(b"hunter2".to_vec()),
            )])),
            ..Default::default()
        };
        let data = decode_secret(&secret).unwrap();
        assert_eq!(data["password"], "hunter2");
    }

    #[test]
    fn test_decode_rejects_binary() {
        let secret = Secret {
            data: Some(BTreeMap::from([(
                "password".to_string(),
                ByteString(vec![0xff, 0xfe]),
            )])),
            ..Default::default()
        };
        assert!(decode_secret(&secret).is_err());
    }
}
