//! Persistent volume claims left behind by uninstalled releases

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::{
    api::{DeleteParams, ListParams},
    Api, Client, ResourceExt,
};
use tracing::debug;

use crate::error::{Error, Result};

/// Listing and deletion of volume claims in a namespace
#[async_trait]
pub trait VolumeClaimStore: Send + Sync {
    /// Names of all claims in a namespace
    async fn list(&self, namespace: &str) -> Result<Vec<String>>;

    /// Delete a claim; deleting an absent claim succeeds
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

/// [`VolumeClaimStore`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeVolumeClaims {
    client: Client,
}

impl KubeVolumeClaims {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl VolumeClaimStore for KubeVolumeClaims {
    async fn list(&self, namespace: &str) -> Result<Vec<String>> {
        let claims = self.api(namespace).list(&ListParams::default()).await?;
        Ok(claims.items.iter().map(|claim| claim.name_any()).collect())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        match self.api(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                debug!(claim = %name, namespace = %namespace, "Deleted volume claim");
                Ok(())
            }
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => Ok(()),
            Err(e) => Err(Error::Kube(e)),
        }
    }
}
