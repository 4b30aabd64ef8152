//! Lookups against the orchestrating cluster: storage classes, object stores,
//! gateway TLS material and the admin-ops credentials of a store.

use async_trait::async_trait;
use k8s_openapi::api::{core::v1::Secret, storage::v1::StorageClass};
use kube::{
    Client,
    api::{Api, ApiResource, DynamicObject, ListParams},
};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::models::{
    bucket::{ObjectStoreInfo, StorageClassParams},
    user::Credentials,
};

/// Secret holding the admin-ops user of an object store.
pub const ADMIN_OPS_SECRET: &str = "rgw-admin-ops-user";
const STORAGE_CLASS_ATTEMPTS: u32 = 3;
const STORAGE_CLASS_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{kind} `{name}` not found")]
    NotFound { kind: &'static str, name: String },
    #[error("{0}")]
    NotInitialized(String),
    #[error("{kind} `{name}` is invalid: {reason}")]
    Invalid {
        kind: &'static str,
        name: String,
        reason: String,
    },
    #[error(transparent)]
    Kube(#[from] kube::Error),
}

pub type ClusterResult<T> = Result<T, ClusterError>;

/// Read-only view of the cluster resources a lifecycle call depends on.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterLookup: Send + Sync {
    async fn storage_class(&self, name: &str) -> ClusterResult<StorageClassParams>;

    async fn object_store(&self, name: &str, namespace: &str) -> ClusterResult<ObjectStoreInfo>;

    /// PEM trust material for the store's secure gateway port.
    async fn tls_ca_cert(&self, store: &ObjectStoreInfo) -> ClusterResult<Vec<u8>>;

    /// Credentials of the store's admin-ops user. Fails with
    /// [`ClusterError::NotInitialized`] while the backing cluster is not ready.
    async fn admin_ops_credentials(&self, store: &ObjectStoreInfo) -> ClusterResult<Credentials>;
}

/// [`ClusterLookup`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeClusterLookup {
    client: Client,
}

impl KubeClusterLookup {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn rook_resource(kind: &str, plural: &str) -> ApiResource {
        ApiResource {
            group: "ceph.rook.io".into(),
            version: "v1".into(),
            api_version: "ceph.rook.io/v1".into(),
            kind: kind.into(),
            plural: plural.into(),
        }
    }

    async fn secret_key(&self, namespace: &str, name: &str, key: &str) -> ClusterResult<Vec<u8>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = match api.get(name).await {
            Ok(secret) => secret,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                return Err(ClusterError::NotFound {
                    kind: "Secret",
                    name: format!("{}/{}", namespace, name),
                });
            }
            Err(err) => return Err(err.into()),
        };
        secret
            .data
            .and_then(|mut data| data.remove(key))
            .map(|value| value.0)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ClusterError::Invalid {
                kind: "Secret",
                name: format!("{}/{}", namespace, name),
                reason: format!("missing key `{}`", key),
            })
    }

    /// The backing cluster counts as initialized once it reports a ceph status.
    async fn ensure_cluster_initialized(&self, namespace: &str) -> ClusterResult<()> {
        let ar = Self::rook_resource("CephCluster", "cephclusters");
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
        let clusters = api.list(&ListParams::default()).await?;
        let cluster = clusters.items.into_iter().next().ok_or_else(|| {
            ClusterError::NotInitialized(format!("no ceph cluster found in namespace `{}`", namespace))
        })?;

        let ceph_reported = cluster
            .data
            .get("status")
            .and_then(|status| status.get("ceph"))
            .and_then(|ceph| ceph.get("health"))
            .and_then(|h| h.as_str())
            .is_some_and(|h| !h.is_empty());
        if !ceph_reported {
            return Err(ClusterError::NotInitialized(format!(
                "ceph cluster in namespace `{}` is not initialized yet",
                namespace
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterLookup for KubeClusterLookup {
    async fn storage_class(&self, name: &str) -> ClusterResult<StorageClassParams> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        let mut attempt = 1;
        loop {
            match api.get(name).await {
                Ok(sc) => {
                    let params = sc.parameters.unwrap_or_default();
                    return Ok(StorageClassParams::from_parameters(name, &params));
                }
                Err(kube::Error::Api(ae)) if ae.code == 404 => {
                    return Err(ClusterError::NotFound {
                        kind: "StorageClass",
                        name: name.to_string(),
                    });
                }
                Err(err) if attempt < STORAGE_CLASS_ATTEMPTS => {
                    warn!(storage_class = name, attempt, error = %err, "storage class lookup failed, retrying");
                    tokio::time::sleep(STORAGE_CLASS_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn object_store(&self, name: &str, namespace: &str) -> ClusterResult<ObjectStoreInfo> {
        let ar = Self::rook_resource("CephObjectStore", "cephobjectstores");
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
        let store = match api.get(name).await {
            Ok(store) => store,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                return Err(ClusterError::NotFound {
                    kind: "CephObjectStore",
                    name: format!("{}/{}", namespace, name),
                });
            }
            Err(err) => return Err(err.into()),
        };

        let gateway = store
            .data
            .get("spec")
            .and_then(|spec| spec.get("gateway"))
            .cloned()
            .unwrap_or_default();
        let int_field = |key: &str| {
            gateway
                .get(key)
                .and_then(|v| v.as_i64())
                .and_then(|v| i32::try_from(v).ok())
                .unwrap_or(0)
        };
        let str_field = |key: &str| {
            gateway
                .get(key)
                .and_then(|v| v.as_str())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let info = ObjectStoreInfo {
            name: name.to_string(),
            namespace: namespace.to_string(),
            port: int_field("port"),
            secure_port: int_field("securePort"),
            ssl_certificate_ref: str_field("sslCertificateRef"),
            ca_bundle_ref: str_field("caBundleRef"),
        };
        debug!(?info, "resolved object store");
        if info.gateway_port() == 0 {
            return Err(ClusterError::Invalid {
                kind: "CephObjectStore",
                name: format!("{}/{}", namespace, name),
                reason: "neither port nor securePort is set".into(),
            });
        }
        Ok(info)
    }

    async fn tls_ca_cert(&self, store: &ObjectStoreInfo) -> ClusterResult<Vec<u8>> {
        if let Some(bundle) = store.ca_bundle_ref.as_deref() {
            return self.secret_key(&store.namespace, bundle, "cabundle").await;
        }
        match store.ssl_certificate_ref.as_deref() {
            Some(cert) => self.secret_key(&store.namespace, cert, "cert").await,
            None => Err(ClusterError::Invalid {
                kind: "CephObjectStore",
                name: format!("{}/{}", store.namespace, store.name),
                reason: "secure port is set but no certificate secret is referenced".into(),
            }),
        }
    }

    async fn admin_ops_credentials(&self, store: &ObjectStoreInfo) -> ClusterResult<Credentials> {
        self.ensure_cluster_initialized(&store.namespace).await?;

        let access_key = self
            .secret_key(&store.namespace, ADMIN_OPS_SECRET, "accessKey")
            .await?;
        let secret_key = self
            .secret_key(&store.namespace, ADMIN_OPS_SECRET, "secretKey")
            .await?;
        let to_string = |raw: Vec<u8>| {
            String::from_utf8(raw).map_err(|_| ClusterError::Invalid {
                kind: "Secret",
                name: format!("{}/{}", store.namespace, ADMIN_OPS_SECRET),
                reason: "credentials are not valid UTF-8".into(),
            })
        };
        Ok(Credentials::new(to_string(access_key)?, to_string(secret_key)?))
    }
}
