//! Represents an incoming bucket request and the storage-class parameters it resolves to.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Storage class parameter naming the backing object store.
pub const PARAM_OBJECT_STORE_NAME: &str = "objectStoreName";
/// Storage class parameter naming the namespace of the backing object store.
pub const PARAM_OBJECT_STORE_NAMESPACE: &str = "objectStoreNamespace";
/// Storage class parameter pointing at an externally reachable gateway (`host:port`).
pub const PARAM_ENDPOINT: &str = "endpoint";
/// Storage class parameter naming a pre-existing (static) bucket.
pub const PARAM_BUCKET_NAME: &str = "bucketName";
/// Storage class parameter carrying the region reported in bindings.
pub const PARAM_REGION: &str = "region";

/// A request to provision (or grant access to) a bucket.
///
/// Constructed per call and consumed entirely by one lifecycle operation.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct BucketRequest {
    /// Desired bucket name. Replaced by the storage class `bucketName`
    /// parameter when the class points at a static bucket.
    pub bucket_name: String,

    /// The claim that asked for the bucket.
    pub claim: ClaimRef,
}

/// Identity and settings of the bucket claim behind a request.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRef {
    pub name: String,
    pub namespace: String,

    /// Kubernetes UID of the claim, used to derive a unique user name.
    #[serde(default)]
    pub uid: Option<String>,

    pub storage_class_name: String,

    /// Free-form settings from the claim (`maxObjects`, `maxSize`, ...).
    #[serde(default)]
    pub additional_config: BTreeMap<String, String>,
}

/// The subset of storage class parameters the provisioner reads.
///
/// Empty parameter values are normalized to `None` when the class is loaded.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StorageClassParams {
    pub name: String,
    pub object_store_name: Option<String>,
    pub object_store_namespace: Option<String>,
    pub endpoint: Option<String>,
    pub bucket_name: Option<String>,
    pub region: Option<String>,
}

impl StorageClassParams {
    /// Build from a raw storage class parameter map.
    pub fn from_parameters(name: &str, params: &BTreeMap<String, String>) -> Self {
        let get = |key: &str| {
            params
                .get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Self {
            name: name.to_string(),
            object_store_name: get(PARAM_OBJECT_STORE_NAME),
            object_store_namespace: get(PARAM_OBJECT_STORE_NAMESPACE),
            endpoint: get(PARAM_ENDPOINT),
            bucket_name: get(PARAM_BUCKET_NAME),
            region: get(PARAM_REGION),
        }
    }

    /// Returns the static bucket name when the class targets an existing bucket.
    pub fn static_bucket(&self) -> Option<&str> {
        self.bucket_name.as_deref()
    }
}

/// Resolved location of a backing object store gateway.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectStoreInfo {
    pub name: String,
    pub namespace: String,
    /// Plain HTTP gateway port (0 when disabled).
    pub port: i32,
    /// HTTPS gateway port (0 when disabled).
    pub secure_port: i32,
    /// Secret holding the gateway certificate (`cert` key).
    pub ssl_certificate_ref: Option<String>,
    /// Secret holding a dedicated CA bundle (`cabundle` key).
    pub ca_bundle_ref: Option<String>,
}

impl ObjectStoreInfo {
    /// Gateway port used by clients: the plain port when set, otherwise the secure one.
    pub fn gateway_port(&self) -> i32 {
        if self.port != 0 {
            self.port
        } else {
            self.secure_port
        }
    }

    /// In-cluster service domain of the gateway.
    pub fn domain_name(&self) -> String {
        build_domain_name(&self.name, &self.namespace)
    }
}

/// Service DNS name of an object store gateway.
pub fn build_domain_name(store: &str, namespace: &str) -> String {
    format!("rook-ceph-rgw-{}.{}.svc", store, namespace)
}

/// Split an external `host:port` endpoint.
///
/// A scheme prefix is tolerated. Returns `None` for the host when it is empty
/// and `0` for the port when it is missing or not numeric.
pub fn split_endpoint(endpoint: &str) -> (Option<String>, i32) {
    let trimmed = endpoint
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/');

    let (host, port) = match trimmed.rsplit_once(':') {
        Some((host, _)) if !host.ends_with(']') && host.contains(':') => (trimmed, None),
        Some((host, port)) => (host, Some(port)),
        None => (trimmed, None),
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port = port
        .and_then(|p| p.parse::<u16>().ok())
        .map(i32::from)
        .unwrap_or(0);

    let host = (!host.is_empty()).then(|| host.to_string());
    (host, port)
}
