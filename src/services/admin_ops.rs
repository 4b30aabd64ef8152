//! Client for the object store's admin-ops REST API.
//!
//! Provides a trait-based abstraction over user, bucket-metadata and quota
//! administration so the lifecycle coordinator can be exercised against mocks,
//! while production code talks to the gateway's `/admin` endpoints.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use super::transport::{GatewayEndpoint, SignedTransport, TransportError};
use crate::models::{
    quota::QuotaSpec,
    user::{BucketInfo, Credentials, ObjectUser},
};

#[derive(Debug, Error)]
pub enum AdminOpsError {
    #[error("user `{0}` does not exist")]
    NoSuchUser(String),
    #[error("bucket `{0}` does not exist")]
    NoSuchBucket(String),
    #[error("admin API returned {status} ({code}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },
    #[error("failed to decode admin API response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl AdminOpsError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            AdminOpsError::NoSuchUser(_) | AdminOpsError::NoSuchBucket(_)
        )
    }
}

pub type AdminOpsResult<T> = Result<T, AdminOpsError>;

/// Administrative operations on object-store users and buckets.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AdminOps: Send + Sync {
    /// Create a user and return it with its generated key pair.
    async fn create_user(&self, uid: &str, display_name: &str) -> AdminOpsResult<ObjectUser>;

    /// Set how many buckets a user may own. `-1` forbids creating any.
    async fn modify_user_max_buckets(&self, uid: &str, max_buckets: i32) -> AdminOpsResult<()>;

    async fn get_user(&self, uid: &str) -> AdminOpsResult<ObjectUser>;

    async fn get_bucket_info(&self, bucket: &str) -> AdminOpsResult<BucketInfo>;

    /// Remove a bucket; with `purge_objects` its objects go with it.
    async fn remove_bucket(&self, bucket: &str, purge_objects: bool) -> AdminOpsResult<()>;

    /// Write the fields of `spec` that are set; unset fields are left untouched.
    async fn set_user_quota(&self, spec: &QuotaSpec) -> AdminOpsResult<()>;

    async fn delete_user(&self, uid: &str) -> AdminOpsResult<()>;
}

/// Builds an [`AdminOps`] handle for one lifecycle call.
#[cfg_attr(test, automock)]
pub trait AdminOpsConnector: Send + Sync {
    fn connect(
        &self,
        endpoint: &GatewayEndpoint,
        credentials: &Credentials,
    ) -> AdminOpsResult<Arc<dyn AdminOps>>;
}

/// Connector producing [`RgwAdminOps`] clients with a fixed request timeout.
#[derive(Clone, Debug)]
pub struct RgwAdminOpsConnector {
    pub timeout: Duration,
}

impl AdminOpsConnector for RgwAdminOpsConnector {
    fn connect(
        &self,
        endpoint: &GatewayEndpoint,
        credentials: &Credentials,
    ) -> AdminOpsResult<Arc<dyn AdminOps>> {
        let transport =
            SignedTransport::new(endpoint.clone(), credentials.clone(), "", self.timeout)?;
        Ok(Arc::new(RgwAdminOps { transport }))
    }
}

/// Admin-ops client speaking the RADOS gateway `/admin` REST dialect.
pub struct RgwAdminOps {
    transport: SignedTransport,
}

const USER_PATH: &str = "/admin/user";
const BUCKET_PATH: &str = "/admin/bucket";

fn query<const N: usize>(pairs: [(&str, String); N]) -> BTreeMap<String, String> {
    let mut q: BTreeMap<String, String> = pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
    q.insert("format".into(), "json".into());
    q
}

impl RgwAdminOps {
    async fn call(
        &self,
        method: Method,
        path: &str,
        query: BTreeMap<String, String>,
        subject: &str,
    ) -> AdminOpsResult<Bytes> {
        let response = self
            .transport
            .send(method, path, &query, Bytes::new(), &[])
            .await?;
        let status = response.status();
        let body = response.bytes().await?;
        if status.is_success() {
            return Ok(body);
        }
        Err(api_error(status, &body, subject))
    }

    async fn call_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: BTreeMap<String, String>,
        subject: &str,
    ) -> AdminOpsResult<T> {
        let body = self.call(method, path, query, subject).await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

/// Map an error response onto the distinguishable not-found conditions.
fn api_error(status: StatusCode, body: &[u8], subject: &str) -> AdminOpsError {
    let code = serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("Code").and_then(|c| c.as_str()).map(str::to_string))
        .unwrap_or_default();
    match code.as_str() {
        "NoSuchUser" => AdminOpsError::NoSuchUser(subject.to_string()),
        "NoSuchBucket" => AdminOpsError::NoSuchBucket(subject.to_string()),
        _ => AdminOpsError::Api {
            status: status.as_u16(),
            code,
            message: String::from_utf8_lossy(body).into_owned(),
        },
    }
}

#[async_trait]
impl AdminOps for RgwAdminOps {
    async fn create_user(&self, uid: &str, display_name: &str) -> AdminOpsResult<ObjectUser> {
        self.call_json(
            Method::PUT,
            USER_PATH,
            query([
                ("uid", uid.to_string()),
                ("display-name", display_name.to_string()),
            ]),
            uid,
        )
        .await
    }

    async fn modify_user_max_buckets(&self, uid: &str, max_buckets: i32) -> AdminOpsResult<()> {
        self.call(
            Method::POST,
            USER_PATH,
            query([
                ("uid", uid.to_string()),
                ("max-buckets", max_buckets.to_string()),
            ]),
            uid,
        )
        .await
        .map(|_| ())
    }

    async fn get_user(&self, uid: &str) -> AdminOpsResult<ObjectUser> {
        self.call_json(Method::GET, USER_PATH, query([("uid", uid.to_string())]), uid)
            .await
    }

    async fn get_bucket_info(&self, bucket: &str) -> AdminOpsResult<BucketInfo> {
        self.call_json(
            Method::GET,
            BUCKET_PATH,
            query([("bucket", bucket.to_string())]),
            bucket,
        )
        .await
    }

    async fn remove_bucket(&self, bucket: &str, purge_objects: bool) -> AdminOpsResult<()> {
        self.call(
            Method::DELETE,
            BUCKET_PATH,
            query([
                ("bucket", bucket.to_string()),
                ("purge-objects", purge_objects.to_string()),
            ]),
            bucket,
        )
        .await
        .map(|_| ())
    }

    async fn set_user_quota(&self, spec: &QuotaSpec) -> AdminOpsResult<()> {
        let mut q = query([
            ("uid", spec.uid.clone()),
            ("quota", String::new()),
            ("quota-type", "user".to_string()),
        ]);
        if let Some(enabled) = spec.enabled {
            q.insert("enabled".into(), enabled.to_string());
        }
        if let Some(max_objects) = spec.max_objects {
            q.insert("max-objects".into(), max_objects.to_string());
        }
        if let Some(max_size) = spec.max_size {
            q.insert("max-size".into(), max_size.to_string());
        }
        self.call(Method::PUT, USER_PATH, q, &spec.uid)
            .await
            .map(|_| ())
    }

    async fn delete_user(&self, uid: &str) -> AdminOpsResult<()> {
        self.call(
            Method::DELETE,
            USER_PATH,
            query([("uid", uid.to_string())]),
            uid,
        )
        .await
        .map(|_| ())
    }
}
