//! S3 data-plane session used to create buckets and manage bucket policies.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use reqwest::{Method, StatusCode, header};
use serde::Deserialize;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use super::transport::{GatewayEndpoint, SignedTransport, TransportError};
use crate::models::{policy::BucketPolicy, user::Credentials};

#[derive(Debug, Error)]
pub enum S3Error {
    #[error("bucket `{0}` does not exist")]
    NoSuchBucket(String),
    #[error("S3 returned {status} ({code}) for `{resource}`")]
    Api {
        status: u16,
        code: String,
        resource: String,
    },
    #[error("invalid bucket policy document: {0}")]
    Policy(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type S3Result<T> = Result<T, S3Error>;

/// Bucket-level data-plane operations performed as one user.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait S3Agent: Send + Sync {
    /// Create a bucket. A bucket already owned by the caller counts as created.
    async fn create_bucket(&self, bucket: &str) -> S3Result<()>;

    /// Fetch the bucket policy; `None` when the bucket has none yet.
    async fn get_bucket_policy(&self, bucket: &str) -> S3Result<Option<BucketPolicy>>;

    async fn put_bucket_policy(&self, bucket: &str, policy: &BucketPolicy) -> S3Result<()>;
}

/// Opens an [`S3Agent`] session for a given user.
#[cfg_attr(test, automock)]
pub trait S3Connector: Send + Sync {
    fn connect(
        &self,
        endpoint: &GatewayEndpoint,
        credentials: &Credentials,
        region: &str,
    ) -> S3Result<Arc<dyn S3Agent>>;
}

#[derive(Clone, Debug)]
pub struct HttpS3Connector {
    pub timeout: Duration,
}

impl S3Connector for HttpS3Connector {
    fn connect(
        &self,
        endpoint: &GatewayEndpoint,
        credentials: &Credentials,
        region: &str,
    ) -> S3Result<Arc<dyn S3Agent>> {
        let transport =
            SignedTransport::new(endpoint.clone(), credentials.clone(), region, self.timeout)?;
        Ok(Arc::new(HttpS3Agent { transport }))
    }
}

/// Path-style S3 client over a signed transport.
pub struct HttpS3Agent {
    transport: SignedTransport,
}

fn policy_query() -> BTreeMap<String, String> {
    BTreeMap::from([("policy".to_string(), String::new())])
}

/// S3 XML error document; only the code is read.
#[derive(Deserialize)]
struct ErrorBody {
    #[serde(rename = "Code")]
    code: String,
}

/// `<Code>` of an S3 XML error body, empty when the body is not one.
fn error_code(body: &[u8]) -> String {
    match quick_xml::de::from_reader::<_, ErrorBody>(body) {
        Ok(err) => err.code.trim().to_string(),
        Err(err) => {
            tracing::debug!(error = %err, "S3 error body is not an XML error document");
            String::new()
        }
    }
}

/// Base64 MD5 of a request body, as S3 expects in `Content-MD5`.
fn content_md5(body: &[u8]) -> String {
    general_purpose::STANDARD.encode(md5::compute(body).0)
}

impl HttpS3Agent {
    async fn failure(resource: &str, response: reqwest::Response) -> S3Error {
        let status = response.status();
        let body = response.bytes().await.unwrap_or_default();
        let code = error_code(&body);
        if code == "NoSuchBucket" {
            return S3Error::NoSuchBucket(resource.to_string());
        }
        S3Error::Api {
            status: status.as_u16(),
            code,
            resource: resource.to_string(),
        }
    }
}

#[async_trait]
impl S3Agent for HttpS3Agent {
    async fn create_bucket(&self, bucket: &str) -> S3Result<()> {
        let path = format!("/{}", bucket);
        let response = self
            .transport
            .send(Method::PUT, &path, &BTreeMap::new(), Bytes::new(), &[])
            .await?;
        if response.status().is_success() {
            tracing::info!(bucket, gateway = %self.transport.endpoint().base_url(), "bucket created");
            return Ok(());
        }

        match Self::failure(bucket, response).await {
            S3Error::Api { ref code, .. } if code == "BucketAlreadyOwnedByYou" => {
                tracing::debug!(bucket, "bucket already exists and is owned by this user");
                Ok(())
            }
            err => Err(err),
        }
    }

    async fn get_bucket_policy(&self, bucket: &str) -> S3Result<Option<BucketPolicy>> {
        let path = format!("/{}", bucket);
        let response = self
            .transport
            .send(Method::GET, &path, &policy_query(), Bytes::new(), &[])
            .await?;
        if response.status().is_success() {
            let body = response.bytes().await?;
            return Ok(Some(serde_json::from_slice(&body)?));
        }

        match Self::failure(bucket, response).await {
            S3Error::Api { ref code, status, .. }
                if code == "NoSuchBucketPolicy" && status == StatusCode::NOT_FOUND.as_u16() =>
            {
                Ok(None)
            }
            err => Err(err),
        }
    }

    async fn put_bucket_policy(&self, bucket: &str, policy: &BucketPolicy) -> S3Result<()> {
        let path = format!("/{}", bucket);
        let body = Bytes::from(serde_json::to_vec(policy)?);
        let headers = [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (header::HeaderName::from_static("content-md5"), content_md5(&body)),
        ];
        let response = self
            .transport
            .send(Method::PUT, &path, &policy_query(), body, &headers)
            .await?;
        if response.status().is_success() {
            tracing::debug!(bucket, status = %response.status(), "bucket policy written");
            return Ok(());
        }
        Err(Self::failure(bucket, response).await)
    }
}
