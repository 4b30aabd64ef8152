//! Signed HTTP transport shared by the admin-ops and S3 clients.
//!
//! One transport is built per lifecycle call from the gateway location, the
//! credentials of the acting user and optional TLS trust material. It is never
//! cached across calls.

use bytes::Bytes;
use chrono::Utc;
use reqwest::{Certificate, Client, Method, Response, header};
use std::{collections::BTreeMap, time::Duration};
use thiserror::Error;

use super::signer::{self, SigningRequest, canonical_query};
use crate::models::user::Credentials;

/// Where a gateway listens and how to trust it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GatewayEndpoint {
    pub host: String,
    pub port: i32,
    /// PEM trust material. When present the gateway is spoken to over HTTPS.
    pub tls_ca: Option<Vec<u8>>,
}

impl GatewayEndpoint {
    pub fn scheme(&self) -> &'static str {
        if self.tls_ca.is_some() { "https" } else { "http" }
    }

    /// Host header value: `host:port`, IPv6 literals bracketed.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme(), self.authority())
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid TLS trust material: {0}")]
    InvalidCertificate(#[source] reqwest::Error),
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("failed to sign request: {0}")]
    Signing(#[from] hmac::digest::InvalidLength),
    #[error("request to gateway failed: {0}")]
    Send(#[source] reqwest::Error),
}

/// An HTTP client bound to one gateway and one set of credentials.
#[derive(Clone, Debug)]
pub struct SignedTransport {
    client: Client,
    endpoint: GatewayEndpoint,
    credentials: Credentials,
    region: String,
}

impl SignedTransport {
    pub fn new(
        endpoint: GatewayEndpoint,
        credentials: Credentials,
        region: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let mut builder = Client::builder().timeout(timeout);
        if let Some(pem) = endpoint.tls_ca.as_deref() {
            let certs =
                Certificate::from_pem_bundle(pem).map_err(TransportError::InvalidCertificate)?;
            for cert in certs {
                builder = builder.add_root_certificate(cert);
            }
        }
        let client = builder.build().map_err(TransportError::Client)?;

        Ok(Self {
            client,
            endpoint,
            credentials,
            region: region.into(),
        })
    }

    pub fn endpoint(&self) -> &GatewayEndpoint {
        &self.endpoint
    }

    /// Sign and send one request. `path` is unencoded; the query is sent in
    /// exactly the canonical form that was signed.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        query: &BTreeMap<String, String>,
        body: Bytes,
        extra_headers: &[(header::HeaderName, String)],
    ) -> Result<Response, TransportError> {
        let authority = self.endpoint.authority();
        let signed = signer::sign(
            &SigningRequest {
                method: method.as_str(),
                host: &authority,
                path,
                query,
                payload: &body[..],
            },
            &self.credentials,
            &self.region,
            Utc::now(),
        )?;

        let mut url = format!(
            "{}{}",
            self.endpoint.base_url(),
            signer::uri_encode(path, false)
        );
        if !query.is_empty() {
            url.push('?');
            url.push_str(&canonical_query(query));
        }
        tracing::debug!(%method, %url, "sending signed request");

        let mut request = self
            .client
            .request(method, url)
            .header(header::HOST, signed.host)
            .header("x-amz-date", signed.amz_date)
            .header("x-amz-content-sha256", signed.content_sha256)
            .header(header::AUTHORIZATION, signed.authorization);
        for (name, value) in extra_headers {
            request = request.header(name.clone(), value.as_str());
        }
        request.body(body).send().await.map_err(TransportError::Send)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_scheme_follows_trust_material() {
        let mut ep = GatewayEndpoint {
            host: "rook-ceph-rgw-store.rook-ceph.svc".into(),
            port: 80,
            tls_ca: None,
        };
        assert_eq!(ep.base_url(), "http://rook-ceph-rgw-store.rook-ceph.svc:80");

        ep.tls_ca = Some(b"pem".to_vec());
        ep.port = 443;
        assert_eq!(ep.base_url(), "https://rook-ceph-rgw-store.rook-ceph.svc:443");
    }

    #[test]
    fn ipv6_hosts_are_bracketed() {
        let ep = GatewayEndpoint {
            host: "fd00::1".into(),
            port: 7480,
            tls_ca: None,
        };
        assert_eq!(ep.authority(), "[fd00::1]:7480");
    }
}
