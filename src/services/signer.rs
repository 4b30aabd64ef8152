//! AWS Signature Version 4 request signing.
//!
//! Both the admin-ops API and the S3 data plane of the object store accept
//! SigV4-signed requests. [`sign`] produces the headers a request must carry;
//! callers send exactly the path and query they signed.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac, digest::InvalidLength};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::models::user::Credentials;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "s3";
pub const DEFAULT_REGION: &str = "us-east-1";

/// Headers to attach to a signed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub host: String,
    pub amz_date: String,
    pub content_sha256: String,
    pub authorization: String,
}

/// A request about to be signed.
pub struct SigningRequest<'a> {
    pub method: &'a str,
    /// `host` or `host:port`, exactly as sent in the Host header.
    pub host: &'a str,
    /// Unencoded absolute path.
    pub path: &'a str,
    pub query: &'a BTreeMap<String, String>,
    pub payload: &'a [u8],
}

/// URI-encode per SigV4: unreserved characters stay, everything else is `%XX`.
pub fn uri_encode(value: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(value.len() * 3);
    for byte in value.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_' | b'-' | b'~' | b'.' => {
                out.push(byte as char)
            }
            b'/' if !encode_slash => out.push('/'),
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

/// Canonical (and wire) form of a query map, sorted by encoded key.
pub fn canonical_query(query: &BTreeMap<String, String>) -> String {
    let mut items: Vec<String> = query
        .iter()
        .map(|(k, v)| format!("{}={}", uri_encode(k, true), uri_encode(v, true)))
        .collect();
    items.sort();
    items.join("&")
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>, InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(key)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn signing_key(secret: &str, date: &str, region: &str) -> Result<Vec<u8>, InvalidLength> {
    let k_date = hmac(format!("AWS4{}", secret).as_bytes(), date.as_bytes())?;
    let k_region = hmac(&k_date, region.as_bytes())?;
    let k_service = hmac(&k_region, SERVICE.as_bytes())?;
    hmac(&k_service, b"aws4_request")
}

/// Sign `req` with `creds` for `region` at time `now`.
pub fn sign(
    req: &SigningRequest<'_>,
    creds: &Credentials,
    region: &str,
    now: DateTime<Utc>,
) -> Result<SignedHeaders, InvalidLength> {
    let region = if region.is_empty() {
        DEFAULT_REGION
    } else {
        region
    };
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();
    let content_sha256 = sha256_hex(req.payload);

    let signed_headers = "host;x-amz-content-sha256;x-amz-date";
    let canonical_headers = format!(
        "host:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n",
        req.host, content_sha256, amz_date
    );
    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        req.method,
        uri_encode(req.path, false),
        canonical_query(req.query),
        canonical_headers,
        signed_headers,
        content_sha256
    );

    let scope = format!("{}/{}/{}/aws4_request", date, region, SERVICE);
    let string_to_sign = format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM,
        amz_date,
        scope,
        sha256_hex(canonical_request.as_bytes())
    );
    let signature = hex::encode(hmac(
        &signing_key(&creds.secret_key, &date, region)?,
        string_to_sign.as_bytes(),
    )?);

    Ok(SignedHeaders {
        host: req.host.to_string(),
        amz_date,
        content_sha256,
        authorization: format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM, creds.access_key, scope, signed_headers, signature
        ),
    })
}
