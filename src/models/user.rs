//! Admin-plane views of object-store users and bucket metadata.

use super::quota::UserQuota;
use serde::{Deserialize, Serialize};

/// An object-store user as returned by the admin API.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectUser {
    #[serde(rename = "user_id")]
    pub id: String,

    #[serde(default)]
    pub display_name: String,

    #[serde(default)]
    pub max_buckets: Option<i32>,

    #[serde(default)]
    pub keys: Vec<UserKey>,

    #[serde(default)]
    pub user_quota: UserQuota,
}

/// An S3 key pair belonging to a user.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct UserKey {
    #[serde(default)]
    pub user: String,
    pub access_key: String,
    pub secret_key: String,
}

impl ObjectUser {
    /// The user's first key pair, which is the one handed out in bindings.
    pub fn primary_key(&self) -> Option<&UserKey> {
        self.keys.first()
    }
}

/// Bucket metadata as returned by the admin API.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct BucketInfo {
    pub bucket: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub id: String,
}

/// Access credentials for either plane.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

impl Credentials {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

impl From<&UserKey> for Credentials {
    fn from(key: &UserKey) -> Self {
        Self::new(&key.access_key, &key.secret_key)
    }
}
