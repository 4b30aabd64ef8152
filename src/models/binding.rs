//! Represents the bucket binding: the record linking a claim to its bucket's
//! endpoint and credentials.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Key in [`Connection::additional_state`] holding the object-store user name.
pub const CEPH_USER_KEY: &str = "cephUser";

/// A provisioned (or granted) bucket as seen by the claim owner.
///
/// Created on a successful provision or grant and read back on delete,
/// revoke and update to recover the owning user and prior settings.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectBucket {
    /// Name of the claim this binding belongs to.
    pub name: String,

    /// Namespace of the claim this binding belongs to.
    pub namespace: String,

    /// Storage class used to resolve the backing object store.
    pub storage_class_name: String,

    pub connection: Connection,
}

/// Connection details handed to the bucket consumer.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub endpoint: Endpoint,
    pub authentication: Authentication,

    /// Provisioner-private state; carries at least [`CEPH_USER_KEY`].
    #[serde(default)]
    pub additional_state: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub bucket_host: String,
    pub bucket_port: i32,
    pub bucket_name: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub additional_config: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Authentication {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl ObjectBucket {
    /// The object-store user that owns this binding, if recorded.
    pub fn ceph_user(&self) -> Option<&str> {
        self.connection
            .additional_state
            .get(CEPH_USER_KEY)
            .map(String::as_str)
            .filter(|u| !u.is_empty())
    }

    pub fn bucket_name(&self) -> &str {
        &self.connection.endpoint.bucket_name
    }

    pub fn additional_config(&self) -> &BTreeMap<String, String> {
        &self.connection.endpoint.additional_config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_serializes_in_camel_case() {
        let ob = ObjectBucket {
            name: "photos".into(),
            namespace: "apps".into(),
            storage_class_name: "rgw-bucket".into(),
            connection: Connection {
                endpoint: Endpoint {
                    bucket_host: "rook-ceph-rgw-store.rook-ceph.svc".into(),
                    bucket_port: 80,
                    bucket_name: "photos-1".into(),
                    ..Default::default()
                },
                authentication: Authentication {
                    access_key_id: "AK".into(),
                    secret_access_key: "SK".into(),
                },
                additional_state: BTreeMap::from([(CEPH_USER_KEY.to_string(), "obc-u".into())]),
            },
        };

        let json = serde_json::to_value(&ob).unwrap();
        assert_eq!(json["connection"]["endpoint"]["bucketHost"], "rook-ceph-rgw-store.rook-ceph.svc");
        assert_eq!(json["connection"]["authentication"]["accessKeyId"], "AK");
        assert_eq!(json["connection"]["additionalState"]["cephUser"], "obc-u");
        assert_eq!(ob.ceph_user(), Some("obc-u"));
    }

    #[test]
    fn empty_ceph_user_is_absent() {
        let mut ob = ObjectBucket::default();
        assert_eq!(ob.ceph_user(), None);
        ob.connection
            .additional_state
            .insert(CEPH_USER_KEY.to_string(), String::new());
        assert_eq!(ob.ceph_user(), None);
    }
}
