//! Bucket access-policy documents.
//!
//! A policy is a list of statements, each naming principals, an effect, the
//! bucket resources it covers and an action set. Statements are plain values
//! built by [`PolicyStatement::for_user`]; the document only supports adding
//! a principal's statement (replacing any earlier one) and dropping every
//! statement attributable to a principal.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

pub const POLICY_VERSION: &str = "2012-10-17";
const PRINCIPAL_KEY: &str = "AWS";

/// Actions granted to (or denied from) a bucket user.
pub const ALLOWED_ACTIONS: [&str; 17] = [
    "s3:AbortMultipartUpload",
    "s3:DeleteObject",
    "s3:DeleteObjectVersion",
    "s3:GetBucketLocation",
    "s3:GetBucketVersioning",
    "s3:GetLifecycleConfiguration",
    "s3:GetObject",
    "s3:GetObjectAcl",
    "s3:GetObjectVersion",
    "s3:ListBucket",
    "s3:ListBucketMultipartUploads",
    "s3:ListBucketVersions",
    "s3:ListMultipartUploadParts",
    "s3:PutBucketVersioning",
    "s3:PutLifecycleConfiguration",
    "s3:PutObject",
    "s3:PutObjectAcl",
];

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Effect {
    Allow,
    Deny,
}

/// A single value or a list, as policy documents written by other tools allow.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn iter(&self) -> impl Iterator<Item = &String> {
        match self {
            OneOrMany::One(v) => std::slice::from_ref(v).iter(),
            OneOrMany::Many(v) => v.iter(),
        }
    }
}

/// Either the `"*"` wildcard or principal type (`AWS`) to principal ARNs.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(untagged)]
pub enum Principal {
    Any(String),
    Typed(BTreeMap<String, OneOrMany>),
}

impl Principal {
    pub fn iter(&self) -> Box<dyn Iterator<Item = &String> + '_> {
        match self {
            Principal::Any(v) => Box::new(std::iter::once(v)),
            Principal::Typed(map) => Box::new(map.values().flat_map(OneOrMany::iter)),
        }
    }
}

impl Default for Principal {
    fn default() -> Self {
        Principal::Typed(BTreeMap::new())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PolicyStatement {
    #[serde(rename = "Sid", default)]
    pub sid: String,
    #[serde(rename = "Effect")]
    pub effect: Effect,
    #[serde(rename = "Principal", default)]
    pub principal: Principal,
    #[serde(rename = "Action", default, deserialize_with = "one_or_many")]
    pub action: Vec<String>,
    #[serde(rename = "Resource", default, deserialize_with = "one_or_many")]
    pub resource: Vec<String>,
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(v) => vec![v],
        OneOrMany::Many(v) => v,
    })
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BucketPolicy {
    #[serde(rename = "Id", default)]
    pub id: String,
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "Statement", default)]
    pub statement: Vec<PolicyStatement>,
}

/// ARN naming an object-store user as a policy principal.
pub fn user_arn(user: &str) -> String {
    format!("arn:aws:iam:::user/{}", user)
}

/// ARN naming a bucket itself.
pub fn bucket_arn(bucket: &str) -> String {
    format!("arn:aws:s3:::{}", bucket)
}

/// ARN naming every object in a bucket.
pub fn bucket_objects_arn(bucket: &str) -> String {
    format!("arn:aws:s3:::{}/*", bucket)
}

impl PolicyStatement {
    /// Statement for one user over a bucket and its objects with the fixed action set.
    pub fn for_user(user: &str, bucket: &str, effect: Effect) -> Self {
        Self {
            sid: user.to_string(),
            effect,
            principal: Principal::Typed(BTreeMap::from([(
                PRINCIPAL_KEY.to_string(),
                OneOrMany::Many(vec![user_arn(user)]),
            )])),
            action: ALLOWED_ACTIONS.iter().map(|a| a.to_string()).collect(),
            resource: vec![bucket_arn(bucket), bucket_objects_arn(bucket)],
        }
    }

    /// True when the statement's principal set is exactly `user`.
    pub fn names_only(&self, user: &str) -> bool {
        let arn = user_arn(user);
        let mut principals = self.principal.iter();
        matches!(
            (principals.next(), principals.next()),
            (Some(p), None) if *p == arn || p == user
        )
    }
}

impl BucketPolicy {
    pub fn new(statements: Vec<PolicyStatement>) -> Self {
        Self {
            id: String::new(),
            version: POLICY_VERSION.to_string(),
            statement: statements,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statement_covers_bucket_and_objects() {
        let st = PolicyStatement::for_user("obc-a", "photos", Effect::Allow);

        assert_eq!(st.sid, "obc-a");
        assert_eq!(
            st.principal.iter().collect::<Vec<_>>(),
            vec!["arn:aws:iam:::user/obc-a"]
        );
        assert_eq!(
            st.resource,
            vec!["arn:aws:s3:::photos".to_string(), "arn:aws:s3:::photos/*".to_string()]
        );
        assert_eq!(st.action.len(), ALLOWED_ACTIONS.len());
        assert!(st.names_only("obc-a"));
        assert!(!st.names_only("obc-b"));
    }

    #[test]
    fn shared_statement_is_not_named_only_by_either_user() {
        let mut st = PolicyStatement::for_user("obc-a", "photos", Effect::Allow);
        st.principal = Principal::Typed(BTreeMap::from([(
            "AWS".to_string(),
            OneOrMany::Many(vec![user_arn("obc-a"), user_arn("obc-b")]),
        )]));

        assert!(!st.names_only("obc-a"));
        assert!(!st.names_only("obc-b"));
    }

    #[test]
    fn policy_serializes_to_s3_shape() {
        let policy = BucketPolicy::new(vec![PolicyStatement::for_user(
            "obc-a",
            "photos",
            Effect::Deny,
        )]);
        let json = serde_json::to_value(&policy).unwrap();

        assert_eq!(json["Version"], "2012-10-17");
        assert_eq!(json["Statement"][0]["Effect"], "Deny");
        assert_eq!(json["Statement"][0]["Principal"]["AWS"][0], "arn:aws:iam:::user/obc-a");
    }

    #[test]
    fn policy_parses_document_without_id() {
        let raw = r#"{
            "Version": "2012-10-17",
            "Statement": [{
                "Sid": "x",
                "Effect": "Allow",
                "Principal": {"AWS": ["arn:aws:iam:::user/x"]},
                "Action": ["s3:GetObject"],
                "Resource": ["arn:aws:s3:::b/*"]
            }]
        }"#;
        let policy: BucketPolicy = serde_json::from_str(raw).unwrap();
        assert_eq!(policy.id, "");
        assert_eq!(policy.statement.len(), 1);
        assert!(policy.statement[0].names_only("x"));
    }

    #[test]
    fn foreign_statement_shapes_round_trip() {
        let raw = r#"{
            "Version": "2012-10-17",
            "Statement": [
                {"Effect": "Allow", "Principal": "*", "Action": "s3:GetObject", "Resource": "arn:aws:s3:::b/*"},
                {"Effect": "Allow", "Principal": {"AWS": "arn:aws:iam:::user/y"}, "Action": ["s3:*"], "Resource": ["arn:aws:s3:::b"]}
            ]
        }"#;
        let policy: BucketPolicy = serde_json::from_str(raw).unwrap();

        assert_eq!(policy.statement[0].principal, Principal::Any("*".into()));
        assert_eq!(policy.statement[0].action, vec!["s3:GetObject".to_string()]);
        assert!(policy.statement[1].names_only("y"));

        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["Statement"][0]["Principal"], "*");
        assert_eq!(json["Statement"][1]["Principal"]["AWS"], "arn:aws:iam:::user/y");
    }
}
