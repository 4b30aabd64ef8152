//! Pure policy and quota reconciliation.
//!
//! Nothing here talks to a remote: the lifecycle coordinator fetches current
//! state, asks these functions for the document or quota write to send, and
//! sends it.

use crate::models::{
    policy::{BucketPolicy, Effect, PolicyStatement},
    quota::{ParsedLimits, QuotaSpec, UserQuota},
};

/// Add `user`'s statement over `bucket` to `current` (or to a fresh policy).
///
/// Any statement naming only `user` is replaced, so repeated grants leave a
/// single statement per principal. Statements of other principals are kept
/// in their original order.
pub fn add_statement(
    current: Option<BucketPolicy>,
    user: &str,
    bucket: &str,
    effect: Effect,
) -> BucketPolicy {
    let statement = PolicyStatement::for_user(user, bucket, effect);
    match current {
        None => BucketPolicy::new(vec![statement]),
        Some(mut policy) => {
            policy.statement.retain(|st| !st.names_only(user));
            policy.statement.push(statement);
            policy
        }
    }
}

/// Remove every statement whose principal set is exactly `user`.
pub fn drop_statements(mut policy: BucketPolicy, user: &str) -> BucketPolicy {
    policy.statement.retain(|st| !st.names_only(user));
    policy
}

/// Quota write applied right after a user is created, or `None` when the
/// claim requests no limits.
pub fn initial_quota(uid: &str, limits: &ParsedLimits) -> Option<QuotaSpec> {
    if limits.max_objects.is_none() && limits.max_size.is_none() {
        return None;
    }
    Some(QuotaSpec {
        uid: uid.to_string(),
        enabled: Some(true),
        max_objects: limits.max_objects,
        max_size: limits.max_size,
    })
}

/// The single quota write that moves `current` towards `requested`.
///
/// An enabled quota with no meaningful limit requested (absent or negative)
/// is disabled and nothing else is sent. Otherwise the quota is enabled and
/// each limit is included only when it differs from the stored value.
pub fn quota_update(uid: &str, requested: &ParsedLimits, current: &UserQuota) -> QuotaSpec {
    let unlimited = |v: Option<i64>| v.is_none_or(|v| v < 0);
    if current.enabled.unwrap_or(false)
        && unlimited(requested.max_objects)
        && unlimited(requested.max_size)
    {
        return QuotaSpec {
            uid: uid.to_string(),
            enabled: Some(false),
            ..Default::default()
        };
    }

    let changed = |want: Option<i64>, have: Option<i64>| want.filter(|w| Some(*w) != have);
    QuotaSpec {
        uid: uid.to_string(),
        enabled: Some(true),
        max_objects: changed(requested.max_objects, current.max_objects),
        max_size: changed(requested.max_size, current.max_size),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::policy::{OneOrMany, Principal};
    use std::collections::BTreeMap;

    fn foreign_statement() -> PolicyStatement {
        PolicyStatement {
            sid: "public-read".into(),
            effect: Effect::Allow,
            principal: Principal::Any("*".into()),
            action: vec!["s3:GetObject".into()],
            resource: vec!["arn:aws:s3:::photos/*".into()],
        }
    }

    #[test]
    fn add_to_missing_policy_creates_one() {
        let policy = add_statement(None, "obc-a", "photos", Effect::Allow);
        assert_eq!(policy.version, "2012-10-17");
        assert_eq!(policy.statement.len(), 1);
        assert!(policy.statement[0].names_only("obc-a"));
    }

    #[test]
    fn repeated_grant_replaces_statement() {
        let existing = BucketPolicy::new(vec![foreign_statement()]);
        let once = add_statement(Some(existing), "obc-a", "photos", Effect::Allow);
        let twice = add_statement(Some(once.clone()), "obc-a", "photos", Effect::Allow);

        assert_eq!(once, twice);
        assert_eq!(twice.statement.len(), 2);
        assert_eq!(twice.statement[0], foreign_statement());
    }

    #[test]
    fn deny_replaces_allow_for_same_principal() {
        let granted = add_statement(None, "obc-a", "photos", Effect::Allow);
        let denied = add_statement(Some(granted), "obc-a", "photos", Effect::Deny);
        assert_eq!(denied.statement.len(), 1);
        assert_eq!(denied.statement[0].effect, Effect::Deny);
    }

    #[test]
    fn drop_removes_only_exact_principal() {
        let mut shared = PolicyStatement::for_user("obc-a", "photos", Effect::Allow);
        shared.principal = Principal::Typed(BTreeMap::from([(
            "AWS".to_string(),
            OneOrMany::Many(vec![
                "arn:aws:iam:::user/obc-a".into(),
                "arn:aws:iam:::user/obc-b".into(),
            ]),
        )]));
        let policy = BucketPolicy::new(vec![
            PolicyStatement::for_user("obc-a", "photos", Effect::Allow),
            shared.clone(),
            PolicyStatement::for_user("obc-b", "photos", Effect::Allow),
            foreign_statement(),
        ]);

        let dropped = drop_statements(policy, "obc-a");
        assert_eq!(dropped.statement.len(), 3);
        assert_eq!(dropped.statement[0], shared);
        assert!(dropped.statement.iter().all(|st| !st.names_only("obc-a")));
    }

    #[test]
    fn grant_then_drop_leaves_no_statement_for_principal() {
        let existing = BucketPolicy::new(vec![foreign_statement()]);
        let granted = add_statement(Some(existing.clone()), "obc-a", "photos", Effect::Allow);
        let revoked = drop_statements(granted, "obc-a");
        assert_eq!(revoked, existing);
    }

    #[test]
    fn initial_quota_skipped_without_limits() {
        assert_eq!(initial_quota("u", &ParsedLimits::default()), None);
        let spec = initial_quota(
            "u",
            &ParsedLimits {
                max_objects: None,
                max_size: Some(1024),
            },
        )
        .unwrap();
        assert_eq!(spec.enabled, Some(true));
        assert_eq!(spec.max_objects, None);
        assert_eq!(spec.max_size, Some(1024));
    }

    #[test]
    fn enabled_quota_without_limits_is_disabled_only() {
        let current = UserQuota {
            enabled: Some(true),
            max_objects: Some(100),
            max_size: Some(1 << 30),
        };
        for requested in [
            ParsedLimits::default(),
            ParsedLimits {
                max_objects: Some(-1),
                max_size: None,
            },
            ParsedLimits {
                max_objects: Some(-1),
                max_size: Some(-1),
            },
        ] {
            let spec = quota_update("u", &requested, &current);
            assert_eq!(
                spec,
                QuotaSpec {
                    uid: "u".into(),
                    enabled: Some(false),
                    max_objects: None,
                    max_size: None,
                }
            );
        }
    }

    #[test]
    fn unchanged_limits_are_omitted() {
        let current = UserQuota {
            enabled: Some(true),
            max_objects: Some(100),
            max_size: Some(1024),
        };
        let spec = quota_update(
            "u",
            &ParsedLimits {
                max_objects: Some(100),
                max_size: Some(2048),
            },
            &current,
        );
        assert_eq!(spec.enabled, Some(true));
        assert_eq!(spec.max_objects, None);
        assert_eq!(spec.max_size, Some(2048));
    }

    #[test]
    fn disabled_quota_is_enabled_with_new_limits() {
        let current = UserQuota {
            enabled: Some(false),
            max_objects: Some(-1),
            max_size: Some(-1),
        };
        let spec = quota_update(
            "u",
            &ParsedLimits {
                max_objects: Some(10),
                max_size: None,
            },
            &current,
        );
        assert_eq!(spec.enabled, Some(true));
        assert_eq!(spec.max_objects, Some(10));
        assert_eq!(spec.max_size, None);
    }
}
