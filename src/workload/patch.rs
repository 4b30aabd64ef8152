//! Operator-setting overrides applied to pod specs before submission.
//!
//! Every override reads one operator setting. A missing or malformed setting
//! never fails the caller: the default is kept and a warning is logged. Ports
//! are the exception and report their error alongside the fallback.

use k8s_openapi::{
    api::core::v1::{
        Affinity, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
        PodAffinityTerm, PodAntiAffinity, PodSpec, ResourceRequirements, Toleration,
    },
    apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement},
};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::services::settings::{SettingsError, SettingsSource};

pub const TOLERATION_OP_EXISTS: &str = "Exists";
pub const LABEL_HOSTNAME: &str = "kubernetes.io/hostname";

/// Compute resources for one named container.
#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct ContainerResource {
    pub name: String,
    pub resource: ResourceRequirements,
}

#[derive(Debug, Error)]
pub enum PortSettingError {
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("failed to parse port value `{value}` for `{key}`")]
    Invalid { key: String, value: String },
    #[error("port value `{value}` for `{key}` is greater than 65535")]
    OutOfRange { key: String, value: String },
}

async fn read_setting(settings: &dyn SettingsSource, key: &str) -> Option<String> {
    match settings.get_setting(key, "").await {
        Ok(raw) if raw.trim().is_empty() => None,
        Ok(raw) => Some(raw),
        Err(err) => {
            warn!(key, error = %err, "failed to read operator setting");
            None
        }
    }
}

/// Container resources configured under `key`; empty when unset or malformed.
pub async fn compute_resources(settings: &dyn SettingsSource, key: &str) -> Vec<ContainerResource> {
    let Some(raw) = read_setting(settings, key).await else {
        return Vec::new();
    };
    serde_yaml::from_str(&raw).unwrap_or_else(|err| {
        warn!(key, error = %err, "resource requirement will not be applied");
        Vec::new()
    })
}

/// Replace the resources of every container whose name matches an entry.
pub fn apply_resources_to_containers(resources: &[ContainerResource], pod: &mut PodSpec) {
    for container in pod.containers.iter_mut() {
        if let Some(r) = resources.iter().rev().find(|r| r.name == container.name) {
            container.resources = Some(r.resource.clone());
        }
    }
}

/// Normalize tolerations: no key tolerates everything, `Exists` carries no value.
pub fn normalize_tolerations(mut tolerations: Vec<Toleration>) -> Vec<Toleration> {
    for t in tolerations.iter_mut() {
        if t.key.as_deref().unwrap_or_default().is_empty() {
            t.operator = Some(TOLERATION_OP_EXISTS.to_string());
        }
        if t.operator.as_deref() == Some(TOLERATION_OP_EXISTS) {
            t.value = None;
        }
    }
    tolerations
}

pub async fn tolerations(
    settings: &dyn SettingsSource,
    key: &str,
    defaults: Vec<Toleration>,
) -> Vec<Toleration> {
    let Some(raw) = read_setting(settings, key).await else {
        return defaults;
    };
    match serde_yaml::from_str::<Vec<Toleration>>(&raw) {
        Ok(parsed) => normalize_tolerations(parsed),
        Err(err) => {
            warn!(key, error = %err, "failed to parse tolerations");
            defaults
        }
    }
}

/// Parse a node affinity given either as a YAML `NodeAffinity` or as labels
/// in the form `key=v1,v2; other-key`.
pub fn parse_node_affinity(raw: &str) -> Result<NodeAffinity, String> {
    if let Ok(affinity) = serde_yaml::from_str::<NodeAffinity>(raw) {
        return Ok(affinity);
    }

    let mut expressions = Vec::new();
    for label in raw.split(';').map(str::trim).filter(|l| !l.is_empty()) {
        let parts: Vec<&str> = label.split('=').map(str::trim).collect();
        let requirement = match parts.as_slice() {
            [key] if !key.is_empty() => NodeSelectorRequirement {
                key: key.to_string(),
                operator: "Exists".into(),
                values: None,
            },
            [key, values] if !key.is_empty() => NodeSelectorRequirement {
                key: key.to_string(),
                operator: "In".into(),
                values: Some(
                    values
                        .split(',')
                        .map(str::trim)
                        .filter(|v| !v.is_empty())
                        .map(str::to_string)
                        .collect(),
                ),
            },
            _ => return Err(format!("invalid node label `{}`", label)),
        };
        expressions.push(requirement);
    }
    if expressions.is_empty() {
        return Err("no node labels given".into());
    }

    Ok(NodeAffinity {
        required_during_scheduling_ignored_during_execution: Some(NodeSelector {
            node_selector_terms: vec![NodeSelectorTerm {
                match_expressions: Some(expressions),
                match_fields: None,
            }],
        }),
        preferred_during_scheduling_ignored_during_execution: None,
    })
}

pub async fn node_affinity(
    settings: &dyn SettingsSource,
    key: &str,
    default: Option<NodeAffinity>,
) -> Option<NodeAffinity> {
    let Some(raw) = read_setting(settings, key).await else {
        return default;
    };
    match parse_node_affinity(&raw) {
        Ok(affinity) => Some(affinity),
        Err(err) => {
            warn!(key, error = %err, "failed to parse node affinity");
            default
        }
    }
}

/// Replace the node affinity of a pod spec. Pod (anti-)affinity terms are left alone.
pub fn set_node_affinity(pod: &mut PodSpec, node_affinity: Option<NodeAffinity>) {
    match (&mut pod.affinity, node_affinity) {
        (Some(affinity), node_affinity) => affinity.node_affinity = node_affinity,
        (None, Some(node_affinity)) => {
            pod.affinity = Some(Affinity {
                node_affinity: Some(node_affinity),
                ..Default::default()
            })
        }
        (None, None) => {}
    }
}

/// Port configured under `key`. On any error the caller should fall back to `default`.
pub async fn port_from_settings(
    settings: &dyn SettingsSource,
    key: &str,
    default: u16,
) -> Result<u16, PortSettingError> {
    let raw = settings.get_setting(key, &default.to_string()).await?;
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(default);
    }
    let value = raw.parse::<u64>().map_err(|_| PortSettingError::Invalid {
        key: key.to_string(),
        value: raw.to_string(),
    })?;
    u16::try_from(value).map_err(|_| PortSettingError::OutOfRange {
        key: key.to_string(),
        value: raw.to_string(),
    })
}

/// Keep pods labelled `key=value` on distinct hosts.
pub fn pod_anti_affinity(key: &str, value: &str) -> PodAntiAffinity {
    PodAntiAffinity {
        required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
            label_selector: Some(LabelSelector {
                match_expressions: Some(vec![LabelSelectorRequirement {
                    key: key.to_string(),
                    operator: "In".into(),
                    values: Some(vec![value.to_string()]),
                }]),
                match_labels: None,
            }),
            topology_key: LABEL_HOSTNAME.to_string(),
            ..Default::default()
        }]),
        preferred_during_scheduling_ignored_during_execution: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::settings::{MapSettings, MockSettingsSource};
    use k8s_openapi::api::core::v1::Container;
    use std::collections::BTreeMap;

    fn settings(pairs: &[(&str, &str)]) -> MapSettings {
        MapSettings::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    fn pod(containers: &[&str]) -> PodSpec {
        PodSpec {
            containers: containers
                .iter()
                .map(|name| Container {
                    name: name.to_string(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn resources_apply_by_container_name() {
        let s = settings(&[(
            "PROVISIONER_RESOURCE",
            r#"
- name: provisioner
  resource:
    limits:
      memory: "256Mi"
    requests:
      cpu: "100m"
"#,
        )]);
        let resources = compute_resources(&s, "PROVISIONER_RESOURCE").await;
        assert_eq!(resources.len(), 1);

        let mut spec = pod(&["provisioner", "sidecar"]);
        apply_resources_to_containers(&resources, &mut spec);

        let limits = spec.containers[0]
            .resources
            .as_ref()
            .unwrap()
            .limits
            .as_ref()
            .unwrap();
        assert_eq!(limits["memory"].0, "256Mi");
        assert!(spec.containers[1].resources.is_none());
    }

    #[tokio::test]
    async fn malformed_resources_are_ignored() {
        let s = settings(&[("PROVISIONER_RESOURCE", "not: [valid")]);
        assert!(compute_resources(&s, "PROVISIONER_RESOURCE").await.is_empty());
        assert!(compute_resources(&s, "BUCKET_PROVISIONER_TEST_UNSET").await.is_empty());
    }

    #[tokio::test]
    async fn tolerations_are_normalized() {
        let s = settings(&[(
            "PROVISIONER_TOLERATIONS",
            r#"
- operator: Equal
  value: ignored
  effect: NoSchedule
- key: storage
  operator: Exists
  value: dropped
- key: zone
  operator: Equal
  value: a
"#,
        )]);
        let t = tolerations(&s, "PROVISIONER_TOLERATIONS", Vec::new()).await;

        assert_eq!(t.len(), 3);
        assert_eq!(t[0].operator.as_deref(), Some("Exists"));
        assert_eq!(t[0].value, None);
        assert_eq!(t[1].value, None);
        assert_eq!(t[2].operator.as_deref(), Some("Equal"));
        assert_eq!(t[2].value.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn unreadable_tolerations_fall_back_to_defaults() {
        let mut source = MockSettingsSource::new();
        source.expect_get_setting().returning(|_, _| {
            Err(SettingsError::Kube {
                config_map: "cm".into(),
                source: kube::Error::Api(kube::error::ErrorResponse {
                    status: "Failure".into(),
                    message: "forbidden".into(),
                    reason: "Forbidden".into(),
                    code: 403,
                }),
            })
        });
        let defaults = vec![Toleration {
            key: Some("default".into()),
            ..Default::default()
        }];

        let t = tolerations(&source, "PROVISIONER_TOLERATIONS", defaults.clone()).await;
        assert_eq!(t, defaults);
    }

    #[test]
    fn node_affinity_from_label_syntax() {
        let affinity = parse_node_affinity("role=storage-node,backup; rook").unwrap();
        let terms = affinity
            .required_during_scheduling_ignored_during_execution
            .unwrap()
            .node_selector_terms;
        let exprs = terms[0].match_expressions.as_ref().unwrap();

        assert_eq!(exprs[0].key, "role");
        assert_eq!(exprs[0].operator, "In");
        assert_eq!(
            exprs[0].values.as_deref(),
            Some(&["storage-node".to_string(), "backup".to_string()][..])
        );
        assert_eq!(exprs[1].key, "rook");
        assert_eq!(exprs[1].operator, "Exists");
        assert!(parse_node_affinity("a=b=c").is_err());
    }

    #[test]
    fn node_affinity_from_yaml() {
        let raw = r#"
requiredDuringSchedulingIgnoredDuringExecution:
  nodeSelectorTerms:
    - matchExpressions:
        - key: topology.kubernetes.io/zone
          operator: In
          values: ["a"]
"#;
        let affinity = parse_node_affinity(raw).unwrap();
        let terms = affinity
            .required_during_scheduling_ignored_during_execution
            .unwrap()
            .node_selector_terms;
        assert_eq!(
            terms[0].match_expressions.as_ref().unwrap()[0].key,
            "topology.kubernetes.io/zone"
        );
    }

    #[tokio::test]
    async fn missing_node_affinity_keeps_default() {
        let s = settings(&[("PROVISIONER_NODE_AFFINITY", "a=b=c")]);
        let default = parse_node_affinity("role=default").unwrap();

        let kept = node_affinity(&s, "PROVISIONER_NODE_AFFINITY", Some(default.clone())).await;
        assert_eq!(kept, Some(default.clone()));
        let unset = node_affinity(&s, "BUCKET_PROVISIONER_TEST_UNSET", Some(default.clone())).await;
        assert_eq!(unset, Some(default));
    }

    #[test]
    fn node_affinity_replacement_keeps_pod_anti_affinity() {
        let mut spec = pod(&["provisioner"]);
        set_node_affinity(&mut spec, None);
        assert_eq!(spec.affinity, None);

        spec.affinity = Some(Affinity {
            pod_anti_affinity: Some(pod_anti_affinity("app", "provisioner")),
            ..Default::default()
        });
        let affinity = parse_node_affinity("role=storage").unwrap();
        set_node_affinity(&mut spec, Some(affinity.clone()));

        let result = spec.affinity.unwrap();
        assert_eq!(result.node_affinity, Some(affinity));
        assert!(result.pod_anti_affinity.is_some());
        assert_eq!(spec.tolerations, None);
    }

    #[tokio::test]
    async fn ports_are_range_checked() {
        let s = settings(&[
            ("GOOD_PORT", "9070"),
            ("BLANK_PORT", "  "),
            ("BIG_PORT", "70000"),
            ("BAD_PORT", "http"),
        ]);
        assert_eq!(port_from_settings(&s, "GOOD_PORT", 80).await.unwrap(), 9070);
        assert_eq!(port_from_settings(&s, "BLANK_PORT", 80).await.unwrap(), 80);
        assert_eq!(
            port_from_settings(&s, "BUCKET_PROVISIONER_TEST_UNSET", 80)
                .await
                .unwrap(),
            80
        );
        assert!(matches!(
            port_from_settings(&s, "BIG_PORT", 80).await,
            Err(PortSettingError::OutOfRange { .. })
        ));
        assert!(matches!(
            port_from_settings(&s, "BAD_PORT", 80).await,
            Err(PortSettingError::Invalid { .. })
        ));
    }

    #[test]
    fn anti_affinity_spreads_by_hostname() {
        let anti = pod_anti_affinity("app", "bucket-provisioner");
        let term = &anti.required_during_scheduling_ignored_during_execution.unwrap()[0];
        assert_eq!(term.topology_key, "kubernetes.io/hostname");
        let req = &term.label_selector.as_ref().unwrap().match_expressions.as_ref().unwrap()[0];
        assert_eq!(req.key, "app");
        assert_eq!(req.operator, "In");
        assert_eq!(req.values.as_deref(), Some(&["bucket-provisioner".to_string()][..]));
    }
}
