//! Workload manifests: template rendering plus operator-setting overrides
//! applied to the rendered pod spec.

pub mod patch;
pub mod templates;

use clap::ValueEnum;
use k8s_openapi::api::core::v1::PodSpec;
use serde::Serialize;
use tracing::{debug, warn};

use crate::services::settings::SettingsSource;
use patch::{
    apply_resources_to_containers, compute_resources, node_affinity, pod_anti_affinity,
    port_from_settings, set_node_affinity, tolerations,
};
use templates::{
    PROVISIONER_DEPLOYMENT, PROVISIONER_SERVICE, TemplateError, TemplateParams,
    template_to_daemon_set, template_to_deployment, template_to_service,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum WorkloadKind {
    Service,
    Daemonset,
    Deployment,
}

impl WorkloadKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkloadKind::Service => "service",
            WorkloadKind::Daemonset => "daemonset",
            WorkloadKind::Deployment => "deployment",
        }
    }

    /// Template shipped with the binary for this kind, if any.
    pub fn builtin_template(self) -> Option<&'static str> {
        match self {
            WorkloadKind::Service => Some(PROVISIONER_SERVICE),
            WorkloadKind::Deployment => Some(PROVISIONER_DEPLOYMENT),
            WorkloadKind::Daemonset => None,
        }
    }
}

/// Operator-setting keys consulted while rendering. `None` skips that override.
#[derive(Clone, Debug, Default)]
pub struct PodOverrides {
    pub resources_key: Option<String>,
    pub tolerations_key: Option<String>,
    pub node_affinity_key: Option<String>,
    pub port_key: Option<String>,
    /// Label `(key, value)` whose pods must land on distinct hosts.
    pub anti_affinity: Option<(String, String)>,
}

async fn patch_pod(pod: &mut PodSpec, settings: &dyn SettingsSource, overrides: &PodOverrides) {
    if let Some(key) = &overrides.resources_key {
        let resources = compute_resources(settings, key).await;
        apply_resources_to_containers(&resources, pod);
    }

    if let Some(key) = &overrides.tolerations_key {
        let current = pod.tolerations.take().unwrap_or_default();
        pod.tolerations = Some(tolerations(settings, key, current).await);
    }

    if let Some(key) = &overrides.node_affinity_key {
        let current = pod.affinity.as_ref().and_then(|a| a.node_affinity.clone());
        let resolved = node_affinity(settings, key, current).await;
        set_node_affinity(pod, resolved);
    }

    if let Some((key, value)) = &overrides.anti_affinity {
        pod.affinity.get_or_insert_with(Default::default).pod_anti_affinity =
            Some(pod_anti_affinity(key, value));
    }
}

fn to_yaml<T: Serialize>(kind: WorkloadKind, name: &str, obj: &T) -> Result<String, TemplateError> {
    serde_yaml::to_string(obj).map_err(|source| TemplateError::Encode {
        name: name.to_string(),
        kind: kind.as_str(),
        source,
    })
}

/// Render `template` as `kind`, apply the overrides and return the manifest as YAML.
pub async fn render_workload(
    kind: WorkloadKind,
    name: &str,
    template: &str,
    params: &TemplateParams,
    settings: &dyn SettingsSource,
    overrides: &PodOverrides,
) -> Result<String, TemplateError> {
    let mut params = params.clone();
    if let Some(key) = &overrides.port_key {
        match port_from_settings(settings, key, params.port).await {
            Ok(port) => params.port = port,
            Err(err) => warn!(key = %key, error = %err, port = params.port, "keeping default port"),
        }
    }
    debug!(kind = kind.as_str(), name, port = params.port, "rendering workload");

    match kind {
        WorkloadKind::Service => {
            let svc = template_to_service(name, template, &params)?;
            to_yaml(kind, name, &svc)
        }
        WorkloadKind::Daemonset => {
            let mut ds = template_to_daemon_set(name, template, &params)?;
            if let Some(pod) = ds.spec.as_mut().and_then(|s| s.template.spec.as_mut()) {
                patch_pod(pod, settings, overrides).await;
            }
            to_yaml(kind, name, &ds)
        }
        WorkloadKind::Deployment => {
            let mut dep = template_to_deployment(name, template, &params)?;
            if let Some(pod) = dep.spec.as_mut().and_then(|s| s.template.spec.as_mut()) {
                patch_pod(pod, settings, overrides).await;
            }
            to_yaml(kind, name, &dep)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::settings::MapSettings;
    use k8s_openapi::api::{
        apps::v1::{DaemonSet, Deployment},
        core::v1::Service,
    };
    use std::collections::BTreeMap;

    fn settings() -> MapSettings {
        MapSettings::new(BTreeMap::from([
            (
                "PROVISIONER_TOLERATIONS".to_string(),
                "- key: storage\n  operator: Exists\n  value: x\n".to_string(),
            ),
            ("PROVISIONER_NODE_AFFINITY".to_string(), "role=storage".to_string()),
            (
                "PROVISIONER_RESOURCE".to_string(),
                "- name: provisioner\n  resource:\n    requests:\n      cpu: 50m\n".to_string(),
            ),
            ("PROVISIONER_PORT".to_string(), "99999".to_string()),
            ("SERVICE_PORT".to_string(), "8443".to_string()),
        ]))
    }

    fn overrides() -> PodOverrides {
        PodOverrides {
            resources_key: Some("PROVISIONER_RESOURCE".into()),
            tolerations_key: Some("PROVISIONER_TOLERATIONS".into()),
            node_affinity_key: Some("PROVISIONER_NODE_AFFINITY".into()),
            port_key: Some("PROVISIONER_PORT".into()),
            anti_affinity: Some(("app".into(), "bucket-provisioner".into())),
        }
    }

    #[tokio::test]
    async fn deployment_gets_every_override() {
        let yaml = render_workload(
            WorkloadKind::Deployment,
            "provisioner",
            PROVISIONER_DEPLOYMENT,
            &TemplateParams::default(),
            &settings(),
            &overrides(),
        )
        .await
        .unwrap();

        let dep: Deployment = serde_yaml::from_str(&yaml).unwrap();
        let pod = dep.spec.unwrap().template.spec.unwrap();
        let tolerations = pod.tolerations.unwrap();
        assert_eq!(tolerations[0].key.as_deref(), Some("storage"));
        assert_eq!(tolerations[0].value, None);

        let affinity = pod.affinity.unwrap();
        assert!(affinity.node_affinity.is_some());
        assert!(affinity.pod_anti_affinity.is_some());

        let container = &pod.containers[0];
        assert_eq!(
            container.resources.as_ref().unwrap().requests.as_ref().unwrap()["cpu"].0,
            "50m"
        );
        // out-of-range port setting keeps the default
        assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 3000);
    }

    #[tokio::test]
    async fn service_port_comes_from_settings() {
        let overrides = PodOverrides {
            port_key: Some("SERVICE_PORT".into()),
            ..Default::default()
        };
        let yaml = render_workload(
            WorkloadKind::Service,
            "svc",
            PROVISIONER_SERVICE,
            &TemplateParams::default(),
            &settings(),
            &overrides,
        )
        .await
        .unwrap();

        let svc: Service = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(svc.spec.unwrap().ports.unwrap()[0].port, 8443);
    }

    const SPREAD_DAEMON_SET: &str = r#"
apiVersion: apps/v1
kind: DaemonSet
metadata:
  name: {{ name }}
spec:
  selector:
    matchLabels:
      app: {{ name }}
  template:
    metadata:
      labels:
        app: {{ name }}
    spec:
      affinity:
        podAffinity:
          preferredDuringSchedulingIgnoredDuringExecution:
            - weight: 10
              podAffinityTerm:
                topologyKey: topology.kubernetes.io/zone
                labelSelector:
                  matchLabels:
                    app: rgw
        podAntiAffinity:
          requiredDuringSchedulingIgnoredDuringExecution:
            - topologyKey: kubernetes.io/hostname
              labelSelector:
                matchLabels:
                  app: {{ name }}
      containers:
        - name: provisioner
          image: {{ image }}
"#;

    #[tokio::test]
    async fn template_affinity_survives_without_overrides() {
        let yaml = render_workload(
            WorkloadKind::Daemonset,
            "spread",
            SPREAD_DAEMON_SET,
            &TemplateParams::default(),
            &settings(),
            &PodOverrides::default(),
        )
        .await
        .unwrap();

        let ds: DaemonSet = serde_yaml::from_str(&yaml).unwrap();
        let pod = ds.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.tolerations, None);

        let affinity = pod.affinity.unwrap();
        assert_eq!(affinity.node_affinity, None);
        assert!(affinity.pod_affinity.is_some());
        let anti = affinity.pod_anti_affinity.unwrap();
        let terms = anti.required_during_scheduling_ignored_during_execution.unwrap();
        assert_eq!(terms[0].topology_key, "kubernetes.io/hostname");
    }

    #[tokio::test]
    async fn node_affinity_override_keeps_template_pod_affinity() {
        let overrides = PodOverrides {
            node_affinity_key: Some("PROVISIONER_NODE_AFFINITY".into()),
            ..Default::default()
        };
        let yaml = render_workload(
            WorkloadKind::Daemonset,
            "spread",
            SPREAD_DAEMON_SET,
            &TemplateParams::default(),
            &settings(),
            &overrides,
        )
        .await
        .unwrap();

        let ds: DaemonSet = serde_yaml::from_str(&yaml).unwrap();
        let pod = ds.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.tolerations, None);
        let affinity = pod.affinity.unwrap();
        assert!(affinity.node_affinity.is_some());
        assert!(affinity.pod_affinity.is_some());
        assert!(affinity.pod_anti_affinity.is_some());
    }

    #[test]
    fn daemon_sets_have_no_builtin_template() {
        assert!(WorkloadKind::Daemonset.builtin_template().is_none());
        assert!(WorkloadKind::Service.builtin_template().is_some());
    }
}
