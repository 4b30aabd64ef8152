//! Renders workload manifests from templates into typed Kubernetes objects.

use k8s_openapi::api::{
    apps::v1::{DaemonSet, Deployment},
    core::v1::Service,
};
use minijinja::{Environment, context};
use serde::{Serialize, de::DeserializeOwned};
use std::collections::BTreeMap;
use thiserror::Error;

/// Deployment manifest of the provisioner itself.
pub const PROVISIONER_DEPLOYMENT: &str = include_str!("../../templates/provisioner-deployment.yaml");
/// Service fronting the provisioner's HTTP surface.
pub const PROVISIONER_SERVICE: &str = include_str!("../../templates/provisioner-service.yaml");

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("failed to render template `{name}`: {source}")]
    Render {
        name: String,
        source: minijinja::Error,
    },
    #[error("failed to decode {kind} from template `{name}`: {source}")]
    Decode {
        name: String,
        kind: &'static str,
        source: serde_yaml::Error,
    },
    #[error("failed to encode {kind} `{name}`: {source}")]
    Encode {
        name: String,
        kind: &'static str,
        source: serde_yaml::Error,
    },
    #[error("no built-in template for {0}")]
    NoTemplate(&'static str),
}

/// Values available to templates.
#[derive(Serialize, Clone, Debug)]
pub struct TemplateParams {
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub port: u16,
    pub log_level: String,
    /// Free-form values, reachable as `values.<key>`.
    pub values: BTreeMap<String, String>,
}

impl Default for TemplateParams {
    fn default() -> Self {
        Self {
            name: "bucket-provisioner".into(),
            namespace: "rook-ceph".into(),
            image: "bucket-provisioner:latest".into(),
            port: 3000,
            log_level: "info".into(),
            values: BTreeMap::new(),
        }
    }
}

pub fn render(name: &str, template: &str, params: &TemplateParams) -> Result<String, TemplateError> {
    let render_error = |source| TemplateError::Render {
        name: name.to_string(),
        source,
    };
    let mut env = Environment::new();
    env.add_template(name, template).map_err(render_error)?;
    env.get_template(name)
        .map_err(render_error)?
        .render(context! {
            name => &params.name,
            namespace => &params.namespace,
            image => &params.image,
            port => params.port,
            log_level => &params.log_level,
            values => &params.values,
        })
        .map_err(render_error)
}

fn template_to<T: DeserializeOwned>(
    kind: &'static str,
    name: &str,
    template: &str,
    params: &TemplateParams,
) -> Result<T, TemplateError> {
    let rendered = render(name, template, params)?;
    serde_yaml::from_str(&rendered).map_err(|source| TemplateError::Decode {
        name: name.to_string(),
        kind,
        source,
    })
}

pub fn template_to_service(
    name: &str,
    template: &str,
    params: &TemplateParams,
) -> Result<Service, TemplateError> {
    template_to("service", name, template, params)
}

pub fn template_to_daemon_set(
    name: &str,
    template: &str,
    params: &TemplateParams,
) -> Result<DaemonSet, TemplateError> {
    template_to("daemonset", name, template, params)
}

pub fn template_to_deployment(
    name: &str,
    template: &str,
    params: &TemplateParams,
) -> Result<Deployment, TemplateError> {
    template_to("deployment", name, template, params)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAEMON_SET: &str = r#"
apiVersion: apps/v1
kind: DaemonSet
metadata:
  name: {{ name }}-agent
  namespace: {{ namespace }}
spec:
  selector:
    matchLabels:
      app: {{ name }}-agent
  template:
    metadata:
      labels:
        app: {{ name }}-agent
    spec:
      containers:
        - name: agent
          image: {{ image }}
          args: ["--v={{ values.verbosity }}"]
"#;

    #[test]
    fn provisioner_deployment_renders() {
        let params = TemplateParams {
            namespace: "storage".into(),
            ..Default::default()
        };
        let dep = template_to_deployment("deployment", PROVISIONER_DEPLOYMENT, &params).unwrap();

        assert_eq!(dep.metadata.name.as_deref(), Some("bucket-provisioner"));
        assert_eq!(dep.metadata.namespace.as_deref(), Some("storage"));
        let pod = dep.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.containers[0].image.as_deref(), Some("bucket-provisioner:latest"));
    }

    #[test]
    fn provisioner_service_exposes_port() {
        let params = TemplateParams {
            port: 8080,
            ..Default::default()
        };
        let svc = template_to_service("service", PROVISIONER_SERVICE, &params).unwrap();
        let ports = svc.spec.unwrap().ports.unwrap();
        assert_eq!(ports[0].port, 8080);
    }

    #[test]
    fn daemon_set_reads_free_form_values() {
        let params = TemplateParams {
            values: BTreeMap::from([("verbosity".to_string(), "3".to_string())]),
            ..Default::default()
        };
        let ds = template_to_daemon_set("agent", DAEMON_SET, &params).unwrap();
        let pod = ds.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.containers[0].args.as_ref().unwrap()[0], "--v=3");
    }

    #[test]
    fn syntax_and_shape_errors_are_distinguished() {
        let params = TemplateParams::default();
        assert!(matches!(
            render("broken", "{% if %}", &params),
            Err(TemplateError::Render { .. })
        ));
        assert!(matches!(
            template_to_service("list", "- a\n- b\n", &params),
            Err(TemplateError::Decode { kind: "service", .. })
        ));
    }
}
