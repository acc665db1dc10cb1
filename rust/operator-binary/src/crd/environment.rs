//! The `DevStagingEnvironment` custom resource: a declared per-developer
//! application stack (image + ports + optional ingress + backing services).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use stackable_operator::{
    commons::cluster_operation::ClusterOperation,
    k8s_openapi::api::core::v1::ResourceRequirements,
    kube::{CustomResource, ResourceExt},
    schemars::{self, JsonSchema},
    status::condition::{ClusterCondition, HasStatusCondition},
};
use strum::Display;

use crate::crd::{EnvVarSpec, COMPONENT_DEPENDENCY, LABEL_COMPONENT, LABEL_ENVIRONMENT};

#[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "apps.example.com",
    version = "v1alpha1",
    kind = "DevStagingEnvironment",
    plural = "devstagingenvironments",
    shortname = "dse",
    status = "DevStagingEnvironmentStatus",
    namespaced,
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
pub struct DevStagingEnvironmentSpec {
    /// The application workload: image, port and runtime settings.
    pub deployment: DeploymentConfig,
    /// The Service in front of the application workload.
    pub service: ServiceConfig,
    /// Optional Ingress exposure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<IngressConfig>,
    /// Backing services to auto-provision, in declaration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<DependencyConfig>,
    /// Cluster operations like pause reconciliation or cluster stop.
    #[serde(default)]
    pub cluster_operation: ClusterOperation,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfig {
    /// Image reference, pulled from the in-cluster registry during CI.
    pub image: String,
    /// The container port the application listens on.
    pub port: u16,
    /// Defaults to 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    /// Extra env vars for the application container. Overrides win over the
    /// auto-injected dependency env on name collision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<EnvVarSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckConfig>,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
    /// HTTP probe path. Ignored for `grpc` and `none` probes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Probe port override; defaults to the deployment port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_delay_seconds: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_seconds: Option<i32>,
    #[serde(default, rename = "type")]
    pub check_type: HealthCheckType,
}

#[derive(Clone, Copy, Debug, Default, Display, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HealthCheckType {
    #[default]
    Http,
    Grpc,
    None,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    /// The port the Service listens on.
    pub port: u16,
    /// Defaults to the deployment port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,
    #[serde(default, rename = "type")]
    pub service_type: ServiceType,
}

#[derive(Clone, Copy, Debug, Default, Display, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
#[strum(serialize_all = "PascalCase")]
pub enum ServiceType {
    #[default]
    #[serde(rename = "ClusterIP")]
    #[strum(serialize = "ClusterIP")]
    ClusterIp,
    NodePort,
    LoadBalancer,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressConfig {
    #[serde(default)]
    pub enabled: bool,
    pub host: String,
    /// Defaults to `/`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub path_type: IngressPathType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<IngressTlsConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Clone, Copy, Debug, Default, Display, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub enum IngressPathType {
    #[default]
    Prefix,
    Exact,
    ImplementationSpecific,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressTlsConfig {
    pub secret_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyConfig {
    /// One of the catalog types (`postgres`, `redis`, `mysql`, ...).
    /// Validated during reconciliation so that a bypassed CRD schema still
    /// surfaces a terminal condition instead of a panic.
    #[serde(rename = "type")]
    pub dependency_type: String,
    /// Overrides the default image tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Overrides the full image reference; wins over `version`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Overrides the catalog's default port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Env overrides for the dependency container. Credential env names
    /// (`POSTGRES_USER`, ...) declared here also override the generated
    /// credentials record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<EnvVarSpec>>,
    /// Overrides the auto-injected connection env var name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_var_name: Option<String>,
    /// When set, the dependency gets a PersistentVolumeClaim of this size
    /// instead of an emptyDir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DevStagingEnvironmentStatus {
    #[serde(default)]
    pub conditions: Vec<ClusterCondition>,
    #[serde(default)]
    pub deployment_ready: bool,
    #[serde(default)]
    pub service_ready: bool,
    #[serde(default)]
    pub ingress_ready: bool,
    #[serde(default)]
    pub dependencies_ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_replicas: Option<i32>,
    /// Set when ingress is enabled and has a host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl HasStatusCondition for DevStagingEnvironment {
    fn conditions(&self) -> Vec<ClusterCondition> {
        match &self.status {
            Some(status) => status.conditions.clone(),
            None => vec![],
        }
    }
}

impl DevStagingEnvironment {
    /// Name of the application Deployment and Service: the environment name
    /// itself, which doubles as the DNS label root for all derived objects.
    pub fn app_name(&self) -> String {
        self.name_any()
    }

    /// Derived name of a dependency's workload, service and credentials
    /// record: `<env-name>-<type>`.
    pub fn dependency_name(&self, dependency_type: &str) -> String {
        format!("{}-{}", self.name_any(), dependency_type)
    }

    pub fn replicas(&self) -> i32 {
        if self.spec.cluster_operation.stopped {
            return 0;
        }
        self.spec.deployment.replicas.unwrap_or(1)
    }

    /// Effective service target port: the declared target or the deployment
    /// port.
    pub fn service_target_port(&self) -> u16 {
        self.spec
            .service
            .target_port
            .unwrap_or(self.spec.deployment.port)
    }

    /// Label selector matching every dependency child owned by this
    /// environment, used by the stale-dependency pass.
    pub fn dependency_selector(&self) -> String {
        format!(
            "{LABEL_ENVIRONMENT}={},{LABEL_COMPONENT}={COMPONENT_DEPENDENCY}",
            self.name_any()
        )
    }

    /// The externally reachable URL, when ingress is enabled and has a host.
    pub fn url(&self) -> Option<String> {
        let ingress = self.spec.ingress.as_ref().filter(|i| i.enabled)?;
        if ingress.host.is_empty() {
            return None;
        }
        let scheme = if ingress.tls.is_some() { "https" } else { "http" };
        let path = ingress.path.as_deref().unwrap_or("/");
        Some(format!("{scheme}://{}{path}", ingress.host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> DevStagingEnvironment {
        serde_yaml::from_str(input).expect("illegal test input")
    }

    const MINIMAL: &str = r#"
        apiVersion: apps.example.com/v1alpha1
        kind: DevStagingEnvironment
        metadata:
          name: web
        spec:
          deployment:
            image: nginx:1.25
            port: 80
            healthCheck:
              path: /
          service:
            port: 80
    "#;

    #[test]
    fn minimal_environment_defaults() {
        let env = parse(MINIMAL);
        assert_eq!(env.app_name(), "web");
        assert_eq!(env.replicas(), 1);
        assert_eq!(env.service_target_port(), 80);
        assert_eq!(env.spec.service.service_type, ServiceType::ClusterIp);
        assert!(env.spec.ingress.is_none());
        assert!(env.spec.dependencies.is_empty());
        assert_eq!(env.url(), None);
        let health = env.spec.deployment.health_check.expect("declared above");
        assert_eq!(health.check_type, HealthCheckType::Http);
        assert_eq!(health.path.as_deref(), Some("/"));
    }

    #[test]
    fn dependency_names_derive_from_environment_and_type() {
        let env = parse(MINIMAL);
        assert_eq!(env.dependency_name("postgres"), "web-postgres");
        assert_eq!(env.dependency_name("redis"), "web-redis");
    }

    #[test]
    fn stopped_environment_scales_to_zero() {
        let env = parse(
            r#"
            apiVersion: apps.example.com/v1alpha1
            kind: DevStagingEnvironment
            metadata:
              name: web
            spec:
              deployment:
                image: nginx:1.25
                port: 80
                replicas: 3
              service:
                port: 80
              clusterOperation:
                stopped: true
        "#,
        );
        assert_eq!(env.replicas(), 0);
    }

    #[test]
    fn ingress_url_uses_tls_scheme() {
        let env = parse(
            r#"
            apiVersion: apps.example.com/v1alpha1
            kind: DevStagingEnvironment
            metadata:
              name: web
            spec:
              deployment:
                image: nginx:1.25
                port: 80
              service:
                port: 80
              ingress:
                enabled: true
                host: web.dev.example.com
                tls:
                  secretName: web-tls
                  hosts: [web.dev.example.com]
        "#,
        );
        assert_eq!(env.url().as_deref(), Some("https://web.dev.example.com/"));
    }

    #[test]
    fn disabled_ingress_yields_no_url() {
        let env = parse(
            r#"
            apiVersion: apps.example.com/v1alpha1
            kind: DevStagingEnvironment
            metadata:
              name: web
            spec:
              deployment:
                image: nginx:1.25
                port: 80
              service:
                port: 80
              ingress:
                enabled: false
                host: web.dev.example.com
        "#,
        );
        assert_eq!(env.url(), None);
    }
}
