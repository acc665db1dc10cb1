//! The `RunnerPool` custom resource: a declared per-developer CI runner
//! deployment bound to one repository on one CI platform.

use serde::{Deserialize, Serialize};
use stackable_operator::{
    commons::cluster_operation::ClusterOperation,
    k8s_openapi::api::core::v1::{ResourceRequirements, Volume, VolumeMount},
    kube::CustomResource,
    schemars::{self, JsonSchema},
    status::condition::{ClusterCondition, HasStatusCondition},
};

use crate::crd::{sanitize_label, EnvVarSpec};

#[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "apps.example.com",
    version = "v1alpha1",
    kind = "RunnerPool",
    plural = "runnerpools",
    shortname = "rp",
    status = "RunnerPoolStatus",
    namespaced,
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
pub struct RunnerPoolSpec {
    /// CI platform adapter name (`github`, `gitlab`, `circleci`). Defaults
    /// to the registry default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    /// The human's handle on the CI platform. Sanitized into the identity
    /// key used in every derived object name and routing label.
    pub username: String,
    /// Platform-specific repository slug (`owner/repo`, `group/project`,
    /// `org/project`).
    pub repository: String,
    /// Overridable for self-hosted platform instances.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_url: Option<String>,
    /// Secret holding the platform credential. The meaning of the credential
    /// (PAT, registration token, resource-class token) is adapter-specific.
    pub token_secret_ref: TokenSecretRef,
    /// Defaults to 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// Overrides the adapter's default runner image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner_image: Option<String>,
    /// Extra routing labels advertised to the CI platform.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    /// Overrides the derived service account.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_env: Vec<EnvVarSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_volumes: Vec<Volume>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_volume_mounts: Vec<VolumeMount>,
    /// Cluster operations like pause reconciliation or cluster stop.
    #[serde(default)]
    pub cluster_operation: ClusterOperation,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenSecretRef {
    /// Name of the Secret in the pool's namespace.
    pub name: String,
    /// Key within the Secret; defaults to the adapter's conventional key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerPoolStatus {
    #[serde(default)]
    pub conditions: Vec<ClusterCondition>,
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub ready_runners: i32,
    /// True once at least one runner pod reports ready; actual platform-side
    /// registration is observable only through the runner's own logs.
    #[serde(default)]
    pub runner_registered: bool,
}

impl HasStatusCondition for RunnerPool {
    fn conditions(&self) -> Vec<ClusterCondition> {
        match &self.status {
            Some(status) => status.conditions.clone(),
            None => vec![],
        }
    }
}

impl RunnerPool {
    /// The DNS-safe identity key derived from the declared username.
    pub fn sanitized_username(&self) -> String {
        sanitize_label(&self.spec.username)
    }

    /// Shared name of the runner Deployment, ServiceAccount, ClusterRole and
    /// RoleBinding: `<sanitized-username>-runner`.
    pub fn runner_name(&self) -> String {
        format!("{}-runner", self.sanitized_username())
    }

    /// Effective service account name: the declared override or the derived
    /// runner name.
    pub fn service_account_name(&self) -> String {
        self.spec
            .service_account_name
            .clone()
            .unwrap_or_else(|| self.runner_name())
    }

    pub fn replicas(&self) -> i32 {
        if self.spec.cluster_operation.stopped {
            return 0;
        }
        self.spec.replicas.unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> RunnerPool {
        serde_yaml::from_str(input).expect("illegal test input")
    }

    const POOL: &str = r#"
        apiVersion: apps.example.com/v1alpha1
        kind: RunnerPool
        metadata:
          name: jeff
          namespace: kindling
        spec:
          platform: github
          username: Jeff.D.Vincent@gmail.com
          repository: acme/app
          tokenSecretRef:
            name: gh-token
            key: github-token
          replicas: 1
    "#;

    #[test]
    fn derived_names_use_the_sanitized_username() {
        let pool = parse(POOL);
        assert_eq!(pool.sanitized_username(), "jeff.d.vincent-gmail.com");
        assert_eq!(pool.runner_name(), "jeff.d.vincent-gmail.com-runner");
        assert_eq!(pool.service_account_name(), "jeff.d.vincent-gmail.com-runner");
    }

    #[test]
    fn replicas_default_to_one_and_honor_stop() {
        let pool = parse(
            r#"
            apiVersion: apps.example.com/v1alpha1
            kind: RunnerPool
            metadata:
              name: jeff
            spec:
              username: octocat
              repository: acme/app
              tokenSecretRef:
                name: gh-token
        "#,
        );
        assert_eq!(pool.replicas(), 1);

        let stopped = parse(
            r#"
            apiVersion: apps.example.com/v1alpha1
            kind: RunnerPool
            metadata:
              name: jeff
            spec:
              username: octocat
              repository: acme/app
              tokenSecretRef:
                name: gh-token
              replicas: 4
              clusterOperation:
                stopped: true
        "#,
        );
        assert_eq!(stopped.replicas(), 0);
    }
}
