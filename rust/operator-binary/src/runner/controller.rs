//! Ensures that a registered CI runner deployment exists for each
//! [`RunnerPool`].
//!
//! The runner pod carries two containers: the platform's runner under the
//! adapter's startup script, and the privileged build-agent sidecar sharing
//! the `/builds` volume. De-registration happens in the startup script's
//! SIGTERM path; on forced pod deletion (node loss) ghost runners can
//! accumulate on the platform side.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    client::Client,
    k8s_openapi::{
        api::{
            apps::v1::{Deployment, DeploymentSpec},
            core::v1::{
                Container, EmptyDirVolumeSource, EnvVar, PodSpec, PodTemplateSpec, Secret,
                SecurityContext, ServiceAccount, Volume, VolumeMount,
            },
            rbac::v1::{ClusterRole, PolicyRule, RoleBinding, RoleRef, Subject},
        },
        apimachinery::pkg::apis::meta::v1::LabelSelector,
    },
    kube::{api::ObjectMeta, runtime::controller::Action, ResourceExt},
    labels::role_group_selector_labels,
    logging::controller::ReconcilerError,
    status::condition::{
        compute_conditions, deployment::DeploymentConditionBuilder,
        operations::ClusterOperationsConditionBuilder, ClusterCondition, ClusterConditionStatus,
        ClusterConditionType,
    },
};
use strum::EnumDiscriminants;
use tracing::info;

use crate::{
    agent::protocol::BUILDS_DIR,
    crd::{
        merge_env_vars,
        runner::{RunnerPool, RunnerPoolStatus},
        spec_hash, APP_NAME, OPERATOR_NAME, TOKEN_REVISION_ANNOTATION,
    },
    provider::{self, Provider, RunnerConfig},
    resources::{self, apply_if_changed, get_opt},
    runner::{build_child_meta, build_cluster_scoped_meta, MetaError},
};

const DEFAULT_BUILD_AGENT_IMAGE: &str = "ghcr.io/kindling-sh/kindling-build-agent:latest";
const BUILD_AGENT_IMAGE_ENV: &str = "KINDLING_BUILD_AGENT_IMAGE";

pub struct Ctx {
    pub client: Client,
}

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(strum::IntoStaticStr))]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    #[snafu(display("object defines no namespace"))]
    ObjectHasNoNamespace,
    #[snafu(display("failed to build metadata for {name}"))]
    BuildMeta { source: MetaError, name: String },
    #[snafu(display("token secret {name} not found in pool namespace"))]
    TokenSecretMissing { name: String },
    #[snafu(display("failed to read token secret {name}"))]
    ReadTokenSecret {
        source: resources::Error,
        name: String,
    },
    #[snafu(display("failed to apply ServiceAccount"))]
    ApplyServiceAccount { source: resources::Error },
    #[snafu(display("failed to apply ClusterRole"))]
    ApplyClusterRole {
        source: stackable_operator::error::Error,
    },
    #[snafu(display("failed to apply RoleBinding"))]
    ApplyRoleBinding { source: resources::Error },
    #[snafu(display("failed to apply runner Deployment"))]
    ApplyRunnerDeployment { source: resources::Error },
    #[snafu(display("failed to update status"))]
    ApplyStatus {
        source: stackable_operator::error::Error,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

pub async fn reconcile_runner_pool(pool: Arc<RunnerPool>, ctx: Arc<Ctx>) -> Result<Action> {
    info!("Starting reconcile");
    let client = &ctx.client;
    let namespace = pool.namespace().context(ObjectHasNoNamespaceSnafu)?;

    let Some(provider) = provider::for_pool(&pool) else {
        return terminal_unknown_platform(client, &pool).await;
    };
    let cfg = RunnerConfig::from_pool(&provider.runner, &pool);
    let hash = spec_hash(&pool.spec);
    let runner_name = pool.runner_name();

    if pool.spec.cluster_operation.reconciliation_paused {
        let status = RunnerPoolStatus {
            conditions: compute_conditions(
                pool.as_ref(),
                &[&ClusterOperationsConditionBuilder::new(
                    &pool.spec.cluster_operation,
                )],
            ),
            ..pool.status.clone().unwrap_or_default()
        };
        write_status(client, &pool, status).await?;
        return Ok(Action::await_change());
    }

    // RBAC first: the runner pod must be able to apply environment
    // resources through the build-agent the moment it starts.
    let service_account = build_service_account(&pool, &hash)
        .context(BuildMetaSnafu { name: &runner_name })?;
    apply_if_changed(client, OPERATOR_NAME, &service_account, &hash)
        .await
        .context(ApplyServiceAccountSnafu)?;

    let cluster_role = build_cluster_role(&pool, &hash);
    client
        .apply_patch(OPERATOR_NAME, &cluster_role, &cluster_role)
        .await
        .context(ApplyClusterRoleSnafu)?;

    let role_binding = build_role_binding(&pool, &namespace, &hash)
        .context(BuildMetaSnafu { name: &runner_name })?;
    apply_if_changed(client, OPERATOR_NAME, &role_binding, &hash)
        .await
        .context(ApplyRoleBindingSnafu)?;

    // The pod template carries the token secret's revision, so a rotated
    // token rolls the runner pods.
    let token_secret: Option<Secret> = get_opt(client, &cfg.secret_name, &namespace)
        .await
        .context(ReadTokenSecretSnafu {
            name: &cfg.secret_name,
        })?;
    let token_revision = token_secret
        .context(TokenSecretMissingSnafu {
            name: &cfg.secret_name,
        })?
        .metadata
        .resource_version
        .unwrap_or_default();

    let deployment = build_runner_deployment(&pool, provider, &cfg, &token_revision, &hash)
        .context(BuildMetaSnafu { name: &runner_name })?;
    let (deployment, _) = apply_if_changed(client, OPERATOR_NAME, &deployment, &hash)
        .await
        .context(ApplyRunnerDeploymentSnafu)?;

    let ready_runners = deployment
        .status
        .as_ref()
        .and_then(|status| status.ready_replicas)
        .unwrap_or(0);
    let mut deployment_cond_builder = DeploymentConditionBuilder::default();
    deployment_cond_builder.add(deployment);
    let cluster_operation_cond_builder =
        ClusterOperationsConditionBuilder::new(&pool.spec.cluster_operation);

    let status = RunnerPoolStatus {
        conditions: compute_conditions(
            pool.as_ref(),
            &[&deployment_cond_builder, &cluster_operation_cond_builder],
        ),
        replicas: pool.replicas(),
        ready_runners,
        runner_registered: ready_runners > 0,
    };
    write_status(client, &pool, status).await?;

    if ready_runners >= pool.replicas() {
        Ok(Action::await_change())
    } else {
        Ok(Action::requeue(Duration::from_secs(10)))
    }
}

pub fn error_policy(_obj: Arc<RunnerPool>, _error: &Error, _ctx: Arc<Ctx>) -> Action {
    Action::requeue(Duration::from_secs(5))
}

async fn terminal_unknown_platform(client: &Client, pool: &RunnerPool) -> Result<Action> {
    let platform = pool.spec.platform.clone().unwrap_or_default();
    let condition = ClusterCondition {
        type_: ClusterConditionType::Degraded,
        status: ClusterConditionStatus::True,
        message: Some(format!("SpecInvalid: unknown platform {platform:?}")),
        ..ClusterCondition::default()
    };
    let status = RunnerPoolStatus {
        conditions: vec![condition],
        ..pool.status.clone().unwrap_or_default()
    };
    write_status(client, pool, status).await?;
    Ok(Action::await_change())
}

/// Skips the status write when nothing changed, mirroring the spec-hash
/// gate on the owned children.
async fn write_status(
    client: &Client,
    pool: &RunnerPool,
    status: RunnerPoolStatus,
) -> Result<()> {
    if pool.status.as_ref() == Some(&status) {
        return Ok(());
    }
    client
        .apply_patch_status(OPERATOR_NAME, pool, &status)
        .await
        .context(ApplyStatusSnafu)?;
    Ok(())
}

fn build_agent_image() -> String {
    std::env::var(BUILD_AGENT_IMAGE_ENV)
        .unwrap_or_else(|_| DEFAULT_BUILD_AGENT_IMAGE.to_string())
}

pub fn build_service_account(pool: &RunnerPool, hash: &str) -> Result<ServiceAccount, MetaError> {
    Ok(ServiceAccount {
        metadata: build_child_meta(pool, &pool.service_account_name(), BTreeMap::new(), hash)?,
        ..ServiceAccount::default()
    })
}

/// Grants full control over environment resources in the runner's namespace
/// plus read access to their derived children. Bound per-namespace through
/// the RoleBinding below.
pub fn build_cluster_role(pool: &RunnerPool, hash: &str) -> ClusterRole {
    ClusterRole {
        metadata: build_cluster_scoped_meta(pool, &pool.runner_name(), BTreeMap::new(), hash),
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(vec!["apps.example.com".to_string()]),
                resources: Some(vec![
                    "devstagingenvironments".to_string(),
                    "devstagingenvironments/status".to_string(),
                ]),
                verbs: ["create", "get", "list", "watch", "update", "patch", "delete"]
                    .iter()
                    .map(|v| v.to_string())
                    .collect(),
                ..PolicyRule::default()
            },
            PolicyRule {
                api_groups: Some(vec![
                    "".to_string(),
                    "apps".to_string(),
                    "networking.k8s.io".to_string(),
                ]),
                resources: Some(
                    [
                        "deployments",
                        "services",
                        "ingresses",
                        "secrets",
                        "configmaps",
                        "pods",
                        "pods/log",
                        "persistentvolumeclaims",
                    ]
                    .iter()
                    .map(|r| r.to_string())
                    .collect(),
                ),
                verbs: ["get", "list", "watch"].iter().map(|v| v.to_string()).collect(),
                ..PolicyRule::default()
            },
        ]),
        ..ClusterRole::default()
    }
}

pub fn build_role_binding(
    pool: &RunnerPool,
    namespace: &str,
    hash: &str,
) -> Result<RoleBinding, MetaError> {
    let name = pool.runner_name();
    Ok(RoleBinding {
        metadata: build_child_meta(pool, &name, BTreeMap::new(), hash)?,
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: name.clone(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: pool.service_account_name(),
            namespace: Some(namespace.to_string()),
            ..Subject::default()
        }]),
    })
}

pub fn build_runner_deployment(
    pool: &RunnerPool,
    provider: &Provider,
    cfg: &RunnerConfig,
    token_revision: &str,
    hash: &str,
) -> Result<Deployment, MetaError> {
    let adapter = &provider.runner;
    let runner_name = pool.runner_name();
    let sanitized = pool.sanitized_username();
    let selector = role_group_selector_labels(pool, APP_NAME, "runner", &sanitized);

    let mut pod_labels = selector.clone();
    pod_labels.extend((adapter.pod_labels)(&sanitized));

    let adapter_env: Vec<EnvVar> = (adapter.env_vars)(cfg).iter().map(EnvVar::from).collect();
    let extra_env: Vec<EnvVar> = pool.spec.extra_env.iter().map(EnvVar::from).collect();
    let env = merge_env_vars(adapter_env, extra_env);

    let mut runner_mounts = vec![VolumeMount {
        name: "builds".to_string(),
        mount_path: BUILDS_DIR.to_string(),
        ..VolumeMount::default()
    }];
    runner_mounts.extend(pool.spec.extra_volume_mounts.iter().cloned());

    let runner_container = Container {
        name: "runner".to_string(),
        image: Some(
            pool.spec
                .runner_image
                .clone()
                .unwrap_or_else(|| adapter.default_image.to_string()),
        ),
        command: Some(vec![
            adapter.shell.to_string(),
            "-c".to_string(),
            (adapter.startup_script)(cfg),
        ]),
        env: Some(env),
        volume_mounts: Some(runner_mounts),
        resources: pool.spec.resources.clone(),
        ..Container::default()
    };

    // The sidecar needs privileges for the daemonless builder; the runner
    // container stays unprivileged and only ever touches /builds.
    let build_agent_container = Container {
        name: "build-agent".to_string(),
        image: Some(build_agent_image()),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..SecurityContext::default()
        }),
        volume_mounts: Some(vec![VolumeMount {
            name: "builds".to_string(),
            mount_path: BUILDS_DIR.to_string(),
            ..VolumeMount::default()
        }]),
        ..Container::default()
    };

    let mut volumes = vec![Volume {
        name: "builds".to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Volume::default()
    }];
    volumes.extend(pool.spec.extra_volumes.iter().cloned());

    Ok(Deployment {
        metadata: build_child_meta(pool, &runner_name, BTreeMap::new(), hash)?,
        spec: Some(DeploymentSpec {
            replicas: Some(pool.replicas()),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    annotations: Some(BTreeMap::from([(
                        TOKEN_REVISION_ANNOTATION.to_string(),
                        token_revision.to_string(),
                    )])),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(pool.service_account_name()),
                    containers: vec![runner_container, build_agent_container],
                    volumes: Some(volumes),
                    ..PodSpec::default()
                }),
            },
            ..DeploymentSpec::default()
        }),
        status: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_pool() -> RunnerPool {
        serde_yaml::from_str(
            r#"
            apiVersion: apps.example.com/v1alpha1
            kind: RunnerPool
            metadata:
              name: jeff
              namespace: kindling
              uid: pool-uid
            spec:
              platform: github
              username: Jeff.D.Vincent@gmail.com
              repository: acme/app
              tokenSecretRef:
                name: gh-token
                key: github-token
              replicas: 1
        "#,
        )
        .expect("illegal test input")
    }

    #[test]
    fn runner_deployment_matches_the_naming_contract() {
        let pool = parse_pool();
        let provider = provider::get("github").unwrap();
        let cfg = RunnerConfig::from_pool(&provider.runner, &pool);
        let deployment =
            build_runner_deployment(&pool, provider, &cfg, "rv1", "h1").unwrap();

        assert_eq!(
            deployment.metadata.name.as_deref(),
            Some("jeff.d.vincent-gmail.com-runner")
        );
        let pod_meta = deployment
            .spec
            .as_ref()
            .unwrap()
            .template
            .metadata
            .as_ref()
            .unwrap();
        assert_eq!(
            pod_meta
                .labels
                .as_ref()
                .unwrap()
                .get("apps.example.com/github-username")
                .map(String::as_str),
            Some("jeff.d.vincent-gmail.com")
        );
        assert_eq!(
            pod_meta
                .annotations
                .as_ref()
                .unwrap()
                .get(TOKEN_REVISION_ANNOTATION)
                .map(String::as_str),
            Some("rv1")
        );
    }

    #[test]
    fn runner_env_sources_the_token_from_the_declared_secret() {
        let pool = parse_pool();
        let provider = provider::get("github").unwrap();
        let cfg = RunnerConfig::from_pool(&provider.runner, &pool);
        let deployment =
            build_runner_deployment(&pool, provider, &cfg, "rv1", "h1").unwrap();
        let pod = deployment.spec.unwrap().template.spec.unwrap();
        let runner = pod
            .containers
            .iter()
            .find(|c| c.name == "runner")
            .unwrap();
        let pat = runner
            .env
            .as_ref()
            .unwrap()
            .iter()
            .find(|v| v.name == "GITHUB_PAT")
            .expect("GITHUB_PAT env var");
        let selector = pat
            .value_from
            .as_ref()
            .and_then(|v| v.secret_key_ref.as_ref())
            .unwrap();
        assert_eq!(selector.name.as_deref(), Some("gh-token"));
        assert_eq!(selector.key, "github-token");
    }

    #[test]
    fn sidecar_is_privileged_and_shares_the_builds_volume() {
        let pool = parse_pool();
        let provider = provider::get("github").unwrap();
        let cfg = RunnerConfig::from_pool(&provider.runner, &pool);
        let deployment =
            build_runner_deployment(&pool, provider, &cfg, "rv1", "h1").unwrap();
        let pod = deployment.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.service_account_name.as_deref(), Some("jeff.d.vincent-gmail.com-runner"));

        let agent = pod
            .containers
            .iter()
            .find(|c| c.name == "build-agent")
            .unwrap();
        assert_eq!(
            agent.security_context.as_ref().unwrap().privileged,
            Some(true)
        );
        for container in &pod.containers {
            assert!(container
                .volume_mounts
                .as_ref()
                .unwrap()
                .iter()
                .any(|m| m.mount_path == BUILDS_DIR));
        }
    }

    #[test]
    fn rbac_trio_shares_the_derived_name() {
        let pool = parse_pool();
        let sa = build_service_account(&pool, "h1").unwrap();
        let role = build_cluster_role(&pool, "h1");
        let binding = build_role_binding(&pool, "kindling", "h1").unwrap();
        let expected = "jeff.d.vincent-gmail.com-runner";
        assert_eq!(sa.metadata.name.as_deref(), Some(expected));
        assert_eq!(role.metadata.name.as_deref(), Some(expected));
        assert_eq!(binding.metadata.name.as_deref(), Some(expected));
        assert_eq!(binding.role_ref.name, expected);
        // the ClusterRole is cluster-scoped and must not carry a namespaced
        // owner
        assert!(role.metadata.owner_references.is_none());
        assert!(sa.metadata.owner_references.is_some());
    }

    #[test]
    fn cluster_role_grants_environment_control() {
        let pool = parse_pool();
        let role = build_cluster_role(&pool, "h1");
        let rules = role.rules.unwrap();
        let env_rule = &rules[0];
        assert_eq!(
            env_rule.api_groups.as_ref().unwrap()[0],
            "apps.example.com"
        );
        assert!(env_rule.verbs.contains(&"create".to_string()));
        assert!(env_rule.verbs.contains(&"delete".to_string()));
    }
}
