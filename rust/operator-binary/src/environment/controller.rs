//! Ensures that the application stack declared by a
//! [`DevStagingEnvironment`] is running: workload, service, optional
//! ingress, and one provisioned backing service per declared dependency.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    client::Client,
    k8s_openapi::{
        api::{
            apps::v1::{Deployment, DeploymentSpec},
            core::v1::{
                ConfigMap, Container, ContainerPort, EnvVar, GRPCAction, HTTPGetAction, PodSpec,
                PodTemplateSpec, Probe, Secret, Service, ServicePort, ServiceSpec,
            },
            networking::v1::{
                HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
                IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
            },
        },
        apimachinery::pkg::{apis::meta::v1::LabelSelector, util::intstr::IntOrString},
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
    crd::{
        environment::{
            DevStagingEnvironment, DevStagingEnvironmentStatus, HealthCheckType, IngressConfig,
        },
        merge_env_vars, spec_hash, APP_NAME, COMPONENT_APP, LABEL_COMPONENT, OPERATOR_NAME,
    },
    environment::{
        build_child_meta,
        dependency::{
            app_dependency_env, build_credentials_secret, build_dependency_deployment,
            build_dependency_pvc, build_dependency_service, prune_stale_dependencies,
            validate_environment, wait_init_containers, InvalidSpec, ResolvedDependency,
        },
        image_version, MetaError,
    },
    resources::{self, apply_if_changed, delete_if_owned, get_opt},
    tunnel::{tunnel_host, TUNNEL_CONFIG_MAP, TUNNEL_URL_KEY},
};

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
    #[snafu(display("failed to read credentials record {name}"))]
    ReadCredentials {
        source: resources::Error,
        name: String,
    },
    #[snafu(display("failed to apply credentials record {name}"))]
    ApplyCredentials {
        source: resources::Error,
        name: String,
    },
    #[snafu(display("failed to apply workload for dependency {name}"))]
    ApplyDependencyWorkload {
        source: resources::Error,
        name: String,
    },
    #[snafu(display("failed to apply Service for dependency {name}"))]
    ApplyDependencyService {
        source: resources::Error,
        name: String,
    },
    #[snafu(display("failed to apply storage for dependency {name}"))]
    ApplyDependencyStorage {
        source: resources::Error,
        name: String,
    },
    #[snafu(display("failed to prune stale dependencies"))]
    PruneStaleDependencies { source: resources::Error },
    #[snafu(display("failed to apply application Deployment"))]
    ApplyAppDeployment { source: resources::Error },
    #[snafu(display("failed to apply application Service"))]
    ApplyAppService { source: resources::Error },
    #[snafu(display("failed to apply Ingress"))]
    ApplyIngress { source: resources::Error },
    #[snafu(display("failed to delete disabled Ingress"))]
    DeleteIngress { source: resources::Error },
    #[snafu(display("failed to read tunnel ConfigMap"))]
    ReadTunnel { source: resources::Error },
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

pub async fn reconcile_environment(
    env: Arc<DevStagingEnvironment>,
    ctx: Arc<Ctx>,
) -> Result<Action> {
    info!("Starting reconcile");
    let client = &ctx.client;
    let namespace = env.namespace().context(ObjectHasNoNamespaceSnafu)?;

    if env.spec.cluster_operation.reconciliation_paused {
        let status = DevStagingEnvironmentStatus {
            conditions: compute_conditions(
                env.as_ref(),
                &[&ClusterOperationsConditionBuilder::new(
                    &env.spec.cluster_operation,
                )],
            ),
            ..env.status.clone().unwrap_or_default()
        };
        write_status(client, &env, status).await?;
        return Ok(Action::await_change());
    }

    // Declaration errors are terminal: surface a condition, skip the requeue
    // and wait for the declaration to change.
    let deps = match validate_environment(&env) {
        Ok(deps) => deps,
        Err(invalid) => {
            return terminal_invalid_spec(client, &env, &invalid).await;
        }
    };

    let hash = spec_hash(&env.spec);
    let mut dependency_cond_builder = DeploymentConditionBuilder::default();
    let mut dependencies_ready = true;

    for dep in &deps {
        let existing: Option<Secret> = get_opt(client, &dep.name, &namespace)
            .await
            .context(ReadCredentialsSnafu { name: &dep.name })?;
        if let Some(credentials) = build_credentials_secret(&env, dep, existing.as_ref(), &hash)
            .context(BuildMetaSnafu { name: &dep.name })?
        {
            apply_if_changed(client, OPERATOR_NAME, &credentials, &hash)
                .await
                .context(ApplyCredentialsSnafu { name: &dep.name })?;
        }

        let workload = build_dependency_deployment(&env, dep, &hash)
            .context(BuildMetaSnafu { name: &dep.name })?;
        let (workload, _) = apply_if_changed(client, OPERATOR_NAME, &workload, &hash)
            .await
            .context(ApplyDependencyWorkloadSnafu { name: &dep.name })?;
        dependencies_ready &= deployment_available(&workload);
        dependency_cond_builder.add(workload);

        let service = build_dependency_service(&env, dep, &hash)
            .context(BuildMetaSnafu { name: &dep.name })?;
        apply_if_changed(client, OPERATOR_NAME, &service, &hash)
            .await
            .context(ApplyDependencyServiceSnafu { name: &dep.name })?;

        if let Some(pvc) = build_dependency_pvc(&env, dep, &hash)
            .context(BuildMetaSnafu { name: &dep.name })?
        {
            apply_if_changed(client, OPERATOR_NAME, &pvc, &hash)
                .await
                .context(ApplyDependencyStorageSnafu { name: &dep.name })?;
        }
    }

    let keep: BTreeSet<_> = deps.iter().map(|dep| dep.dependency_type).collect();
    prune_stale_dependencies(client, &env, &keep)
        .await
        .context(PruneStaleDependenciesSnafu)?;

    let app_deployment = build_app_deployment(&env, &deps, &hash)?;
    let (app_deployment, _) = apply_if_changed(client, OPERATOR_NAME, &app_deployment, &hash)
        .await
        .context(ApplyAppDeploymentSnafu)?;
    let deployment_ready = deployment_available(&app_deployment);
    let available_replicas = app_deployment
        .status
        .as_ref()
        .and_then(|status| status.available_replicas);

    let mut app_cond_builder = DeploymentConditionBuilder::default();
    app_cond_builder.add(app_deployment);

    let app_service = build_app_service(&env, &hash)?;
    apply_if_changed(client, OPERATOR_NAME, &app_service, &hash)
        .await
        .context(ApplyAppServiceSnafu)?;

    let tunnel_url = read_tunnel_url(client, &namespace).await?;
    let ingress_enabled = env
        .spec
        .ingress
        .as_ref()
        .map(|ingress| ingress.enabled)
        .unwrap_or(false);
    if let Some(ingress_config) = env.spec.ingress.as_ref().filter(|i| i.enabled) {
        let ingress = build_ingress(&env, ingress_config, tunnel_url.as_deref(), &hash)?;
        apply_if_changed(client, OPERATOR_NAME, &ingress, &hash)
            .await
            .context(ApplyIngressSnafu)?;
    } else {
        // a disabled or removed ingress block deletes the object
        delete_if_owned::<Ingress>(
            client,
            &env.app_name(),
            &namespace,
            env.metadata.uid.as_deref().unwrap_or_default(),
        )
        .await
        .context(DeleteIngressSnafu)?;
    }

    let cluster_operation_cond_builder =
        ClusterOperationsConditionBuilder::new(&env.spec.cluster_operation);
    let status = DevStagingEnvironmentStatus {
        conditions: compute_conditions(
            env.as_ref(),
            &[
                &app_cond_builder,
                &dependency_cond_builder,
                &cluster_operation_cond_builder,
            ],
        ),
        deployment_ready,
        service_ready: true,
        ingress_ready: ingress_enabled,
        dependencies_ready,
        available_replicas,
        url: status_url(&env, tunnel_url.as_deref()),
    };
    write_status(client, &env, status).await?;

    if deployment_ready && dependencies_ready {
        Ok(Action::await_change())
    } else {
        // children exist but are not ready yet; check back shortly
        Ok(Action::requeue(Duration::from_secs(10)))
    }
}

pub fn error_policy(_obj: Arc<DevStagingEnvironment>, _error: &Error, _ctx: Arc<Ctx>) -> Action {
    Action::requeue(Duration::from_secs(5))
}

async fn terminal_invalid_spec(
    client: &Client,
    env: &DevStagingEnvironment,
    invalid: &InvalidSpec,
) -> Result<Action> {
    let condition = ClusterCondition {
        type_: ClusterConditionType::Degraded,
        status: ClusterConditionStatus::True,
        message: Some(format!("{}: {invalid}", invalid.reason())),
        ..ClusterCondition::default()
    };
    let status = DevStagingEnvironmentStatus {
        conditions: vec![condition],
        ..env.status.clone().unwrap_or_default()
    };
    write_status(client, env, status).await?;
    Ok(Action::await_change())
}

/// Status writes are themselves hash-gated by value: an unchanged status is
/// not re-applied, so a reconcile of an unchanged spec performs no writes at
/// all.
async fn write_status(
    client: &Client,
    env: &DevStagingEnvironment,
    status: DevStagingEnvironmentStatus,
) -> Result<()> {
    if env.status.as_ref() == Some(&status) {
        return Ok(());
    }
    client
        .apply_patch_status(OPERATOR_NAME, env, &status)
        .await
        .context(ApplyStatusSnafu)?;
    Ok(())
}

fn deployment_available(deployment: &Deployment) -> bool {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(1);
    let available = deployment
        .status
        .as_ref()
        .and_then(|status| status.available_replicas)
        .unwrap_or(0);
    available >= desired
}

async fn read_tunnel_url(client: &Client, namespace: &str) -> Result<Option<String>> {
    let config_map: Option<ConfigMap> = get_opt(client, TUNNEL_CONFIG_MAP, namespace)
        .await
        .context(ReadTunnelSnafu)?;
    Ok(config_map
        .and_then(|cm| cm.data)
        .and_then(|mut data| data.remove(TUNNEL_URL_KEY)))
}

fn status_url(env: &DevStagingEnvironment, tunnel_url: Option<&str>) -> Option<String> {
    match tunnel_url {
        Some(url) if env.spec.ingress.as_ref().map(|i| i.enabled).unwrap_or(false) => {
            Some(url.to_string())
        }
        _ => env.url(),
    }
}

fn build_probe(env: &DevStagingEnvironment) -> Option<Probe> {
    let health = env.spec.deployment.health_check.as_ref()?;
    let port: i32 = health.port.unwrap_or(env.spec.deployment.port).into();
    let mut probe = Probe {
        initial_delay_seconds: Some(health.initial_delay_seconds.unwrap_or(10)),
        period_seconds: Some(health.period_seconds.unwrap_or(10)),
        failure_threshold: Some(5),
        ..Probe::default()
    };
    match health.check_type {
        HealthCheckType::Http => {
            probe.http_get = Some(HTTPGetAction {
                path: Some(health.path.clone().unwrap_or_else(|| "/".to_string())),
                port: IntOrString::Int(port),
                ..HTTPGetAction::default()
            });
        }
        HealthCheckType::Grpc => {
            probe.grpc = Some(GRPCAction {
                port,
                service: None,
            });
        }
        HealthCheckType::None => return None,
    }
    Some(probe)
}

pub fn build_app_deployment(
    env: &DevStagingEnvironment,
    deps: &[ResolvedDependency],
    hash: &str,
) -> Result<Deployment> {
    let name = env.app_name();
    let image = env.spec.deployment.image.clone();
    let selector = role_group_selector_labels(env, APP_NAME, COMPONENT_APP, "default");
    let probe = build_probe(env);

    let user_env: Vec<EnvVar> = env
        .spec
        .deployment
        .env
        .as_ref()
        .map(|pairs| pairs.iter().map(EnvVar::from).collect())
        .unwrap_or_default();
    let merged_env = merge_env_vars(app_dependency_env(deps), user_env);

    let container = Container {
        name: name.clone(),
        image: Some(image.clone()),
        command: env.spec.deployment.command.clone(),
        args: env.spec.deployment.args.clone(),
        ports: Some(vec![ContainerPort {
            container_port: env.spec.deployment.port.into(),
            name: Some("http".to_string()),
            ..ContainerPort::default()
        }]),
        env: (!merged_env.is_empty()).then_some(merged_env),
        resources: env.spec.deployment.resources.clone(),
        readiness_probe: probe.clone(),
        liveness_probe: probe,
        ..Container::default()
    };

    let init_containers = wait_init_containers(deps);

    let metadata = build_child_meta(
        env,
        &name,
        image_version(&image),
        COMPONENT_APP,
        "default",
        app_labels(),
        hash,
    )
    .context(BuildMetaSnafu { name: &name })?;

    Ok(Deployment {
        metadata,
        spec: Some(DeploymentSpec {
            replicas: Some(env.replicas()),
            selector: LabelSelector {
                match_labels: Some(selector.clone()),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(selector),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    init_containers: (!init_containers.is_empty()).then_some(init_containers),
                    containers: vec![container],
                    ..PodSpec::default()
                }),
            },
            ..DeploymentSpec::default()
        }),
        status: None,
    })
}

pub fn build_app_service(env: &DevStagingEnvironment, hash: &str) -> Result<Service> {
    let name = env.app_name();
    let metadata = build_child_meta(
        env,
        &name,
        image_version(&env.spec.deployment.image),
        COMPONENT_APP,
        "default",
        app_labels(),
        hash,
    )
    .context(BuildMetaSnafu { name: &name })?;
    Ok(Service {
        metadata,
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: env.spec.service.port.into(),
                target_port: Some(IntOrString::Int(env.service_target_port().into())),
                protocol: Some("TCP".to_string()),
                ..ServicePort::default()
            }]),
            selector: Some(role_group_selector_labels(
                env,
                APP_NAME,
                COMPONENT_APP,
                "default",
            )),
            type_: Some(env.spec.service.service_type.to_string()),
            ..ServiceSpec::default()
        }),
        status: None,
    })
}

pub fn build_ingress(
    env: &DevStagingEnvironment,
    ingress: &IngressConfig,
    tunnel_url: Option<&str>,
    hash: &str,
) -> Result<Ingress> {
    let name = env.app_name();
    let declared_host = ingress.host.clone();
    let effective_host = tunnel_url
        .and_then(tunnel_host)
        .unwrap_or_else(|| declared_host.clone());

    let mut metadata = build_child_meta(
        env,
        &name,
        image_version(&env.spec.deployment.image),
        COMPONENT_APP,
        "default",
        app_labels(),
        hash,
    )
    .context(BuildMetaSnafu { name: &name })?;
    let annotations = metadata.annotations.get_or_insert_with(Default::default);
    annotations.extend(ingress.annotations.clone());
    if effective_host != declared_host {
        annotations.insert(
            crate::crd::ORIGINAL_HOST_ANNOTATION.to_string(),
            declared_host,
        );
    }

    let path = ingress.path.clone().unwrap_or_else(|| "/".to_string());
    Ok(Ingress {
        metadata,
        spec: Some(IngressSpec {
            ingress_class_name: ingress.class_name.clone(),
            rules: Some(vec![IngressRule {
                host: Some(effective_host),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some(path),
                        path_type: ingress.path_type.to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: name.clone(),
                                port: Some(ServiceBackendPort {
                                    number: Some(env.spec.service.port.into()),
                                    ..ServiceBackendPort::default()
                                }),
                            }),
                            ..IngressBackend::default()
                        },
                    }],
                }),
            }]),
            tls: ingress.tls.as_ref().map(|tls| {
                vec![IngressTLS {
                    secret_name: Some(tls.secret_name.clone()),
                    hosts: (!tls.hosts.is_empty()).then(|| tls.hosts.clone()),
                }]
            }),
            ..IngressSpec::default()
        }),
        status: None,
    })
}

fn app_labels() -> std::collections::BTreeMap<String, String> {
    std::collections::BTreeMap::from([(LABEL_COMPONENT.to_string(), COMPONENT_APP.to_string())])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::dependency::validate_environment;

    fn parse(input: &str) -> DevStagingEnvironment {
        serde_yaml::from_str(input).expect("illegal test input")
    }

    const MINIMAL: &str = r#"
        apiVersion: apps.example.com/v1alpha1
        kind: DevStagingEnvironment
        metadata:
          name: web
          namespace: default
          uid: env-uid
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
    fn minimal_environment_builds_expected_workload() {
        let env = parse(MINIMAL);
        let deps = validate_environment(&env).unwrap();
        let deployment = build_app_deployment(&env, &deps, "h1").unwrap();

        assert_eq!(deployment.metadata.name.as_deref(), Some("web"));
        let spec = deployment.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(1));
        let pod = spec.template.spec.as_ref().unwrap();
        assert!(pod.init_containers.is_none());
        let container = &pod.containers[0];
        assert_eq!(container.image.as_deref(), Some("nginx:1.25"));
        assert_eq!(
            container.ports.as_ref().unwrap()[0].container_port,
            80
        );
        assert!(container.env.is_none());
        let probe = container.readiness_probe.as_ref().unwrap();
        let http = probe.http_get.as_ref().unwrap();
        assert_eq!(http.path.as_deref(), Some("/"));
        assert_eq!(http.port, IntOrString::Int(80));
    }

    #[test]
    fn minimal_environment_builds_expected_service() {
        let env = parse(MINIMAL);
        let service = build_app_service(&env, "h1").unwrap();
        assert_eq!(service.metadata.name.as_deref(), Some("web"));
        let spec = service.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
        let port = &spec.ports.unwrap()[0];
        assert_eq!(port.port, 80);
        assert_eq!(port.target_port, Some(IntOrString::Int(80)));
    }

    #[test]
    fn environment_with_dependencies_wires_init_and_env() {
        let env = parse(
            r#"
            apiVersion: apps.example.com/v1alpha1
            kind: DevStagingEnvironment
            metadata:
              name: web
              namespace: default
            spec:
              deployment:
                image: nginx:1.25
                port: 80
                env:
                  - name: DATABASE_URL
                    value: postgres://elsewhere:5432/other
              service:
                port: 80
              dependencies:
                - type: postgres
                - type: redis
        "#,
        );
        let deps = validate_environment(&env).unwrap();
        let deployment = build_app_deployment(&env, &deps, "h1").unwrap();
        let pod = deployment.spec.unwrap().template.spec.unwrap();

        let init_names: Vec<_> = pod
            .init_containers
            .as_ref()
            .unwrap()
            .iter()
            .map(|c| c.name.clone())
            .collect();
        assert_eq!(init_names, ["wait-for-postgres", "wait-for-redis"]);

        // the declared override replaces the injected value in place
        let env_vars = pod.containers[0].env.as_ref().unwrap();
        let database_url = env_vars.iter().find(|v| v.name == "DATABASE_URL").unwrap();
        assert_eq!(
            database_url.value.as_deref(),
            Some("postgres://elsewhere:5432/other")
        );
        assert!(env_vars.iter().any(|v| v.name == "REDIS_URL"));
    }

    #[test]
    fn grpc_health_check_builds_grpc_probe() {
        let env = parse(
            r#"
            apiVersion: apps.example.com/v1alpha1
            kind: DevStagingEnvironment
            metadata:
              name: web
            spec:
              deployment:
                image: grpc-app:1
                port: 50051
                healthCheck:
                  type: grpc
              service:
                port: 50051
        "#,
        );
        let probe = build_probe(&env).unwrap();
        assert_eq!(probe.grpc.as_ref().unwrap().port, 50051);
        assert!(probe.http_get.is_none());
    }

    #[test]
    fn none_health_check_builds_no_probe() {
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
                healthCheck:
                  type: none
              service:
                port: 80
        "#,
        );
        assert!(build_probe(&env).is_none());
    }

    #[test]
    fn ingress_builds_rule_tls_and_annotations() {
        let env = parse(
            r#"
            apiVersion: apps.example.com/v1alpha1
            kind: DevStagingEnvironment
            metadata:
              name: web
              namespace: default
            spec:
              deployment:
                image: nginx:1.25
                port: 80
              service:
                port: 80
              ingress:
                enabled: true
                host: web.dev.example.com
                path: /app
                pathType: Prefix
                className: traefik
                annotations:
                  example.com/rewrite: "true"
                tls:
                  secretName: web-tls
                  hosts: [web.dev.example.com]
        "#,
        );
        let ingress_config = env.spec.ingress.clone().unwrap();
        let ingress = build_ingress(&env, &ingress_config, None, "h1").unwrap();
        let spec = ingress.spec.as_ref().unwrap();
        assert_eq!(spec.ingress_class_name.as_deref(), Some("traefik"));
        let rule = &spec.rules.as_ref().unwrap()[0];
        assert_eq!(rule.host.as_deref(), Some("web.dev.example.com"));
        let path = &rule.http.as_ref().unwrap().paths[0];
        assert_eq!(path.path.as_deref(), Some("/app"));
        assert_eq!(path.path_type, "Prefix");
        assert_eq!(
            spec.tls.as_ref().unwrap()[0].secret_name.as_deref(),
            Some("web-tls")
        );
        assert_eq!(
            ingress
                .metadata
                .annotations
                .as_ref()
                .unwrap()
                .get("example.com/rewrite")
                .map(String::as_str),
            Some("true")
        );
    }

    #[test]
    fn active_tunnel_rewrites_the_host_and_keeps_the_original() {
        let env = parse(
            r#"
            apiVersion: apps.example.com/v1alpha1
            kind: DevStagingEnvironment
            metadata:
              name: web
              namespace: default
            spec:
              deployment:
                image: nginx:1.25
                port: 80
              service:
                port: 80
              ingress:
                enabled: true
                host: web.dev.example.com
        "#,
        );
        let ingress_config = env.spec.ingress.clone().unwrap();
        let ingress = build_ingress(
            &env,
            &ingress_config,
            Some("https://abc123.trycloudflare.com"),
            "h1",
        )
        .unwrap();
        let rule = &ingress.spec.as_ref().unwrap().rules.as_ref().unwrap()[0];
        assert_eq!(rule.host.as_deref(), Some("abc123.trycloudflare.com"));
        assert_eq!(
            ingress
                .metadata
                .annotations
                .as_ref()
                .unwrap()
                .get(crate::crd::ORIGINAL_HOST_ANNOTATION)
                .map(String::as_str),
            Some("web.dev.example.com")
        );
    }
}
