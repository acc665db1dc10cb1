//! CircleCI machine-runner (3.x) adapter.

use std::collections::BTreeMap;

use indoc::{formatdoc, indoc};
use regex::Regex;

use crate::provider::{
    CliLabels, PromptContext, Provider, RunnerAdapter, RunnerConfig, RunnerEnvVar,
    WorkflowGenerator,
};

pub static PROVIDER: Provider = Provider {
    name: "circleci",
    display_name: "CircleCI",
    runner: RunnerAdapter {
        default_image: "circleci/runner-agent:machine-3",
        shell: "/bin/sh",
        default_work_dir: "/var/opt/circleci/workdir",
        default_secret_key: "circleci-token",
        default_platform_url: "https://circleci.com",
        api_base_url,
        env_vars,
        pod_labels,
        startup_script,
    },
    workflow: WorkflowGenerator {
        output_path: ".circleci/config.yml",
        system_prompt,
        prompt_context,
        example_single_service: EXAMPLE_SINGLE_SERVICE,
        example_multi_service: EXAMPLE_MULTI_SERVICE,
        trigger_block,
        canonicalize,
        foreign_expression_markers: &["${{", "$CI_COMMIT", "$CI_PROJECT"],
        validate,
    },
    cli_labels: CliLabels {
        token_hint: "CircleCI resource-class token",
        repository_hint: "org/project",
    },
};

fn api_base_url(platform_url: &str) -> String {
    if platform_url.contains("circleci.com") {
        "https://runner.circleci.com".to_string()
    } else {
        format!("{platform_url}/api/v2")
    }
}

/// Resource class the runner claims: `<org>/<sanitized-username>`. The org
/// comes from the repository slug; the token authorizes exactly this class.
fn resource_class(cfg: &RunnerConfig) -> String {
    let org = cfg.repository.split('/').next().unwrap_or("kindling");
    format!("{org}/{}", cfg.sanitized_username)
}

fn env_vars(cfg: &RunnerConfig) -> Vec<RunnerEnvVar> {
    vec![
        RunnerEnvVar::secret_key(
            "CIRCLECI_RESOURCE_CLASS_TOKEN",
            &cfg.secret_name,
            &cfg.secret_key,
        ),
        RunnerEnvVar::literal("CIRCLECI_RESOURCE_CLASS", resource_class(cfg)),
        RunnerEnvVar::literal("CIRCLECI_RUNNER_API_URL", &cfg.api_url),
        RunnerEnvVar::literal(
            "RUNNER_NAME_PREFIX",
            format!("{}-runner", cfg.sanitized_username),
        ),
        RunnerEnvVar::literal("RUNNER_WORKDIR", &cfg.work_dir),
    ]
}

fn pod_labels(sanitized_username: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(
        "apps.example.com/circleci-username".to_string(),
        sanitized_username.to_string(),
    )])
}

// The resource-class token is used directly; machine-runner 3 performs no
// registration handshake, so shutdown needs no API call either.
fn startup_script(_cfg: &RunnerConfig) -> String {
    indoc! {r#"
        #!/bin/sh
        set -uo pipefail

        for var in CIRCLECI_RESOURCE_CLASS_TOKEN CIRCLECI_RESOURCE_CLASS RUNNER_NAME_PREFIX; do
          eval value="\${${var}:-}"
          if [ -z "${value}" ]; then
            echo "error: required environment variable ${var} is not set" >&2
            exit 1
          fi
        done

        RUNNER_NAME="${RUNNER_NAME_PREFIX}-$(hostname | tail -c 7)"
        RUNNER_NAME="$(printf '%.64s' "${RUNNER_NAME}")"

        mkdir -p /etc/circleci-runner
        cat > /etc/circleci-runner/circleci-runner-config.yaml <<EOF
        api:
          auth_token: ${CIRCLECI_RESOURCE_CLASS_TOKEN}
          url: ${CIRCLECI_RUNNER_API_URL}
        runner:
          name: ${RUNNER_NAME}
          working_directory: ${RUNNER_WORKDIR}
          cleanup_working_directory: true
        EOF

        exec circleci-runner machine --config /etc/circleci-runner/circleci-runner-config.yaml
    "#}
    .to_string()
}

fn system_prompt(host_arch: &str) -> String {
    formatdoc! {r#"
        You generate CircleCI configs for self-hosted dev-staging
        deployments. Output exactly one YAML document and nothing else: no
        prose, no markdown fences.

        Rules:
        - The config file lives at .circleci/config.yml and declares
          `version: 2.1`.
        - Every job runs on the developer's machine runner:
          `machine: true` plus the `resource_class` given in the user
          prompt.
        - The runner is {host_arch}; do not emulate other architectures.
        - Use pipeline values (`<< pipeline.git.revision >>`) only in fields
          CircleCI evaluates; never inside `environment:` values or file
          payloads written verbatim.
    "#}
}

fn prompt_context() -> PromptContext {
    PromptContext {
        platform: "circleci",
        actor_expression: "<< pipeline.trigger_parameters.github_app.user_username >>",
        sha_expression: "<< pipeline.git.revision >>",
        workspace_expression: "~/project",
        runner_spec_fragment: "machine: true\nresource_class: RESOURCE_CLASS".to_string(),
        checkout_step: "- checkout",
    }
}

fn trigger_block(branch: &str) -> String {
    formatdoc! {r#"
        workflows:
          dev-deploy:
            jobs:
              - build-and-deploy:
                  filters:
                    branches:
                      only: {branch}
    "#}
}

fn canonicalize(config: &str) -> String {
    // single-line only, so shell heredoc markers (`<<EOF`) survive untouched
    let expressions = Regex::new(r"<<[^>\n]+>>").expect("valid regex");
    expressions.replace_all(config, "${EXPR}").into_owned()
}

fn validate(config: &serde_yaml::Value) -> Vec<String> {
    let mut violations = Vec::new();
    let Some(root) = config.as_mapping() else {
        return vec!["config is not a YAML mapping".to_string()];
    };
    match root.get("version").and_then(|v| v.as_f64()) {
        Some(version) if (version - 2.1).abs() < f64::EPSILON => {}
        _ => violations.push("config must declare `version: 2.1`".to_string()),
    }
    if root.get("workflows").and_then(|w| w.as_mapping()).is_none() {
        violations.push("missing `workflows:` block".to_string());
    }
    match root.get("jobs").and_then(|j| j.as_mapping()) {
        None => violations.push("missing `jobs:` block".to_string()),
        Some(jobs) => {
            for (name, job) in jobs {
                let name = name.as_str().unwrap_or("<job>");
                let machine = matches!(
                    job.get("machine"),
                    Some(serde_yaml::Value::Bool(true)) | Some(serde_yaml::Value::Mapping(_))
                );
                if !machine {
                    violations.push(format!("job `{name}` is not a machine-runner job"));
                }
                if job.get("resource_class").and_then(|r| r.as_str()).is_none() {
                    violations.push(format!("job `{name}` has no `resource_class`"));
                }
            }
        }
    }
    violations
}

const EXAMPLE_SINGLE_SERVICE: &str = indoc! {r#"
    version: 2.1

    jobs:
      build-and-deploy:
        machine: true
        resource_class: acme/jane.doe
        steps:
          - checkout
          - run:
              name: kindling-build
              command: |
                rm -f /builds/web.*
                tar -czf /builds/web.tar.gz -C ~/project .
                echo "registry:5000/web:<< pipeline.git.revision >>" > /builds/web.dest
                touch /builds/web.request
                for i in $(seq 1 150); do
                  [ -f /builds/web.done ] && break
                  sleep 2
                done
                [ -f /builds/web.done ] || { echo "build timed out"; cat /builds/web.log; exit 1; }
                [ "$(cat /builds/web.exitcode)" = "0" ] || { cat /builds/web.log; exit 1; }
          - run:
              name: kindling-deploy
              command: |
                rm -f /builds/web-dse.*
                cat > /builds/web-dse.yaml <<EOF
                apiVersion: apps.example.com/v1alpha1
                kind: DevStagingEnvironment
                metadata:
                  name: web
                spec:
                  deployment:
                    image: registry:5000/web:<< pipeline.git.revision >>
                    port: 3000
                    healthCheck:
                      path: /healthz
                    env:
                      - name: STRIPE_API_KEY
                        valueFrom:
                          secretKeyRef:
                            name: web-secrets
                            key: STRIPE_API_KEY
                  service:
                    port: 3000
                  dependencies:
                    - type: postgres
                EOF
                touch /builds/web-dse.apply
                for i in $(seq 1 60); do
                  [ -f /builds/web-dse.apply-done ] && break
                  sleep 2
                done
                [ "$(cat /builds/web-dse.apply-exitcode)" = "0" ] || { cat /builds/web-dse.apply-log; exit 1; }

    workflows:
      dev-deploy:
        jobs:
          - build-and-deploy:
              filters:
                branches:
                  only: main
"#};

const EXAMPLE_MULTI_SERVICE: &str = indoc! {r#"
    version: 2.1

    jobs:
      build-api:
        machine: true
        resource_class: acme/jane.doe
        steps:
          - checkout
          - run:
              name: kindling-build
              command: |
                rm -f /builds/api.*
                tar -czf /builds/api.tar.gz -C ~/project/services/api .
                echo "registry:5000/api:<< pipeline.git.revision >>" > /builds/api.dest
                touch /builds/api.request
                for i in $(seq 1 150); do
                  [ -f /builds/api.done ] && break; sleep 2
                done
                [ "$(cat /builds/api.exitcode)" = "0" ] || { cat /builds/api.log; exit 1; }
      build-worker:
        machine: true
        resource_class: acme/jane.doe
        steps:
          - checkout
          - run:
              name: kindling-build
              command: |
                rm -f /builds/worker.*
                tar -czf /builds/worker.tar.gz -C ~/project/services/worker .
                echo "registry:5000/worker:<< pipeline.git.revision >>" > /builds/worker.dest
                touch /builds/worker.request
                for i in $(seq 1 150); do
                  [ -f /builds/worker.done ] && break; sleep 2
                done
                [ "$(cat /builds/worker.exitcode)" = "0" ] || { cat /builds/worker.log; exit 1; }
      deploy-all:
        machine: true
        resource_class: acme/jane.doe
        steps:
          - run:
              name: kindling-deploy
              command: |
                rm -f /builds/api-dse.* /builds/worker-dse.*
                cat > /builds/api-dse.yaml <<EOF
                apiVersion: apps.example.com/v1alpha1
                kind: DevStagingEnvironment
                metadata:
                  name: api
                spec:
                  deployment:
                    image: registry:5000/api:<< pipeline.git.revision >>
                    port: 8080
                  service:
                    port: 8080
                  dependencies:
                    - type: postgres
                    - type: redis
                EOF
                touch /builds/api-dse.apply
                for i in $(seq 1 60); do
                  [ -f /builds/api-dse.apply-done ] && break; sleep 2
                done
                [ "$(cat /builds/api-dse.apply-exitcode)" = "0" ] || { cat /builds/api-dse.apply-log; exit 1; }

    workflows:
      dev-deploy:
        jobs:
          - build-api:
              filters:
                branches:
                  only: main
          - build-worker:
              filters:
                branches:
                  only: main
          - deploy-all:
              requires: [build-api, build-worker]
"#};
