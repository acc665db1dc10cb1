//! GitLab CI adapter.

use std::collections::BTreeMap;

use indoc::{formatdoc, indoc};
use regex::Regex;

use crate::provider::{
    CliLabels, PromptContext, Provider, RunnerAdapter, RunnerConfig, RunnerEnvVar,
    WorkflowGenerator,
};

pub static PROVIDER: Provider = Provider {
    name: "gitlab",
    display_name: "GitLab CI",
    runner: RunnerAdapter {
        default_image: "gitlab/gitlab-runner:alpine-v17.0.0",
        shell: "/bin/sh",
        default_work_dir: "/builds-work",
        default_secret_key: "gitlab-token",
        default_platform_url: "https://gitlab.com",
        api_base_url,
        env_vars,
        pod_labels,
        startup_script,
    },
    workflow: WorkflowGenerator {
        output_path: ".gitlab-ci.yml",
        system_prompt,
        prompt_context,
        example_single_service: EXAMPLE_SINGLE_SERVICE,
        example_multi_service: EXAMPLE_MULTI_SERVICE,
        trigger_block,
        canonicalize,
        foreign_expression_markers: &["${{", "<< pipeline"],
        validate,
    },
    cli_labels: CliLabels {
        token_hint: "GitLab personal access token with `api` scope",
        repository_hint: "group/project",
    },
};

fn api_base_url(platform_url: &str) -> String {
    format!("{platform_url}/api/v4")
}

fn env_vars(cfg: &RunnerConfig) -> Vec<RunnerEnvVar> {
    vec![
        RunnerEnvVar::secret_key("GITLAB_PAT", &cfg.secret_name, &cfg.secret_key),
        RunnerEnvVar::literal("GITLAB_URL", &cfg.platform_url),
        RunnerEnvVar::literal("GITLAB_API_URL", &cfg.api_url),
        RunnerEnvVar::literal("GITLAB_PROJECT", &cfg.repository),
        RunnerEnvVar::literal(
            "RUNNER_NAME_PREFIX",
            format!("{}-runner", cfg.sanitized_username),
        ),
        RunnerEnvVar::literal("RUNNER_TAGS", cfg.runner_labels_csv()),
        RunnerEnvVar::literal("RUNNER_WORKDIR", &cfg.work_dir),
    ]
}

fn pod_labels(sanitized_username: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(
        "apps.example.com/gitlab-username".to_string(),
        sanitized_username.to_string(),
    )])
}

// Token exchange: PAT -> project-scoped runner authentication token via
// POST /user/runners (GitLab 16+), falling back to the legacy per-project
// registration endpoint. The config.toml is written directly; registration
// state lives with the platform, so SIGTERM deletes the runner by id.
fn startup_script(_cfg: &RunnerConfig) -> String {
    indoc! {r#"
        #!/bin/sh
        set -uo pipefail

        for var in GITLAB_PAT GITLAB_URL GITLAB_API_URL GITLAB_PROJECT RUNNER_NAME_PREFIX; do
          eval value="\${${var}:-}"
          if [ -z "${value}" ]; then
            echo "error: required environment variable ${var} is not set" >&2
            exit 1
          fi
        done

        RUNNER_NAME="${RUNNER_NAME_PREFIX}-$(hostname | tail -c 7)"
        PROJECT_PATH="$(printf '%s' "${GITLAB_PROJECT}" | sed 's|/|%2F|g')"

        json_field() {
          sed -n "s/.*\"$1\" *: *\"\{0,1\}\([^\",}]*\)\"\{0,1\}.*/\1/p" | head -n 1
        }

        api_post() {
          url="$1"; shift
          attempt=0
          while true; do
            attempt=$((attempt + 1))
            response="$(curl -sS -w '\n%{http_code}' -X POST \
              -H "PRIVATE-TOKEN: ${GITLAB_PAT}" "$@" "${url}")"
            status="$(printf '%s' "${response}" | tail -n 1)"
            body="$(printf '%s' "${response}" | sed '$d')"
            case "${status}" in
              2*) printf '%s' "${body}"; return 0 ;;
              4*)
                echo "error: GitLab API returned ${status} for ${url}" >&2
                echo "${body}" >&2
                return 1
                ;;
              *)
                if [ "${attempt}" -ge 5 ]; then
                  echo "error: GitLab API unreachable after ${attempt} attempts" >&2
                  return 1
                fi
                sleep $((attempt * 2))
                ;;
            esac
          done
        }

        PROJECT_ID="$(curl -sS -H "PRIVATE-TOKEN: ${GITLAB_PAT}" \
          "${GITLAB_API_URL}/projects/${PROJECT_PATH}" | json_field id)"
        if [ -z "${PROJECT_ID}" ]; then
          echo "error: could not resolve project id for ${GITLAB_PROJECT}" >&2
          exit 1
        fi

        RESPONSE="$(api_post "${GITLAB_API_URL}/user/runners" \
          --data "runner_type=project_type" \
          --data "project_id=${PROJECT_ID}" \
          --data "tag_list=${RUNNER_TAGS}" \
          --data "description=${RUNNER_NAME}")"
        if [ -z "${RESPONSE}" ]; then
          echo "falling back to legacy project runner registration" >&2
          RESPONSE="$(api_post "${GITLAB_API_URL}/projects/${PROJECT_ID}/runners" \
            --data "description=${RUNNER_NAME}" \
            --data "tag_list=${RUNNER_TAGS}")" || exit 1
        fi
        RUNNER_ID="$(printf '%s' "${RESPONSE}" | json_field id)"
        AUTH_TOKEN="$(printf '%s' "${RESPONSE}" | json_field token)"
        if [ -z "${AUTH_TOKEN}" ]; then
          echo "error: runner registration returned no token" >&2
          exit 1
        fi

        mkdir -p /etc/gitlab-runner
        cat > /etc/gitlab-runner/config.toml <<EOF
        concurrent = 1
        check_interval = 3

        [[runners]]
          name = "${RUNNER_NAME}"
          url = "${GITLAB_URL}"
          token = "${AUTH_TOKEN}"
          executor = "shell"
          builds_dir = "${RUNNER_WORKDIR}"
        EOF

        cleanup() {
          echo "deregistering runner ${RUNNER_NAME} (id ${RUNNER_ID})"
          curl -sS -X DELETE -H "PRIVATE-TOKEN: ${GITLAB_PAT}" \
            "${GITLAB_API_URL}/runners/${RUNNER_ID}"
        }
        trap cleanup TERM INT

        gitlab-runner run --config /etc/gitlab-runner/config.toml &
        wait $!
    "#}
    .to_string()
}

fn system_prompt(host_arch: &str) -> String {
    formatdoc! {r#"
        You generate GitLab CI pipelines for self-hosted dev-staging
        deployments. Output exactly one YAML document and nothing else: no
        prose, no markdown fences.

        Rules:
        - The pipeline file lives at .gitlab-ci.yml.
        - Declare `stages: [build, deploy]` and tag every job with the
          developer's runner tag given in the user prompt, so jobs route to
          the in-cluster runner.
        - The runner is {host_arch}; do not emulate other architectures.
        - Use GitLab variables (`$CI_COMMIT_SHA`, `$GITLAB_USER_LOGIN`) only
          in shell context; never inside file payloads written verbatim.
    "#}
}

fn prompt_context() -> PromptContext {
    PromptContext {
        platform: "gitlab",
        actor_expression: "$GITLAB_USER_LOGIN",
        sha_expression: "$CI_COMMIT_SHA",
        workspace_expression: "$CI_PROJECT_DIR",
        runner_spec_fragment: "tags: [USERNAME_LABEL]".to_string(),
        checkout_step: "(implicit: GitLab clones the project into $CI_PROJECT_DIR)",
    }
}

fn trigger_block(branch: &str) -> String {
    formatdoc! {r#"
        workflow:
          rules:
            - if: $CI_COMMIT_BRANCH == "{branch}"
    "#}
}

fn canonicalize(config: &str) -> String {
    let expressions = Regex::new(r"\$\{?[A-Z][A-Z0-9_]*\}?").expect("valid regex");
    expressions.replace_all(config, "${EXPR}").into_owned()
}

fn validate(config: &serde_yaml::Value) -> Vec<String> {
    let mut violations = Vec::new();
    let Some(root) = config.as_mapping() else {
        return vec!["config is not a YAML mapping".to_string()];
    };
    if root.get("stages").and_then(|s| s.as_sequence()).is_none() {
        violations.push("missing `stages:` list".to_string());
    }
    let reserved = [
        "stages", "workflow", "variables", "default", "include", "image",
    ];
    let mut tagged_jobs = 0;
    for (name, job) in root {
        let Some(name) = name.as_str() else { continue };
        if reserved.contains(&name) || name.starts_with('.') {
            continue;
        }
        let Some(job) = job.as_mapping() else { continue };
        if job.contains_key("script") {
            if job.get("tags").and_then(|t| t.as_sequence()).is_some() {
                tagged_jobs += 1;
            } else {
                violations.push(format!("job `{name}` has no runner `tags:`"));
            }
        }
    }
    if tagged_jobs == 0 {
        violations.push("no runnable jobs found".to_string());
    }
    violations
}

const EXAMPLE_SINGLE_SERVICE: &str = indoc! {r#"
    stages: [build, deploy]

    workflow:
      rules:
        - if: $CI_COMMIT_BRANCH == "main"

    build-web:
      stage: build
      tags: [jane.doe]
      script:
        - rm -f /builds/web.*
        - tar -czf /builds/web.tar.gz -C "$CI_PROJECT_DIR" .
        - echo "registry:5000/web:$CI_COMMIT_SHA" > /builds/web.dest
        - touch /builds/web.request
        - |
          for i in $(seq 1 150); do
            [ -f /builds/web.done ] && break
            sleep 2
          done
          [ -f /builds/web.done ] || { echo "build timed out"; cat /builds/web.log; exit 1; }
          [ "$(cat /builds/web.exitcode)" = "0" ] || { cat /builds/web.log; exit 1; }

    deploy-web:
      stage: deploy
      tags: [jane.doe]
      script:
        - rm -f /builds/web-dse.*
        - |
          cat > /builds/web-dse.yaml <<EOF
          apiVersion: apps.example.com/v1alpha1
          kind: DevStagingEnvironment
          metadata:
            name: web
          spec:
            deployment:
              image: registry:5000/web:$CI_COMMIT_SHA
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
        - touch /builds/web-dse.apply
        - |
          for i in $(seq 1 60); do
            [ -f /builds/web-dse.apply-done ] && break
            sleep 2
          done
          [ "$(cat /builds/web-dse.apply-exitcode)" = "0" ] || { cat /builds/web-dse.apply-log; exit 1; }
"#};

const EXAMPLE_MULTI_SERVICE: &str = indoc! {r#"
    stages: [build, deploy]

    workflow:
      rules:
        - if: $CI_COMMIT_BRANCH == "main"

    build-api:
      stage: build
      tags: [jane.doe]
      script:
        - rm -f /builds/api.*
        - tar -czf /builds/api.tar.gz -C "$CI_PROJECT_DIR/services/api" .
        - echo "registry:5000/api:$CI_COMMIT_SHA" > /builds/api.dest
        - touch /builds/api.request
        - |
          for i in $(seq 1 150); do
            [ -f /builds/api.done ] && break; sleep 2
          done
          [ "$(cat /builds/api.exitcode)" = "0" ] || { cat /builds/api.log; exit 1; }

    build-worker:
      stage: build
      tags: [jane.doe]
      script:
        - rm -f /builds/worker.*
        - tar -czf /builds/worker.tar.gz -C "$CI_PROJECT_DIR/services/worker" .
        - echo "registry:5000/worker:$CI_COMMIT_SHA" > /builds/worker.dest
        - touch /builds/worker.request
        - |
          for i in $(seq 1 150); do
            [ -f /builds/worker.done ] && break; sleep 2
          done
          [ "$(cat /builds/worker.exitcode)" = "0" ] || { cat /builds/worker.log; exit 1; }

    deploy-all:
      stage: deploy
      tags: [jane.doe]
      script:
        - rm -f /builds/api-dse.* /builds/worker-dse.*
        - |
          cat > /builds/api-dse.yaml <<EOF
          apiVersion: apps.example.com/v1alpha1
          kind: DevStagingEnvironment
          metadata:
            name: api
          spec:
            deployment:
              image: registry:5000/api:$CI_COMMIT_SHA
              port: 8080
            service:
              port: 8080
            dependencies:
              - type: postgres
              - type: redis
          EOF
          cat > /builds/worker-dse.yaml <<EOF
          apiVersion: apps.example.com/v1alpha1
          kind: DevStagingEnvironment
          metadata:
            name: worker
          spec:
            deployment:
              image: registry:5000/worker:$CI_COMMIT_SHA
              port: 9090
            service:
              port: 9090
            dependencies:
              - type: redis
          EOF
        - |
          for svc in api worker; do
            touch /builds/${svc}-dse.apply
            for i in $(seq 1 60); do
              [ -f /builds/${svc}-dse.apply-done ] && break; sleep 2
            done
            [ "$(cat /builds/${svc}-dse.apply-exitcode)" = "0" ] || { cat /builds/${svc}-dse.apply-log; exit 1; }
          done
"#};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_url_is_versioned() {
        assert_eq!(
            api_base_url("https://gitlab.example.com"),
            "https://gitlab.example.com/api/v4"
        );
    }

    #[test]
    fn startup_script_registers_then_deletes_by_id() {
        let script = startup_script(&test_config());
        assert!(script.contains("set -uo pipefail"));
        assert!(!script.contains("set -e"));
        assert!(script.contains("/user/runners"));
        assert!(script.contains("legacy project runner registration"));
        assert!(script.contains(r#"curl -sS -X DELETE"#));
    }

    #[test]
    fn canonicalize_strips_ci_variables() {
        assert_eq!(
            canonicalize("image: registry:5000/web:$CI_COMMIT_SHA"),
            "image: registry:5000/web:${EXPR}"
        );
        assert_eq!(
            canonicalize("dir: ${CI_PROJECT_DIR}/x"),
            "dir: ${EXPR}/x"
        );
    }

    #[test]
    fn example_configs_validate_structurally() {
        for example in [EXAMPLE_SINGLE_SERVICE, EXAMPLE_MULTI_SERVICE] {
            let parsed: serde_yaml::Value =
                serde_yaml::from_str(example).expect("example must parse");
            assert_eq!(validate(&parsed), Vec::<String>::new());
        }
    }

    #[test]
    fn untagged_jobs_are_flagged() {
        let config: serde_yaml::Value = serde_yaml::from_str(
            r#"
            stages: [build]
            build-web:
              stage: build
              script:
                - echo hi
        "#,
        )
        .unwrap();
        let violations = validate(&config);
        assert!(violations.iter().any(|v| v.contains("tags")));
    }

    fn test_config() -> RunnerConfig {
        RunnerConfig {
            username: "jane_doe".into(),
            sanitized_username: "jane-doe".into(),
            repository: "acme/app".into(),
            platform_url: "https://gitlab.com".into(),
            api_url: "https://gitlab.com/api/v4".into(),
            secret_name: "gl-token".into(),
            secret_key: "gitlab-token".into(),
            runner_labels: vec!["jane-doe".into(), "kindling".into()],
            work_dir: "/builds-work".into(),
            runner_group: None,
        }
    }
}
