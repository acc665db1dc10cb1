//! GitHub Actions adapter.

use std::collections::BTreeMap;

use indoc::{formatdoc, indoc};
use regex::Regex;

use crate::provider::{
    CliLabels, PromptContext, Provider, RunnerAdapter, RunnerConfig, RunnerEnvVar,
    WorkflowGenerator,
};

pub static PROVIDER: Provider = Provider {
    name: "github",
    display_name: "GitHub Actions",
    runner: RunnerAdapter {
        default_image: "ghcr.io/actions/actions-runner:2.317.0",
        shell: "/bin/bash",
        default_work_dir: "/home/runner/_work",
        default_secret_key: "github-token",
        default_platform_url: "https://github.com",
        api_base_url,
        env_vars,
        pod_labels,
        startup_script,
    },
    workflow: WorkflowGenerator {
        output_path: ".github/workflows/dev-deploy.yml",
        system_prompt,
        prompt_context,
        example_single_service: EXAMPLE_SINGLE_SERVICE,
        example_multi_service: EXAMPLE_MULTI_SERVICE,
        trigger_block,
        canonicalize,
        foreign_expression_markers: &["<< pipeline", "$CI_COMMIT", "$CI_PROJECT"],
        validate,
    },
    cli_labels: CliLabels {
        token_hint: "GitHub personal access token with `repo` scope",
        repository_hint: "owner/repo",
    },
};

fn api_base_url(platform_url: &str) -> String {
    if platform_url == "https://github.com" {
        "https://api.github.com".to_string()
    } else {
        // GitHub Enterprise Server serves its REST API under /api/v3
        format!("{platform_url}/api/v3")
    }
}

fn env_vars(cfg: &RunnerConfig) -> Vec<RunnerEnvVar> {
    let mut vars = vec![
        RunnerEnvVar::secret_key("GITHUB_PAT", &cfg.secret_name, &cfg.secret_key),
        RunnerEnvVar::literal(
            "GITHUB_URL",
            format!("{}/{}", cfg.platform_url, cfg.repository),
        ),
        RunnerEnvVar::literal("GITHUB_API_URL", &cfg.api_url),
        RunnerEnvVar::literal("GITHUB_REPOSITORY", &cfg.repository),
        RunnerEnvVar::literal(
            "RUNNER_NAME_PREFIX",
            format!("{}-runner", cfg.sanitized_username),
        ),
        RunnerEnvVar::literal("RUNNER_LABELS", cfg.runner_labels_csv()),
        RunnerEnvVar::literal("RUNNER_WORKDIR", &cfg.work_dir),
    ];
    if let Some(group) = &cfg.runner_group {
        vars.push(RunnerEnvVar::literal("RUNNER_GROUP", group));
    }
    vars
}

fn pod_labels(sanitized_username: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(
        "apps.example.com/github-username".to_string(),
        sanitized_username.to_string(),
    )])
}

// All inputs arrive through the container env built by `env_vars`, so the
// script itself is static. `set -e` is deliberately absent: the API error
// paths must reach their diagnostics instead of dying mid-pipeline.
fn startup_script(_cfg: &RunnerConfig) -> String {
    indoc! {r#"
        #!/bin/bash
        set -uo pipefail

        for var in GITHUB_PAT GITHUB_URL GITHUB_API_URL GITHUB_REPOSITORY RUNNER_NAME_PREFIX; do
          if [ -z "${!var:-}" ]; then
            echo "error: required environment variable ${var} is not set" >&2
            exit 1
          fi
        done

        # GitHub rejects runner names longer than 64 characters.
        RUNNER_NAME="${RUNNER_NAME_PREFIX}-$(hostname | tail -c 7)"
        RUNNER_NAME="$(printf '%.64s' "${RUNNER_NAME}")"

        fetch_token() {
          url="$1"
          attempt=0
          while true; do
            attempt=$((attempt + 1))
            response="$(curl -sS -w '\n%{http_code}' -X POST \
              -H "Authorization: token ${GITHUB_PAT}" \
              -H "Accept: application/vnd.github+json" \
              "${url}")"
            status="${response##*$'\n'}"
            body="${response%$'\n'*}"
            case "${status}" in
              2*)
                printf '%s' "${body}" | sed -n 's/.*"token" *: *"\([^"]*\)".*/\1/p'
                return 0
                ;;
              4*)
                echo "error: GitHub API returned ${status} for ${url}" >&2
                echo "${body}" >&2
                return 1
                ;;
              *)
                if [ "${attempt}" -ge 5 ]; then
                  echo "error: GitHub API unreachable after ${attempt} attempts" >&2
                  return 1
                fi
                sleep $((attempt * 2))
                ;;
            esac
          done
        }

        REG_TOKEN="$(fetch_token "${GITHUB_API_URL}/repos/${GITHUB_REPOSITORY}/actions/runners/registration-token")" || exit 1

        ./config.sh --unattended --replace \
          --url "${GITHUB_URL}" \
          --token "${REG_TOKEN}" \
          --name "${RUNNER_NAME}" \
          --labels "${RUNNER_LABELS}" \
          --work "${RUNNER_WORKDIR}" \
          ${RUNNER_GROUP:+--runnergroup "${RUNNER_GROUP}"} || exit 1

        cleanup() {
          echo "deregistering runner ${RUNNER_NAME}"
          REMOVE_TOKEN="$(fetch_token "${GITHUB_API_URL}/repos/${GITHUB_REPOSITORY}/actions/runners/remove-token")" \
            && ./config.sh remove --token "${REMOVE_TOKEN}"
        }
        trap cleanup TERM INT

        ./run.sh &
        wait $!
    "#}
    .to_string()
}

fn system_prompt(host_arch: &str) -> String {
    formatdoc! {r#"
        You generate GitHub Actions workflows for self-hosted dev-staging
        deployments. Output exactly one YAML document and nothing else: no
        prose, no markdown fences.

        Rules:
        - The workflow file lives at .github/workflows/dev-deploy.yml.
        - Every job runs on the developer's own runner: `runs-on:
          [self-hosted, USERNAME_LABEL]`, where USERNAME_LABEL is given in
          the user prompt.
        - The runner is {host_arch}; do not emulate other architectures.
        - Check out with actions/checkout@v4 before building.
        - Use GitHub expressions (`${{{{ github.sha }}}}`, `${{{{ github.actor }}}}`)
          only in fields GitHub evaluates; never inside file payloads that
          are written verbatim.
    "#}
}

fn prompt_context() -> PromptContext {
    PromptContext {
        platform: "github",
        actor_expression: "${{ github.actor }}",
        sha_expression: "${{ github.sha }}",
        workspace_expression: "${{ github.workspace }}",
        runner_spec_fragment: "runs-on: [self-hosted, USERNAME_LABEL]".to_string(),
        checkout_step: "- uses: actions/checkout@v4",
    }
}

fn trigger_block(branch: &str) -> String {
    formatdoc! {r#"
        on:
          push:
            branches: [{branch}]
    "#}
}

fn canonicalize(config: &str) -> String {
    let expressions = Regex::new(r"\$\{\{[^}]*\}\}").expect("valid regex");
    expressions.replace_all(config, "${EXPR}").into_owned()
}

fn validate(config: &serde_yaml::Value) -> Vec<String> {
    let mut violations = Vec::new();
    let Some(root) = config.as_mapping() else {
        return vec!["config is not a YAML mapping".to_string()];
    };
    // depending on the YAML schema, a bare `on:` key parses as the string
    // "on" or as the boolean true
    let has_trigger = root
        .keys()
        .any(|key| key.as_str() == Some("on") || key.as_bool() == Some(true));
    if !has_trigger {
        violations.push("missing `on:` trigger block".to_string());
    }
    match root.get("jobs").and_then(|j| j.as_mapping()) {
        None => violations.push("missing `jobs:` block".to_string()),
        Some(jobs) => {
            for (name, job) in jobs {
                let name = name.as_str().unwrap_or("<job>");
                let runs_on_self_hosted = job
                    .get("runs-on")
                    .map(|r| match r {
                        serde_yaml::Value::String(s) => s.contains("self-hosted"),
                        serde_yaml::Value::Sequence(seq) => seq
                            .iter()
                            .any(|v| v.as_str() == Some("self-hosted")),
                        _ => false,
                    })
                    .unwrap_or(false);
                if !runs_on_self_hosted {
                    violations.push(format!("job `{name}` does not run on a self-hosted runner"));
                }
                if job.get("steps").and_then(|s| s.as_sequence()).is_none() {
                    violations.push(format!("job `{name}` has no steps"));
                }
            }
        }
    }
    violations
}

const EXAMPLE_SINGLE_SERVICE: &str = indoc! {r#"
    name: dev-deploy
    on:
      push:
        branches: [main]
    jobs:
      build-and-deploy:
        runs-on: [self-hosted, jane.doe]
        steps:
          - uses: actions/checkout@v4
          - name: kindling-build
            run: |
              rm -f /builds/web.*
              tar -czf /builds/web.tar.gz -C . .
              echo "registry:5000/web:${{ github.sha }}" > /builds/web.dest
              touch /builds/web.request
              for i in $(seq 1 150); do
                [ -f /builds/web.done ] && break
                sleep 2
              done
              if [ ! -f /builds/web.done ]; then
                echo "build timed out"; cat /builds/web.log; exit 1
              fi
              if [ "$(cat /builds/web.exitcode)" != "0" ]; then
                cat /builds/web.log; exit 1
              fi
          - name: kindling-deploy
            run: |
              rm -f /builds/web-dse.*
              cat > /builds/web-dse.yaml <<EOF
              apiVersion: apps.example.com/v1alpha1
              kind: DevStagingEnvironment
              metadata:
                name: web
              spec:
                deployment:
                  image: registry:5000/web:${{ github.sha }}
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
              if [ "$(cat /builds/web-dse.apply-exitcode)" != "0" ]; then
                cat /builds/web-dse.apply-log; exit 1
              fi
"#};

const EXAMPLE_MULTI_SERVICE: &str = indoc! {r#"
    name: dev-deploy
    on:
      push:
        branches: [main]
    jobs:
      build-and-deploy:
        runs-on: [self-hosted, jane.doe]
        steps:
          - uses: actions/checkout@v4
          - name: kindling-build-api
            run: |
              rm -f /builds/api.*
              tar -czf /builds/api.tar.gz -C services/api .
              echo "registry:5000/api:${{ github.sha }}" > /builds/api.dest
              echo "Dockerfile" > /builds/api.dockerfile
              touch /builds/api.request
              for i in $(seq 1 150); do
                [ -f /builds/api.done ] && break; sleep 2
              done
              [ "$(cat /builds/api.exitcode)" = "0" ] || { cat /builds/api.log; exit 1; }
          - name: kindling-build-worker
            run: |
              rm -f /builds/worker.*
              tar -czf /builds/worker.tar.gz -C services/worker .
              echo "registry:5000/worker:${{ github.sha }}" > /builds/worker.dest
              touch /builds/worker.request
              for i in $(seq 1 150); do
                [ -f /builds/worker.done ] && break; sleep 2
              done
              [ "$(cat /builds/worker.exitcode)" = "0" ] || { cat /builds/worker.log; exit 1; }
          - name: kindling-deploy
            run: |
              for svc in api worker; do
                rm -f /builds/${svc}-dse.*
              done
              cat > /builds/api-dse.yaml <<EOF
              apiVersion: apps.example.com/v1alpha1
              kind: DevStagingEnvironment
              metadata:
                name: api
              spec:
                deployment:
                  image: registry:5000/api:${{ github.sha }}
                  port: 8080
                  healthCheck:
                    path: /health
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
                  image: registry:5000/worker:${{ github.sha }}
                  port: 9090
                service:
                  port: 9090
                dependencies:
                  - type: redis
              EOF
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
    fn api_url_distinguishes_cloud_from_enterprise() {
        assert_eq!(api_base_url("https://github.com"), "https://api.github.com");
        assert_eq!(
            api_base_url("https://github.corp.example"),
            "https://github.corp.example/api/v3"
        );
    }

    #[test]
    fn startup_script_never_uses_set_e() {
        let cfg = test_config();
        let script = startup_script(&cfg);
        assert!(script.contains("set -uo pipefail"));
        assert!(!script.contains("set -e"));
        assert!(script.contains("config.sh remove"));
        assert!(script.contains("trap cleanup TERM"));
    }

    #[test]
    fn canonicalize_strips_github_expressions() {
        let config = "image: registry:5000/web:${{ github.sha }}";
        assert_eq!(canonicalize(config), "image: registry:5000/web:${EXPR}");
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
    fn validate_flags_hosted_runners() {
        let config: serde_yaml::Value = serde_yaml::from_str(
            r#"
            on:
              push: {}
            jobs:
              build:
                runs-on: ubuntu-latest
                steps:
                  - run: echo hi
        "#,
        )
        .unwrap();
        let violations = validate(&config);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("self-hosted"));
    }

    fn test_config() -> RunnerConfig {
        RunnerConfig {
            username: "Jane.Doe@example.com".into(),
            sanitized_username: "jane.doe-example.com".into(),
            repository: "acme/app".into(),
            platform_url: "https://github.com".into(),
            api_url: "https://api.github.com".into(),
            secret_name: "gh-token".into(),
            secret_key: "github-token".into(),
            runner_labels: vec!["jane.doe-example.com".into(), "kindling".into()],
            work_dir: "/home/runner/_work".into(),
            runner_group: None,
        }
    }
}
