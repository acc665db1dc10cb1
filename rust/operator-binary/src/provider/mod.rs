//! CI platform adapters.
//!
//! Each platform is one self-contained module exposing a [`Provider`] value:
//! a bundle of plain data and function pointers, registered in a process-wide
//! read-only table. There is no trait object in the dispatch path; adding a
//! platform means adding one module and one entry to [`PROVIDERS`].

pub mod circleci;
pub mod github;
pub mod gitlab;

use std::collections::BTreeMap;

use stackable_operator::k8s_openapi::api::core::v1::{
    EnvVar, EnvVarSource, SecretKeySelector,
};

use crate::crd::runner::RunnerPool;

pub const DEFAULT_PLATFORM_ENV: &str = "KINDLING_DEFAULT_PLATFORM";

static PROVIDERS: &[&Provider] = &[&github::PROVIDER, &gitlab::PROVIDER, &circleci::PROVIDER];

/// One CI platform: naming, runner wiring and workflow generation.
pub struct Provider {
    pub name: &'static str,
    pub display_name: &'static str,
    pub runner: RunnerAdapter,
    pub workflow: WorkflowGenerator,
    pub cli_labels: CliLabels,
}

/// Hints the CLI shows when prompting for platform-specific inputs.
pub struct CliLabels {
    pub token_hint: &'static str,
    pub repository_hint: &'static str,
}

/// Everything the runner-pool reconciler needs from a platform.
pub struct RunnerAdapter {
    pub default_image: &'static str,
    /// Shell the startup script runs under (the GitHub script needs bash).
    pub shell: &'static str,
    pub default_work_dir: &'static str,
    /// Conventional key within the token secret when the pool does not name
    /// one.
    pub default_secret_key: &'static str,
    pub default_platform_url: &'static str,
    /// Derives the REST API base from the (possibly self-hosted) platform
    /// URL.
    pub api_base_url: fn(platform_url: &str) -> String,
    /// Container env for the runner: literals plus secret references.
    pub env_vars: fn(cfg: &RunnerConfig) -> Vec<RunnerEnvVar>,
    /// Platform-identifying pod labels, e.g.
    /// `apps.example.com/github-username=<sanitized>`.
    pub pod_labels: fn(sanitized_username: &str) -> BTreeMap<String, String>,
    /// The shell the runner container starts with: env validation, token
    /// exchange, registration, SIGTERM de-registration.
    pub startup_script: fn(cfg: &RunnerConfig) -> String,
}

/// Everything the config generator needs from a platform.
pub struct WorkflowGenerator {
    /// Canonical location of the generated CI config within a repo.
    pub output_path: &'static str,
    pub system_prompt: fn(host_arch: &str) -> String,
    pub prompt_context: fn() -> PromptContext,
    /// Few-shot priming examples handed to the LLM.
    pub example_single_service: &'static str,
    pub example_multi_service: &'static str,
    pub trigger_block: fn(branch: &str) -> String,
    /// Strips this platform's template-expression syntax, producing the
    /// canonical form used to compare configs across platforms.
    pub canonicalize: fn(config: &str) -> String,
    /// Expression markers of *other* platforms that must not leak into a
    /// config generated for this one.
    pub foreign_expression_markers: &'static [&'static str],
    /// Platform-specific structural checks; returns human-readable
    /// violations.
    pub validate: fn(config: &serde_yaml::Value) -> Vec<String>,
}

/// Platform-agnostic expressions the prompt builder splices into the shared
/// instruction block.
pub struct PromptContext {
    pub platform: &'static str,
    pub actor_expression: &'static str,
    pub sha_expression: &'static str,
    pub workspace_expression: &'static str,
    pub runner_spec_fragment: String,
    pub checkout_step: &'static str,
}

/// A runner env entry: a literal value or a key in the pool's token secret.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RunnerEnvValue {
    Literal(String),
    SecretKey { secret: String, key: String },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunnerEnvVar {
    pub name: &'static str,
    pub value: RunnerEnvValue,
}

impl RunnerEnvVar {
    pub fn literal(name: &'static str, value: impl Into<String>) -> Self {
        RunnerEnvVar {
            name,
            value: RunnerEnvValue::Literal(value.into()),
        }
    }

    pub fn secret_key(name: &'static str, secret: impl Into<String>, key: impl Into<String>) -> Self {
        RunnerEnvVar {
            name,
            value: RunnerEnvValue::SecretKey {
                secret: secret.into(),
                key: key.into(),
            },
        }
    }
}

impl From<&RunnerEnvVar> for EnvVar {
    fn from(var: &RunnerEnvVar) -> Self {
        match &var.value {
            RunnerEnvValue::Literal(value) => EnvVar {
                name: var.name.to_string(),
                value: Some(value.clone()),
                ..EnvVar::default()
            },
            RunnerEnvValue::SecretKey { secret, key } => EnvVar {
                name: var.name.to_string(),
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: Some(secret.clone()),
                        key: key.clone(),
                        optional: Some(false),
                    }),
                    ..EnvVarSource::default()
                }),
                ..EnvVar::default()
            },
        }
    }
}

/// The resolved inputs a [`RunnerAdapter`] works from, derived once per
/// reconcile from the declared pool.
pub struct RunnerConfig {
    pub username: String,
    pub sanitized_username: String,
    pub repository: String,
    pub platform_url: String,
    pub api_url: String,
    pub secret_name: String,
    pub secret_key: String,
    /// Routing labels advertised to the platform: the sanitized username,
    /// the `kindling` marker, then any extra pool labels.
    pub runner_labels: Vec<String>,
    pub work_dir: String,
    pub runner_group: Option<String>,
}

impl RunnerConfig {
    pub fn from_pool(adapter: &RunnerAdapter, pool: &RunnerPool) -> Self {
        let sanitized_username = pool.sanitized_username();
        let platform_url = pool
            .spec
            .platform_url
            .clone()
            .unwrap_or_else(|| adapter.default_platform_url.to_string());
        let platform_url = platform_url.trim_end_matches('/').to_string();
        let api_url = (adapter.api_base_url)(&platform_url);
        let mut runner_labels = vec![sanitized_username.clone(), "kindling".to_string()];
        runner_labels.extend(pool.spec.labels.iter().cloned());
        RunnerConfig {
            username: pool.spec.username.clone(),
            sanitized_username,
            repository: pool.spec.repository.clone(),
            platform_url,
            api_url,
            secret_name: pool.spec.token_secret_ref.name.clone(),
            secret_key: pool
                .spec
                .token_secret_ref
                .key
                .clone()
                .unwrap_or_else(|| adapter.default_secret_key.to_string()),
            runner_labels,
            work_dir: pool
                .spec
                .work_dir
                .clone()
                .unwrap_or_else(|| adapter.default_work_dir.to_string()),
            runner_group: pool.spec.runner_group.clone(),
        }
    }

    pub fn runner_labels_csv(&self) -> String {
        self.runner_labels.join(",")
    }
}

pub fn all() -> &'static [&'static Provider] {
    PROVIDERS
}

pub fn get(name: &str) -> Option<&'static Provider> {
    PROVIDERS.iter().find(|p| p.name == name).copied()
}

/// The adapter selected by `KINDLING_DEFAULT_PLATFORM`, falling back to the
/// primary platform.
pub fn default_provider() -> &'static Provider {
    std::env::var(DEFAULT_PLATFORM_ENV)
        .ok()
        .and_then(|name| get(&name))
        .unwrap_or(&github::PROVIDER)
}

/// Resolves a pool's `platform` field against the registry.
pub fn for_pool(pool: &RunnerPool) -> Option<&'static Provider> {
    match pool.spec.platform.as_deref() {
        Some(name) => get(name),
        None => Some(default_provider()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool(platform: &str) -> RunnerPool {
        serde_yaml::from_str(&format!(
            r#"
            apiVersion: apps.example.com/v1alpha1
            kind: RunnerPool
            metadata:
              name: pool
              namespace: kindling
            spec:
              platform: {platform}
              username: Jeff.D.Vincent@gmail.com
              repository: acme/app
              tokenSecretRef:
                name: ci-token
        "#
        ))
        .expect("illegal test input")
    }

    #[test]
    fn registry_resolves_all_platforms() {
        for name in ["github", "gitlab", "circleci"] {
            let provider = get(name).expect(name);
            assert_eq!(provider.name, name);
        }
        assert!(get("jenkins").is_none());
    }

    #[test]
    fn all_adapters_agree_on_derived_names() {
        // The naming contract: one username, the same four object names on
        // every platform.
        for provider in all() {
            let cfg = RunnerConfig::from_pool(&provider.runner, &test_pool(provider.name));
            assert_eq!(cfg.sanitized_username, "jeff.d.vincent-gmail.com");
        }
    }

    #[test]
    fn runner_labels_start_with_identity_and_marker() {
        let provider = get("github").unwrap();
        let cfg = RunnerConfig::from_pool(&provider.runner, &test_pool("github"));
        assert_eq!(
            cfg.runner_labels_csv(),
            "jeff.d.vincent-gmail.com,kindling"
        );
    }

    #[test]
    fn secret_env_vars_render_as_secret_key_refs() {
        let var = RunnerEnvVar::secret_key("GITHUB_PAT", "gh-token", "github-token");
        let env: EnvVar = (&var).into();
        let selector = env
            .value_from
            .and_then(|v| v.secret_key_ref)
            .expect("secret ref");
        assert_eq!(selector.name.as_deref(), Some("gh-token"));
        assert_eq!(selector.key, "github-token");
    }
}
