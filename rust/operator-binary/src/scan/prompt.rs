//! Prompt assembly for CI-config generation: the platform adapter's system
//! prompt plus a shared instruction block, and a user payload built from the
//! repo scan.

use std::fmt::Write;

use indoc::formatdoc;
use strum::IntoEnumIterator;

use crate::{
    catalog::{self, DependencyType},
    provider::Provider,
    scan::{credentials::OauthHints, RepoScan},
};

pub struct GeneratedPrompt {
    pub system: String,
    pub user: String,
}

/// Inputs that do not come from the scan itself.
pub struct PromptOptions<'a> {
    pub host_arch: &'a str,
    pub default_branch: &'a str,
    /// The sanitized-username routing label the generated jobs must target.
    pub username_label: &'a str,
}

pub fn build_prompt(
    provider: &Provider,
    scan: &RepoScan,
    credentials: &[String],
    oauth: &OauthHints,
    options: &PromptOptions,
) -> GeneratedPrompt {
    let system = format!(
        "{}\n{}",
        (provider.workflow.system_prompt)(options.host_arch),
        shared_system_block(),
    );
    GeneratedPrompt {
        system,
        user: user_payload(provider, scan, credentials, oauth, options),
    }
}

/// Platform-independent rules: the build/deploy file protocol, the
/// dependency auto-injection table and the health-check contract.
fn shared_system_block() -> String {
    let mut dependency_table = String::new();
    for dependency_type in DependencyType::iter() {
        let entry = catalog::entry(dependency_type);
        let _ = writeln!(
            dependency_table,
            "- {dependency_type} -> {} (port {})",
            entry.env_var_name, entry.port
        );
    }
    formatdoc! {r#"
        Shared rules for every platform:

        Build protocol (the runner pod has a build-agent sidecar sharing
        /builds):
        1. Pack the build context: tar -czf /builds/NAME.tar.gz -C DIR .
        2. Write the image reference into /builds/NAME.dest; the only valid
           registry is registry:5000.
        3. Optionally write a relative dockerfile path into
           /builds/NAME.dockerfile.
        4. touch /builds/NAME.request, then poll every 2 seconds for
           /builds/NAME.done (timeout 300s; 900s for heavy toolchains).
        5. Read /builds/NAME.exitcode; on nonzero, print /builds/NAME.log
           and fail the step.
        6. Clean up only your own /builds/NAME.* files; NEVER run
           rm -f /builds/* because parallel jobs share the volume.

        Deploy protocol: write the DevStagingEnvironment manifest
        (apiVersion apps.example.com/v1alpha1) to /builds/NAME-dse.yaml,
        touch /builds/NAME-dse.apply, and poll for
        /builds/NAME-dse.apply-done the same way.

        Declared dependencies are provisioned automatically; their
        connection env vars are injected into the app container:
        {dependency_table}
        Do not add containers for these services and do not set their env
        vars by hand.

        Health checks: give every HTTP service a healthCheck with its real
        path; use type grpc for gRPC services and type none only for
        workers without a port.

        External credentials must be wired through Kubernetes secrets:
        reference each one in the environment's deployment.env using
        valueFrom.secretKeyRef, never as a literal value.
    "#}
}

fn user_payload(
    provider: &Provider,
    scan: &RepoScan,
    credentials: &[String],
    oauth: &OauthHints,
    options: &PromptOptions,
) -> String {
    let context = (provider.workflow.prompt_context)();
    let runner_spec = context
        .runner_spec_fragment
        .replace("USERNAME_LABEL", options.username_label)
        .replace(
            "RESOURCE_CLASS",
            &format!("ORG/{}", options.username_label),
        );

    let mut payload = formatdoc! {r#"
        Repository: {repo}
        Default branch: {branch}
        Platform: {platform}
        Commit expression: {sha}
        Actor expression: {actor}
        Workspace: {workspace}
        Runner selection for every job:
        {runner_spec}
        Trigger on pushes to the default branch:
        {trigger}
        Checkout: {checkout}
    "#,
        repo = scan.repo_name,
        branch = options.default_branch,
        platform = context.platform,
        sha = context.sha_expression,
        actor = context.actor_expression,
        workspace = context.workspace_expression,
        trigger = (provider.workflow.trigger_block)(options.default_branch),
        checkout = context.checkout_step,
    };

    push_section(&mut payload, "Directory listing", &scan.listing.join("\n"));
    for file in &scan.dockerfiles {
        push_section(&mut payload, &format!("Dockerfile: {}", file.path), &file.content);
    }
    for file in &scan.manifests {
        push_section(&mut payload, &format!("Manifest: {}", file.path), &file.content);
    }
    for file in &scan.sources {
        push_section(&mut payload, &format!("Source: {}", file.path), &file.content);
    }
    if let Some(compose) = &scan.compose {
        push_section(
            &mut payload,
            &format!("Compose file: {}", compose.path),
            &compose.content,
        );
    }

    if credentials.is_empty() {
        push_section(&mut payload, "Detected external credentials", "none");
    } else {
        push_section(
            &mut payload,
            "Detected external credentials (each needs a secretKeyRef in the deploy step)",
            &credentials.join("\n"),
        );
    }
    if oauth.requires_public_url {
        push_section(
            &mut payload,
            "OAuth hints (the app needs a stable public URL)",
            &oauth.hints.join("\n"),
        );
    }

    payload.push_str("\nExample config (single service):\n");
    payload.push_str(provider.workflow.example_single_service);
    payload.push_str("\nExample config (multiple services):\n");
    payload.push_str(provider.workflow.example_multi_service);
    payload
}

fn push_section(payload: &mut String, title: &str, body: &str) {
    let _ = write!(payload, "\n## {title}\n{body}\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider;
    use crate::scan::ScannedFile;

    fn options() -> PromptOptions<'static> {
        PromptOptions {
            host_arch: "linux/arm64",
            default_branch: "main",
            username_label: "jane.doe",
        }
    }

    fn scan() -> RepoScan {
        RepoScan {
            repo_name: "web".to_string(),
            listing: vec!["Dockerfile".to_string(), "src/index.ts".to_string()],
            dockerfiles: vec![ScannedFile {
                path: "Dockerfile".to_string(),
                content: "FROM node:20".to_string(),
            }],
            ..RepoScan::default()
        }
    }

    #[test]
    fn system_prompt_combines_platform_and_shared_rules() {
        let provider = provider::get("github").unwrap();
        let prompt = build_prompt(provider, &scan(), &[], &OauthHints::default(), &options());
        assert!(prompt.system.contains("GitHub Actions"));
        assert!(prompt.system.contains("linux/arm64"));
        assert!(prompt.system.contains("rm -f /builds/*"));
        assert!(prompt.system.contains("postgres -> DATABASE_URL (port 5432)"));
        assert!(prompt.system.contains("jaeger -> JAEGER_ENDPOINT"));
    }

    #[test]
    fn user_payload_substitutes_the_username_label() {
        let provider = provider::get("github").unwrap();
        let prompt = build_prompt(provider, &scan(), &[], &OauthHints::default(), &options());
        assert!(prompt.user.contains("runs-on: [self-hosted, jane.doe]"));
        assert!(prompt.user.contains("branches: [main]"));
        assert!(prompt.user.contains("FROM node:20"));
    }

    #[test]
    fn credentials_and_oauth_sections_appear_when_detected() {
        let provider = provider::get("gitlab").unwrap();
        let credentials = vec!["STRIPE_API_KEY".to_string()];
        let oauth = OauthHints {
            requires_public_url: true,
            hints: vec!["NextAuth.js detected".to_string()],
        };
        let prompt = build_prompt(provider, &scan(), &credentials, &oauth, &options());
        assert!(prompt.user.contains("STRIPE_API_KEY"));
        assert!(prompt.user.contains("stable public URL"));
        assert!(prompt.user.contains("tags: [jane.doe]"));
    }
}
