//! Validation of a generated CI config before it is written to disk.

use regex::Regex;

use crate::provider::Provider;

/// Checks the returned config against the platform's structure and the
/// shared protocol rules. An empty result means the config is acceptable.
pub fn validate_config(
    provider: &Provider,
    config_text: &str,
    credentials: &[String],
) -> Vec<String> {
    let parsed: serde_yaml::Value = match serde_yaml::from_str(config_text) {
        Ok(parsed) => parsed,
        Err(err) => return vec![format!("config is not valid YAML: {err}")],
    };

    let mut violations = (provider.workflow.validate)(&parsed);

    // a broad wildcard clean races with parallel jobs on the shared volume
    let broad_clean = Regex::new(r"rm\s+(-[a-zA-Z]+\s+)*/builds/\*").expect("valid regex");
    if broad_clean.is_match(config_text) {
        violations.push("config wipes /builds/* wholesale; clean-ups must be scoped to the job's own work item".to_string());
    }

    if !config_text.contains(".request") {
        violations.push("no build step found (nothing raises a /builds/<name>.request)".to_string());
    }
    if !config_text.contains("-dse.apply") {
        violations
            .push("no deploy step found (nothing raises a /builds/<name>-dse.apply)".to_string());
    }

    for marker in provider.workflow.foreign_expression_markers {
        if config_text.contains(marker) {
            violations.push(format!(
                "foreign template expression {marker:?} does not belong in a {} config",
                provider.display_name
            ));
        }
    }

    for credential in credentials {
        if !config_text.contains(credential.as_str()) {
            violations.push(format!(
                "detected credential {credential} is not wired into the deploy step"
            ));
        }
    }
    if !credentials.is_empty() && !config_text.contains("secretKeyRef") {
        violations.push(
            "credentials must be injected via valueFrom.secretKeyRef, not literals".to_string(),
        );
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider;

    fn github() -> &'static Provider {
        provider::get("github").unwrap()
    }

    #[test]
    fn every_example_config_passes_validation() {
        for provider in provider::all() {
            for example in [
                provider.workflow.example_single_service,
                provider.workflow.example_multi_service,
            ] {
                let violations = validate_config(provider, example, &[]);
                assert!(
                    violations.is_empty(),
                    "provider {} example failed validation: {violations:?}",
                    provider.name
                );
            }
        }
    }

    #[test]
    fn broad_builds_wipe_is_rejected() {
        let config = github().workflow.example_single_service.replace(
            "rm -f /builds/web.*",
            "rm -f /builds/*",
        );
        let violations = validate_config(github(), &config, &[]);
        assert!(violations.iter().any(|v| v.contains("wipes /builds/*")));
    }

    #[test]
    fn scoped_cleanup_is_allowed() {
        let violations =
            validate_config(github(), github().workflow.example_single_service, &[]);
        assert!(!violations.iter().any(|v| v.contains("wipes /builds/*")));
    }

    #[test]
    fn missing_protocol_steps_are_flagged() {
        let config = "on:\n  push: {}\njobs:\n  noop:\n    runs-on: [self-hosted, x]\n    steps:\n      - run: echo hi\n";
        let violations = validate_config(github(), config, &[]);
        assert!(violations.iter().any(|v| v.contains("no build step")));
        assert!(violations.iter().any(|v| v.contains("no deploy step")));
    }

    #[test]
    fn foreign_expressions_are_flagged() {
        let config = github()
            .workflow
            .example_single_service
            .replace("${{ github.sha }}", "$CI_COMMIT_SHA");
        let violations = validate_config(github(), &config, &[]);
        assert!(violations
            .iter()
            .any(|v| v.contains("foreign template expression")));
    }

    #[test]
    fn unwired_credentials_are_flagged() {
        let violations = validate_config(
            github(),
            github().workflow.example_single_service,
            &["MAILGUN_API_KEY".to_string()],
        );
        assert!(violations
            .iter()
            .any(|v| v.contains("MAILGUN_API_KEY is not wired")));
    }

    #[test]
    fn wired_credentials_pass() {
        let violations = validate_config(
            github(),
            github().workflow.example_single_service,
            &["STRIPE_API_KEY".to_string()],
        );
        assert!(violations.is_empty(), "unexpected: {violations:?}");
    }
}
