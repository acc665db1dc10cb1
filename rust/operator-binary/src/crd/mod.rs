//! Custom resources managed by this operator and the naming rules shared by
//! everything derived from them.

pub mod environment;
pub mod runner;

use std::hash::Hasher;

use fnv::FnvHasher;
use serde::{Deserialize, Serialize};
use stackable_operator::{
    k8s_openapi::api::core::v1::{EnvVar, EnvVarSource},
    schemars::{self, JsonSchema},
};

/// A declared env var: a literal value or a reference (generated CI configs
/// route external credentials in through `secretKeyRef`).
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVarSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<EnvVarSource>,
}

impl From<&EnvVarSpec> for EnvVar {
    fn from(pair: &EnvVarSpec) -> Self {
        EnvVar {
            name: pair.name.clone(),
            value: pair.value.clone(),
            value_from: pair.value_from.clone(),
        }
    }
}

pub const APP_NAME: &str = "kindling";
/// Also the CRD group: every declared resource and every label or annotation
/// this operator writes lives under this prefix.
pub const OPERATOR_NAME: &str = "apps.example.com";
pub const API_GROUP: &str = "apps.example.com";
pub const API_VERSION: &str = "apps.example.com/v1alpha1";

// label keys
pub const LABEL_ENVIRONMENT: &str = "apps.example.com/environment";
pub const LABEL_COMPONENT: &str = "apps.example.com/component";
pub const LABEL_DEPENDENCY_TYPE: &str = "apps.example.com/dependency-type";
// label values for LABEL_COMPONENT
pub const COMPONENT_APP: &str = "app";
pub const COMPONENT_DEPENDENCY: &str = "dependency";
pub const COMPONENT_RUNNER: &str = "runner";

// annotation keys
pub const SPEC_HASH_ANNOTATION: &str = "apps.example.com/spec-hash";
pub const ORIGINAL_HOST_ANNOTATION: &str = "apps.example.com/original-host";
pub const TOKEN_REVISION_ANNOTATION: &str = "apps.example.com/token-revision";

/// Maximum length of a DNS-1123 label.
const MAX_LABEL_LEN: usize = 63;

/// Normalizes an arbitrary platform username into the DNS-label-safe identity
/// key used in every derived object name and label value.
///
/// The transformation is: lowercase, `@` and `_` become `-`, anything outside
/// `[a-z0-9.-]` is dropped, runs of `-`/`.` collapse to a single character,
/// leading and trailing separators are trimmed and the result is truncated to
/// 63 characters. An input that sanitizes to nothing yields `"runner"`.
pub fn sanitize_label(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LABEL_LEN));
    for c in input.chars().flat_map(char::to_lowercase) {
        let c = match c {
            '@' | '_' => '-',
            c if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-' => c,
            _ => continue,
        };
        if (c == '-' || c == '.') && out.ends_with(c) {
            continue;
        }
        out.push(c);
    }
    let trimmed = out.trim_matches(|c| c == '-' || c == '.');
    let mut result: String = trimmed.chars().take(MAX_LABEL_LEN).collect();
    while result.ends_with('-') || result.ends_with('.') {
        result.pop();
    }
    if result.is_empty() {
        return "runner".to_string();
    }
    result
}

/// Digest over the serialized spec, stored as [`SPEC_HASH_ANNOTATION`] on
/// every owned child so that reconcile passes can skip no-op writes.
///
/// Serialization goes through serde, so two specs that differ only in input
/// key order or free-form whitespace hash identically.
// std's SipHasher is deprecated, and DefaultHasher is unstable across Rust
// releases; FNV keeps the annotation stable across operator upgrades.
pub fn spec_hash<T: Serialize>(spec: &T) -> String {
    let serialized = serde_json::to_vec(spec).unwrap_or_default();
    let mut hasher = FnvHasher::with_key(0);
    hasher.write(&serialized);
    hasher.finish().to_string()
}

/// Merges an override env list into a base env list.
///
/// The result keeps the base order, with each base entry's value replaced by
/// the override when the same name appears in the override list; override
/// names not present in the base are appended in their original order.
pub fn merge_env_vars(base: Vec<EnvVar>, overrides: Vec<EnvVar>) -> Vec<EnvVar> {
    let mut merged: Vec<EnvVar> = base
        .into_iter()
        .map(|var| {
            overrides
                .iter()
                .find(|o| o.name == var.name)
                .cloned()
                .unwrap_or(var)
        })
        .collect();
    for var in overrides {
        if !merged.iter().any(|m| m.name == var.name) {
            merged.push(var);
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn literal(name: &str, value: &str) -> EnvVar {
        EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            ..EnvVar::default()
        }
    }

    #[rstest]
    #[case("Jeff.D.Vincent@gmail.com", "jeff.d.vincent-gmail.com")]
    #[case("octocat", "octocat")]
    #[case("Some_User", "some-user")]
    #[case("user@@corp", "user-corp")]
    #[case("--weird--", "weird")]
    #[case("..dots..", "dots")]
    #[case("", "runner")]
    #[case("!!!", "runner")]
    fn sanitize_label_cases(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(sanitize_label(input), expected);
    }

    #[test]
    fn sanitize_label_truncates_to_dns_label() {
        let out = sanitize_label(&"A".repeat(100));
        assert_eq!(out.len(), 63);
        assert!(out.ends_with(|c: char| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn sanitize_label_truncation_never_ends_in_separator() {
        // 62 chars followed by a separator that lands on the cut boundary
        let input = format!("{}-{}", "a".repeat(62), "b".repeat(10));
        let out = sanitize_label(&input);
        assert!(out.ends_with(|c: char| c.is_ascii_alphanumeric()));
        assert!(out.len() <= 63);
    }

    #[test]
    fn sanitize_label_is_idempotent() {
        let long = "x".repeat(200);
        for input in [
            "Jeff.D.Vincent@gmail.com",
            "UPPER_case@HOST",
            "",
            "a-.-.-b",
            long.as_str(),
        ] {
            let once = sanitize_label(input);
            assert_eq!(sanitize_label(&once), once);
        }
    }

    #[test]
    fn merge_keeps_base_order_and_applies_overrides() {
        let base = vec![literal("A", "1"), literal("B", "2"), literal("C", "3")];
        let overrides = vec![literal("B", "20"), literal("D", "4")];
        let merged = merge_env_vars(base, overrides);
        let names: Vec<_> = merged.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, ["A", "B", "C", "D"]);
        assert_eq!(merged[1].value.as_deref(), Some("20"));
        assert_eq!(merged[3].value.as_deref(), Some("4"));
    }

    #[test]
    fn merge_with_empty_overrides_is_identity() {
        let base = vec![literal("A", "1"), literal("B", "2")];
        assert_eq!(merge_env_vars(base.clone(), vec![]), base);
    }

    #[test]
    fn spec_hash_is_stable_under_key_order() {
        let a: serde_json::Value = serde_json::from_str(r#"{"x": 1, "y": {"b": 2, "a": 3}}"#)
            .expect("illegal test input");
        let b: serde_json::Value = serde_json::from_str(r#"{"y": {"a": 3, "b": 2}, "x": 1}"#)
            .expect("illegal test input");
        assert_eq!(spec_hash(&a), spec_hash(&b));
    }

    #[test]
    fn spec_hash_differs_on_content_change() {
        let a: serde_json::Value = serde_json::json!({"image": "nginx:1.25"});
        let b: serde_json::Value = serde_json::json!({"image": "nginx:1.26"});
        assert_ne!(spec_hash(&a), spec_hash(&b));
    }
}
