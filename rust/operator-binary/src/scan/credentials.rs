//! External-credential and OAuth detection over a repo scan.

use std::collections::BTreeSet;

use regex::Regex;

use crate::{catalog, scan::RepoScan};

/// A token counts as a credential only when it ends in one of these.
pub const CREDENTIAL_SUFFIXES: &[&str] = &[
    "_CLIENT_ID",
    "_CLIENT_SECRET",
    "_DSN",
    "_KEY",
    "_PASSWD",
    "_PASSWORD",
    "_SECRET",
    "_TOKEN",
];

/// Well-known names that match a suffix but are configuration, not secrets.
pub const NON_CREDENTIALS: &[&str] = &[
    "APP_ENV",
    "CI",
    "DEBUG",
    "ENV",
    "ENVIRONMENT",
    "GOPATH",
    "HOME",
    "HOST",
    "HOSTNAME",
    "LANG",
    "LOG_LEVEL",
    "NODE_ENV",
    "PATH",
    "PORT",
    "PYTHONPATH",
    "RUST_LOG",
    "TZ",
];

/// Substrings marking OAuth flows that need a stable public callback URL.
const OAUTH_MARKERS: &[(&str, &str)] = &[
    ("next-auth", "NextAuth.js detected; callbacks need a public URL"),
    ("NEXTAUTH_URL", "NEXTAUTH_URL is read; point it at the tunnel URL"),
    ("auth0", "Auth0 detected; register the tunnel URL as a callback"),
    ("AUTH0_DOMAIN", "Auth0 domain configured; callbacks need a public URL"),
    ("passport", "Passport.js detected; OAuth callbacks need a public URL"),
    ("golang.org/x/oauth2", "Go OAuth2 client detected"),
    ("omniauth", "OmniAuth detected; callbacks need a public URL"),
];

/// Env var names the developer must wire in as secrets: ALL-CAPS tokens with
/// a credential suffix, minus the catalog-managed names and well-known
/// non-credentials. Sorted and deduplicated.
pub fn detect_credentials(scan: &RepoScan) -> Vec<String> {
    let token = Regex::new(r"[A-Z][A-Z0-9_]{3,}").expect("valid regex");
    let managed = catalog::managed_env_names();
    let mut found = BTreeSet::new();

    for file in scan
        .sources
        .iter()
        .chain(scan.manifests.iter())
        .chain(scan.dockerfiles.iter())
        .chain(scan.compose.iter())
    {
        for candidate in token.find_iter(&file.content) {
            let name = candidate.as_str();
            if !CREDENTIAL_SUFFIXES
                .iter()
                .any(|suffix| name.ends_with(suffix) && name.len() > suffix.len())
            {
                continue;
            }
            if managed.contains(name) || NON_CREDENTIALS.contains(&name) {
                continue;
            }
            found.insert(name.to_string());
        }
    }
    found.into_iter().collect()
}

#[derive(Debug, Default, Eq, PartialEq)]
pub struct OauthHints {
    pub requires_public_url: bool,
    pub hints: Vec<String>,
}

pub fn detect_oauth(scan: &RepoScan) -> OauthHints {
    let mut hints = OauthHints::default();
    for file in scan
        .sources
        .iter()
        .chain(scan.manifests.iter())
        .chain(scan.compose.iter())
    {
        for (marker, hint) in OAUTH_MARKERS {
            if file.content.contains(marker) && !hints.hints.iter().any(|h| h == hint) {
                hints.requires_public_url = true;
                hints.hints.push(hint.to_string());
            }
        }
    }
    hints
}
