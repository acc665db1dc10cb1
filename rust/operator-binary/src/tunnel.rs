//! Public-tunnel integration.
//!
//! The host-side tunnel manager records the active tunnel in two places: a
//! `.kindling/tunnel.yaml` file for the CLI and a `kindling-tunnel`
//! ConfigMap in the environment's namespace for the reconciler. While the
//! ConfigMap exists, ingress rules point their primary host at the tunnel
//! URL; the declared host is kept in an annotation and comes back on the
//! pass after the tunnel disappears.

use serde::{Deserialize, Serialize};

/// Name of the ConfigMap the reconciler polls each pass.
pub const TUNNEL_CONFIG_MAP: &str = "kindling-tunnel";
/// Key holding the public URL within the ConfigMap.
pub const TUNNEL_URL_KEY: &str = "url";

/// On-disk record written by the host tunnel manager
/// (`.kindling/tunnel.yaml`).
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TunnelRecord {
    pub url: String,
    pub provider: String,
    pub pid: u32,
}

/// Extracts the host part of a tunnel URL.
pub fn tunnel_host(url: &str) -> Option<String> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let host = rest.split('/').next()?.trim();
    if host.is_empty() {
        return None;
    }
    Some(host.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_extraction() {
        assert_eq!(
            tunnel_host("https://abc123.trycloudflare.com").as_deref(),
            Some("abc123.trycloudflare.com")
        );
        assert_eq!(
            tunnel_host("https://xyz.ngrok.io/some/path").as_deref(),
            Some("xyz.ngrok.io")
        );
        assert_eq!(tunnel_host("not-a-url"), None);
        assert_eq!(tunnel_host("https://"), None);
    }

    #[test]
    fn record_round_trips_through_yaml() {
        let record = TunnelRecord {
            url: "https://abc123.trycloudflare.com".to_string(),
            provider: "cloudflare".to_string(),
            pid: 4242,
        };
        let serialized = serde_yaml::to_string(&record).unwrap();
        assert_eq!(serde_yaml::from_str::<TunnelRecord>(&serialized).unwrap(), record);
    }
}
