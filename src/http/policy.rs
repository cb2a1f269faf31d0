//! Upstream Policy (spec §4.3).
//!
//! Given a destination URL, decides which outbound proxy (if any) to route
//! through, whether to verify the upstream's TLS certificate, and what
//! default headers to attach. Rule matching is a simple hostname-substring
//! table, data-driven via `Config` rather than hardcoded branches — the same
//! shape the rest of the corpus uses for config-carried rule tables (see
//! `DESIGN.md`).

use crate::config::UpstreamPolicyConfig;
use crate::headers::HeaderParams;
use url::Url;

#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    pub proxy: Option<String>,
    pub verify_tls: bool,
    pub default_headers: HeaderParams,
    /// True if this host must always be reached directly, bypassing any
    /// configured proxy (§4.1: GitHub hosts, for the resolver's landing-base
    /// descriptor fetch).
    pub force_direct: bool,
}

pub struct UpstreamPolicy {
    config: UpstreamPolicyConfig,
}

impl UpstreamPolicy {
    pub fn new(config: UpstreamPolicyConfig) -> Self {
        Self { config }
    }

    /// Resolve policy for a destination URL. Unparseable URLs get the
    /// general defaults applied (the client will fail on the malformed URL
    /// itself downstream).
    pub fn resolve(&self, url: &str) -> UpstreamTarget {
        let parsed = Url::parse(url).ok();
        let host = parsed
            .as_ref()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
            .unwrap_or_default();
        // Default Referer/Origin per §4.3: the target's own scheme+host,
        // unless a domain rule below supplies a more specific constant.
        let own_origin = parsed.as_ref().map(|u| format!("{}://{}", u.scheme(), host));

        let force_direct = self
            .config
            .direct_hosts
            .iter()
            .any(|h| host.contains(&h.to_ascii_lowercase()));

        if let Some(rule) = self
            .config
            .domain_rules
            .iter()
            .find(|rule| host.contains(&rule.host_contains.to_ascii_lowercase()))
        {
            tracing::debug!("upstream policy: {} matched domain rule {}", host, rule.host_contains);
            let mut headers = default_headers();
            let referer = rule.default_referer.clone().or_else(|| own_origin.clone().map(|o| format!("{o}/")));
            let origin = rule.default_origin.clone().or_else(|| own_origin.clone());
            if let Some(referer) = referer {
                headers.insert("Referer", referer);
            }
            if let Some(origin) = origin {
                headers.insert("Origin", origin);
            }
            return UpstreamTarget {
                proxy: if force_direct { None } else { pick_proxy(&rule.proxy) },
                verify_tls: rule.verify_ssl,
                default_headers: headers,
                force_direct,
            };
        }

        let mut headers = default_headers();
        if let Some(origin) = &own_origin {
            headers.insert("Referer", format!("{origin}/"));
            headers.insert("Origin", origin.clone());
        }

        UpstreamTarget {
            proxy: if force_direct {
                None
            } else {
                pick_proxy(&self.config.general_proxy)
            },
            verify_tls: self.config.general_ssl_verify,
            default_headers: headers,
            force_direct,
        }
    }

    /// True if `url` is permitted by the (optional) `allowed_hosts`
    /// restriction on `/proxy/m3u` (spec §7 `PolicyDenied`). An empty
    /// `allowed_hosts` list means the restriction is disabled and every
    /// host is permitted.
    pub fn is_allowed(&self, url: &str) -> bool {
        if self.config.allowed_hosts.is_empty() {
            return true;
        }
        let host = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
            .unwrap_or_default();
        self.config
            .allowed_hosts
            .iter()
            .any(|h| host.contains(&h.to_ascii_lowercase()))
    }

    /// True if the URL should be emitted unrewritten by the master-list
    /// ingest path (spec §4.6, §9 "pluto.tv bypass" open question).
    pub fn bypasses_rewrite(&self, url: &str) -> bool {
        let host = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
            .unwrap_or_default();
        self.config
            .bypass_hosts
            .iter()
            .any(|h| host.contains(&h.to_ascii_lowercase()))
    }
}

/// Every policy decision carries at least a User-Agent (spec §4.3: "Default
/// headers are a User-Agent plus Referer/Origin...").
fn default_headers() -> HeaderParams {
    let mut headers = HeaderParams::new();
    headers.insert(
        "User-Agent",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    );
    headers
}

/// Uniformly pick one entry from a comma-separated proxy list (no
/// stickiness), per spec §4.3.
fn pick_proxy(candidates: &[String]) -> Option<String> {
    if candidates.is_empty() {
        None
    } else {
        let idx = fastrand::usize(..candidates.len());
        Some(candidates[idx].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DomainRule;

    fn config() -> UpstreamPolicyConfig {
        UpstreamPolicyConfig {
            general_proxy: vec!["http://general-proxy:8080".to_string()],
            general_ssl_verify: false,
            bypass_hosts: vec!["pluto.tv".to_string()],
            direct_hosts: vec!["github.com".to_string()],
            allowed_hosts: vec![],
            domain_rules: vec![DomainRule {
                host_contains: "vavoo.to".to_string(),
                proxy: vec!["http://vavoo-proxy:1080".to_string()],
                verify_ssl: true,
                default_referer: None,
                default_origin: None,
            }],
        }
    }

    #[test]
    fn falls_back_to_general_rule_when_no_domain_matches() {
        let policy = UpstreamPolicy::new(config());
        let target = policy.resolve("https://example.com/video.m3u8");
        assert_eq!(target.proxy.as_deref(), Some("http://general-proxy:8080"));
        assert!(!target.verify_tls);
        assert!(!target.force_direct);
    }

    #[test]
    fn domain_rule_overrides_general_defaults() {
        let policy = UpstreamPolicy::new(config());
        let target = policy.resolve("https://cdn.vavoo.to/stream.m3u8");
        assert_eq!(target.proxy.as_deref(), Some("http://vavoo-proxy:1080"));
        assert!(target.verify_tls);
    }

    #[test]
    fn direct_hosts_never_receive_a_proxy() {
        let policy = UpstreamPolicy::new(config());
        let target = policy.resolve("https://raw.githubusercontent.com/foo/base.txt");
        assert!(target.proxy.is_none());
        assert!(target.force_direct);
    }

    #[test]
    fn empty_allowed_hosts_permits_everything() {
        let policy = UpstreamPolicy::new(config());
        assert!(policy.is_allowed("https://anything.example/x.m3u8"));
    }

    #[test]
    fn nonempty_allowed_hosts_rejects_unlisted_hosts() {
        let mut cfg = config();
        cfg.allowed_hosts = vec!["trusted.example".to_string()];
        let policy = UpstreamPolicy::new(cfg);
        assert!(policy.is_allowed("https://cdn.trusted.example/x.m3u8"));
        assert!(!policy.is_allowed("https://evil.example/x.m3u8"));
    }

    #[test]
    fn bypass_hosts_are_detected_case_insensitively() {
        let policy = UpstreamPolicy::new(config());
        assert!(policy.bypasses_rewrite("https://service.PLUTO.TV/live/x.m3u8"));
        assert!(!policy.bypasses_rewrite("https://example.com/live/x.m3u8"));
    }

    #[test]
    fn general_rule_defaults_referer_and_origin_to_the_targets_own_host() {
        let policy = UpstreamPolicy::new(config());
        let target = policy.resolve("https://example.com/video.m3u8");
        assert_eq!(target.default_headers.get("origin"), Some("https://example.com"));
        assert_eq!(target.default_headers.get("referer"), Some("https://example.com/"));
        assert!(target.default_headers.get("user-agent").is_some());
    }

    #[test]
    fn domain_rule_default_referer_and_origin_override_the_targets_own_host() {
        let mut cfg = config();
        cfg.domain_rules[0].default_referer = Some("https://forcedtoplay.xyz/".to_string());
        cfg.domain_rules[0].default_origin = Some("https://forcedtoplay.xyz".to_string());
        let policy = UpstreamPolicy::new(cfg);
        let target = policy.resolve("https://cdn.vavoo.to/stream.m3u8");
        assert_eq!(target.default_headers.get("referer"), Some("https://forcedtoplay.xyz/"));
        assert_eq!(target.default_headers.get("origin"), Some("https://forcedtoplay.xyz"));
    }
}
