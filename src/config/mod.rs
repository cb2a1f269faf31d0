//! Application configuration
//!
//! Mirrors the layering the rest of the corpus uses: a `Config` struct with
//! a full `Default` impl, loaded from a TOML file (writing the defaults out
//! on first run), then overlaid by environment variables and finally by CLI
//! flags in `main`.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub cache: CacheConfig,
    pub resolver: ResolverConfig,
    pub upstream_policy: UpstreamPolicyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Absolute base URL emitted in rewritten playlist URLs, e.g.
    /// `http://localhost:8080`. Overridden by the `SERVER_BASE_URL` env var.
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub max_redirects: usize,
    pub retry_attempts: u32,
    /// Verify upstream TLS certificates unless a more specific Upstream
    /// Policy rule overrides it. Overridden by the `VERIFY_SSL` env var.
    pub verify_ssl: bool,
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub playlist_ttl_secs: u64,
    pub playlist_max_entries: usize,
    pub segment_max_items: usize,
    pub segment_max_total_bytes: u64,
    pub segment_max_item_bytes: u64,
    pub key_max_items: usize,
    /// Run the expired-playlist sweep every Nth request.
    pub sweep_every_n_requests: u64,
}

impl CacheConfig {
    pub fn playlist_ttl(&self) -> Duration {
        Duration::from_secs(self.playlist_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Compiled-in fallback landing base, used until a remote descriptor
    /// refresh succeeds and whenever refreshes subsequently fail.
    pub landing_base_fallback: String,
    /// Remote text descriptor containing `src = "<base>"`.
    pub landing_base_descriptor_url: String,
    pub landing_base_refresh_interval_secs: u64,
}

impl ResolverConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.landing_base_refresh_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamPolicyConfig {
    /// General outbound proxy list (comma-separated at the env-var layer),
    /// used when no more specific rule matches.
    pub general_proxy: Vec<String>,
    pub general_ssl_verify: bool,
    /// Host substrings that bypass proxying/rewriting entirely (§9).
    pub bypass_hosts: Vec<String>,
    /// Host substrings that are always fetched directly, never through
    /// `general_proxy` or any domain rule (§4.1: GitHub hosts for the
    /// resolver's landing-base descriptor).
    pub direct_hosts: Vec<String>,
    /// When non-empty, `/proxy/m3u` rejects (403 `PolicyDenied`, §7) any
    /// `url` whose host doesn't contain one of these substrings. Empty
    /// (the default) disables the restriction entirely.
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    pub domain_rules: Vec<DomainRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainRule {
    /// Hostname substring match, case-insensitive.
    pub host_contains: String,
    pub proxy: Vec<String>,
    pub verify_ssl: bool,
    pub default_referer: Option<String>,
    pub default_origin: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                base_url: "http://localhost:8080".to_string(),
            },
            client: ClientConfig {
                connect_timeout_secs: 10,
                read_timeout_secs: 30,
                max_redirects: 5,
                retry_attempts: 3,
                verify_ssl: false,
            },
            cache: CacheConfig {
                playlist_ttl_secs: 15,
                playlist_max_entries: 200,
                segment_max_items: 2000,
                segment_max_total_bytes: 512 * 1024 * 1024,
                segment_max_item_bytes: 8 * 1024 * 1024,
                key_max_items: 1000,
                sweep_every_n_requests: 100,
            },
            resolver: ResolverConfig {
                landing_base_fallback: "https://daddylive.dad/".to_string(),
                landing_base_descriptor_url:
                    "https://raw.githubusercontent.com/dlhd-config/config/main/base.txt"
                        .to_string(),
                landing_base_refresh_interval_secs: 3600,
            },
            upstream_policy: UpstreamPolicyConfig {
                general_proxy: Vec::new(),
                general_ssl_verify: false,
                bypass_hosts: vec!["pluto.tv".to_string()],
                direct_hosts: vec!["github.com".to_string(), "githubusercontent.com".to_string()],
                allowed_hosts: Vec::new(),
                domain_rules: vec![
                    DomainRule {
                        host_contains: "newkso.ru".to_string(),
                        proxy: Vec::new(),
                        verify_ssl: false,
                        default_referer: Some("https://forcedtoplay.xyz/".to_string()),
                        default_origin: Some("https://forcedtoplay.xyz".to_string()),
                    },
                    DomainRule {
                        host_contains: "vavoo.to".to_string(),
                        proxy: Vec::new(),
                        verify_ssl: true,
                        default_referer: None,
                        default_origin: None,
                    },
                    DomainRule {
                        host_contains: "oha.to".to_string(),
                        proxy: Vec::new(),
                        verify_ssl: true,
                        default_referer: None,
                        default_origin: None,
                    },
                ],
            },
        }
    }
}

impl Config {
    /// Load configuration from `CONFIG_FILE` (default `config.toml`),
    /// writing the defaults out if the file doesn't exist yet, then overlay
    /// recognised environment variables (spec §6).
    pub fn load() -> Result<Self> {
        let config_file =
            std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".to_string());

        let mut config = if std::path::Path::new(&config_file).exists() {
            let contents = std::fs::read_to_string(&config_file)?;
            toml::from_str(&contents)?
        } else {
            let default_config = Self::default();
            let contents = toml::to_string_pretty(&default_config)?;
            std::fs::write(&config_file, contents)?;
            default_config
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("VERIFY_SSL") {
            self.client.verify_ssl = parse_bool(&v);
        }
        if let Ok(v) = std::env::var("REQUEST_TIMEOUT") {
            if let Ok(secs) = v.parse() {
                self.client.read_timeout_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("SERVER_BASE_URL") {
            self.server.base_url = v;
        }
        if let Ok(v) = std::env::var("GENERAL_PROXY") {
            self.upstream_policy.general_proxy = split_csv(&v);
        }
        if let Ok(v) = std::env::var("SOCKS5_PROXY") {
            self.upstream_policy.general_proxy.extend(split_csv(&v));
        }
        if let Ok(v) = std::env::var("HTTP_PROXY") {
            self.upstream_policy.general_proxy.extend(split_csv(&v));
        }
        if let Ok(v) = std::env::var("HTTPS_PROXY") {
            self.upstream_policy.general_proxy.extend(split_csv(&v));
        }
        if let Ok(v) = std::env::var("PORT") {
            if let Ok(port) = v.parse() {
                self.server.port = port;
            }
        }
    }
}

fn parse_bool(v: &str) -> bool {
    matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn split_csv(v: &str) -> Vec<String> {
    v.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_bounds() {
        let config = Config::default();
        assert!(config.cache.segment_max_item_bytes < config.cache.segment_max_total_bytes);
        assert_eq!(config.client.max_redirects, 5);
        assert_eq!(config.upstream_policy.bypass_hosts, vec!["pluto.tv"]);
    }

    #[test]
    fn parse_bool_recognises_common_truthy_forms() {
        assert!(parse_bool("true"));
        assert!(parse_bool("1"));
        assert!(parse_bool("YES"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool(""));
    }

    #[test]
    fn split_csv_trims_and_drops_empties() {
        assert_eq!(
            split_csv(" http://a:1 , , http://b:2"),
            vec!["http://a:1", "http://b:2"]
        );
    }
}
