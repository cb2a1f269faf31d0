//! Stream Resolver (spec §4.5).
//!
//! Normalises a handful of indirect-stream URL shapes to a canonical landing
//! page, then either takes the direct-M3U8 fast path or walks an
//! iframe-chain auth handshake to arrive at a concrete `.m3u8` URL. Never
//! fails upward: every dead end degrades to returning the cleaned input URL
//! with whatever headers the caller already had.
//!
//! Grounded in `original_source/app.py`'s `DLHDExtractor`
//! (`_extract_player_url`, `_extract_auth_data`, `_extract_auth_url_base`,
//! `_lookup_server`) for the bare-literal extraction fallback; the
//! base64-wrapped identifier variant is this implementation's primary path
//! per spec §4.5.c, supplementing rather than replacing the Python source.

mod landing_base;

pub use landing_base::LandingBase;

use std::sync::Arc;

use base64::Engine;
use regex::Regex;
use std::sync::OnceLock;
use urlencoding::encode as url_encode;

use crate::config::ResolverConfig;
use crate::headers::HeaderParams;
use crate::http::{SharedClientPool, UpstreamPolicy};

/// Result of a resolution attempt: the URL to actually fetch as the media
/// playlist, and the headers that fetch needs.
#[derive(Debug, Clone)]
pub struct ResolvedStream {
    pub url: String,
    pub headers: HeaderParams,
}

pub struct StreamResolver {
    client: SharedClientPool,
    policy: Arc<UpstreamPolicy>,
    landing_base: LandingBase,
}

impl StreamResolver {
    pub fn new(config: ResolverConfig, client: SharedClientPool, policy: Arc<UpstreamPolicy>) -> Self {
        Self {
            client,
            policy,
            landing_base: LandingBase::new(config),
        }
    }

    /// Resolve `url` to a concrete media-playlist URL. Always succeeds from
    /// the caller's point of view — a resolution failure simply returns the
    /// (possibly normalised) input back with `headers` unchanged.
    pub async fn resolve(&self, url: &str, headers: HeaderParams) -> ResolvedStream {
        let cleaned = url.trim().to_string();
        let normalised = self.normalise(&cleaned).await;

        match self.try_resolve(&normalised, &headers).await {
            Some(resolved) => resolved,
            None => ResolvedStream {
                url: normalised,
                headers,
            },
        }
    }

    /// Step 1 (§4.5): rewrite known indirect URL shapes to a canonical
    /// landing URL. URLs that don't match any pattern pass through as-is.
    async fn normalise(&self, url: &str) -> String {
        if let Some(id) = extract_indirect_id(url) {
            let base = self.landing_base.current(&self.client, &self.policy).await;
            return format!("{base}watch/stream-{id}.php");
        }
        url.to_string()
    }

    async fn try_resolve(&self, landing_url: &str, caller_headers: &HeaderParams) -> Option<ResolvedStream> {
        let resolver_headers = resolver_headers(landing_url);
        let target = self.policy.resolve(landing_url);
        let merged = resolver_headers.clone().with_defaults(&target.default_headers);

        let response = self
            .client
            .fetch(landing_url, &target, merged.to_header_map())
            .await
            .ok()?;
        let final_url = response.final_url.clone();
        let body = response.inner.text().await.ok()?;

        // Step 2: direct-M3U8 fast path.
        if body.trim_start().starts_with("#EXTM3U") {
            return Some(ResolvedStream {
                url: final_url,
                headers: resolver_headers,
            });
        }

        // Step 3: iframe-chain handshake.
        self.iframe_chain_handshake(&final_url, &body, caller_headers).await
    }

    async fn iframe_chain_handshake(
        &self,
        landing_url: &str,
        landing_body: &str,
        caller_headers: &HeaderParams,
    ) -> Option<ResolvedStream> {
        let player_href = extract_player_2_href(landing_body).or_else(|| extract_embed_iframe(landing_body))?;
        let player_url = resolve_url(landing_url, &player_href);
        let player_headers = resolver_headers(&player_url);
        let player_target = self.policy.resolve(&player_url);
        let player_response = self
            .client
            .fetch(&player_url, &player_target, player_headers.to_header_map())
            .await
            .ok()?;
        let player_final_url = player_response.final_url.clone();
        let player_body = player_response.inner.text().await.ok()?;

        let iframe_href = extract_first_iframe_src(&player_body)?;
        let iframe_url = resolve_url(&player_final_url, &iframe_href);
        let iframe_origin = origin_of(&iframe_url);
        let mut iframe_headers = HeaderParams::new();
        iframe_headers.insert("Referer", format!("{iframe_origin}/"));
        iframe_headers.insert("Origin", iframe_origin.clone());
        iframe_headers.insert("User-Agent", default_user_agent());

        let iframe_target = self.policy.resolve(&iframe_url);
        let iframe_response = self
            .client
            .fetch(&iframe_url, &iframe_target, iframe_headers.to_header_map())
            .await
            .ok()?;
        let iframe_final_url = iframe_response.final_url.clone();
        let iframe_body = iframe_response.inner.text().await.ok()?;
        let _ = caller_headers; // caller's own headers don't carry into the handshake (spec §4.5.b: Referer/Origin are derived fresh).

        let auth = extract_auth_params_base64(&iframe_body)
            .or_else(|| extract_auth_params_bare_literal(&iframe_body, &iframe_final_url))?;

        let auth_url = format!(
            "{}{}?channel_id={}&ts={}&rnd={}&sig={}",
            auth.auth_host,
            auth.auth_path,
            auth.channel_key,
            auth.auth_ts,
            auth.auth_rnd,
            url_encode(&auth.auth_sig),
        );
        let auth_target = self.policy.resolve(&auth_url);
        let auth_response = self
            .client
            .fetch(&auth_url, &auth_target, iframe_headers.to_header_map())
            .await
            .ok()?;
        if !auth_response.status.is_success() {
            return None;
        }

        let lookup_path = extract_server_lookup_path(&iframe_body)?;
        let lookup_url = format!("{iframe_origin}{lookup_path}{}", auth.channel_key);
        let lookup_target = self.policy.resolve(&lookup_url);
        let lookup_response = self
            .client
            .fetch(&lookup_url, &lookup_target, iframe_headers.to_header_map())
            .await
            .ok()?;
        let lookup_body = lookup_response.inner.text().await.ok()?;
        let lookup_json: serde_json::Value = serde_json::from_str(&lookup_body).ok()?;
        let server_key = lookup_json.get("server_key")?.as_str()?.to_string();

        let host_fragment = extract_m3u8_host_fragment(&iframe_body)?;

        Some(ResolvedStream {
            url: format!("https://{server_key}{host_fragment}{server_key}/{}/mono.m3u8", auth.channel_key),
            headers: iframe_headers,
        })
    }
}

struct AuthParams {
    auth_host: String,
    auth_path: String,
    channel_key: String,
    auth_ts: String,
    auth_rnd: String,
    auth_sig: String,
}

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static resolver regex is valid")
}

fn default_user_agent() -> &'static str {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36"
}

fn resolver_headers(url: &str) -> HeaderParams {
    let origin = origin_of(url);
    let mut headers = HeaderParams::new();
    headers.insert("Referer", format!("{origin}/"));
    headers.insert("Origin", origin);
    headers.insert("User-Agent", default_user_agent());
    headers
}

fn origin_of(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => format!(
            "{}://{}",
            parsed.scheme(),
            parsed.host_str().unwrap_or_default()
        ),
        Err(_) => String::new(),
    }
}

fn resolve_url(base: &str, maybe_relative: &str) -> String {
    match url::Url::parse(base).and_then(|b| b.join(maybe_relative)) {
        Ok(joined) => joined.to_string(),
        Err(_) => maybe_relative.to_string(),
    }
}

/// §4.5 step 1: recognise `/premium<digits>/mono.m3u8`, `oha.to/play/<digits>/index.m3u8`,
/// and bare integer inputs, returning the extracted numeric id.
fn extract_indirect_id(url: &str) -> Option<String> {
    static PREMIUM: OnceLock<Regex> = OnceLock::new();
    static OHA: OnceLock<Regex> = OnceLock::new();

    if let Some(c) = PREMIUM
        .get_or_init(|| re(r"/premium(\d+)/mono\.m3u8$"))
        .captures(url)
    {
        return Some(c[1].to_string());
    }
    if let Some(c) = OHA
        .get_or_init(|| re(r"oha\.to/play/(\d+)/index\.m3u8"))
        .captures(url)
    {
        return Some(c[1].to_string());
    }
    if !url.is_empty() && url.chars().all(|c| c.is_ascii_digit()) {
        return Some(url.to_string());
    }
    None
}

fn extract_player_2_href(html: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        re(r#"(?is)<a[^>]+href=["']([^"']+)["'][^>]*>\s*Player\s*2\s*</a>"#)
    })
    .captures(html)
    .map(|c| c[1].to_string())
}

/// original_source/app.py's `_extract_player_url`: a direct iframe with
/// `allowfullscreen`, or one whose src mentions a known embed family.
fn extract_embed_iframe(html: &str) -> Option<String> {
    static WITH_FULLSCREEN: OnceLock<Regex> = OnceLock::new();
    static KNOWN_FAMILY: OnceLock<Regex> = OnceLock::new();

    if let Some(c) = WITH_FULLSCREEN
        .get_or_init(|| re(r#"(?is)<iframe[^>]*src=["']([^"']+)["'][^>]*allowfullscreen"#))
        .captures(html)
    {
        return Some(c[1].trim().to_string());
    }
    KNOWN_FAMILY
        .get_or_init(|| {
            re(r#"(?is)<iframe[^>]*src=["']([^"']*(?:premiumtv|daddylivehd|vecloud)[^"']*)["']"#)
        })
        .captures(html)
        .map(|c| c[1].trim().to_string())
}

fn extract_first_iframe_src(html: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| re(r#"(?is)<iframe[^>]+src=["']([^"']+)["']"#))
        .captures(html)
        .map(|c| c[1].trim().to_string())
}

/// §4.5.c primary path: `channelKey` as a literal, and `a`..`e` bound to
/// base64 blobs decoding to authHost/authPath/authTs/authRnd/authSig.
fn extract_auth_params_base64(body: &str) -> Option<AuthParams> {
    static CHANNEL_KEY: OnceLock<Regex> = OnceLock::new();
    let channel_key = CHANNEL_KEY
        .get_or_init(|| re(r#"(?m)var\s+channelKey\s*=\s*["']([^"']+)["']"#))
        .captures(body)?
        .get(1)?
        .as_str()
        .to_string();

    let a = decode_base64_var(body, "a")?;
    let b = decode_base64_var(body, "b")?;
    let c = decode_base64_var(body, "c")?;
    let d = decode_base64_var(body, "d")?;
    let e = decode_base64_var(body, "e")?;

    Some(AuthParams {
        auth_host: a,
        auth_path: b,
        auth_ts: c,
        auth_rnd: d,
        auth_sig: e,
        channel_key,
    })
}

fn decode_base64_var(body: &str, ident: &str) -> Option<String> {
    let pattern = format!(r#"(?m)var\s+{ident}\s*=\s*["']([^"']+)["']"#);
    let captured = Regex::new(&pattern).ok()?.captures(body)?.get(1)?.as_str().to_string();
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(captured.trim())
        .ok()?;
    String::from_utf8(decoded).ok()
}

/// Fallback path grounded directly in `_extract_auth_data` /
/// `_extract_auth_url_base`: the bare-literal variant with no base64 layer,
/// where the auth path is always `/auth.php`.
fn extract_auth_params_bare_literal(body: &str, iframe_url: &str) -> Option<AuthParams> {
    static CHANNEL_KEY: OnceLock<Regex> = OnceLock::new();
    static AUTH_TS: OnceLock<Regex> = OnceLock::new();
    static AUTH_RND: OnceLock<Regex> = OnceLock::new();
    static AUTH_SIG: OnceLock<Regex> = OnceLock::new();
    static AUTH_URL_FETCH: OnceLock<Regex> = OnceLock::new();
    static AUTH_URL_DOMAIN: OnceLock<Regex> = OnceLock::new();

    let channel_key = CHANNEL_KEY
        .get_or_init(|| re(r#"(?m)var\s+channelKey\s*=\s*["']([^"']+)["']"#))
        .captures(body)?[1]
        .to_string();
    let auth_ts = AUTH_TS
        .get_or_init(|| re(r#"(?m)var\s+authTs\s*=\s*["']([^"']+)["']"#))
        .captures(body)?[1]
        .to_string();
    let auth_rnd = AUTH_RND
        .get_or_init(|| re(r#"(?m)var\s+authRnd\s*=\s*["']([^"']+)["']"#))
        .captures(body)?[1]
        .to_string();
    let auth_sig = AUTH_SIG
        .get_or_init(|| re(r#"(?m)var\s+authSig\s*=\s*["']([^"']+)["']"#))
        .captures(body)?[1]
        .to_string();

    let auth_host = AUTH_URL_FETCH
        .get_or_init(|| re(r#"fetchWithRetry\(['"]([^'"]*/auth\.php)"#))
        .captures(body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().split("/auth.php").next().unwrap_or_default().to_string())
        .or_else(|| {
            AUTH_URL_DOMAIN
                .get_or_init(|| re(r#"['"]https://([^/'"]+)(?:/[^'"]*)?/auth\.php"#))
                .captures(body)
                .map(|c| format!("https://{}", &c[1]))
        })
        .unwrap_or_else(|| origin_of(iframe_url));

    Some(AuthParams {
        auth_host,
        auth_path: "/auth.php".to_string(),
        channel_key,
        auth_ts,
        auth_rnd,
        auth_sig,
    })
}

fn extract_server_lookup_path(body: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| re(r#"fetchWithRetry\(['"]([^'"]*server_lookup[^'"]*)['"]"#))
        .captures(body)
        .map(|c| c[1].to_string())
        .or_else(|| Some("/server_lookup.php?channel_id=".to_string()))
}

/// §4.5.f: the string between the third pair of quoted literals following
/// an `m3u8 =` assignment in the iframe body.
fn extract_m3u8_host_fragment(body: &str) -> Option<String> {
    let m3u8_at = body.find("m3u8")?;
    let rest = &body[m3u8_at..];
    static QUOTED: OnceLock<Regex> = OnceLock::new();
    let quoted = QUOTED.get_or_init(|| re(r#"["']([^"']*)["']"#));
    quoted.captures_iter(rest).nth(2).map(|c| c[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_premium_digits_suffix() {
        assert_eq!(
            extract_indirect_id("https://example.com/premium123/mono.m3u8"),
            Some("123".to_string())
        );
    }

    #[test]
    fn recognises_oha_to_play_path() {
        assert_eq!(
            extract_indirect_id("https://oha.to/play/456/index.m3u8"),
            Some("456".to_string())
        );
    }

    #[test]
    fn recognises_bare_integer_input() {
        assert_eq!(extract_indirect_id("789"), Some("789".to_string()));
    }

    #[test]
    fn non_matching_url_is_not_an_indirect_id() {
        assert_eq!(extract_indirect_id("https://example.com/live/a.m3u8"), None);
    }

    #[test]
    fn extracts_player_2_anchor_href() {
        let html = r#"<div><a href="/player2.php?id=1">Player 2</a></div>"#;
        assert_eq!(extract_player_2_href(html), Some("/player2.php?id=1".to_string()));
    }

    #[test]
    fn extracts_iframe_with_allowfullscreen_when_no_player_2() {
        let html = r#"<iframe src="https://embed.example/x" allowfullscreen></iframe>"#;
        assert_eq!(extract_embed_iframe(html), Some("https://embed.example/x".to_string()));
    }

    #[test]
    fn base64_auth_param_extraction_decodes_all_five_identifiers() {
        let enc = |s: &str| base64::engine::general_purpose::STANDARD.encode(s);
        let body = format!(
            r#"var channelKey = "chan-1";
            var a = "{}";
            var b = "{}";
            var c = "{}";
            var d = "{}";
            var e = "{}";"#,
            enc("https://auth.example"),
            enc("/auth.php"),
            enc("1700000000"),
            enc("rnd-value"),
            enc("sig-value"),
        );
        let auth = extract_auth_params_base64(&body).unwrap();
        assert_eq!(auth.auth_host, "https://auth.example");
        assert_eq!(auth.auth_path, "/auth.php");
        assert_eq!(auth.channel_key, "chan-1");
        assert_eq!(auth.auth_sig, "sig-value");
    }

    #[test]
    fn bare_literal_auth_param_extraction_falls_back_without_base64() {
        let body = r#"
            var channelKey = "chan-2";
            var authTs = "1700000001";
            var authRnd = "rnd-2";
            var authSig = "sig-2";
            fetchWithRetry('https://auth2.example/auth.php', {});
        "#;
        let auth = extract_auth_params_bare_literal(body, "https://iframe.example/x").unwrap();
        assert_eq!(auth.auth_host, "https://auth2.example");
        assert_eq!(auth.auth_path, "/auth.php");
        assert_eq!(auth.channel_key, "chan-2");
    }

    #[test]
    fn server_lookup_path_falls_back_to_conventional_default() {
        assert_eq!(
            extract_server_lookup_path("no fetchWithRetry call here"),
            Some("/server_lookup.php?channel_id=".to_string())
        );
    }

    #[test]
    fn m3u8_host_fragment_picks_the_third_quoted_literal() {
        let body = r#"m3u8 = "first" + "second" + "new." + "fourth";"#;
        assert_eq!(extract_m3u8_host_fragment(body), Some("new.".to_string()));
    }

    #[tokio::test]
    async fn resolve_returns_cleaned_input_when_nothing_matches_or_fetch_fails() {
        use crate::config::{ResolverConfig, UpstreamPolicyConfig};
        use crate::http::ClientPool;

        let client = Arc::new(ClientPool::new(crate::config::ClientConfig {
            connect_timeout_secs: 1,
            read_timeout_secs: 1,
            max_redirects: 5,
            retry_attempts: 1,
            verify_ssl: false,
        }));
        let policy = Arc::new(UpstreamPolicy::new(UpstreamPolicyConfig {
            general_proxy: vec![],
            general_ssl_verify: false,
            bypass_hosts: vec![],
            direct_hosts: vec![],
            allowed_hosts: vec![],
            domain_rules: vec![],
        }));
        let resolver = StreamResolver::new(
            ResolverConfig {
                landing_base_fallback: "https://fallback.example/".to_string(),
                landing_base_descriptor_url: "https://this-host-does-not-resolve.invalid/base.txt"
                    .to_string(),
                landing_base_refresh_interval_secs: 3600,
            },
            client,
            policy,
        );

        let resolved = resolver
            .resolve("https://this-host-does-not-resolve.invalid/x.m3u8", HeaderParams::new())
            .await;
        assert_eq!(resolved.url, "https://this-host-does-not-resolve.invalid/x.m3u8");
    }
}
