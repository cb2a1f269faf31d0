//! Playlist Rewriter (spec §4.6).
//!
//! Grounded in `original_source/app.py`'s `detect_m3u_type`, `proxy_m3u` and
//! `replace_key_uri`: a line-by-line pass over the playlist body, resolving
//! relative segment/key URIs against the post-redirect URL (`urljoin`) and
//! rewriting them to point back at this proxy's own `/proxy/ts` and
//! `/proxy/key` endpoints. Master-list directive handling (`#EXTHTTP` /
//! `#EXTVLCOPT`) supplements the Python source per spec §4.2/§4.6.

use regex::Regex;
use std::sync::OnceLock;
use url::Url;

use crate::headers::HeaderParams;
use crate::http::UpstreamPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistKind {
    /// A media playlist — carries `#EXTINF` segment entries.
    Media,
    /// A master/channel list — one entry per line, no `#EXTINF` pairing.
    Master,
}

/// Mirrors `detect_m3u_type()`: an HLS media playlist declares both the
/// `#EXTM3U` header and at least one `#EXTINF` tag; anything else that
/// *starts with* `#EXTM3U` is treated as a channel list (spec §4.6 Detection:
/// "anything else that starts with `#EXTM3U` is treated as `m3u`"). A body
/// that doesn't start with `#EXTM3U` at all is neither — `None` signals the
/// caller to surface a resolution failure rather than pass through
/// non-playlist content.
pub fn detect_kind(body: &str) -> Option<PlaylistKind> {
    if !body.trim_start().starts_with("#EXTM3U") {
        return None;
    }
    if body.contains("#EXTINF") {
        Some(PlaylistKind::Media)
    } else {
        Some(PlaylistKind::Master)
    }
}

fn key_uri_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"URI="([^"]+)""#).unwrap())
}

/// Resolve `maybe_relative` against `base_url`. `Url::join` implements the
/// same RFC 3986 relative-resolution algorithm as Python's `urljoin`, so no
/// manual "strip to directory" step is needed.
fn resolve(base_url: &str, maybe_relative: &str) -> String {
    match Url::parse(base_url).and_then(|base| base.join(maybe_relative)) {
        Ok(joined) => joined.to_string(),
        Err(_) => maybe_relative.to_string(),
    }
}

pub struct MediaRewriteOptions<'a> {
    /// This proxy's own externally-reachable base URL (e.g.
    /// `https://proxy.example.com`), used to build absolute `/proxy/ts` and
    /// `/proxy/key` links.
    pub server_base_url: &'a str,
    /// The upstream URL the playlist body was actually fetched from, after
    /// following redirects — the base for resolving relative lines.
    pub final_url: &'a str,
    /// Headers that were forwarded to fetch this playlist; carried forward
    /// onto every rewritten segment/key link so the player's subsequent
    /// requests keep the same auth context.
    pub headers: &'a HeaderParams,
}

/// Rewrite a fetched media playlist so every segment and key URI routes back
/// through this proxy (spec §4.6). Lines that are neither a segment entry
/// nor an `#EXT-X-KEY` tag pass through untouched.
pub fn rewrite_media_playlist(body: &str, opts: &MediaRewriteOptions<'_>) -> String {
    let header_tail = if opts.headers.is_empty() {
        String::new()
    } else {
        format!("&{}", opts.headers.encode())
    };

    let mut out = String::with_capacity(body.len() + 256);
    for line in body.lines() {
        if let Some(rewritten) = rewrite_key_line(line, opts, &header_tail) {
            out.push_str(&rewritten);
        } else if !line.is_empty() && !line.starts_with('#') {
            let absolute = resolve(opts.final_url, line.trim());
            out.push_str(&format!(
                "{}/proxy/ts?url={}{}",
                opts.server_base_url,
                urlencoding::encode(&absolute),
                header_tail
            ));
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    out
}

fn rewrite_key_line(
    line: &str,
    opts: &MediaRewriteOptions<'_>,
    header_tail: &str,
) -> Option<String> {
    if !line.starts_with("#EXT-X-KEY") {
        return None;
    }
    let captures = key_uri_regex().captures(line)?;
    let original_uri = captures.get(1)?.as_str();
    let absolute = resolve(opts.final_url, original_uri);
    let proxied = format!(
        "{}/proxy/key?url={}{}",
        opts.server_base_url,
        urlencoding::encode(&absolute),
        header_tail
    );
    Some(key_uri_regex().replace(line, |_: &regex::Captures| format!(r#"URI="{proxied}""#)).into_owned())
}

/// Directives accumulated from `#EXTHTTP` / `#EXTVLCOPT` lines, applying only
/// to the next non-comment URL line (spec §4.2). Neither directive appears
/// in `original_source/app.py`; both are carried over from real-world M3U
/// channel lists per spec's own description.
#[derive(Default)]
struct PendingDirectives(HeaderParams);

impl PendingDirectives {
    fn absorb_exthttp(&mut self, line: &str) {
        let Some(json_start) = line.find('{') else { return };
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&line[json_start..]) else {
            return;
        };
        let Some(map) = value.as_object() else { return };
        for (k, v) in map {
            if let Some(v) = v.as_str() {
                self.0.insert(k.clone(), v.to_string());
            }
        }
    }

    fn absorb_extvlcopt(&mut self, line: &str) {
        let Some(rest) = line.strip_prefix("#EXTVLCOPT:") else {
            return;
        };
        for pair in rest.split(',') {
            let mut parts = pair.splitn(2, '=');
            let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
                continue;
            };
            match key.trim().to_ascii_lowercase().as_str() {
                "http-user-agent" => self.0.insert("User-Agent", value.trim().to_string()),
                "http-referrer" | "http-referer" => {
                    self.0.insert("Referer", value.trim().to_string())
                }
                "http-cookie" => self.0.insert("Cookie", value.trim().to_string()),
                "http-header" => {
                    if let Some((name, val)) = value.split_once(':') {
                        self.0.insert(name.trim().to_string(), val.trim().to_string());
                    }
                }
                _ => {}
            }
        }
    }

    fn take(&mut self) -> HeaderParams {
        std::mem::take(&mut self.0)
    }
}

/// Rewrite a master/channel list fetched through the `/proxy` ingest path
/// (spec §4.6): every entry URL is rewritten to `/proxy/m3u?url=...`
/// carrying any headers accumulated from preceding `#EXTHTTP`/`#EXTVLCOPT`
/// directives, double-encoded because the whole tail sits inside a `url=`
/// value that will itself be decoded once by the player and once by this
/// proxy. Hosts matching `UpstreamPolicy::bypasses_rewrite` (e.g. pluto.tv)
/// are passed through unrewritten.
pub fn rewrite_master_ingest(body: &str, server_base_url: &str, policy: &UpstreamPolicy) -> String {
    let mut pending = PendingDirectives::default();
    let mut out = String::with_capacity(body.len() + 256);

    for line in body.lines() {
        if line.starts_with("#EXTHTTP:") {
            pending.absorb_exthttp(line);
            out.push_str(line);
        } else if line.starts_with("#EXTVLCOPT:") {
            pending.absorb_extvlcopt(line);
            out.push_str(line);
        } else if !line.is_empty() && !line.starts_with('#') {
            let url = line.trim();
            let headers = pending.take();
            if policy.bypasses_rewrite(url) {
                out.push_str(url);
            } else {
                let tail = if headers.is_empty() {
                    String::new()
                } else {
                    format!("%26{}", headers.encode_double())
                };
                out.push_str(&format!(
                    "{}/proxy/m3u?url={}{}",
                    server_base_url,
                    urlencoding::encode(url),
                    tail
                ));
            }
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_media_playlist_vs_master_list() {
        let media = "#EXTM3U\n#EXTINF:10,\nsegment0.ts\n";
        let channel_list_with_extinf_metadata = "#EXTM3U\n#EXTINF:-1,Channel\nhttps://example.com/chan.m3u8\n";
        assert_eq!(detect_kind(media), Some(PlaylistKind::Media));
        // still Media: #EXTINF is present even though the entry is a channel, not a segment.
        assert_eq!(detect_kind(channel_list_with_extinf_metadata), Some(PlaylistKind::Media));
        assert_eq!(
            detect_kind("#EXTM3U\nhttps://example.com/chan.m3u8\n"),
            Some(PlaylistKind::Master)
        );
    }

    #[test]
    fn body_not_starting_with_extm3u_is_neither_kind() {
        assert_eq!(detect_kind("<html>no player here</html>"), None);
        // #EXTM3U present but not at the start doesn't count either.
        assert_eq!(detect_kind("garbage\n#EXTM3U\n#EXTINF:10,\nsegment0.ts\n"), None);
    }

    #[test]
    fn rewrites_relative_segment_lines_to_proxy_ts() {
        let headers = HeaderParams::new();
        let opts = MediaRewriteOptions {
            server_base_url: "https://relay.example.com",
            final_url: "https://origin.example.com/live/index.m3u8",
            headers: &headers,
        };
        let body = "#EXTM3U\n#EXTINF:10,\nsegment0.ts\n";
        let rewritten = rewrite_media_playlist(body, &opts);
        assert!(rewritten.contains("https://relay.example.com/proxy/ts?url=https%3A%2F%2Forigin.example.com%2Flive%2Fsegment0.ts"));
    }

    #[test]
    fn rewrites_key_uri_and_preserves_rest_of_tag() {
        let headers = HeaderParams::new();
        let opts = MediaRewriteOptions {
            server_base_url: "https://relay.example.com",
            final_url: "https://origin.example.com/live/index.m3u8",
            headers: &headers,
        };
        let body = r#"#EXT-X-KEY:METHOD=AES-128,URI="key.bin",IV=0x00
segment0.ts
"#;
        let rewritten = rewrite_media_playlist(body, &opts);
        assert!(rewritten.contains("METHOD=AES-128"));
        assert!(rewritten.contains("IV=0x00"));
        assert!(rewritten.contains("/proxy/key?url=https%3A%2F%2Forigin.example.com%2Flive%2Fkey.bin"));
    }

    #[test]
    fn carries_forwarded_headers_onto_rewritten_links() {
        let mut headers = HeaderParams::new();
        headers.insert("Referer", "https://a.example/");
        let opts = MediaRewriteOptions {
            server_base_url: "https://relay.example.com",
            final_url: "https://origin.example.com/live/index.m3u8",
            headers: &headers,
        };
        let rewritten = rewrite_media_playlist("#EXTM3U\n#EXTINF:10,\nsegment0.ts\n", &opts);
        assert!(rewritten.contains("h_referer=https%3A%2F%2Fa.example%2F"));
    }

    fn policy() -> UpstreamPolicy {
        UpstreamPolicy::new(crate::config::UpstreamPolicyConfig {
            general_proxy: vec![],
            general_ssl_verify: true,
            bypass_hosts: vec!["pluto.tv".to_string()],
            direct_hosts: vec![],
            allowed_hosts: vec![],
            domain_rules: vec![],
        })
    }

    #[test]
    fn master_ingest_rewrites_entries_to_proxy_m3u() {
        let body = "#EXTM3U\nhttps://origin.example.com/chan1.m3u8\n";
        let rewritten = rewrite_master_ingest(body, "https://relay.example.com", &policy());
        assert!(rewritten.contains("https://relay.example.com/proxy/m3u?url=https%3A%2F%2Forigin.example.com%2Fchan1.m3u8"));
    }

    #[test]
    fn master_ingest_passes_bypassed_hosts_through_unrewritten() {
        let body = "#EXTM3U\nhttps://service.pluto.tv/live/x.m3u8\n";
        let rewritten = rewrite_master_ingest(body, "https://relay.example.com", &policy());
        assert!(rewritten.contains("https://service.pluto.tv/live/x.m3u8"));
        assert!(!rewritten.contains("/proxy/m3u"));
    }

    #[test]
    fn extvlcopt_directive_is_carried_into_the_next_entrys_headers() {
        let body = "#EXTM3U\n#EXTVLCOPT:http-user-agent=VLC/3.0,http-referrer=https://ref.example/\nhttps://origin.example.com/chan1.m3u8\n";
        let rewritten = rewrite_master_ingest(body, "https://relay.example.com", &policy());
        assert!(rewritten.contains("%26h_"));
    }

    #[test]
    fn exthttp_directive_only_applies_to_the_immediately_following_url() {
        let body = "#EXTM3U\n#EXTHTTP:{\"Referer\":\"https://ref.example/\"}\nhttps://origin.example.com/chan1.m3u8\nhttps://origin.example.com/chan2.m3u8\n";
        let rewritten = rewrite_master_ingest(body, "https://relay.example.com", &policy());
        let lines: Vec<&str> = rewritten.lines().filter(|l| l.contains("/proxy/m3u")).collect();
        assert!(lines[0].contains("%26h_"));
        assert!(!lines[1].contains("%26h_"));
    }
}
