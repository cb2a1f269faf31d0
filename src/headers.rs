//! Header Codec (spec §4.2).
//!
//! Forwarded request headers travel through the proxy's own URL space as
//! `h_<name>=<value>` query parameters. Grounded directly in
//! `original_source/app.py`'s header dict comprehension and emission:
//!
//! ```python
//! headers = {
//!     unquote(key[2:]).replace("_", "-"): unquote(value).strip()
//!     for key, value in request.args.items()
//!     if key.lower().startswith("h_")
//! }
//! headers_query = "&".join([f"h_{quote(k)}={quote(v)}" for k, v in headers.items()])
//! ```

use std::collections::BTreeMap;

/// An ordered set of headers to forward upstream, keyed case-insensitively
/// for lookup/dedup purposes but preserving the exact casing each header
/// name was inserted with — spec §8 scenario 4 (spec.md:176) requires
/// rewritten segment URLs to carry `h_Referer=...&h_User-Agent=X` verbatim,
/// and `original_source/app.py`'s header dict comprehension never lowercases
/// either. The `BTreeMap` is keyed on the lowercased name so the emitted
/// query string stays stable (useful for the `PlaylistCache` key
/// fingerprint, §3/§4.4) while the value carries the original-case name
/// alongside the header value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderParams(BTreeMap<String, (String, String)>);

impl HeaderParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.0.insert(normalize_name(&name), (name, value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&normalize_name(name)).map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate `(name, value)` pairs in their originally-inserted casing,
    /// ordered by the case-insensitive key.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.values().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Merge `defaults` under `self` — values already present in `self` win.
    /// Used to layer `UpstreamTarget::default_headers` beneath whatever the
    /// caller forwarded explicitly (spec §4.3).
    pub fn with_defaults(mut self, defaults: &HeaderParams) -> Self {
        for (key, (name, value)) in defaults.0.iter() {
            self.0
                .entry(key.clone())
                .or_insert_with(|| (name.clone(), value.clone()));
        }
        self
    }

    /// Render as a `reqwest::header::HeaderMap` for an outbound request.
    /// Entries that are not valid header names/values are skipped rather
    /// than failing the whole request.
    pub fn to_header_map(&self) -> reqwest::header::HeaderMap {
        let mut map = reqwest::header::HeaderMap::new();
        for (name, value) in self.0.values() {
            let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(name.as_bytes()),
                reqwest::header::HeaderValue::from_str(value),
            ) else {
                continue;
            };
            map.insert(name, value);
        }
        map
    }

    /// Decode the `h_*` query parameters of an inbound request into a
    /// header set. Unrelated parameters (`url`, etc.) are ignored.
    pub fn decode(query_pairs: impl Iterator<Item = (String, String)>) -> Self {
        let mut params = HeaderParams::new();
        for (key, value) in query_pairs {
            if key.len() > 2 && key[..2].eq_ignore_ascii_case("h_") {
                let name = urlencoding::decode(&key[2..])
                    .map(|s| s.into_owned())
                    .unwrap_or_else(|_| key[2..].to_string())
                    .replace('_', "-");
                let value = urlencoding::decode(&value)
                    .map(|s| s.into_owned())
                    .unwrap_or(value)
                    .trim()
                    .to_string();
                params.insert(name, value);
            }
        }
        params
    }

    /// Emit as `h_<enc-name>=<enc-value>&...`, single-encoded — used on the
    /// media-playlist rewrite path (§4.2) because those URLs are consumed
    /// directly by the player.
    pub fn encode(&self) -> String {
        self.0
            .values()
            .map(|(k, v)| {
                format!(
                    "h_{}={}",
                    urlencoding::encode(k),
                    urlencoding::encode(v)
                )
            })
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Emit double-encoded, for embedding in the tail of a URL that will
    /// itself be URL-encoded once more (the `/proxy` ingest path, §4.2): the
    /// literal `&` separating `url=...` from the header params becomes
    /// `%26` so the whole tail survives one extra decode round-trip.
    pub fn encode_double(&self) -> String {
        self.0
            .values()
            .map(|(k, v)| {
                format!(
                    "h_{}={}",
                    urlencoding::encode(&urlencoding::encode(k)),
                    urlencoding::encode(&urlencoding::encode(v))
                )
            })
            .collect::<Vec<_>>()
            .join("%26")
    }
}

fn normalize_name(name: &str) -> String {
    name.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(items: &[(&str, &str)]) -> impl Iterator<Item = (String, String)> + '_ {
        items.iter().map(|(k, v)| (k.to_string(), v.to_string()))
    }

    #[test]
    fn decodes_h_prefixed_params_only() {
        let decoded = HeaderParams::decode(pairs(&[
            ("url", "https://example.com"),
            ("h_Referer", "https%3A%2F%2Fa.example%2F"),
            ("h_User_Agent", "X"),
        ]));
        assert_eq!(decoded.get("referer"), Some("https://a.example/"));
        assert_eq!(decoded.get("user-agent"), Some("X"));
        assert_eq!(decoded.iter().count(), 2);
    }

    #[test]
    fn round_trips_for_arbitrary_utf8_values() {
        let mut original = HeaderParams::new();
        original.insert("Referer", "https://a.example/páth?q=1&x=é");
        original.insert("User-Agent", "Mozilla/5.0 (ünïcode)");

        let encoded = original.encode();
        let query = encoded
            .split('&')
            .map(|pair| {
                let mut it = pair.splitn(2, '=');
                (
                    it.next().unwrap().to_string(),
                    it.next().unwrap_or("").to_string(),
                )
            });
        let round_tripped = HeaderParams::decode(query);
        assert_eq!(round_tripped, original);
    }

    #[test]
    fn single_encode_preserves_original_casing_and_joins_with_ampersand() {
        let mut params = HeaderParams::new();
        params.insert("Referer", "https://a.example/");
        params.insert("User-Agent", "X");
        assert_eq!(
            params.encode(),
            "h_Referer=https%3A%2F%2Fa.example%2F&h_User-Agent=X"
        );
    }

    #[test]
    fn double_encode_uses_percent26_separator() {
        let mut params = HeaderParams::new();
        params.insert("Referer", "https://a.example/");
        params.insert("User-Agent", "X");
        let doubled = params.encode_double();
        assert!(doubled.contains("%26"));
        assert!(!doubled.contains('&'));
    }

    #[test]
    fn with_defaults_never_overrides_an_explicit_value() {
        let mut explicit = HeaderParams::new();
        explicit.insert("User-Agent", "explicit-ua");
        let mut defaults = HeaderParams::new();
        defaults.insert("User-Agent", "default-ua");
        defaults.insert("Referer", "https://default.example/");

        let merged = explicit.with_defaults(&defaults);
        assert_eq!(merged.get("user-agent"), Some("explicit-ua"));
        assert_eq!(merged.get("referer"), Some("https://default.example/"));
    }

    #[test]
    fn to_header_map_renders_valid_entries() {
        let mut params = HeaderParams::new();
        params.insert("User-Agent", "X");
        let map = params.to_header_map();
        assert_eq!(map.get("user-agent").unwrap(), "X");
    }

    #[test]
    fn empty_params_encode_to_empty_string() {
        let params = HeaderParams::new();
        assert_eq!(params.encode(), "");
        assert!(params.is_empty());
    }
}
