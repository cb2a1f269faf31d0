//! Endpoint handlers (spec §4.7).
//!
//! Grounded in `original_source/app.py`'s four `@app.route` handlers
//! (`/proxy`, `/proxy/m3u`, `/proxy/ts`, `/proxy/key`) for control flow,
//! rewritten in axum extractor/handler idiom per the teacher's
//! `Query<T>`/`State<AppState>`/`impl IntoResponse` style.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;

use crate::cache::CacheStats;
use crate::errors::{ProxyError, ProxyResult};
use crate::headers::HeaderParams;
use crate::playlist::{self, PlaylistKind};
use crate::web::AppState;

const MEDIA_PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl; charset=utf-8";
const MASTER_LIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const SEGMENT_CONTENT_TYPE: &str = "video/mp2t";
const KEY_CONTENT_TYPE: &str = "application/octet-stream";

fn required_url(params: &HashMap<String, String>) -> ProxyResult<String> {
    let url = params
        .get("url")
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    if url.is_empty() {
        return Err(ProxyError::ClientError("missing required 'url' parameter".to_string()));
    }
    Ok(url)
}

fn forwarded_headers(params: &HashMap<String, String>) -> HeaderParams {
    HeaderParams::decode(params.iter().map(|(k, v)| (k.clone(), v.clone())))
}

pub async fn health() -> impl IntoResponse {
    StatusCode::OK
}

pub async fn index() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        "hls-relay-proxy is running\n",
    )
}

pub async fn cache_stats(State(state): State<Arc<AppState>>) -> axum::Json<CacheStats> {
    axum::Json(state.caches.stats().await)
}

pub async fn cache_clear(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.caches.clear().await;
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        "cache cleared\n",
    )
}

/// `GET /proxy?url=<m3uList>` — ingest a published channel list, rewrite
/// every entry to route back through `/proxy/m3u`.
pub async fn proxy_ingest(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    match proxy_ingest_inner(state, params).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn proxy_ingest_inner(
    state: Arc<AppState>,
    params: HashMap<String, String>,
) -> ProxyResult<Response> {
    let url = required_url(&params)?;
    let target = state.policy.resolve(&url);
    let headers = HeaderParams::new().with_defaults(&target.default_headers);

    let response = state.client.fetch(&url, &target, headers.to_header_map()).await?;
    if !response.status.is_success() {
        return Err(ProxyError::UpstreamHttp(format!(
            "upstream returned {} for {url}",
            response.status
        )));
    }
    let body = response
        .inner
        .text()
        .await
        .map_err(|e| ProxyError::UpstreamUnreachable(e.to_string()))?;

    let rewritten = playlist::rewrite_master_ingest(&body, &state.config.server.base_url, &state.policy);
    Ok((
        [(header::CONTENT_TYPE, MASTER_LIST_CONTENT_TYPE)],
        rewritten,
    )
        .into_response())
}

/// `GET /proxy/m3u?url=<anyStreamURL>&h_*` — resolve then rewrite the media
/// playlist.
pub async fn proxy_m3u(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    match proxy_m3u_inner(state, params).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn proxy_m3u_inner(
    state: Arc<AppState>,
    params: HashMap<String, String>,
) -> ProxyResult<Response> {
    let url = required_url(&params)?;
    if !state.policy.is_allowed(&url) {
        return Err(ProxyError::PolicyDenied(format!("{url} is not an allowed host")));
    }
    let forwarded = forwarded_headers(&params);

    let resolved = state.resolver.resolve(&url, forwarded).await;

    let cache_key = crate::cache::PlaylistCache::key(&resolved.url, &resolved.headers);
    if let Some(cached) = state.caches.playlists.get(&cache_key).await {
        tracing::debug!("playlist cache hit for {}", resolved.url);
        return Ok((
            [(header::CONTENT_TYPE, cached.content_type)],
            cached.body,
        )
            .into_response());
    }

    let target = state.policy.resolve(&resolved.url);
    let headers = resolved.headers.clone().with_defaults(&target.default_headers);

    let response = state
        .client
        .fetch(&resolved.url, &target, headers.to_header_map())
        .await?;
    if !response.status.is_success() {
        return Err(ProxyError::UpstreamHttp(format!(
            "upstream returned {} for {}",
            response.status, resolved.url
        )));
    }
    let final_url = response.final_url.clone();
    let body = response
        .inner
        .text()
        .await
        .map_err(|e| ProxyError::UpstreamUnreachable(e.to_string()))?;

    match playlist::detect_kind(&body) {
        None => Err(ProxyError::ResolutionFailed(format!(
            "{} did not yield a playable #EXTM3U playlist",
            resolved.url
        ))),
        Some(PlaylistKind::Media) => {
            let rewrite_opts = playlist::rewriter::MediaRewriteOptions {
                server_base_url: &state.config.server.base_url,
                final_url: &final_url,
                headers: &resolved.headers,
            };
            let rewritten = playlist::rewrite_media_playlist(&body, &rewrite_opts);

            state
                .caches
                .playlists
                .put(
                    cache_key,
                    crate::cache::playlist::CachedPlaylist {
                        body: rewritten.clone(),
                        content_type: MEDIA_PLAYLIST_CONTENT_TYPE,
                    },
                )
                .await;

            Ok((
                [(header::CONTENT_TYPE, MEDIA_PLAYLIST_CONTENT_TYPE)],
                rewritten,
            )
                .into_response())
        }
        Some(PlaylistKind::Master) => Ok((
            [(header::CONTENT_TYPE, MASTER_LIST_CONTENT_TYPE)],
            body,
        )
            .into_response()),
    }
}

/// `GET /proxy/ts?url=<segment>&h_*` — stream a segment through, caching it
/// on success if it fits the byte budget.
pub async fn proxy_ts(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    match proxy_ts_inner(state, params).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn proxy_ts_inner(
    state: Arc<AppState>,
    params: HashMap<String, String>,
) -> ProxyResult<Response> {
    let url = required_url(&params)?;
    let headers = forwarded_headers(&params);

    if let Some(cached) = state.caches.segments.get(&url).await {
        tracing::debug!("segment cache hit for {url}");
        return Ok(segment_response(cached.as_ref().clone()));
    }

    let target = state.policy.resolve(&url);
    let merged = headers.with_defaults(&target.default_headers);
    let response = match state.client.fetch(&url, &target, merged.to_header_map()).await {
        Ok(response) if response.status.is_success() => response,
        Ok(response) => {
            return stale_segment_or_transient_error(
                &state,
                &url,
                format!("upstream returned {} for segment {url}", response.status),
            )
            .await;
        }
        Err(_) => {
            return stale_segment_or_transient_error(
                &state,
                &url,
                format!("upstream unreachable for segment {url}"),
            )
            .await;
        }
    };

    let cache_key = url.clone();
    let max_item_bytes = state.config.cache.segment_max_item_bytes;

    // Tee the body to the cache as it streams to the client: every chunk is
    // forwarded to the response immediately and also pushed onto a channel
    // drained by a background task, which never holds up the response
    // stream and simply drops what it collected if the segment turns out to
    // exceed the byte budget (spec §3/§4.4 — oversized items still stream,
    // they just never land in cache).
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let byte_stream = response.inner.bytes_stream().inspect(move |chunk| {
        if let Ok(bytes) = chunk {
            let _ = tx.send(bytes.clone());
        }
    });

    let cache_task_state = Arc::clone(&state);
    tokio::spawn(async move {
        let mut collected: Vec<u8> = Vec::new();
        let mut too_big = false;
        while let Some(bytes) = rx.recv().await {
            if too_big {
                continue;
            }
            if collected.len() as u64 + bytes.len() as u64 > max_item_bytes {
                too_big = true;
                collected.clear();
                continue;
            }
            collected.extend_from_slice(&bytes);
        }
        if !too_big && !collected.is_empty() {
            cache_task_state.caches.segments.put(cache_key, collected).await;
        }
    });

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, SEGMENT_CONTENT_TYPE)
        .body(Body::from_stream(byte_stream))
        .map_err(|e| ProxyError::ClientError(e.to_string()))?)
}

/// §7: "cache-miss-then-network-failure on `/proxy/ts` additionally attempts
/// a stale-cache lookup before returning 503". `SegmentCache` carries no TTL
/// of its own, so "stale" here means "whatever is in cache now" — a second
/// lookup catches the case where a concurrent request populated the entry
/// between our initial miss and this upstream failure.
async fn stale_segment_or_transient_error(
    state: &Arc<AppState>,
    url: &str,
    failure_reason: String,
) -> ProxyResult<Response> {
    if let Some(cached) = state.caches.segments.get(url).await {
        tracing::warn!("segment fetch failed for {url}, serving stale cached copy: {failure_reason}");
        return Ok(segment_response(cached.as_ref().clone()));
    }
    Err(ProxyError::TransientSegment(failure_reason))
}

fn segment_response(bytes: Vec<u8>) -> Response {
    (
        [(header::CONTENT_TYPE, SEGMENT_CONTENT_TYPE)],
        bytes,
    )
        .into_response()
}

/// `GET /proxy/key?url=<keyURI>&h_*` — fetch and cache an AES-128 key.
pub async fn proxy_key(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    match proxy_key_inner(state, params).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn proxy_key_inner(
    state: Arc<AppState>,
    params: HashMap<String, String>,
) -> ProxyResult<Response> {
    let url = required_url(&params)?;
    let headers = forwarded_headers(&params);

    if let Some(cached) = state.caches.keys.get(&url).await {
        tracing::debug!("key cache hit for {url}");
        return Ok((
            [(header::CONTENT_TYPE, KEY_CONTENT_TYPE)],
            cached.as_ref().clone(),
        )
            .into_response());
    }

    let target = state.policy.resolve(&url);
    let merged = headers.with_defaults(&target.default_headers);
    let response = state.client.fetch(&url, &target, merged.to_header_map()).await?;
    if !response.status.is_success() {
        return Err(ProxyError::UpstreamHttp(format!(
            "upstream returned {} for key {url}",
            response.status
        )));
    }
    let bytes = response
        .inner
        .bytes()
        .await
        .map_err(|e| ProxyError::UpstreamUnreachable(e.to_string()))?
        .to_vec();

    state.caches.keys.put(url, bytes.clone()).await;

    Ok((
        [(header::CONTENT_TYPE, KEY_CONTENT_TYPE)],
        bytes,
    )
        .into_response())
}
