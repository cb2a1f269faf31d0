//! Error taxonomy for the proxy (spec §7).
//!
//! One `thiserror` enum, mapped directly onto the response codes the spec
//! requires. User-visible bodies are plain text; no internal detail beyond
//! the upstream error message leaks out.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    /// Missing or empty required query parameter.
    #[error("missing or empty required parameter: {0}")]
    ClientError(String),

    /// Domain-restricted variant of `/proxy/m3u` called out of policy.
    #[error("url is not permitted by policy: {0}")]
    PolicyDenied(String),

    /// Connect/timeout/DNS failure after the retry ladder is exhausted.
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// Upstream responded with a non-2xx status.
    #[error("upstream returned an error status: {0}")]
    UpstreamHttp(String),

    /// The resolver could not produce a playable M3U8.
    #[error("could not resolve a playable stream: {0}")]
    ResolutionFailed(String),

    /// Segment fetch failed and no cached copy (even stale) was available.
    #[error("segment temporarily unavailable: {0}")]
    TransientSegment(String),
}

impl ProxyError {
    fn status(&self) -> StatusCode {
        match self {
            ProxyError::ClientError(_) => StatusCode::BAD_REQUEST,
            ProxyError::PolicyDenied(_) => StatusCode::FORBIDDEN,
            ProxyError::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamHttp(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::ResolutionFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::TransientSegment(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &status {
            s if s.is_server_error() => tracing::error!("{self}"),
            _ => tracing::warn!("{self}"),
        }
        (status, self.to_string()).into_response()
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;
