//! Hourly-refreshed landing base (spec §4.5 step 1).
//!
//! The descriptor endpoint is a small text file containing `src = "<base>"`
//! (a GitHub-hosted config per `direct_hosts`, §4.1). Refresh is
//! best-effort and rate-limited to `refresh_interval`; any failure — network,
//! parse, non-2xx — simply reuses the last known good value, which starts
//! out as the compiled-in fallback.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::sync::RwLock;

use crate::config::ResolverConfig;
use crate::http::{ClientPool, UpstreamPolicy};

struct State {
    value: String,
    last_refreshed: Option<Instant>,
}

pub struct LandingBase {
    descriptor_url: String,
    refresh_interval: Duration,
    state: RwLock<State>,
}

impl LandingBase {
    pub fn new(config: ResolverConfig) -> Self {
        Self {
            descriptor_url: config.landing_base_descriptor_url,
            refresh_interval: config.refresh_interval(),
            state: RwLock::new(State {
                value: config.landing_base_fallback,
                last_refreshed: None,
            }),
        }
    }

    /// Return the current landing base, refreshing first if the last
    /// refresh is stale or has never happened. At most one refresh attempt
    /// runs at a time — concurrent callers queue on the write lock and
    /// re-check freshness once they acquire it, rather than each firing
    /// their own request.
    pub async fn current(&self, client: &ClientPool, policy: &UpstreamPolicy) -> String {
        if let Some(value) = self.fresh_value().await {
            return value;
        }

        let mut state = self.state.write().await;
        if self.is_fresh(&state) {
            return state.value.clone();
        }

        if let Some(base) = self.fetch_descriptor(client, policy).await {
            state.value = base;
        } else {
            tracing::warn!("landing base descriptor refresh failed, reusing last known value");
        }
        state.last_refreshed = Some(Instant::now());
        state.value.clone()
    }

    async fn fresh_value(&self) -> Option<String> {
        let state = self.state.read().await;
        self.is_fresh(&state).then(|| state.value.clone())
    }

    fn is_fresh(&self, state: &State) -> bool {
        state
            .last_refreshed
            .map(|t| t.elapsed() < self.refresh_interval)
            .unwrap_or(false)
    }

    async fn fetch_descriptor(&self, client: &ClientPool, policy: &UpstreamPolicy) -> Option<String> {
        let target = policy.resolve(&self.descriptor_url);
        let response = client
            .fetch(&self.descriptor_url, &target, Default::default())
            .await
            .ok()?;
        if !response.status.is_success() {
            return None;
        }
        let body = response.inner.text().await.ok()?;
        extract_src(&body)
    }
}

fn extract_src(body: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"src\s*=\s*"([^"]+)""#).unwrap())
        .captures(body)
        .map(|c| c[1].to_string())
}
