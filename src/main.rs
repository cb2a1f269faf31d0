use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hls_relay_proxy::{
    cache::Caches,
    config::Config,
    http::{ClientPool, UpstreamPolicy},
    resolver::StreamResolver,
    web::{AppState, WebServer},
};

#[derive(Parser)]
#[command(name = "hls-relay-proxy")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "An HTTP reverse proxy for HLS streams: playlist rewriting, segment/key caching, and an indirect-stream resolver")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listening IP address
    #[arg(short = 'H', long, value_name = "IP")]
    host: Option<String>,

    /// Listening port
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_filter = if cli.log_level == "trace" {
        format!("hls_relay_proxy={},tower_http=trace", cli.log_level)
    } else {
        format!("hls_relay_proxy={}", cli.log_level)
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting HLS relay proxy v{}", env!("CARGO_PKG_VERSION"));

    std::env::set_var("CONFIG_FILE", &cli.config);
    let mut config = Config::load()?;
    info!("Configuration loaded from: {}", cli.config);

    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    let client = Arc::new(ClientPool::new(config.client.clone()));
    let policy = Arc::new(UpstreamPolicy::new(config.upstream_policy.clone()));
    let resolver = StreamResolver::new(config.resolver.clone(), Arc::clone(&client), Arc::clone(&policy));
    let caches = Caches::new(&config.cache);

    let state = AppState {
        config: config.clone(),
        client,
        policy,
        resolver,
        caches,
        request_count: std::sync::atomic::AtomicU64::new(0),
    };

    let web_server = WebServer::new(state)?;
    info!("Starting web server on {}:{}", web_server.host(), web_server.port());
    web_server.serve().await?;

    Ok(())
}
