use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use clap::Parser;
use speedtest_server::access::{Identity, StandaloneHost};
use speedtest_server::buffer::BufferManager;
use speedtest_server::config::{SharedConfig, TestConfig};
use speedtest_server::dispatch::{self, Dispatcher};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{Level, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind: SocketAddr,
    /// JSON settings file (allowedAccounts, speedtestUrl, testDuration, pingCount,
    /// allowAnonymous, enableGeoIP)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Let anonymous users run the test. Overrides the settings file.
    #[arg(long)]
    allow_anonymous: bool,
    /// Path the test page is served on. Overrides the settings file.
    #[arg(long)]
    speedtest_url: Option<String>,
    /// Attribute requests to the X-Forwarded-For chain set by a reverse proxy
    #[arg(long)]
    trust_proxy: bool,
    /// Header a trusted reverse proxy sets to the authenticated username
    #[arg(long)]
    user_header: Option<String>,
    /// Header carrying that user's groups, separated by '|'
    #[arg(long, requires = "user_header")]
    groups_header: Option<String>,
    /// HTML file replacing the built-in test page
    #[arg(long)]
    page_template: Option<PathBuf>,
    /// Seconds an upload may take to drain; 0 waits indefinitely
    #[arg(long, default_value_t = 120)]
    upload_timeout: u64,
    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

/// Headers a fronting proxy uses to pass the authenticated account.
struct TrustedHeaders {
    user: HeaderName,
    groups: Option<HeaderName>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut settings = match &cli.config {
        Some(path) => TestConfig::from_json_file(path)?,
        None => TestConfig::default(),
    };
    if cli.allow_anonymous {
        settings.allow_anonymous = true;
    }
    if let Some(url) = cli.speedtest_url {
        settings.speedtest_url = url;
    }
    info!(
        bind = %cli.bind,
        speedtest_url = %settings.speedtest_url,
        allow_anonymous = settings.allow_anonymous,
        "starting speedtest server"
    );

    let upload_timeout = (cli.upload_timeout > 0).then(|| Duration::from_secs(cli.upload_timeout));
    let mut dispatcher = Dispatcher::new(
        BufferManager::new(),
        Arc::new(SharedConfig::new(settings)),
        Arc::new(StandaloneHost),
    )
    .with_trust_proxy(cli.trust_proxy)
    .with_upload_timeout(upload_timeout);
    if let Some(path) = cli.page_template {
        dispatcher = dispatcher.with_page_template(path);
    }
    dispatcher.start();

    let mut app = Router::new()
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(
            dispatcher.clone(),
            dispatch::middleware,
        ));
    if let Some(user) = &cli.user_header {
        let trusted = TrustedHeaders {
            user: HeaderName::from_bytes(user.as_bytes())?,
            groups: cli
                .groups_header
                .as_deref()
                .map(|g| HeaderName::from_bytes(g.as_bytes()))
                .transpose()?,
        };
        app = app.layer(middleware::from_fn_with_state(Arc::new(trusted), identify));
    }
    let app = app.layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(cli.bind).await?;
    info!(addr = %cli.bind, "listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    dispatcher.shutdown().await;
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not found")
}

// Turns proxy-supplied account headers into the identity the access gate reads.
async fn identify(
    State(trusted): State<Arc<TrustedHeaders>>,
    mut request: Request,
    next: Next,
) -> Response {
    if let Some(identity) = identity_from(&trusted, request.headers()) {
        request.extensions_mut().insert(identity);
    }
    next.run(request).await
}

fn identity_from(trusted: &TrustedHeaders, headers: &HeaderMap) -> Option<Identity> {
    let header = |name: &HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    let username = header(&trusted.user)?;
    let groups = trusted.groups.as_ref().and_then(header).unwrap_or_default();
    Some(
        Identity::new(username).with_groups(
            groups
                .split('|')
                .map(str::trim)
                .filter(|g| !g.is_empty()),
        ),
    )
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutting down");
    }
}
