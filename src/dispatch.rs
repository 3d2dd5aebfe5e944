//! Entry point for every request the host sees.
//!
//! The [`Dispatcher`] classifies a request, hands anything that is not a
//! speed test request back untouched, runs the access gate, and invokes the
//! matching handler. Failures inside a handler stop here: they are logged,
//! reported to the host, and answered with an opaque status.
//!
//! Hosts built on axum mount it with [`middleware`]:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use axum::Router;
//! use speedtest_server::access::StandaloneHost;
//! use speedtest_server::buffer::BufferManager;
//! use speedtest_server::config::TestConfig;
//! use speedtest_server::dispatch::{self, Dispatcher};
//!
//! let dispatcher = Dispatcher::new(
//!     BufferManager::new(),
//!     Arc::new(TestConfig::default()),
//!     Arc::new(StandaloneHost),
//! );
//! let app: Router = Router::new().layer(axum::middleware::from_fn_with_state(
//!     dispatcher,
//!     dispatch::middleware,
//! ));
//! ```

use std::borrow::Cow;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{debug, error, warn};

use crate::access::{self, AccessDecision, Host, Identity};
use crate::buffer::BufferManager;
use crate::classify::classify;
use crate::config::{ConfigProvider, TestConfig};
use crate::error::{Result, SpeedtestError};
use crate::handlers;
use crate::page;
use crate::params;
use crate::protocol::{IpInfo, RequestClassification};

/// What the dispatcher did with a request.
#[derive(Debug)]
pub enum Outcome {
    /// The request was a speed test request and this is its response.
    Handled(Response),
    /// Not a speed test request; the host should process it as usual.
    Passthrough(Request),
}

/// Speed test request dispatcher.
///
/// Owns the injected payload buffer, settings source and host services.
/// Cloning shares all of them.
#[derive(Clone)]
pub struct Dispatcher {
    buffers: BufferManager,
    config: Arc<dyn ConfigProvider>,
    host: Arc<dyn Host>,
    trust_proxy: bool,
    upload_timeout: Option<Duration>,
    asset_base: String,
    page_template: Option<PathBuf>,
}

impl Dispatcher {
    /// Dispatcher over the given payload buffer, settings source and host.
    ///
    /// Uploads drain with the default timeout and page assets resolve under
    /// the default plugin path until overridden.
    pub fn new(
        buffers: BufferManager,
        config: Arc<dyn ConfigProvider>,
        host: Arc<dyn Host>,
    ) -> Self {
        Dispatcher {
            buffers,
            config,
            host,
            trust_proxy: false,
            upload_timeout: Some(params::UPLOAD_DRAIN_TIMEOUT),
            asset_base: params::DEFAULT_ASSET_BASE.to_string(),
            page_template: None,
        }
    }

    /// Attribute requests to the first `X-Forwarded-For` entry and report the chain.
    pub fn with_trust_proxy(mut self, trust_proxy: bool) -> Self {
        self.trust_proxy = trust_proxy;
        self
    }

    /// Bound on how long an upload body may take to drain; `None` waits indefinitely.
    pub fn with_upload_timeout(mut self, limit: Option<Duration>) -> Self {
        self.upload_timeout = limit;
        self
    }

    /// Base path relative page assets are rewritten to.
    pub fn with_asset_base(mut self, asset_base: impl Into<String>) -> Self {
        self.asset_base = asset_base.into();
        self
    }

    /// Serve the test page from this file instead of the built-in template.
    pub fn with_page_template(mut self, path: impl Into<PathBuf>) -> Self {
        self.page_template = Some(path.into());
        self
    }

    /// Payload buffer manager shared with this dispatcher.
    pub fn buffers(&self) -> &BufferManager {
        &self.buffers
    }

    /// Arm the initial eviction timer. Call once when the host starts.
    pub fn start(&self) {
        self.buffers.schedule_eviction();
    }

    /// Cancel the eviction timer and release the payload buffer.
    pub async fn shutdown(&self) {
        self.buffers.shutdown().await;
    }

    /// Handle `request` if it is a speed test request.
    pub async fn dispatch(&self, request: Request) -> Outcome {
        let config = self.config.current();
        let classification = classify(
            request.method(),
            request.uri().path(),
            request.headers(),
            &config.speedtest_url,
        );
        if !classification.is_test() {
            return Outcome::Passthrough(request);
        }

        let decision = access::evaluate(
            classification,
            request.uri().path(),
            request.extensions().get::<Identity>(),
            &config,
            self.host.as_ref(),
        );
        debug!(
            ?classification,
            ?decision,
            path = %request.uri().path(),
            "speedtest request"
        );

        let response = match decision {
            AccessDecision::Allow => match self.handle(classification, request, &config).await {
                Ok(response) => response,
                Err(err) => self.fail(err),
            },
            AccessDecision::RedirectToLogin { location } => {
                (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
            }
            AccessDecision::Unauthenticated => {
                (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
            }
            AccessDecision::Forbidden => (StatusCode::FORBIDDEN, "Access denied").into_response(),
        };
        Outcome::Handled(response)
    }

    async fn handle(
        &self,
        classification: RequestClassification,
        request: Request,
        config: &TestConfig,
    ) -> Result<Response> {
        match classification {
            RequestClassification::Page => {
                let template = match &self.page_template {
                    Some(path) => Cow::Owned(page::load_template(path).await?),
                    None => Cow::Borrowed(page::DEFAULT_TEMPLATE),
                };
                handlers::page(&template, &self.asset_base, config)
            }
            RequestClassification::Ping => Ok(handlers::ping()),
            RequestClassification::Download => {
                handlers::download(&self.buffers, request.headers()).await
            }
            RequestClassification::CalibrationDownload => {
                handlers::calibration_download(&self.buffers, request.headers()).await
            }
            RequestClassification::Upload | RequestClassification::CalibrationUpload => {
                handlers::upload(request.into_body(), self.upload_timeout).await
            }
            RequestClassification::IpLookup => {
                Ok(handlers::ip_lookup(self.client_address(&request)))
            }
            // filtered out by dispatch
            RequestClassification::None => Ok(StatusCode::NOT_FOUND.into_response()),
        }
    }

    fn fail(&self, err: SpeedtestError) -> Response {
        let status = err.status();
        if status.is_server_error() {
            error!(error = %err, "speedtest request failed");
            self.host.record_error(&format!("speedtest plugin error: {err}"));
        } else {
            warn!(error = %err, "speedtest request aborted");
        }
        (status, err.public_message()).into_response()
    }

    fn client_address(&self, request: &Request) -> IpInfo {
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());

        let forwarded: Vec<String> = if self.trust_proxy {
            request
                .headers()
                .get_all("x-forwarded-for")
                .iter()
                .filter_map(|v| v.to_str().ok())
                .flat_map(|v| v.split(','))
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        } else {
            Vec::new()
        };

        let ip = forwarded.first().cloned().or(peer).unwrap_or_default();
        IpInfo::new(ip, forwarded)
    }
}

/// axum middleware adapter: answers speed test requests, forwards the rest.
pub async fn middleware(
    State(dispatcher): State<Dispatcher>,
    request: Request,
    next: Next,
) -> Response {
    match dispatcher.dispatch(request).await {
        Outcome::Handled(response) => response,
        Outcome::Passthrough(request) => next.run(request).await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use axum::Router;
    use axum::body::{Body, Bytes, to_bytes};
    use axum::http::{self, Method};
    use futures_util::stream;
    use tower::ServiceExt;

    use super::*;
    use crate::access::StandaloneHost;
    use crate::config::SharedConfig;

    const SMALL: usize = 4 << 20;

    #[derive(Default)]
    struct RecordingHost {
        errors: Mutex<Vec<String>>,
    }

    impl Host for RecordingHost {
        fn record_error(&self, message: &str) {
            self.errors.lock().unwrap().push(message.to_string());
        }
    }

    fn locked_down() -> TestConfig {
        TestConfig {
            allow_anonymous: false,
            allowed_accounts: "admin".into(),
            ..Default::default()
        }
    }

    fn dispatcher(config: TestConfig) -> Dispatcher {
        Dispatcher::new(
            BufferManager::with_limits(SMALL, params::BUFFER_TIMEOUT),
            Arc::new(config),
            Arc::new(StandaloneHost),
        )
    }

    fn app(dispatcher: Dispatcher) -> Router {
        Router::new()
            .fallback(|| async { (StatusCode::NOT_FOUND, "host") })
            .layer(axum::middleware::from_fn_with_state(dispatcher, middleware))
    }

    fn get(path: &str) -> axum::http::request::Builder {
        http::Request::builder().method(Method::GET).uri(path)
    }

    async fn send(app: &Router, request: Request) -> (StatusCode, Bytes) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body)
    }

    #[tokio::test]
    async fn unrelated_requests_reach_the_host() {
        let app = app(dispatcher(locked_down()));
        let (status, body) = send(&app, get("/index.html").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, "host");
    }

    #[tokio::test]
    async fn anonymous_download_is_unauthorized() {
        let app = app(dispatcher(locked_down()));
        let request = get("/~/chunk")
            .header("X-SpeedTest", "download")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, "Unauthorized");
    }

    #[tokio::test]
    async fn anonymous_download_allowed_when_configured() {
        let app = app(dispatcher(TestConfig {
            allow_anonymous: true,
            ..locked_down()
        }));
        let request = get("/~/chunk")
            .header("X-SpeedTest", "download")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.len(), params::DEFAULT_CHUNK_SIZE);
    }

    #[tokio::test]
    async fn outsider_is_forbidden() {
        let app = app(dispatcher(locked_down()));
        let request = get("/~/chunk")
            .header("X-SpeedTest", "ping")
            .extension(Identity::new("mallory"))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body, "Access denied");
    }

    #[tokio::test]
    async fn anonymous_page_visit_redirects_to_login() {
        let app = app(dispatcher(locked_down()));
        let response = app
            .oneshot(get("/speedtest/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers()[header::LOCATION],
            "/~/login?from=%2Fspeedtest%2F"
        );
    }

    #[tokio::test]
    async fn page_carries_settings() {
        let app = app(dispatcher(locked_down()));
        let request = get("/speedtest")
            .extension(Identity::new("admin"))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response.headers()[header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("text/html")
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let html = String::from_utf8(body.to_vec()).unwrap();
        assert!(html.contains(r#""testDuration":5"#));
        assert!(html.contains(r#""pingCount":10"#));
    }

    #[tokio::test]
    async fn ping_is_empty_when_anonymous_allowed() {
        let app = app(dispatcher(TestConfig {
            allow_anonymous: true,
            ..locked_down()
        }));
        let request = get("/~/p")
            .header("X-SpeedTest", "ping")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn calibration_ignores_access_rules() {
        let app = app(dispatcher(locked_down()));

        let request = get("/anything")
            .header("X-SpeedTest", "calibration")
            .header("X-Calibration-Size", "300000")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.len(), 300_000);

        let request = http::Request::builder()
            .method(Method::POST)
            .uri("/~/upload-calibration")
            .body(Body::from(vec![0u8; 64 * 1024]))
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn successive_downloads_share_content() {
        let app = app(dispatcher(TestConfig {
            allow_anonymous: true,
            ..locked_down()
        }));
        let chunk = || {
            get("/~/d")
                .header("X-SpeedTest", "download")
                .header("X-Chunk-Size", "65536")
                .body(Body::empty())
                .unwrap()
        };
        let (_, first) = send(&app, chunk()).await;
        let (_, second) = send(&app, chunk()).await;
        assert_eq!(first.len(), 65_536);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn upload_drains_body() {
        let app = app(dispatcher(locked_down()));
        let request = http::Request::builder()
            .method(Method::POST)
            .uri("/~/upload")
            .header("X-SpeedTest", "upload")
            .extension(Identity::new("admin"))
            .body(Body::from(vec![7u8; 3 << 20]))
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_upload_gets_408() {
        let app = app(
            dispatcher(TestConfig {
                allow_anonymous: true,
                ..locked_down()
            })
            .with_upload_timeout(Some(Duration::from_secs(10))),
        );
        let body =
            Body::from_stream(stream::pending::<std::result::Result<Bytes, std::io::Error>>());
        let request = http::Request::builder()
            .method(Method::POST)
            .uri("/~/upload")
            .header("X-SpeedTest", "upload")
            .body(body)
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
        assert_eq!(body, "Request timeout");
    }

    #[tokio::test]
    async fn ip_lookup_reports_peer() {
        let app = app(dispatcher(locked_down()));
        let addr: SocketAddr = "[2001:db8::1]:4000".parse().unwrap();
        let request = get("/~/ip")
            .extension(ConnectInfo(addr))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        let info: IpInfo = serde_json::from_slice(&body).unwrap();
        assert_eq!(info.ip, "2001:db8::1");
        assert!(info.ips.is_empty());
        assert_eq!(info.ip_version, crate::protocol::IpVersion::V6);
    }

    #[tokio::test]
    async fn ip_lookup_follows_trusted_proxy_chain() {
        let app = app(dispatcher(locked_down()).with_trust_proxy(true));
        let addr: SocketAddr = "10.0.0.2:4000".parse().unwrap();
        let request = get("/~/ip")
            .header("X-Forwarded-For", "203.0.113.9, 10.0.0.1")
            .extension(ConnectInfo(addr))
            .body(Body::empty())
            .unwrap();
        let (_, body) = send(&app, request).await;
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["ip"], "203.0.113.9");
        assert_eq!(json["ips"], serde_json::json!(["203.0.113.9", "10.0.0.1"]));
        assert_eq!(json["ipVersion"], "IPv4");
    }

    #[tokio::test]
    async fn settings_are_read_per_request() {
        let shared = SharedConfig::new(locked_down());
        let app = app(Dispatcher::new(
            BufferManager::with_limits(SMALL, params::BUFFER_TIMEOUT),
            Arc::new(shared.clone()),
            Arc::new(StandaloneHost),
        ));
        let ping = || {
            get("/~/p")
                .header("X-SpeedTest", "ping")
                .body(Body::empty())
                .unwrap()
        };

        assert_eq!(send(&app, ping()).await.0, StatusCode::UNAUTHORIZED);
        shared.update(TestConfig {
            allow_anonymous: true,
            ..locked_down()
        });
        assert_eq!(send(&app, ping()).await.0, StatusCode::OK);
    }

    #[tokio::test]
    async fn handler_failure_is_opaque_and_reported() {
        let host = Arc::new(RecordingHost::default());
        let dispatcher = Dispatcher::new(
            BufferManager::with_limits(SMALL, params::BUFFER_TIMEOUT),
            Arc::new(TestConfig {
                allow_anonymous: true,
                ..Default::default()
            }),
            host.clone(),
        )
        .with_page_template("/nonexistent/speedtest.html");

        let request = get("/speedtest").body(Body::empty()).unwrap();
        let (status, body) = send(&app(dispatcher), request).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, "Internal server error");

        let errors = host.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("speedtest plugin error: page template"));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_buffer_is_regenerated() {
        let app = app(dispatcher(TestConfig {
            allow_anonymous: true,
            ..locked_down()
        }));
        let chunk = || {
            get("/~/d")
                .header("X-SpeedTest", "download")
                .body(Body::empty())
                .unwrap()
        };

        let (_, before) = send(&app, chunk()).await;
        tokio::time::sleep(Duration::from_secs(31 * 60)).await;
        let (_, after) = send(&app, chunk()).await;
        assert_eq!(before.len(), after.len());
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn full_size_buffer_scenarios() {
        let dispatcher = Dispatcher::new(
            BufferManager::new(),
            Arc::new(locked_down()),
            Arc::new(StandaloneHost),
        );
        let app = app(dispatcher.clone());

        let request = get("/~/d")
            .header("X-SpeedTest", "download")
            .header("X-Chunk-Size", "2097152")
            .extension(Identity::new("admin"))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.len(), 2_097_152);

        let calibration = |size: &str| {
            get("/")
                .header("X-SpeedTest", "calibration")
                .header("X-Calibration-Size", size)
                .body(Body::empty())
                .unwrap()
        };
        let (_, body) = send(&app, calibration("5000000")).await;
        assert_eq!(body.len(), 5_000_000);
        let (_, body) = send(&app, calibration("200000000")).await;
        assert_eq!(body.len(), params::BUFFER_SIZE);

        dispatcher.shutdown().await;
        assert!(!dispatcher.buffers().is_allocated().await);
    }
}
