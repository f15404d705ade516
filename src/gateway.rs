//! HTTP front door: authenticates, classifies by Host, then dispatches to
//! the control plane. Tenant traffic is answered with an internal redirect
//! for the reverse proxy in front of us.

use crate::config::Config;
use crate::error::{json_error_response, ErrorCode};
use crate::plane::ControlPlane;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::{AUTHORIZATION, HOST};
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Header the proxy fabric uses to pick the upstream
pub const ACCEL_REDIRECT: &str = "X-Accel-Redirect";

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Who is making the request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Principal {
    Admin,
    Anonymous,
}

/// Which side of the front door a request belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Traffic for the instance with this routing key
    Tenant(String),
    Admin,
}

/// Per-server settings shared by every connection
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub domain: String,
    pub admin_token: String,
    pub redirect_prefix: String,
    pub max_body_bytes: usize,
}

impl GatewaySettings {
    pub fn from_config(config: &Config, admin_token: String) -> Self {
        Self {
            domain: config.server.domain.to_ascii_lowercase(),
            admin_token,
            redirect_prefix: config.routing.redirect_prefix.clone(),
            max_body_bytes: config.server.max_body_bytes,
        }
    }
}

/// The host name tenants reach instance `id` under
pub fn routing_host(id: &str, domain: &str) -> String {
    format!("{}.{}", id, domain)
}

/// Stage 1: bearer token check
pub fn authenticate(headers: &HeaderMap, admin_token: &str) -> Principal {
    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "));

    match presented {
        Some(token) if !admin_token.is_empty() && token == admin_token => Principal::Admin,
        _ => Principal::Anonymous,
    }
}

/// Stage 2: `<id>.<domain>` is tenant traffic, anything else is admin
pub fn classify(host: Option<&str>, domain: &str) -> Route {
    let Some(host) = host else {
        return Route::Admin;
    };
    let host = host.trim().to_ascii_lowercase();
    let host = strip_port(&host);

    match host
        .strip_suffix(domain)
        .and_then(|rest| rest.strip_suffix('.'))
    {
        Some(id) if !id.is_empty() && !id.contains('.') => Route::Tenant(id.to_string()),
        _ => Route::Admin,
    }
}

fn strip_port(host: &str) -> &str {
    // Bracketed IPv6 literals keep their colons
    if host.starts_with('[') {
        return host.find(']').map(|i| &host[..=i]).unwrap_or(host);
    }
    host.rsplit_once(':')
        .filter(|(_, port)| port.chars().all(|c| c.is_ascii_digit()))
        .map(|(name, _)| name)
        .unwrap_or(host)
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    image: String,
    port: u16,
    #[serde(default)]
    env: HashMap<String, String>,
}

/// Front door server
pub struct Gateway {
    bind_addr: SocketAddr,
    plane: Arc<ControlPlane>,
    settings: Arc<GatewaySettings>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Gateway {
    pub fn new(
        bind_addr: SocketAddr,
        plane: Arc<ControlPlane>,
        settings: GatewaySettings,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            plane,
            settings: Arc::new(settings),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, domain = %self.settings.domain, "Gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let plane = Arc::clone(&self.plane);
                            let settings = Arc::clone(&self.settings);

                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let plane = Arc::clone(&plane);
                                    let settings = Arc::clone(&settings);
                                    async move {
                                        Ok::<_, hyper::Error>(handle_request(req, &plane, &settings).await)
                                    }
                                });

                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "Gateway connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept gateway connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

/// Run one request through authenticate, classify and dispatch
pub async fn handle_request<B>(
    req: Request<B>,
    plane: &ControlPlane,
    settings: &GatewaySettings,
) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let principal = authenticate(req.headers(), &settings.admin_token);
    let host = req.headers().get(HOST).and_then(|v| v.to_str().ok());
    let route = classify(host.or_else(|| req.uri().host()), &settings.domain);

    match route {
        Route::Tenant(id) => {
            let path = req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/")
                .to_string();
            dispatch_tenant(&id, &path, plane, settings).await
        }
        Route::Admin => dispatch_admin(req, principal, plane, settings).await,
    }
}

async fn dispatch_tenant(
    id: &str,
    path: &str,
    plane: &ControlPlane,
    settings: &GatewaySettings,
) -> Response<Full<Bytes>> {
    match plane.route_request(id).await {
        Ok(target) => {
            let redirect = format!(
                "{}{}:{}{}",
                settings.redirect_prefix, target.network_address, target.service_port, path
            );
            debug!(id, redirect = %redirect, "Tenant request redirected");

            Response::builder()
                .status(StatusCode::OK)
                .header(ACCEL_REDIRECT, redirect)
                .header("Referrer-Policy", "no-referrer-when-downgrade")
                .body(Full::new(Bytes::new()))
                .unwrap_or_else(|_| {
                    json_error_response(ErrorCode::BadRequest, "request path is not a valid header value")
                })
        }
        Err(e) => {
            debug!(id, error = %e, "Tenant request not routable");
            (&e).into()
        }
    }
}

async fn dispatch_admin<B>(
    req: Request<B>,
    principal: Principal,
    plane: &ControlPlane,
    settings: &GatewaySettings,
) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!(%method, %path, "Admin request");

    // Unauthenticated endpoints
    match (&method, path.as_str()) {
        (&Method::GET, "/health") => return response(StatusCode::OK, "ok"),
        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            return json_response(StatusCode::OK, version_info.to_string());
        }
        _ => {}
    }

    if principal != Principal::Admin {
        warn!(%method, %path, "Unauthorized admin request");
        return json_error_response(ErrorCode::Unauthorized, "missing or invalid bearer token");
    }

    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    match (&method, segments.as_slice()) {
        (&Method::GET, ["containers"]) => match plane.list_instances().await {
            Ok(containers) => {
                let body = serde_json::json!({
                    "containers": containers,
                    "count": containers.len(),
                });
                json_response(StatusCode::OK, body.to_string())
            }
            Err(e) => (&e).into(),
        },

        (&Method::POST, ["start"]) => {
            let body = match Limited::new(req.into_body(), settings.max_body_bytes)
                .collect()
                .await
            {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    return json_error_response(
                        ErrorCode::BadRequest,
                        format!("Unreadable body: {}", e),
                    )
                }
            };
            let start: StartRequest = match serde_json::from_slice(&body) {
                Ok(r) => r,
                Err(e) => {
                    return json_error_response(ErrorCode::BadRequest, format!("Invalid JSON: {}", e))
                }
            };

            match plane.start_instance(&start.image, start.port, start.env).await {
                Ok(id) => {
                    let body = serde_json::json!({
                        "host": routing_host(&id, &settings.domain),
                        "id": id,
                    });
                    json_response(StatusCode::OK, body.to_string())
                }
                Err(e) => (&e).into(),
            }
        }

        (&Method::DELETE, ["containers", id]) => match plane.stop_instance(id).await {
            Ok(()) => response(StatusCode::NO_CONTENT, Bytes::new()),
            Err(e) => (&e).into(),
        },

        (&Method::POST, ["containers", id, "keepalive"]) => match plane.keep_alive(id).await {
            Ok(()) => response(StatusCode::NO_CONTENT, Bytes::new()),
            Err(e) => (&e).into(),
        },

        _ => json_error_response(ErrorCode::NotFound, "not found"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryRuntime;
    use hyper::header::HeaderValue;

    const TOKEN: &str = "secret-token";

    fn setup() -> (Arc<InMemoryRuntime>, Arc<ControlPlane>, GatewaySettings) {
        let runtime = Arc::new(InMemoryRuntime::new());
        let config = Config::default();
        let plane = ControlPlane::new(runtime.clone(), &config);
        let settings = GatewaySettings::from_config(&config, TOKEN.to_string());
        (runtime, plane, settings)
    }

    fn request(method: Method, host: &str, uri: &str, token: Option<&str>, body: &str) -> Request<Full<Bytes>> {
        let mut builder = Request::builder().method(method).uri(uri).header(HOST, host);
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Full::new(Bytes::from(body.to_string()))).unwrap()
    }

    async fn body_json(resp: Response<Full<Bytes>>) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_authenticate() {
        let mut headers = HeaderMap::new();
        assert_eq!(authenticate(&headers, TOKEN), Principal::Anonymous);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer wrong"));
        assert_eq!(authenticate(&headers, TOKEN), Principal::Anonymous);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("secret-token"));
        assert_eq!(authenticate(&headers, TOKEN), Principal::Anonymous);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer secret-token "));
        assert_eq!(authenticate(&headers, TOKEN), Principal::Anonymous);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer  secret-token"));
        assert_eq!(authenticate(&headers, TOKEN), Principal::Anonymous);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer secret-token"));
        assert_eq!(authenticate(&headers, TOKEN), Principal::Admin);

        assert_eq!(authenticate(&headers, ""), Principal::Anonymous);
    }

    #[test]
    fn test_classify() {
        let domain = "apps.example.com";
        assert_eq!(
            classify(Some("abc123.apps.example.com"), domain),
            Route::Tenant("abc123".to_string())
        );
        assert_eq!(
            classify(Some("ABC123.Apps.Example.com:8443"), domain),
            Route::Tenant("abc123".to_string())
        );
        assert_eq!(classify(Some("apps.example.com"), domain), Route::Admin);
        assert_eq!(classify(Some("a.b.apps.example.com"), domain), Route::Admin);
        assert_eq!(classify(Some("xapps.example.com"), domain), Route::Admin);
        assert_eq!(classify(Some("other.org"), domain), Route::Admin);
        assert_eq!(classify(None, domain), Route::Admin);
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("localhost:5000"), "localhost");
        assert_eq!(strip_port("localhost"), "localhost");
        assert_eq!(strip_port("[::1]:5000"), "[::1]");
        assert_eq!(strip_port("[abc"), "[abc");
        assert_eq!(strip_port("["), "[");
    }

    #[tokio::test]
    async fn test_unterminated_bracket_host() {
        let (_, plane, settings) = setup();
        let resp = handle_request(request(Method::GET, "[abc", "/health", None, ""), &plane, &settings).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(classify(Some("[abc"), "localhost"), Route::Admin);
    }

    #[test]
    fn test_routing_host() {
        assert_eq!(routing_host("abc", "localhost"), "abc.localhost");
    }

    #[tokio::test]
    async fn test_health_and_version_need_no_token() {
        let (_, plane, settings) = setup();

        let resp = handle_request(request(Method::GET, "localhost", "/health", None, ""), &plane, &settings).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = handle_request(request(Method::GET, "localhost", "/version", None, ""), &plane, &settings).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["name"], PKG_NAME);
    }

    #[tokio::test]
    async fn test_admin_routes_require_token() {
        let (_, plane, settings) = setup();
        let resp = handle_request(request(Method::GET, "localhost", "/containers", None, ""), &plane, &settings).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(resp.headers()["X-Dockvision-Error"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn test_start_then_route() {
        let (_, plane, settings) = setup();
        let resp = handle_request(
            request(Method::POST, "localhost", "/start", Some(TOKEN), r#"{"image":"web:1","port":8080}"#),
            &plane,
            &settings,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        let id = json["id"].as_str().unwrap().to_string();
        assert_eq!(json["host"], format!("{}.localhost", id));

        let resp = handle_request(
            request(Method::GET, &format!("{}.localhost", id), "/app/page?x=1", None, ""),
            &plane,
            &settings,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let redirect = resp.headers()[ACCEL_REDIRECT].to_str().unwrap();
        assert!(redirect.starts_with("/nginx/10.88."));
        assert!(redirect.ends_with(":8080/app/page?x=1"));
        assert_eq!(resp.headers()["Referrer-Policy"], "no-referrer-when-downgrade");
    }

    #[tokio::test]
    async fn test_unknown_tenant_is_not_found() {
        let (_, plane, settings) = setup();
        let resp = handle_request(request(Method::GET, "0123456789ab.localhost", "/", None, ""), &plane, &settings).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["code"], "UNRESOLVABLE");
    }

    #[tokio::test]
    async fn test_runtime_outage_is_service_unavailable() {
        let (runtime, plane, settings) = setup();
        runtime.set_unavailable(true);
        let resp = handle_request(request(Method::GET, "0123456789ab.localhost", "/", None, ""), &plane, &settings).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_start_rejects_bad_json() {
        let (_, plane, settings) = setup();
        let resp = handle_request(
            request(Method::POST, "localhost", "/start", Some(TOKEN), r#"{"image":"web:1"}"#),
            &plane,
            &settings,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_start_rejects_oversized_body() {
        let (_, plane, mut settings) = setup();
        settings.max_body_bytes = 16;
        let resp = handle_request(
            request(Method::POST, "localhost", "/start", Some(TOKEN), r#"{"image":"web:1","port":8080}"#),
            &plane,
            &settings,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_start_missing_image_is_bad_gateway() {
        let (runtime, plane, settings) = setup();
        runtime.forget_image("ghost:1");
        let resp = handle_request(
            request(Method::POST, "localhost", "/start", Some(TOKEN), r#"{"image":"ghost:1","port":80}"#),
            &plane,
            &settings,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_list_keepalive_and_delete() {
        let (runtime, plane, settings) = setup();
        let id = plane.start_instance("web:1", 8080, HashMap::new()).await.unwrap();

        let resp = handle_request(request(Method::GET, "localhost", "/containers", Some(TOKEN), ""), &plane, &settings).await;
        let json = body_json(resp).await;
        assert_eq!(json["count"], 1);
        assert_eq!(json["containers"][0]["id"], id.as_str());

        let keepalive = format!("/containers/{}/keepalive", id);
        let resp = handle_request(request(Method::POST, "localhost", &keepalive, Some(TOKEN), ""), &plane, &settings).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = handle_request(
            request(Method::POST, "localhost", "/containers/0123456789ab/keepalive", Some(TOKEN), ""),
            &plane,
            &settings,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let delete = format!("/containers/{}", id);
        let resp = handle_request(request(Method::DELETE, "localhost", &delete, Some(TOKEN), ""), &plane, &settings).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert!(runtime.container_ids().is_empty());

        // Deleting again is fine
        let resp = handle_request(request(Method::DELETE, "localhost", &delete, Some(TOKEN), ""), &plane, &settings).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }
}
