//! 网关应用：共享状态、保留端点、管理端点和转发管道

use axum::{
    extract::{Request, State},
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use cache::Cache;
use common::config::AppConfig;
use common::configs::{validate_timeouts, CorsConfig, RouteConfig};
use common::Error;
use http_body_util::LengthLimitError;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{bearer_token, IdentityExtractor, JwtIdentityExtractor};
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::error::GatewayError;
use crate::health::{HealthRegistry, HealthStatus};
use crate::metrics::{MetricsSnapshot, RequestStats};
use crate::middleware::{client_ip, RequestId, RequestLoggerLayer};
use crate::proxy::{ProxyRequest, ServiceProxy};
use crate::rate_limit::violations::ViolationLog;
use crate::rate_limit::{ClientIdentity, RateLimiter, RequestOutcome};
use crate::router::{RouteRegistry, RouteTable};

/// 网关共享状态
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub routes: Arc<RouteRegistry>,
    pub proxy: ServiceProxy,
    pub limiter: Arc<RateLimiter>,
    pub health: Arc<HealthRegistry>,
    pub breakers: CircuitBreakerRegistry,
    pub identity: Arc<dyn IdentityExtractor>,
    pub violations: Arc<ViolationLog>,
    pub stats: Arc<RequestStats>,
    pub cache: Arc<dyn Cache>,
    pub prometheus: Option<PrometheusHandle>,
}

impl AppState {
    /// 根据配置组装各组件，路由表非法时返回配置错误
    pub fn new(config: Arc<AppConfig>, cache: Arc<dyn Cache>) -> Result<Self, Error> {
        let gateway = &config.gateway;
        let budget_errors = validate_timeouts(&gateway.routes, gateway.request_timeout_ms());
        if !budget_errors.is_empty() {
            return Err(Error::Config(budget_errors.join("; ")));
        }
        let table = RouteTable::new(gateway.routes.clone())
            .map_err(|errors| Error::Config(errors.join("; ")))?;
        info!("路由表加载完成，共 {} 条路由", table.len());

        let routes = Arc::new(RouteRegistry::new(table));
        let health = Arc::new(HealthRegistry::new(gateway.health.clone()));
        let breakers = CircuitBreakerRegistry::new();
        let violations = Arc::new(ViolationLog::default());
        let limiter = Arc::new(RateLimiter::new(
            cache.clone(),
            gateway.rate_limit.clone(),
            health.clone(),
            violations.clone(),
        ));
        let proxy = ServiceProxy::new(
            breakers.clone(),
            health.clone(),
            gateway.retry.clone(),
            gateway.name.clone(),
        )
        .map_err(|e| Error::Internal(format!("创建上游HTTP客户端失败: {}", e)))?;
        let identity: Arc<dyn IdentityExtractor> =
            Arc::new(JwtIdentityExtractor::new(gateway.auth.jwt_secret.as_deref()));

        Ok(Self {
            routes,
            proxy,
            limiter,
            health,
            breakers,
            identity,
            violations,
            stats: Arc::new(RequestStats::new()),
            cache,
            prometheus: None,
            config,
        })
    }

    pub fn with_prometheus(mut self, handle: Option<PrometheusHandle>) -> Self {
        self.prometheus = handle;
        self
    }

    fn expose_details(&self) -> bool {
        !self.config.server.is_production()
    }

    fn metrics_snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot::collect(&self.stats, &self.health, &self.breakers, &self.violations)
    }
}

/// 构建完整的网关路由
///
/// 转发请求的总超时由转发管道按截止时间控制，超时层只作用于保留端点和管理端点
pub fn build_router(state: AppState) -> Router {
    let gateway = &state.config.gateway;
    let timeout = Duration::from_secs(gateway.request_timeout_secs);

    let reserved = Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(readiness))
        .route("/health/live", get(liveness))
        .route("/metrics", get(metrics_json))
        .route("/metrics/prometheus", get(metrics_prometheus))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .layer(TimeoutLayer::new(timeout));

    let mut app = Router::new().merge(reserved);

    if gateway.admin.api_key.as_deref().is_some_and(|k| !k.is_empty()) {
        let admin = Router::new()
            .route("/admin/routes", get(list_routes).put(replace_routes))
            .route("/admin/rate-limit/violations", get(list_violations))
            .route_layer(middleware::from_fn_with_state(state.clone(), admin_auth))
            .layer(TimeoutLayer::new(timeout));
        app = app.merge(admin);
        info!("管理端点已启用");
    }

    let cors = cors_layer(&gateway.cors);
    let max_body_size = gateway.max_body_size;
    let stats = state.stats.clone();

    app.fallback(gateway_handler)
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(max_body_size))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(RequestLoggerLayer::new(stats))
}

fn cors_layer(config: &CorsConfig) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
            Method::PATCH,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
            header::ORIGIN,
            header::USER_AGENT,
            HeaderName::from_static("x-request-id"),
        ])
        .expose_headers([
            HeaderName::from_static("x-request-id"),
            HeaderName::from_static("x-ratelimit-limit"),
            HeaderName::from_static("x-ratelimit-remaining"),
            HeaderName::from_static("x-ratelimit-reset"),
            header::RETRY_AFTER,
        ])
        .max_age(Duration::from_secs(3600));

    if config.allowed_origins.iter().any(|o| o == "*") {
        return layer.allow_origin(AllowOrigin::any());
    }

    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("忽略非法的CORS来源: {}", origin);
                None
            }
        })
        .collect();
    layer
        .allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true)
}

async fn health(State(state): State<AppState>) -> Response {
    let report = state.health.report(state.metrics_snapshot());
    let status = if report.status == HealthStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(report)).into_response()
}

async fn readiness(State(state): State<AppState>) -> Response {
    let report = state.health.readiness(state.cache.as_ref()).await;
    let status = if report.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

async fn liveness(State(state): State<AppState>) -> Response {
    Json(state.health.liveness()).into_response()
}

async fn metrics_json(State(state): State<AppState>) -> Response {
    Json(state.metrics_snapshot()).into_response()
}

async fn metrics_prometheus(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "Prometheus指标未启用").into_response(),
    }
}

/// 管理端点认证：Bearer 令牌必须与配置的密钥一致
async fn admin_auth(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let expected = state.config.gateway.admin.api_key.as_deref();
    match (expected, bearer_token(req.headers())) {
        (Some(expected), Some(token)) if expected == token => next.run(req).await,
        _ => {
            warn!(path = %req.uri().path(), "管理端点认证失败");
            Error::Unauthorized.into_response()
        }
    }
}

async fn list_routes(State(state): State<AppState>) -> Json<Vec<RouteConfig>> {
    Json(state.routes.snapshot().configs())
}

async fn replace_routes(
    State(state): State<AppState>,
    Json(routes): Json<Vec<RouteConfig>>,
) -> Result<Json<serde_json::Value>, Error> {
    let budget_errors = validate_timeouts(&routes, state.config.gateway.request_timeout_ms());
    if !budget_errors.is_empty() {
        return Err(Error::BadRequest(budget_errors.join("; ")));
    }
    let count = state
        .routes
        .replace(routes)
        .map_err(|errors| Error::BadRequest(errors.join("; ")))?;
    state.health.retain(&state.routes.snapshot().targets());
    Ok(Json(json!({ "routes": count })))
}

async fn list_violations(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "recent": state.violations.recent(100),
        "top": state.violations.leaderboard(10),
    }))
}

/// 非保留路径的统一入口
async fn gateway_handler(State(state): State<AppState>, req: Request) -> Response {
    let started = Instant::now();
    let deadline = started + Duration::from_millis(state.config.gateway.request_timeout_ms());
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut response = match forward(&state, req, &request_id, deadline).await {
        Ok(response) => response,
        Err(err) => {
            debug!(request_id = %request_id, "请求在网关阶段结束: {}", err);
            err.render(&request_id, state.expose_details())
        }
    };

    let headers = response.headers_mut();
    headers.insert(
        "X-Gateway-Duration",
        HeaderValue::from(started.elapsed().as_millis() as u64),
    );
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert("X-Request-ID", value);
    }
    response
}

/// 解析路由、认证、限流、读取请求体，然后转发
async fn forward(
    state: &AppState,
    req: Request,
    request_id: &str,
    deadline: Instant,
) -> Result<Response, GatewayError> {
    let path = req.uri().path().to_string();
    let route = state
        .routes
        .resolve(&path)
        .ok_or_else(|| GatewayError::RouteNotFound(path.clone()))?;

    let identity = state.identity.extract(req.headers());
    if !route.config().public && identity.is_none() {
        return Err(GatewayError::Unauthorized);
    }

    let peer_ip = client_ip(&req);
    let client = match &identity {
        Some(identity) => ClientIdentity::user(identity.user_id.clone()),
        None => ClientIdentity::anonymous(
            peer_ip
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        ),
    };

    let limit = state
        .limiter
        .check(&client, &path, req.method().as_str())
        .await;
    if !limit.allowed {
        return Err(GatewayError::RateLimited(limit.info().unwrap_or_default()));
    }

    let (parts, body) = req.into_parts();
    let read = tokio::time::timeout_at(
        deadline,
        axum::body::to_bytes(body, state.config.gateway.max_body_size),
    )
    .await;
    let body = match read {
        Ok(Ok(body)) => body,
        Ok(Err(e)) => {
            debug!(request_id = %request_id, "读取请求体失败: {}", e);
            state.limiter.record(&limit, RequestOutcome::Failure).await;
            if exceeds_body_limit(&e) {
                return Err(GatewayError::PayloadTooLarge);
            }
            return Err(GatewayError::Internal(format!("读取请求体失败: {}", e)));
        }
        Err(_) => {
            warn!(request_id = %request_id, "读取请求体超时");
            state.limiter.record(&limit, RequestOutcome::Failure).await;
            return Err(GatewayError::UpstreamTimeout {
                target: route.target.clone(),
            });
        }
    };

    let proxy_request = ProxyRequest {
        method: parts.method,
        path,
        query: parts.uri.query().map(str::to_string),
        headers: parts.headers,
        body,
        request_id: request_id.to_string(),
        user_id: identity.map(|i| i.user_id),
        client_ip: peer_ip,
        deadline,
    };

    let result = state.proxy.proxy(&proxy_request, &route).await;
    let outcome = match &result {
        Ok(outcome) => RequestOutcome::from_status(outcome.status.as_u16()),
        Err(_) => RequestOutcome::Failure,
    };
    state.limiter.record(&limit, outcome).await;

    let mut response = result?.into_response();
    if let Some(info) = limit.info() {
        info.apply(response.headers_mut());
    }
    Ok(response)
}

/// 请求体错误链中是否包含长度超限
fn exceeds_body_limit(err: &axum::Error) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if e.is::<LengthLimitError>() {
            return true;
        }
        current = e.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Claims;
    use crate::test_support::{route, spawn_upstream, FailingCache};
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::HeaderMap;
    use cache::MemoryCache;
    use common::configs::RateLimitRule;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::Value;
    use std::net::SocketAddr;
    use tower::ServiceExt;

    const SECRET: &str = "test-secret";
    const ADMIN_KEY: &str = "admin-key";

    async fn upstream() -> String {
        spawn_upstream(
            Router::new()
                .route(
                    "/search",
                    get(|axum::extract::RawQuery(q): axum::extract::RawQuery| async move {
                        Json(json!({ "results": [], "query": q }))
                    }),
                )
                .route(
                    "/api/users/me",
                    get(|headers: HeaderMap| async move {
                        let user = headers
                            .get("x-user-id")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string();
                        Json(json!({ "user": user }))
                    }),
                )
                .route("/find", get(|| async { "found" }))
                .route("/upload", axum::routing::post(|body: String| async move { body })),
        )
        .await
    }

    fn config(target: &str, cache_rule: RateLimitRule) -> AppConfig {
        let mut config = AppConfig::default();
        config.gateway.routes = vec![
            route(json!({ "path": "/search", "target": target, "public": true })),
            route(json!({ "path": "/upload", "target": target, "public": true })),
            route(json!({ "path": "/api/users", "target": target })),
        ];
        config.gateway.auth.jwt_secret = Some(SECRET.to_string());
        config.gateway.admin.api_key = Some(ADMIN_KEY.to_string());
        config.gateway.rate_limit.anonymous = cache_rule;
        config.gateway.rate_limit.global = None;
        config.gateway.max_body_size = 1024;
        config
    }

    fn app_with(config: AppConfig, cache: Arc<dyn Cache>) -> Router {
        let state = AppState::new(Arc::new(config), cache).unwrap();
        build_router(state)
    }

    fn get_request(uri: &str) -> Request {
        let mut req = axum::http::Request::get(uri).body(Body::empty()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 1], 40000))));
        req
    }

    fn token(sub: &str) -> String {
        let exp = (chrono::Utc::now().timestamp() + 3600) as u64;
        encode(
            &Header::default(),
            &Claims {
                sub: sub.to_string(),
                exp,
            },
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_search_end_to_end() {
        let target = upstream().await;
        let app = app_with(
            config(&target, RateLimitRule::new(60_000, 100, 60_000)),
            Arc::new(MemoryCache::new()),
        );

        let response = app.oneshot(get_request("/search?q=test")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let headers = response.headers();
        assert_eq!(headers["x-upstream-target"], target.as_str());
        let duration: u64 = headers["x-gateway-duration"].to_str().unwrap().parse().unwrap();
        assert!(duration < 60_000);
        assert!(headers.contains_key("x-request-id"));
        assert!(headers.contains_key("x-upstream-duration"));
        assert!(!headers.contains_key("x-retry-count"));
        assert_eq!(headers["x-ratelimit-limit"], "100");
        assert_eq!(headers["x-ratelimit-remaining"], "100");

        let body = body_json(response).await;
        assert_eq!(body["query"], "q=test");
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let target = upstream().await;
        let app = app_with(
            config(&target, RateLimitRule::new(60_000, 100, 60_000)),
            Arc::new(MemoryCache::new()),
        );

        let response = app.oneshot(get_request("/nowhere")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let request_id = response.headers()["x-request-id"].to_str().unwrap().to_string();
        let body = body_json(response).await;
        assert_eq!(body["error"], 404);
        assert_eq!(body["request_id"], request_id.as_str());
    }

    #[tokio::test]
    async fn test_private_route_requires_identity() {
        let target = upstream().await;
        let app = app_with(
            config(&target, RateLimitRule::new(60_000, 100, 60_000)),
            Arc::new(MemoryCache::new()),
        );

        let response = app.clone().oneshot(get_request("/api/users/me")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers()[header::WWW_AUTHENTICATE],
            "Bearer realm=\"api-gateway\""
        );

        let mut req = get_request("/api/users/me");
        req.headers_mut().insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token("u-42"))).unwrap(),
        );
        req.headers_mut()
            .insert("x-user-id", HeaderValue::from_static("spoofed"));
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["user"], "u-42");
    }

    #[tokio::test]
    async fn test_rate_limited_with_headers() {
        let target = upstream().await;
        let app = app_with(
            config(&target, RateLimitRule::new(60_000, 2, 30_000)),
            Arc::new(MemoryCache::new()),
        );

        for _ in 0..2 {
            let response = app.clone().oneshot(get_request("/search")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app.clone().oneshot(get_request("/search")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let headers = response.headers();
        assert_eq!(headers[header::RETRY_AFTER], "30");
        assert_eq!(headers["x-ratelimit-limit"], "2");
        assert_eq!(headers["x-ratelimit-remaining"], "0");
        assert!(headers.contains_key("x-ratelimit-reset"));

        let response = app
            .oneshot(
                axum::http::Request::get("/admin/rate-limit/violations")
                    .header(header::AUTHORIZATION, format!("Bearer {}", ADMIN_KEY))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["recent"][0]["identifier"], "10.0.0.1");
        assert_eq!(body["recent"][0]["identifier_type"], "ip");
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let target = upstream().await;
        let app = app_with(
            config(&target, RateLimitRule::new(60_000, 1, 30_000)),
            Arc::new(FailingCache),
        );

        for _ in 0..3 {
            let response = app.clone().oneshot(get_request("/search")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app.clone().oneshot(get_request("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["store"]["healthy"], false);

        let response = app.oneshot(get_request("/health/ready")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(response).await["ready"], false);
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let target = upstream().await;
        let app = app_with(
            config(&target, RateLimitRule::new(60_000, 100, 60_000)),
            Arc::new(MemoryCache::new()),
        );

        let mut req = axum::http::Request::post("/upload").body(Body::from("a".repeat(4096))).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 1], 40000))));
        let response = app.clone().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let response = app
            .oneshot(axum::http::Request::post("/upload").body(Body::from("hello")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"hello");
    }

    #[tokio::test]
    async fn test_reserved_endpoints_not_cacheable() {
        let app = app_with(AppConfig::default(), Arc::new(MemoryCache::new()));

        for path in ["/health", "/health/ready", "/health/live", "/metrics"] {
            let response = app.clone().oneshot(get_request(path)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{}", path);
            assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");
        }

        let response = app.clone().oneshot(get_request("/health/live")).await.unwrap();
        assert_eq!(body_json(response).await["alive"], true);

        let response = app.oneshot(get_request("/metrics")).await.unwrap();
        let body = body_json(response).await;
        assert!(body["requests"]["total"].as_u64().unwrap() >= 1);
    }

    #[tokio::test]
    async fn test_admin_replaces_routes() {
        let target = upstream().await;
        let app = app_with(
            config(&target, RateLimitRule::new(60_000, 100, 60_000)),
            Arc::new(MemoryCache::new()),
        );
        let admin = |method: Method, body: Body| {
            axum::http::Request::builder()
                .method(method)
                .uri("/admin/routes")
                .header(header::AUTHORIZATION, format!("Bearer {}", ADMIN_KEY))
                .header(header::CONTENT_TYPE, "application/json")
                .body(body)
                .unwrap()
        };

        let response = app
            .clone()
            .oneshot(axum::http::Request::get("/admin/routes").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let invalid = json!([{ "path": "no-slash", "target": target }]).to_string();
        let response = app.clone().oneshot(admin(Method::PUT, Body::from(invalid))).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // 路由超时不能超过整个请求的超时
        let too_slow =
            json!([{ "path": "/find", "target": target, "timeout_ms": 60_000 }]).to_string();
        let response = app.clone().oneshot(admin(Method::PUT, Body::from(too_slow))).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app.clone().oneshot(admin(Method::GET, Body::empty())).await.unwrap();
        assert_eq!(body_json(response).await.as_array().unwrap().len(), 3);

        let replacement = json!([{ "path": "/find", "target": target, "public": true }]).to_string();
        let response = app
            .clone()
            .oneshot(admin(Method::PUT, Body::from(replacement)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["routes"], 1);

        let response = app.clone().oneshot(get_request("/find?q=x")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.oneshot(get_request("/search")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_admin_disabled_without_key() {
        let mut config = AppConfig::default();
        config.gateway.admin.api_key = None;
        let app = app_with(config, Arc::new(MemoryCache::new()));
        let response = app
            .oneshot(
                axum::http::Request::get("/admin/routes")
                    .header(header::AUTHORIZATION, "Bearer anything")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_hanging_upstream_times_out_and_trips_breaker() {
        let target = spawn_upstream(Router::new().route(
            "/hang",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        ))
        .await;
        let mut config = AppConfig::default();
        config.gateway.request_timeout_secs = 1;
        config.gateway.rate_limit.enabled = false;
        config.gateway.retry.base_delay_ms = 10;
        config.gateway.routes = vec![route(json!({
            "path": "/hang",
            "target": target,
            "public": true,
            "timeout_ms": 600,
            "retries": 2,
            "circuit_breaker": { "failure_threshold": 2, "reset_timeout_ms": 60_000 }
        }))];
        let state = AppState::new(Arc::new(config), Arc::new(MemoryCache::new())).unwrap();
        let breakers = state.breakers.clone();
        let app = build_router(state);

        let started = Instant::now();
        let response = app.clone().oneshot(get_request("/hang")).await.unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(response.headers().contains_key("x-gateway-duration"));
        assert!(started.elapsed() < Duration::from_millis(1500));
        assert_eq!(breakers.state(&target), crate::circuit_breaker::CircuitState::Open);

        let response = app.oneshot(get_request("/hang")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_route_timeout_must_fit_request_budget() {
        let mut config = AppConfig::default();
        config.gateway.request_timeout_secs = 1;
        config.gateway.routes = vec![route(json!({
            "path": "/a",
            "target": "http://localhost:3001",
            "timeout_ms": 1000
        }))];
        let result = AppState::new(Arc::new(config), Arc::new(MemoryCache::new()));
        assert!(matches!(result, Err(Error::Config(msg)) if msg.contains("timeout_ms")));
    }

    #[tokio::test]
    async fn test_body_limit_detected_in_error_chain() {
        let err = axum::body::to_bytes(Body::from("abcdef"), 2).await.unwrap_err();
        assert!(exceeds_body_limit(&err));

        let other = axum::Error::new(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "客户端断开",
        ));
        assert!(!exceeds_body_limit(&other));
    }

    #[test]
    fn test_invalid_routes_abort_startup() {
        let mut config = AppConfig::default();
        config.gateway.routes = vec![route(json!({ "path": "/a", "target": "ftp://x" }))];
        let result = AppState::new(Arc::new(config), Arc::new(MemoryCache::new()));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
