use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::{
    extract::ConnectInfo,
    http::{self, HeaderValue},
};
use futures::future::BoxFuture;
use tower::{Layer, Service};
use tracing::{info, warn};
use uuid::Uuid;

use crate::metrics::RequestStats;
use crate::proxy::utils::X_REQUEST_ID;

/// 本次请求的关联ID，写入请求扩展供后续阶段读取
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// 请求日志中间件
///
/// 为请求分配关联ID，记录开始与完成日志，并维护请求计数
#[derive(Clone)]
pub struct RequestLoggerLayer {
    stats: Arc<RequestStats>,
}

impl RequestLoggerLayer {
    pub fn new(stats: Arc<RequestStats>) -> Self {
        Self { stats }
    }
}

impl<S> Layer<S> for RequestLoggerLayer {
    type Service = RequestLogger<S>;

    fn layer(&self, service: S) -> Self::Service {
        RequestLogger {
            inner: service,
            stats: self.stats.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RequestLogger<S> {
    inner: S,
    stats: Arc<RequestStats>,
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for RequestLogger<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: http::Request<ReqBody>) -> Self::Future {
        let mut inner = self.inner.clone();
        let stats = self.stats.clone();

        let method = req.method().clone();
        let path = req.uri().path().to_string();

        // 沿用客户端提供的关联ID，没有时生成
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            req.headers_mut().insert(X_REQUEST_ID, value);
        }
        req.extensions_mut().insert(RequestId(request_id.clone()));

        let client_ip = get_client_ip(&req);
        let start_time = Instant::now();

        info!(
            method = %method,
            path = %path,
            request_id = %request_id,
            client_ip = %client_ip,
            "收到HTTP请求"
        );

        let future = inner.call(req);

        Box::pin(async move {
            match future.await {
                Ok(mut response) => {
                    let duration = start_time.elapsed();
                    let status = response.status().as_u16();
                    stats.record(status, duration);

                    if !response.headers().contains_key(X_REQUEST_ID) {
                        if let Ok(value) = HeaderValue::from_str(&request_id) {
                            response.headers_mut().insert(X_REQUEST_ID, value);
                        }
                    }

                    info!(
                        method = %method,
                        path = %path,
                        status = %status,
                        duration_ms = %duration.as_millis(),
                        request_id = %request_id,
                        client_ip = %client_ip,
                        "HTTP请求处理完成"
                    );

                    Ok(response)
                }
                Err(err) => {
                    let duration = start_time.elapsed();

                    warn!(
                        method = %method,
                        path = %path,
                        duration_ms = %duration.as_millis(),
                        request_id = %request_id,
                        client_ip = %client_ip,
                        "HTTP请求处理失败"
                    );

                    Err(err)
                }
            }
        })
    }
}

/// 日志用的客户端IP：依次取 X-Forwarded-For、X-Real-IP、连接地址
fn get_client_ip<B>(request: &http::Request<B>) -> String {
    request
        .headers()
        .get("X-Forwarded-For")
        .and_then(|value| value.to_str().ok())
        .map(|s| s.split(',').next().unwrap_or("").trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| {
            request
                .headers()
                .get("X-Real-IP")
                .and_then(|value| value.to_str().ok())
                .map(|s| s.to_string())
        })
        .unwrap_or_else(|| {
            client_ip(request)
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "未知客户端IP".to_string())
        })
}

/// 连接层面的客户端地址，客户端无法伪造
pub fn client_ip<B>(request: &http::Request<B>) -> Option<IpAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|connect_info| connect_info.0.ip())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    fn app(stats: Arc<RequestStats>) -> Router {
        Router::new()
            .route(
                "/echo",
                get(|axum::Extension(id): axum::Extension<RequestId>| async move { id.0 }),
            )
            .layer(RequestLoggerLayer::new(stats))
    }

    #[tokio::test]
    async fn test_generates_request_id() {
        let stats = Arc::new(RequestStats::new());
        let response = app(stats.clone())
            .oneshot(http::Request::get("/echo").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let header = response.headers()[X_REQUEST_ID].to_str().unwrap().to_string();
        assert!(Uuid::parse_str(&header).is_ok());
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body, header.as_bytes());
        assert_eq!(stats.snapshot().total, 1);
    }

    #[tokio::test]
    async fn test_keeps_client_request_id() {
        let stats = Arc::new(RequestStats::new());
        let response = app(stats.clone())
            .oneshot(
                http::Request::get("/missing")
                    .header("x-request-id", "abc-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), http::StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[X_REQUEST_ID], "abc-123");
        assert_eq!(stats.snapshot().client_errors, 1);
    }

    #[test]
    fn test_client_ip_order() {
        let req = http::Request::get("/")
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .body(())
            .unwrap();
        assert_eq!(get_client_ip(&req), "203.0.113.7");

        let req = http::Request::get("/")
            .header("x-real-ip", "198.51.100.2")
            .body(())
            .unwrap();
        assert_eq!(get_client_ip(&req), "198.51.100.2");

        let mut req = http::Request::get("/").body(()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 9000))));
        assert_eq!(get_client_ip(&req), "127.0.0.1");
        assert_eq!(client_ip(&req), Some(IpAddr::from([127, 0, 0, 1])));
    }
}
