use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Method, Response, StatusCode};
use bytes::Bytes;
use common::configs::RetryConfig;
use reqwest::Client;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::error::GatewayError;
use crate::health::HealthRegistry;
use crate::proxy::utils::{
    calculate_backoff, inbound_response_headers, outbound_headers, upstream_url, ForwardContext,
};
use crate::router::RouteMatch;

/// 已缓冲的入站请求
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub request_id: String,
    pub user_id: Option<String>,
    pub client_ip: Option<IpAddr>,
    /// 整个请求的截止时间，所有尝试和退避都不能越过
    pub deadline: Instant,
}

/// 上游返回的结果
#[derive(Debug)]
pub struct ProxyOutcome {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub target: String,
    /// 最后一次尝试的耗时
    pub upstream_duration: Duration,
    /// 重试次数，不含首次尝试
    pub retries: u32,
}

impl ProxyOutcome {
    /// 转成客户端响应，附带上游相关的响应头
    pub fn into_response(self) -> Response<Body> {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;

        let headers = response.headers_mut();
        headers.insert(
            "X-Upstream-Duration",
            HeaderValue::from(self.upstream_duration.as_millis() as u64),
        );
        if let Ok(target) = HeaderValue::from_str(&self.target) {
            headers.insert("X-Upstream-Target", target);
        }
        if self.retries > 0 {
            headers.insert("X-Retry-Count", HeaderValue::from(self.retries));
        }
        response
    }
}

/// 单次尝试的失败原因
#[derive(Debug)]
enum AttemptError {
    Timeout,
    Network(String),
    Status(StatusCode),
}

impl AttemptError {
    fn label(&self) -> &'static str {
        match self {
            AttemptError::Timeout => "timeout",
            AttemptError::Network(_) => "network",
            AttemptError::Status(_) => "status",
        }
    }

    fn into_gateway_error(self, target: &str) -> GatewayError {
        let target = target.to_string();
        match self {
            AttemptError::Timeout => GatewayError::UpstreamTimeout { target },
            AttemptError::Network(reason) => GatewayError::UpstreamUnavailable { target, reason },
            AttemptError::Status(status) => GatewayError::UpstreamStatus {
                target,
                status: status.as_u16(),
            },
        }
    }
}

struct UpstreamReply {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

/// 服务代理 - 负责转发请求到上游服务
#[derive(Clone)]
pub struct ServiceProxy {
    http_client: Client,
    breakers: CircuitBreakerRegistry,
    health: Arc<HealthRegistry>,
    retry: RetryConfig,
    gateway_name: String,
}

impl ServiceProxy {
    pub fn new(
        breakers: CircuitBreakerRegistry,
        health: Arc<HealthRegistry>,
        retry: RetryConfig,
        gateway_name: impl Into<String>,
    ) -> Result<Self, reqwest::Error> {
        // 超时按路由单独控制，重定向原样交给客户端
        let http_client = Client::builder()
            .pool_max_idle_per_host(100)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            http_client,
            breakers,
            health,
            retry,
            gateway_name: gateway_name.into(),
        })
    }

    /// 转发请求到路由选中的上游
    ///
    /// 5xx、网络错误和超时都计为失败并按退避重试；
    /// 熔断打开时直接失败，不计入重试。
    /// 每次尝试的超时取路由超时与剩余预算中较小者，预算耗尽返回超时
    pub async fn proxy(
        &self,
        req: &ProxyRequest,
        route: &RouteMatch,
    ) -> Result<ProxyOutcome, GatewayError> {
        let config = route.config();
        let target = route.target.as_str();
        let url = upstream_url(
            target,
            &req.path,
            &route.remainder,
            config.strip_prefix,
            req.query.as_deref(),
        );
        let headers = outbound_headers(
            &req.headers,
            &ForwardContext {
                gateway_name: &self.gateway_name,
                request_id: &req.request_id,
                user_id: req.user_id.as_deref(),
                client_ip: req.client_ip,
            },
        );
        let route_timeout = Duration::from_millis(config.timeout_ms);

        let mut retries = 0u32;
        loop {
            let remaining = req.deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(request_id = %req.request_id, target_url = %target, "请求超时预算耗尽");
                return Err(GatewayError::UpstreamTimeout {
                    target: target.to_string(),
                });
            }

            let permit = match self.breakers.acquire(target, &config.circuit_breaker) {
                Ok(permit) => permit,
                Err(open) => {
                    warn!(
                        request_id = %req.request_id,
                        target_url = %target,
                        retry_after_ms = open.retry_after.as_millis() as u64,
                        "熔断器打开，拒绝转发"
                    );
                    return Err(GatewayError::CircuitOpen { target: open.target });
                }
            };

            let timeout = route_timeout.min(remaining);
            debug!(
                request_id = %req.request_id,
                attempt = retries + 1,
                probe = permit.is_probe(),
                timeout_ms = timeout.as_millis() as u64,
                "转发HTTP请求: {} {}",
                req.method,
                url
            );
            let started = Instant::now();
            let result = self
                .send_once(req.method.clone(), &url, headers.clone(), req.body.clone(), timeout)
                .await;
            let elapsed = started.elapsed();

            match result {
                Ok(reply) => {
                    permit.success();
                    self.health
                        .record_call(target, true, elapsed, self.breakers.is_open(target));
                    ::metrics::counter!("gateway_upstream_attempts_total", "outcome" => "success")
                        .increment(1);
                    return Ok(ProxyOutcome {
                        status: reply.status,
                        headers: inbound_response_headers(&reply.headers),
                        body: reply.body,
                        target: target.to_string(),
                        upstream_duration: elapsed,
                        retries,
                    });
                }
                Err(err) => {
                    permit.failure();
                    self.health
                        .record_call(target, false, elapsed, self.breakers.is_open(target));
                    ::metrics::counter!("gateway_upstream_attempts_total", "outcome" => err.label())
                        .increment(1);

                    if retries >= config.retries {
                        error!(
                            request_id = %req.request_id,
                            target_url = %target,
                            attempts = retries + 1,
                            "上游调用失败: {:?}",
                            err
                        );
                        return Err(err.into_gateway_error(target));
                    }

                    retries += 1;
                    let delay =
                        calculate_backoff(retries, self.retry.base_delay_ms, self.retry.max_delay_ms);
                    if delay >= req.deadline.saturating_duration_since(Instant::now()) {
                        error!(
                            request_id = %req.request_id,
                            target_url = %target,
                            attempts = retries,
                            "剩余预算不足以重试: {:?}",
                            err
                        );
                        return Err(err.into_gateway_error(target));
                    }
                    warn!(
                        request_id = %req.request_id,
                        target_url = %target,
                        retry = retries,
                        delay_ms = delay.as_millis() as u64,
                        "上游调用失败，稍后重试: {:?}",
                        err
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// 发送一次请求并读完响应体，整体受超时约束
    async fn send_once(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Bytes,
        timeout: Duration,
    ) -> Result<UpstreamReply, AttemptError> {
        let call = async {
            let resp = self
                .http_client
                .request(method, url)
                .headers(headers)
                .body(body)
                .send()
                .await
                .map_err(|e| AttemptError::Network(e.to_string()))?;
            let status = resp.status();
            let headers = resp.headers().clone();
            let body = resp
                .bytes()
                .await
                .map_err(|e| AttemptError::Network(e.to_string()))?;
            Ok::<_, AttemptError>(UpstreamReply {
                status,
                headers,
                body,
            })
        };

        let reply = tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| AttemptError::Timeout)??;
        if reply.status.is_server_error() {
            return Err(AttemptError::Status(reply.status));
        }
        Ok(reply)
    }
}
