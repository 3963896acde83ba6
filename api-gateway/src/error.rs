use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// 限流拒绝时写入响应头的数据
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub limit: u64,
    pub remaining: u64,
    /// 距离窗口重置的秒数
    pub reset_secs: u64,
    pub retry_after_secs: Option<u64>,
}

impl RateLimitInfo {
    /// 写入 X-RateLimit-* 与 Retry-After
    pub fn apply(&self, headers: &mut axum::http::HeaderMap) {
        headers.insert("X-RateLimit-Limit", HeaderValue::from(self.limit));
        headers.insert("X-RateLimit-Remaining", HeaderValue::from(self.remaining));
        headers.insert("X-RateLimit-Reset", HeaderValue::from(self.reset_secs));
        if let Some(retry_after) = self.retry_after_secs {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        }
    }
}

/// 请求管道中的错误
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("未找到匹配的路由: {0}")]
    RouteNotFound(String),

    #[error("需要身份认证")]
    Unauthorized,

    #[error("请求过于频繁，请稍后重试")]
    RateLimited(RateLimitInfo),

    #[error("请求体超过大小限制")]
    PayloadTooLarge,

    #[error("上游服务熔断中: {target}")]
    CircuitOpen { target: String },

    #[error("上游服务超时: {target}")]
    UpstreamTimeout { target: String },

    #[error("上游服务不可用: {target}: {reason}")]
    UpstreamUnavailable { target: String, reason: String },

    #[error("上游服务返回错误状态 {status}: {target}")]
    UpstreamStatus { target: String, status: u16 },

    #[error("内部错误: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::UpstreamUnavailable { .. } | GatewayError::UpstreamStatus { .. } => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 生产环境下上游与内部错误只返回通用描述
    fn public_message(&self, expose_details: bool) -> String {
        if expose_details {
            return self.to_string();
        }
        match self {
            GatewayError::CircuitOpen { .. } => "服务暂时不可用".to_string(),
            GatewayError::UpstreamTimeout { .. } => "上游服务响应超时".to_string(),
            GatewayError::UpstreamUnavailable { .. } | GatewayError::UpstreamStatus { .. } => {
                "上游服务异常".to_string()
            }
            GatewayError::Internal(_) => "服务器内部错误".to_string(),
            other => other.to_string(),
        }
    }

    /// 渲染错误响应，附带请求ID
    pub fn render(&self, request_id: &str, expose_details: bool) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": status.as_u16(),
            "message": self.public_message(expose_details),
            "request_id": request_id,
        }));

        let mut response = (status, body).into_response();
        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(request_id) {
            headers.insert("X-Request-ID", value);
        }
        match self {
            GatewayError::RateLimited(info) => info.apply(headers),
            GatewayError::Unauthorized => {
                headers.insert(
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_static("Bearer realm=\"api-gateway\""),
                );
            }
            _ => {}
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_status_mapping() {
        let cases = [
            (GatewayError::RouteNotFound("/x".into()), 404),
            (GatewayError::Unauthorized, 401),
            (GatewayError::CircuitOpen { target: "t".into() }, 503),
            (GatewayError::UpstreamTimeout { target: "t".into() }, 504),
            (
                GatewayError::UpstreamUnavailable {
                    target: "t".into(),
                    reason: "refused".into(),
                },
                502,
            ),
            (
                GatewayError::UpstreamStatus {
                    target: "t".into(),
                    status: 500,
                },
                502,
            ),
            (GatewayError::Internal("x".into()), 500),
        ];
        for (error, status) in cases {
            assert_eq!(error.status_code().as_u16(), status, "{:?}", error);
        }
    }

    #[tokio::test]
    async fn test_rate_limited_headers() {
        let error = GatewayError::RateLimited(RateLimitInfo {
            limit: 5,
            remaining: 0,
            reset_secs: 42,
            retry_after_secs: Some(60),
        });
        let response = error.render("req-1", true);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let headers = response.headers();
        assert_eq!(headers["Retry-After"], "60");
        assert_eq!(headers["X-RateLimit-Limit"], "5");
        assert_eq!(headers["X-RateLimit-Remaining"], "0");
        assert_eq!(headers["X-RateLimit-Reset"], "42");
        assert_eq!(headers["X-Request-ID"], "req-1");

        let body = body_json(response).await;
        assert_eq!(body["error"], 429);
        assert_eq!(body["request_id"], "req-1");
    }

    #[tokio::test]
    async fn test_unauthorized_challenge() {
        let response = GatewayError::Unauthorized.render("req-2", false);
        assert_eq!(
            response.headers()[header::WWW_AUTHENTICATE],
            "Bearer realm=\"api-gateway\""
        );
    }

    #[tokio::test]
    async fn test_production_hides_details() {
        let error = GatewayError::UpstreamUnavailable {
            target: "http://10.0.0.7:3001".into(),
            reason: "connection refused".into(),
        };
        let hidden = body_json(error.render("r", false)).await;
        assert_eq!(hidden["message"], "上游服务异常");

        let shown = body_json(error.render("r", true)).await;
        assert!(shown["message"]
            .as_str()
            .unwrap()
            .contains("connection refused"));
    }
}
