use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use std::net::IpAddr;
use std::time::Duration;

/// 逐跳头，不在网关两侧之间转发
pub const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub const X_GATEWAY_NAME: &str = "x-gateway-name";
pub const X_REQUEST_ID: &str = "x-request-id";
pub const X_USER_ID: &str = "x-user-id";
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// 移除逐跳头，包括 Connection 中列出的头
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// 转发上下文中由网关注入的信息
#[derive(Debug, Clone, Copy)]
pub struct ForwardContext<'a> {
    pub gateway_name: &'a str,
    pub request_id: &'a str,
    pub user_id: Option<&'a str>,
    pub client_ip: Option<IpAddr>,
}

/// 构造发往上游的请求头
///
/// 客户端自带的 X-User-ID 一律丢弃，只信任网关认证得到的身份
pub fn outbound_headers(inbound: &HeaderMap, ctx: &ForwardContext<'_>) -> HeaderMap {
    let mut headers = inbound.clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(X_USER_ID);

    insert_str(&mut headers, X_GATEWAY_NAME, ctx.gateway_name);
    insert_str(&mut headers, X_REQUEST_ID, ctx.request_id);
    if let Some(user_id) = ctx.user_id {
        insert_str(&mut headers, X_USER_ID, user_id);
    }
    if let Some(ip) = ctx.client_ip {
        let forwarded = append_forwarded_for(
            inbound.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()),
            ip,
        );
        insert_str(&mut headers, X_FORWARDED_FOR, &forwarded);
    }
    headers
}

/// 构造返回给客户端的响应头
pub fn inbound_response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = upstream.clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(header::CONTENT_LENGTH);
    headers
}

fn insert_str(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

/// 在已有的 X-Forwarded-For 后追加客户端地址
pub fn append_forwarded_for(existing: Option<&str>, ip: IpAddr) -> String {
    match existing.map(str::trim).filter(|v| !v.is_empty()) {
        Some(existing) => format!("{}, {}", existing, ip),
        None => ip.to_string(),
    }
}

/// 第 `attempt` 次重试前的等待时间，指数增长并封顶
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let exp = attempt.saturating_sub(1).min(32);
    let delay = base_ms.saturating_mul(1u64 << exp);
    Duration::from_millis(delay.min(max_ms))
}

/// 合并URL
pub fn join_url(base: &str, path: &str) -> String {
    let base_ends_with_slash = base.ends_with('/');
    let path_starts_with_slash = path.starts_with('/');

    match (base_ends_with_slash, path_starts_with_slash) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

/// 上游请求地址
///
/// 开启 `strip_prefix` 时只转发匹配之后的剩余路径
pub fn upstream_url(
    target: &str,
    path: &str,
    remainder: &str,
    strip_prefix: bool,
    query: Option<&str>,
) -> String {
    let forwarded = if strip_prefix {
        if remainder.is_empty() {
            "/"
        } else {
            remainder
        }
    } else {
        path
    };
    let mut url = join_url(target, forwarded);
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    url
}
