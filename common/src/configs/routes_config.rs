use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_ms() -> u64 {
    60_000
}

/// 负载均衡策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancing {
    /// 轮询
    #[default]
    RoundRobin,
}

/// 单条路由的熔断参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    /// 开启熔断功能
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 连续失败多少次后熔断
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// 熔断后多久允许一次探测请求（毫秒）
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
        }
    }
}

/// 路由配置：一个路径前缀对应一组上游目标
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteConfig {
    /// 路径模式，如 `/api/users` 或 `/api/users/:id`
    pub path: String,
    /// 上游基础地址
    pub target: String,
    /// 额外的上游地址，与 `target` 一起轮询
    #[serde(default)]
    pub extra_targets: Vec<String>,
    /// 是否无需身份即可访问
    #[serde(default)]
    pub public: bool,
    /// 单次上游调用超时（毫秒）
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// 失败后的重试次数，0 表示只调用一次
    #[serde(default)]
    pub retries: u32,
    /// 健康检查路径
    #[serde(default)]
    pub health_check_path: Option<String>,
    #[serde(default)]
    pub load_balancing: LoadBalancing,
    /// 转发时去掉匹配到的前缀
    #[serde(default)]
    pub strip_prefix: bool,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
}

impl RouteConfig {
    /// 该路由的所有上游目标，主目标在前
    pub fn targets(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.target.as_str()).chain(self.extra_targets.iter().map(String::as_str))
    }
}

/// 校验上游基础地址，只接受带主机名的 http/https 地址
pub fn validate_target(target: &str) -> Result<Url, String> {
    let url = Url::parse(target).map_err(|e| format!("上游地址无效 '{}': {}", target, e))?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(format!("上游地址 '{}' 协议不支持: {}", target, other)),
    }
    if url.host_str().is_none() {
        return Err(format!("上游地址 '{}' 缺少主机名", target));
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(format!("上游地址 '{}' 不能包含查询参数或片段", target));
    }
    Ok(url)
}

/// 校验整张路由表，返回全部问题
pub fn validate_routes(routes: &[RouteConfig]) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for route in routes {
        if !route.path.starts_with('/') {
            errors.push(format!("路由路径必须以 '/' 开头: {}", route.path));
        }
        let normalized = normalize_pattern(&route.path);
        if !seen.insert(normalized.clone()) {
            errors.push(format!("路由路径重复: {}", normalized));
        }
        for target in route.targets() {
            if let Err(e) = validate_target(target) {
                errors.push(format!("路由 {}: {}", route.path, e));
            }
        }
        if route.timeout_ms == 0 {
            errors.push(format!("路由 {}: timeout_ms 必须大于0", route.path));
        }
        if let Some(health_path) = &route.health_check_path {
            if !health_path.starts_with('/') {
                errors.push(format!(
                    "路由 {}: 健康检查路径必须以 '/' 开头: {}",
                    route.path, health_path
                ));
            }
        }
        let breaker = &route.circuit_breaker;
        if breaker.enabled && (breaker.failure_threshold == 0 || breaker.reset_timeout_ms == 0) {
            errors.push(format!(
                "路由 {}: 熔断阈值和重置时间必须大于0",
                route.path
            ));
        }
    }

    errors
}

/// 单次上游调用必须短于整个请求的超时预算
pub fn validate_timeouts(routes: &[RouteConfig], request_timeout_ms: u64) -> Vec<String> {
    routes
        .iter()
        .filter(|route| route.timeout_ms >= request_timeout_ms)
        .map(|route| {
            format!(
                "路由 {}: timeout_ms ({}) 必须小于请求超时 ({}ms)",
                route.path, route.timeout_ms, request_timeout_ms
            )
        })
        .collect()
}

/// 去掉末尾斜杠，根路径保持 `/`
pub fn normalize_pattern(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}
