use serde::{Deserialize, Serialize};

use crate::configs::rate_limit_config::RateLimitConfig;
use crate::configs::routes_config::{validate_routes, validate_timeouts, RouteConfig};

/// 网关配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// 注入到上游请求的网关标识
    pub name: String,
    /// 路由配置
    pub routes: Vec<RouteConfig>,
    /// 限流配置
    pub rate_limit: RateLimitConfig,
    /// 认证配置
    pub auth: AuthConfig,
    /// 管理接口配置
    pub admin: AdminConfig,
    /// 跨域配置
    pub cors: CorsConfig,
    /// 健康检查配置
    pub health: HealthConfig,
    /// 重试配置
    pub retry: RetryConfig,
    /// 整个请求的超时时间（秒）
    pub request_timeout_secs: u64,
    /// 请求体大小上限（字节）
    pub max_body_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            name: "api-gateway".to_string(),
            routes: Vec::new(),
            rate_limit: RateLimitConfig::default(),
            auth: AuthConfig::default(),
            admin: AdminConfig::default(),
            cors: CorsConfig::default(),
            health: HealthConfig::default(),
            retry: RetryConfig::default(),
            request_timeout_secs: 30,
            max_body_size: 10 * 1024 * 1024,
        }
    }
}

impl GatewayConfig {
    pub fn request_timeout_ms(&self) -> u64 {
        self.request_timeout_secs.saturating_mul(1000)
    }

    pub fn validate(&self, errors: &mut Vec<String>) {
        if self.name.is_empty() {
            errors.push("网关名称不能为空".to_string());
        }
        errors.extend(validate_routes(&self.routes));
        self.rate_limit.validate(errors);
        self.health.validate(errors);
        if self.retry.base_delay_ms == 0 || self.retry.max_delay_ms < self.retry.base_delay_ms {
            errors.push("重试配置无效: 需要 0 < base_delay_ms <= max_delay_ms".to_string());
        }
        if self.request_timeout_secs == 0 {
            errors.push("request_timeout_secs 必须大于0".to_string());
        } else {
            errors.extend(validate_timeouts(&self.routes, self.request_timeout_ms()));
        }
        if self.max_body_size == 0 {
            errors.push("max_body_size 必须大于0".to_string());
        }
    }
}

/// 认证配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 JWT密钥，未设置时所有调用方视为匿名
    pub jwt_secret: Option<String>,
}

/// 管理接口配置，未设置密钥时不开放
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    /// 允许的来源，`*` 表示任意来源
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://127.0.0.1:3000".to_string(),
                "http://localhost:5173".to_string(),
                "http://127.0.0.1:5173".to_string(),
            ],
        }
    }
}

/// 健康检查配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// 巡检间隔（秒）
    pub interval_secs: u64,
    /// 单次探测超时（毫秒）
    pub timeout_ms: u64,
    /// 健康比例低于该值时整体不健康
    pub unhealthy_threshold: f64,
    /// 健康比例低于该值时整体降级
    pub degraded_threshold: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            timeout_ms: 5_000,
            unhealthy_threshold: 0.3,
            degraded_threshold: 0.7,
        }
    }
}

impl HealthConfig {
    fn validate(&self, errors: &mut Vec<String>) {
        if self.interval_secs == 0 || self.timeout_ms == 0 {
            errors.push("健康检查间隔和超时必须大于0".to_string());
        }
        let in_range = |v: f64| (0.0..=1.0).contains(&v);
        if !in_range(self.unhealthy_threshold) || !in_range(self.degraded_threshold) {
            errors.push("健康阈值必须在 [0, 1] 之间".to_string());
        } else if self.unhealthy_threshold > self.degraded_threshold {
            errors.push("unhealthy_threshold 不能大于 degraded_threshold".to_string());
        }
    }
}

/// 重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 首次重试前的等待时间（毫秒），之后按指数增长
    pub base_delay_ms: u64,
    /// 单次等待上限（毫秒）
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            max_delay_ms: 5_000,
        }
    }
}
