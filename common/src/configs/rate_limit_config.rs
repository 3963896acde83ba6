use serde::{Deserialize, Serialize};

/// 单条滑动窗口限流规则
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// 窗口大小（毫秒）
    pub window_ms: u64,
    /// 窗口内允许的最大请求数
    pub max_requests: u64,
    /// 被限流后建议的等待时间（毫秒）
    pub block_duration_ms: u64,
}

impl RateLimitRule {
    pub const fn new(window_ms: u64, max_requests: u64, block_duration_ms: u64) -> Self {
        Self {
            window_ms,
            max_requests,
            block_duration_ms,
        }
    }

    fn validate(&self, name: &str, errors: &mut Vec<String>) {
        if self.window_ms == 0 {
            errors.push(format!("限流规则 {}: window_ms 必须大于0", name));
        }
        if self.max_requests == 0 {
            errors.push(format!("限流规则 {}: max_requests 必须大于0", name));
        }
    }
}

/// 按路径前缀生效的端点限流
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRateLimit {
    pub path_prefix: String,
    pub rule: RateLimitRule,
}

/// 限流配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// 是否开启限流
    pub enabled: bool,
    /// 存储键前缀
    pub key_prefix: String,
    /// 匿名调用方（按IP）
    pub anonymous: RateLimitRule,
    /// 已认证调用方（按用户）
    pub authenticated: RateLimitRule,
    /// 全局上限，所有调用方共享
    pub global: Option<RateLimitRule>,
    /// 端点级限流，最长前缀生效
    pub endpoints: Vec<EndpointRateLimit>,
    /// 成功的请求不计数
    pub skip_successful_requests: bool,
    /// 失败的请求不计数
    pub skip_failed_requests: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key_prefix: "rate_limit".to_string(),
            anonymous: RateLimitRule::new(60_000, 100, 60_000),
            authenticated: RateLimitRule::new(60_000, 1000, 60_000),
            global: Some(RateLimitRule::new(60_000, 10_000, 1_000)),
            endpoints: Vec::new(),
            skip_successful_requests: false,
            skip_failed_requests: false,
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self, errors: &mut Vec<String>) {
        if self.key_prefix.is_empty() {
            errors.push("限流键前缀不能为空".to_string());
        }
        self.anonymous.validate("anonymous", errors);
        self.authenticated.validate("authenticated", errors);
        if let Some(global) = &self.global {
            global.validate("global", errors);
        }
        for endpoint in &self.endpoints {
            if !endpoint.path_prefix.starts_with('/') {
                errors.push(format!(
                    "端点限流前缀必须以 '/' 开头: {}",
                    endpoint.path_prefix
                ));
            }
            endpoint.rule.validate(&endpoint.path_prefix, errors);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let mut errors = Vec::new();
        RateLimitConfig::default().validate(&mut errors);
        assert!(errors.is_empty(), "{:?}", errors);
    }

    #[test]
    fn test_invalid_rules_reported() {
        let config = RateLimitConfig {
            anonymous: RateLimitRule::new(0, 0, 0),
            endpoints: vec![EndpointRateLimit {
                path_prefix: "search".to_string(),
                rule: RateLimitRule::new(1000, 1, 1000),
            }],
            ..Default::default()
        };
        let mut errors = Vec::new();
        config.validate(&mut errors);
        assert_eq!(errors.len(), 3, "{:?}", errors);
    }
}
