//! 滑动窗口限流
//!
//! 每个适用规则对应共享存储中的一个有序集合。`check` 在计数的同一原子步骤里
//! 为本次请求占位，`record` 根据结果决定是否保留占位。

pub mod violations;

use cache::Cache;
use chrono::Utc;
use common::configs::{RateLimitConfig, RateLimitRule};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::RateLimitInfo;
use crate::health::HealthRegistry;
use crate::router::normalize_path;
use violations::{IdentifierType, RateLimitViolation, ViolationLog};

/// 限流主体
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub id: String,
    pub authenticated: bool,
}

impl ClientIdentity {
    pub fn anonymous(ip: impl Into<String>) -> Self {
        Self {
            id: ip.into(),
            authenticated: false,
        }
    }

    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            id: user_id.into(),
            authenticated: true,
        }
    }

    fn qualified_id(&self) -> String {
        if self.authenticated {
            format!("user:{}", self.id)
        } else {
            format!("ip:{}", self.id)
        }
    }
}

/// 规则作用范围
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitScope {
    Client,
    Global,
    Endpoint(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Reservation {
    key: String,
    member: String,
}

/// 请求结果，用于决定占位是否计数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Success,
    Failure,
}

impl RequestOutcome {
    pub fn from_status(status: u16) -> Self {
        if status < 400 {
            RequestOutcome::Success
        } else {
            RequestOutcome::Failure
        }
    }
}

/// 限流结果
#[derive(Debug, Clone)]
pub struct RateLimitResult {
    pub allowed: bool,
    /// 生效规则的配额，0 表示没有规则生效
    pub limit: u64,
    pub remaining: u64,
    /// 窗口重置时间（毫秒时间戳）
    pub reset_at_ms: u64,
    pub retry_after: Option<Duration>,
    pub scope: Option<LimitScope>,
    reservations: Vec<Reservation>,
}

impl RateLimitResult {
    fn unlimited() -> Self {
        Self {
            allowed: true,
            limit: 0,
            remaining: 0,
            reset_at_ms: 0,
            retry_after: None,
            scope: None,
            reservations: Vec::new(),
        }
    }

    /// 响应头数据，没有规则生效时为空
    pub fn info(&self) -> Option<RateLimitInfo> {
        if self.limit == 0 {
            return None;
        }
        let reset_ms = self.reset_at_ms.saturating_sub(now_millis());
        Some(RateLimitInfo {
            limit: self.limit,
            remaining: self.remaining,
            reset_secs: reset_ms.div_ceil(1000),
            retry_after_secs: self.retry_after.map(|d| d.as_millis().div_ceil(1000) as u64),
        })
    }
}

struct ApplicableRule {
    scope: LimitScope,
    key: String,
    rule: RateLimitRule,
}

struct SubCheck {
    allowed: bool,
    remaining: u64,
    reset_at_ms: u64,
    reservation: Option<Reservation>,
    store_error: bool,
}

fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// 前缀按段匹配，`/search` 匹配 `/search/x` 不匹配 `/searching`
fn prefix_matches(prefix: &str, path: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    prefix.is_empty()
        || path == prefix
        || (path.starts_with(prefix) && path[prefix.len()..].starts_with('/'))
}

/// 限流器
pub struct RateLimiter {
    cache: Arc<dyn Cache>,
    config: RateLimitConfig,
    health: Arc<HealthRegistry>,
    violations: Arc<ViolationLog>,
}

impl RateLimiter {
    pub fn new(
        cache: Arc<dyn Cache>,
        config: RateLimitConfig,
        health: Arc<HealthRegistry>,
        violations: Arc<ViolationLog>,
    ) -> Self {
        Self {
            cache,
            config,
            health,
            violations,
        }
    }

    pub fn violations(&self) -> &ViolationLog {
        &self.violations
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.config.key_prefix, suffix)
    }

    /// 适用的规则，按声明顺序：调用方、全局、端点
    fn applicable(&self, client: &ClientIdentity, path: &str) -> Vec<ApplicableRule> {
        let mut rules = Vec::with_capacity(3);
        let client_id = client.qualified_id();

        let client_rule = if client.authenticated {
            self.config.authenticated
        } else {
            self.config.anonymous
        };
        rules.push(ApplicableRule {
            scope: LimitScope::Client,
            key: self.key(&format!("client:{}", client_id)),
            rule: client_rule,
        });

        if let Some(global) = self.config.global {
            rules.push(ApplicableRule {
                scope: LimitScope::Global,
                key: self.key("global:system"),
                rule: global,
            });
        }

        let endpoint = self
            .config
            .endpoints
            .iter()
            .filter(|e| prefix_matches(&e.path_prefix, path))
            .max_by_key(|e| e.path_prefix.trim_end_matches('/').len());
        if let Some(endpoint) = endpoint {
            rules.push(ApplicableRule {
                scope: LimitScope::Endpoint(endpoint.path_prefix.clone()),
                key: self.key(&format!("endpoint:{}:{}", endpoint.path_prefix, client_id)),
                rule: endpoint.rule,
            });
        }

        rules
    }

    /// 检查并占位
    ///
    /// 所有规则并行检查；任一拒绝即拒绝，否则取剩余配额最少者
    pub async fn check(&self, client: &ClientIdentity, path: &str, method: &str) -> RateLimitResult {
        if !self.config.enabled {
            return RateLimitResult::unlimited();
        }

        let path = normalize_path(path);
        let rules = self.applicable(client, &path);
        let now_ms = now_millis();
        let member = format!("{}-{}", now_ms, Uuid::new_v4());

        let checks = join_all(rules.iter().map(|r| self.check_one(r, now_ms, &member))).await;
        if checks.iter().all(|c| !c.store_error) {
            self.health.mark_store(true);
        }

        // 拒绝时取建议等待最久的规则
        let mut rejected: Option<usize> = None;
        for (idx, check) in checks.iter().enumerate() {
            if check.allowed {
                continue;
            }
            let longer = match rejected {
                None => true,
                Some(current) => rules[idx].rule.block_duration_ms > rules[current].rule.block_duration_ms,
            };
            if longer {
                rejected = Some(idx);
            }
        }

        if let Some(idx) = rejected {
            let held: Vec<Reservation> = checks
                .iter()
                .filter_map(|c| c.reservation.clone())
                .collect();
            self.release(&held).await;

            let rule = &rules[idx];
            self.record_violation(client, rule, &path, method);
            ::metrics::counter!(
                "gateway_rate_limit_rejections_total",
                "scope" => scope_label(&rule.scope)
            )
            .increment(1);

            return RateLimitResult {
                allowed: false,
                limit: rule.rule.max_requests,
                remaining: 0,
                reset_at_ms: checks[idx].reset_at_ms,
                retry_after: Some(Duration::from_millis(rule.rule.block_duration_ms)),
                scope: Some(rule.scope.clone()),
                reservations: Vec::new(),
            };
        }

        // 剩余最少者胜出，相同时重置时间早者胜出，再按声明顺序
        let mut winner = 0;
        for (idx, check) in checks.iter().enumerate().skip(1) {
            let best = &checks[winner];
            if (check.remaining, check.reset_at_ms) < (best.remaining, best.reset_at_ms) {
                winner = idx;
            }
        }

        let result = RateLimitResult {
            allowed: true,
            limit: rules[winner].rule.max_requests,
            remaining: checks[winner].remaining,
            reset_at_ms: checks[winner].reset_at_ms,
            retry_after: None,
            scope: Some(rules[winner].scope.clone()),
            reservations: checks.into_iter().filter_map(|c| c.reservation).collect(),
        };
        debug!(
            client = %client.qualified_id(),
            remaining = result.remaining,
            "限流检查通过"
        );
        result
    }

    async fn check_one(&self, rule: &ApplicableRule, now_ms: u64, member: &str) -> SubCheck {
        let window = rule.rule.window_ms;
        match self
            .cache
            .sliding_window(&rule.key, now_ms, window, rule.rule.max_requests, member)
            .await
        {
            Ok(admission) => {
                let reset_at_ms = admission.oldest_ms.unwrap_or(now_ms) + window;
                if admission.admitted {
                    SubCheck {
                        allowed: true,
                        remaining: rule.rule.max_requests.saturating_sub(admission.count),
                        reset_at_ms,
                        reservation: Some(Reservation {
                            key: rule.key.clone(),
                            member: member.to_string(),
                        }),
                        store_error: false,
                    }
                } else {
                    SubCheck {
                        allowed: false,
                        remaining: 0,
                        reset_at_ms,
                        reservation: None,
                        store_error: false,
                    }
                }
            }
            Err(e) => {
                warn!(key = %rule.key, "限流存储访问失败，放行请求: {}", e);
                self.health.mark_store(false);
                SubCheck {
                    allowed: true,
                    remaining: rule.rule.max_requests,
                    reset_at_ms: now_ms + window,
                    reservation: None,
                    store_error: true,
                }
            }
        }
    }

    /// 根据请求结果决定是否保留占位
    pub async fn record(&self, result: &RateLimitResult, outcome: RequestOutcome) {
        let skip = match outcome {
            RequestOutcome::Success => self.config.skip_successful_requests,
            RequestOutcome::Failure => self.config.skip_failed_requests,
        };
        if skip {
            self.release(&result.reservations).await;
        }
    }

    async fn release(&self, reservations: &[Reservation]) {
        if reservations.is_empty() {
            return;
        }
        let removals = reservations
            .iter()
            .map(|r| self.cache.remove_member(&r.key, &r.member));
        for result in join_all(removals).await {
            if let Err(e) = result {
                warn!("释放限流占位失败: {}", e);
                self.health.mark_store(false);
            }
        }
    }

    fn record_violation(&self, client: &ClientIdentity, rule: &ApplicableRule, path: &str, method: &str) {
        let (identifier, identifier_type) = match &rule.scope {
            LimitScope::Client if client.authenticated => (client.id.clone(), IdentifierType::User),
            LimitScope::Client => (client.id.clone(), IdentifierType::Ip),
            LimitScope::Global => (client.qualified_id(), IdentifierType::Global),
            LimitScope::Endpoint(prefix) => (
                format!("{}:{}", prefix, client.qualified_id()),
                IdentifierType::Endpoint,
            ),
        };
        warn!(
            identifier = %identifier,
            identifier_type = ?identifier_type,
            path = %path,
            method = %method,
            "请求被限流"
        );
        self.violations.record(RateLimitViolation {
            identifier,
            identifier_type,
            path: path.to_string(),
            method: method.to_string(),
            timestamp: Utc::now(),
        });
    }
}

fn scope_label(scope: &LimitScope) -> &'static str {
    match scope {
        LimitScope::Client => "client",
        LimitScope::Global => "global",
        LimitScope::Endpoint(_) => "endpoint",
    }
}
