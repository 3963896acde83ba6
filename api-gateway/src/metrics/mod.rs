use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{info, warn};

use crate::circuit_breaker::{CircuitBreakerRegistry, CircuitSnapshot};
use crate::health::HealthRegistry;
use crate::rate_limit::violations::{ViolationCount, ViolationLog};

static PROMETHEUS: OnceCell<PrometheusHandle> = OnceCell::new();

/// 安装Prometheus记录器，重复调用返回同一个句柄
pub fn init_metrics() -> Option<PrometheusHandle> {
    PROMETHEUS
        .get_or_try_init(|| {
            let handle = PrometheusBuilder::new().install_recorder()?;
            info!("Prometheus指标记录器已安装");
            Ok::<_, metrics_exporter_prometheus::BuildError>(handle)
        })
        .map_err(|e| warn!("安装Prometheus指标记录器失败: {}", e))
        .ok()
        .cloned()
}

/// 请求计数，由请求日志中间件维护
#[derive(Debug, Default)]
pub struct RequestStats {
    total: AtomicU64,
    successful: AtomicU64,
    client_errors: AtomicU64,
    server_errors: AtomicU64,
    rate_limited: AtomicU64,
    total_duration_ms: AtomicU64,
}

impl RequestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, status: u16, duration: Duration) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
        match status {
            429 => {
                self.rate_limited.fetch_add(1, Ordering::Relaxed);
                self.client_errors.fetch_add(1, Ordering::Relaxed);
            }
            s if s >= 500 => {
                self.server_errors.fetch_add(1, Ordering::Relaxed);
            }
            s if s >= 400 => {
                self.client_errors.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.successful.fetch_add(1, Ordering::Relaxed);
            }
        }

        ::metrics::counter!("gateway_requests_total", "status" => status.to_string()).increment(1);
        ::metrics::histogram!("gateway_request_duration_seconds").record(duration.as_secs_f64());
    }

    pub fn snapshot(&self) -> RequestTotals {
        let total = self.total.load(Ordering::Relaxed);
        let successful = self.successful.load(Ordering::Relaxed);
        let server_errors = self.server_errors.load(Ordering::Relaxed);
        let client_errors = self.client_errors.load(Ordering::Relaxed);
        let ratio = |n: u64| if total == 0 { 0.0 } else { n as f64 / total as f64 };

        RequestTotals {
            total,
            successful,
            client_errors,
            server_errors,
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            success_rate: ratio(successful),
            error_rate: ratio(client_errors + server_errors),
            avg_response_time_ms: if total == 0 {
                0.0
            } else {
                self.total_duration_ms.load(Ordering::Relaxed) as f64 / total as f64
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestTotals {
    pub total: u64,
    pub successful: u64,
    pub client_errors: u64,
    pub server_errors: u64,
    pub rate_limited: u64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub avg_response_time_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceTiming {
    pub target: String,
    pub response_time_ms: Option<u64>,
    pub error_count: u64,
}

/// `/metrics` 返回的快照，只读内存计数
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub requests: RequestTotals,
    pub services: Vec<ServiceTiming>,
    pub circuit_breakers: Vec<CircuitSnapshot>,
    pub store_healthy: bool,
    pub recent_violations: usize,
    pub top_violators: Vec<ViolationCount>,
}

impl MetricsSnapshot {
    pub fn collect(
        stats: &RequestStats,
        health: &HealthRegistry,
        breakers: &CircuitBreakerRegistry,
        violations: &ViolationLog,
    ) -> Self {
        let services = health
            .services()
            .into_iter()
            .map(|s| ServiceTiming {
                target: s.target,
                response_time_ms: s.response_time_ms,
                error_count: s.error_count,
            })
            .collect();

        Self {
            uptime_secs: health.uptime().as_secs(),
            requests: stats.snapshot(),
            services,
            circuit_breakers: breakers.snapshot(),
            store_healthy: health.store_healthy(),
            recent_violations: violations.len(),
            top_violators: violations.leaderboard(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_stats() {
        let stats = RequestStats::new();
        stats.record(200, Duration::from_millis(10));
        stats.record(201, Duration::from_millis(30));
        stats.record(429, Duration::from_millis(1));
        stats.record(502, Duration::from_millis(1));

        let totals = stats.snapshot();
        assert_eq!(totals.total, 4);
        assert_eq!(totals.successful, 2);
        assert_eq!(totals.rate_limited, 1);
        assert_eq!(totals.client_errors, 1);
        assert_eq!(totals.server_errors, 1);
        assert!((totals.success_rate - 0.5).abs() < f64::EPSILON);
        assert!((totals.error_rate - 0.5).abs() < f64::EPSILON);
        assert!((totals.avg_response_time_ms - 10.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_stats() {
        let totals = RequestStats::new().snapshot();
        assert_eq!(totals.total, 0);
        assert_eq!(totals.success_rate, 0.0);
    }
}
