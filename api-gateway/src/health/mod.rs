use cache::Cache;
use chrono::{DateTime, Utc};
use common::configs::HealthConfig;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use reqwest::Client;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::metrics::MetricsSnapshot;
use crate::router::RouteRegistry;

/// 健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// 单个上游目标的健康信息
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub target: String,
    pub status: HealthStatus,
    pub healthy: bool,
    /// 最近一次主动检查的时间，未检查过为空
    pub last_check: Option<DateTime<Utc>>,
    pub response_time_ms: Option<u64>,
    pub error_count: u64,
    pub circuit_open: bool,
    pub message: Option<String>,
}

impl ServiceHealth {
    fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            status: HealthStatus::Healthy,
            healthy: true,
            last_check: None,
            response_time_ms: None,
            error_count: 0,
            circuit_open: false,
            message: None,
        }
    }
}

/// 根据健康比例计算整体状态
///
/// 没有可检查的目标时视为健康；存储不可用时至少降级
pub fn overall_status(
    healthy: usize,
    total: usize,
    store_healthy: bool,
    config: &HealthConfig,
) -> HealthStatus {
    let status = if total == 0 {
        HealthStatus::Healthy
    } else {
        let ratio = healthy as f64 / total as f64;
        if ratio < config.unhealthy_threshold {
            HealthStatus::Unhealthy
        } else if ratio < config.degraded_threshold {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    };

    if !store_healthy && status == HealthStatus::Healthy {
        HealthStatus::Degraded
    } else {
        status
    }
}

/// 共享健康缓存
///
/// 代理写入调用结果，巡检任务写入检查结果，读者拿到的是克隆出的快照
#[derive(Debug)]
pub struct HealthRegistry {
    services: RwLock<HashMap<String, Arc<Mutex<ServiceHealth>>>>,
    store_healthy: AtomicBool,
    started_at: Instant,
    config: HealthConfig,
}

impl HealthRegistry {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            store_healthy: AtomicBool::new(true),
            started_at: Instant::now(),
            config,
        }
    }

    fn entry(&self, target: &str) -> Arc<Mutex<ServiceHealth>> {
        if let Some(entry) = self.services.read().get(target) {
            return entry.clone();
        }
        self.services
            .write()
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ServiceHealth::new(target))))
            .clone()
    }

    /// 代理调用结果
    pub fn record_call(&self, target: &str, ok: bool, elapsed: Duration, circuit_open: bool) {
        let entry = self.entry(target);
        let mut health = entry.lock();
        health.response_time_ms = Some(elapsed.as_millis() as u64);
        health.circuit_open = circuit_open;
        if !ok {
            health.error_count += 1;
        }
    }

    /// 主动检查结果
    pub fn record_probe(
        &self,
        target: &str,
        status: HealthStatus,
        elapsed: Duration,
        message: Option<String>,
        circuit_open: bool,
    ) {
        let entry = self.entry(target);
        let mut health = entry.lock();
        if health.last_check.is_some() && health.status != status {
            info!(target_url = %target, from = ?health.status, to = ?status, "上游健康状态变更");
        }
        health.status = status;
        health.healthy = status != HealthStatus::Unhealthy;
        health.last_check = Some(Utc::now());
        health.response_time_ms = Some(elapsed.as_millis() as u64);
        health.circuit_open = circuit_open;
        health.message = message;
        if status == HealthStatus::Unhealthy {
            health.error_count += 1;
        }
    }

    /// 只保留仍在路由表中的目标，已移除目标不再参与整体状态
    pub fn retain(&self, targets: &HashSet<String>) {
        let mut services = self.services.write();
        let before = services.len();
        services.retain(|target, _| targets.contains(target));
        let removed = before - services.len();
        if removed > 0 {
            info!("移除 {} 个已不在路由表中的上游健康记录", removed);
        }
    }

    pub fn mark_store(&self, healthy: bool) {
        let previous = self.store_healthy.swap(healthy, Ordering::Relaxed);
        if previous && !healthy {
            warn!("计数存储不可用，限流降级为放行");
        } else if !previous && healthy {
            info!("计数存储已恢复");
        }
    }

    pub fn store_healthy(&self) -> bool {
        self.store_healthy.load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// 全部目标的快照，按目标排序
    pub fn services(&self) -> Vec<ServiceHealth> {
        let entries: Vec<Arc<Mutex<ServiceHealth>>> =
            self.services.read().values().cloned().collect();
        let mut services: Vec<ServiceHealth> =
            entries.iter().map(|entry| entry.lock().clone()).collect();
        services.sort_by(|a, b| a.target.cmp(&b.target));
        services
    }

    /// 整体状态，只统计做过主动检查的目标
    pub fn status(&self) -> HealthStatus {
        let checked: Vec<ServiceHealth> = self
            .services()
            .into_iter()
            .filter(|s| s.last_check.is_some())
            .collect();
        let healthy = checked.iter().filter(|s| s.healthy).count();
        overall_status(healthy, checked.len(), self.store_healthy(), &self.config)
    }

    pub fn report(&self, metrics: MetricsSnapshot) -> HealthReport {
        HealthReport {
            status: self.status(),
            timestamp: Utc::now(),
            uptime_secs: self.uptime().as_secs(),
            services: self.services(),
            store: StoreHealth {
                healthy: self.store_healthy(),
            },
            metrics,
        }
    }

    /// 就绪检查：存储往返成功且整体不是不健康
    pub async fn readiness(&self, cache: &dyn Cache) -> ReadinessReport {
        let store_ok = match cache.ping().await {
            Ok(()) => true,
            Err(e) => {
                debug!("就绪检查中存储不可用: {}", e);
                false
            }
        };
        self.mark_store(store_ok);
        let status = self.status();

        ReadinessReport {
            ready: store_ok && status != HealthStatus::Unhealthy,
            checks: ReadinessChecks {
                store: store_ok,
                services: status,
            },
        }
    }

    pub fn liveness(&self) -> LivenessReport {
        LivenessReport {
            alive: true,
            uptime_secs: self.uptime().as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreHealth {
    pub healthy: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: u64,
    pub services: Vec<ServiceHealth>,
    pub store: StoreHealth,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadinessChecks {
    pub store: bool,
    pub services: HealthStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadinessReport {
    pub ready: bool,
    pub checks: ReadinessChecks,
}

#[derive(Debug, Clone, Serialize)]
pub struct LivenessReport {
    pub alive: bool,
    pub uptime_secs: u64,
}

/// 健康巡检任务
pub struct HealthMonitor {
    routes: Arc<RouteRegistry>,
    registry: Arc<HealthRegistry>,
    breakers: CircuitBreakerRegistry,
    cache: Arc<dyn Cache>,
    client: Client,
    interval: Duration,
    timeout: Duration,
}

impl HealthMonitor {
    pub fn new(
        routes: Arc<RouteRegistry>,
        registry: Arc<HealthRegistry>,
        breakers: CircuitBreakerRegistry,
        cache: Arc<dyn Cache>,
        config: &HealthConfig,
    ) -> Self {
        Self {
            routes,
            registry,
            breakers,
            cache,
            client: Client::new(),
            interval: Duration::from_secs(config.interval_secs),
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }

    /// 每个间隔检查一次，收到关闭信号后退出
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!("健康检查任务启动，间隔 {:?}", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.check_all().await,
                _ = shutdown.recv() => {
                    info!("健康检查任务收到关闭信号，退出");
                    break;
                }
            }
        }
    }

    /// 声明了健康检查路径的目标，每个目标只检查一次
    fn targets(&self) -> Vec<(String, String)> {
        let table = self.routes.snapshot();
        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        for route in table.configs() {
            let Some(path) = route.health_check_path.as_deref() else {
                continue;
            };
            for target in route.targets() {
                if seen.insert(target.to_string()) {
                    targets.push((target.to_string(), path.to_string()));
                }
            }
        }
        targets
    }

    pub async fn check_all(&self) {
        self.registry.retain(&self.routes.snapshot().targets());
        let targets = self.targets();
        let probes = targets
            .iter()
            .map(|(target, path)| self.probe(target, path));
        let (_, store) = tokio::join!(join_all(probes), self.check_store());

        debug!(
            targets = targets.len(),
            store_healthy = store,
            status = ?self.registry.status(),
            "健康检查完成"
        );
    }

    async fn check_store(&self) -> bool {
        let ok = self.cache.ping().await.is_ok();
        self.registry.mark_store(ok);
        ok
    }

    async fn probe(&self, target: &str, path: &str) {
        let url = format!("{}{}", target.trim_end_matches('/'), path);
        let started = Instant::now();

        let result = tokio::time::timeout(self.timeout, async {
            let response = self.client.get(&url).send().await?;
            let status = response.status();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, body))
        })
        .await;
        let elapsed = started.elapsed();

        let (status, message) = match result {
            Ok(Ok((code, body))) if code.is_success() => classify_body(&body),
            Ok(Ok((code, _))) => (HealthStatus::Unhealthy, Some(format!("状态码 {}", code))),
            Ok(Err(e)) => (HealthStatus::Unhealthy, Some(e.to_string())),
            Err(_) => (HealthStatus::Unhealthy, Some("健康检查超时".to_string())),
        };

        if status == HealthStatus::Unhealthy {
            warn!(target_url = %target, reason = ?message, "上游健康检查失败");
        }
        ::metrics::counter!(
            "gateway_health_checks_total",
            "target" => target.to_string(),
            "healthy" => (status != HealthStatus::Unhealthy).to_string()
        )
        .increment(1);

        self.registry.record_probe(
            target,
            status,
            elapsed,
            message,
            self.breakers.is_open(target),
        );
    }
}

/// 2xx 响应体中 `status` 字段不是 healthy 时视为降级
fn classify_body(body: &[u8]) -> (HealthStatus, Option<String>) {
    let reported = serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("status").and_then(|s| s.as_str()).map(str::to_string));
    match reported {
        Some(status) if status != "healthy" => {
            (HealthStatus::Degraded, Some(format!("上游报告状态: {}", status)))
        }
        _ => (HealthStatus::Healthy, None),
    }
}
