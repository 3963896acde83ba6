//! 熔断器
//!
//! 每个上游目标一个状态机，首次失败时创建。注册表只在查找和创建时加锁，
//! 状态变更只锁单个目标。

use common::configs::CircuitBreakerSettings;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// 熔断状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct BreakerEntry {
    state: CircuitState,
    failures: u32,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
}

impl BreakerEntry {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            last_failure: None,
            probe_in_flight: false,
        }
    }

    fn transition(&mut self, target: &str, to: CircuitState) {
        if self.state == to {
            return;
        }
        match to {
            CircuitState::Open => warn!(target_url = %target, from = self.state.as_str(), "熔断器打开"),
            _ => info!(target_url = %target, from = self.state.as_str(), to = to.as_str(), "熔断器状态变更"),
        }
        ::metrics::counter!(
            "gateway_circuit_breaker_transitions_total",
            "target" => target.to_string(),
            "to" => to.as_str()
        )
        .increment(1);
        self.state = to;
        if to == CircuitState::Closed {
            self.failures = 0;
        }
    }
}

/// 熔断拒绝
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitOpen {
    pub target: String,
    /// 距离允许探测的剩余时间
    pub retry_after: Duration,
}

/// 熔断状态快照
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub target: String,
    pub state: CircuitState,
    pub failures: u32,
    pub last_failure_ms_ago: Option<u64>,
}

/// 熔断器注册表，按上游目标区分
#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerRegistry {
    entries: Arc<RwLock<HashMap<String, Arc<Mutex<BreakerEntry>>>>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, target: &str) -> Option<Arc<Mutex<BreakerEntry>>> {
        self.entries.read().get(target).cloned()
    }

    fn entry_or_create(&self, target: &str) -> Arc<Mutex<BreakerEntry>> {
        if let Some(entry) = self.entry(target) {
            return entry;
        }
        self.entries
            .write()
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(BreakerEntry::new())))
            .clone()
    }

    /// 调用上游前获取许可
    ///
    /// 打开状态下超过重置时间后，第一个请求成为探测请求，其余请求继续被拒绝
    pub fn acquire(
        &self,
        target: &str,
        settings: &CircuitBreakerSettings,
    ) -> Result<CircuitPermit, CircuitOpen> {
        let mut permit = CircuitPermit {
            registry: self.clone(),
            target: target.to_string(),
            settings: settings.clone(),
            probe: false,
            resolved: false,
        };
        if !settings.enabled {
            permit.resolved = true;
            return Ok(permit);
        }
        let Some(entry) = self.entry(target) else {
            return Ok(permit);
        };

        let mut entry = entry.lock();
        let reset_timeout = Duration::from_millis(settings.reset_timeout_ms);
        match entry.state {
            CircuitState::Closed => Ok(permit),
            CircuitState::Open => {
                let elapsed = entry
                    .last_failure
                    .map(|at| at.elapsed())
                    .unwrap_or(reset_timeout);
                if elapsed >= reset_timeout {
                    entry.transition(target, CircuitState::HalfOpen);
                    entry.probe_in_flight = true;
                    permit.probe = true;
                    Ok(permit)
                } else {
                    Err(CircuitOpen {
                        target: target.to_string(),
                        retry_after: reset_timeout - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if entry.probe_in_flight {
                    Err(CircuitOpen {
                        target: target.to_string(),
                        retry_after: Duration::ZERO,
                    })
                } else {
                    entry.probe_in_flight = true;
                    permit.probe = true;
                    Ok(permit)
                }
            }
        }
    }

    fn record_success(&self, target: &str, probe: bool) {
        let Some(entry) = self.entry(target) else {
            return;
        };
        let mut entry = entry.lock();
        match entry.state {
            CircuitState::Closed => entry.failures = 0,
            CircuitState::HalfOpen if probe => {
                entry.probe_in_flight = false;
                entry.transition(target, CircuitState::Closed);
            }
            // 熔断前发出的请求晚到的结果不影响状态
            _ => {}
        }
    }

    fn record_failure(&self, target: &str, settings: &CircuitBreakerSettings, probe: bool) {
        let entry = self.entry_or_create(target);
        let mut entry = entry.lock();
        match entry.state {
            CircuitState::Closed => {
                entry.failures += 1;
                entry.last_failure = Some(Instant::now());
                if entry.failures >= settings.failure_threshold {
                    entry.transition(target, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen if probe => {
                entry.probe_in_flight = false;
                entry.last_failure = Some(Instant::now());
                entry.transition(target, CircuitState::Open);
            }
            _ => {}
        }
    }

    /// 当前状态，不触发状态变更
    pub fn state(&self, target: &str) -> CircuitState {
        self.entry(target)
            .map(|entry| entry.lock().state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn is_open(&self, target: &str) -> bool {
        self.state(target) != CircuitState::Closed
    }

    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let entries: Vec<(String, Arc<Mutex<BreakerEntry>>)> = self
            .entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut snapshot: Vec<CircuitSnapshot> = entries
            .into_iter()
            .map(|(target, entry)| {
                let entry = entry.lock();
                CircuitSnapshot {
                    target,
                    state: entry.state,
                    failures: entry.failures,
                    last_failure_ms_ago: entry
                        .last_failure
                        .map(|at| at.elapsed().as_millis() as u64),
                }
            })
            .collect();
        snapshot.sort_by(|a, b| a.target.cmp(&b.target));
        snapshot
    }
}

/// 单次调用的许可
///
/// 必须以 `success` 或 `failure` 结束；调用被取消（客户端断开、超时）导致许可
/// 未结束就被丢弃时按失败处理
#[derive(Debug)]
pub struct CircuitPermit {
    registry: CircuitBreakerRegistry,
    target: String,
    settings: CircuitBreakerSettings,
    probe: bool,
    resolved: bool,
}

impl CircuitPermit {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        if !self.resolved {
            self.resolved = true;
            self.registry.record_success(&self.target, self.probe);
        }
    }

    pub fn failure(mut self) {
        if !self.resolved {
            self.resolved = true;
            self.registry
                .record_failure(&self.target, &self.settings, self.probe);
        }
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if !self.resolved {
            self.registry
                .record_failure(&self.target, &self.settings, self.probe);
        }
    }
}
