use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

/// 保留的最大记录数
pub const MAX_VIOLATIONS: usize = 1000;

/// 记录保留时长（秒）
pub const VIOLATION_TTL_SECS: i64 = 3600;

/// 被限流的主体类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierType {
    Ip,
    User,
    Endpoint,
    Global,
}

/// 一次限流记录
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitViolation {
    pub identifier: String,
    pub identifier_type: IdentifierType,
    pub path: String,
    pub method: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViolationCount {
    pub identifier: String,
    pub identifier_type: IdentifierType,
    pub count: usize,
}

/// 限流记录环形缓冲，仅用于观测
#[derive(Debug)]
pub struct ViolationLog {
    entries: Mutex<VecDeque<RateLimitViolation>>,
    capacity: usize,
    ttl: ChronoDuration,
}

impl Default for ViolationLog {
    fn default() -> Self {
        Self::new(MAX_VIOLATIONS, ChronoDuration::seconds(VIOLATION_TTL_SECS))
    }
}

impl ViolationLog {
    pub fn new(capacity: usize, ttl: ChronoDuration) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(MAX_VIOLATIONS))),
            capacity,
            ttl,
        }
    }

    /// 记录一次限流；锁被占用时直接丢弃，不阻塞请求
    pub fn record(&self, violation: RateLimitViolation) {
        let Some(mut entries) = self.entries.try_lock() else {
            return;
        };
        Self::prune(&mut entries, self.ttl, violation.timestamp);
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(violation);
    }

    fn prune(entries: &mut VecDeque<RateLimitViolation>, ttl: ChronoDuration, now: DateTime<Utc>) {
        let cutoff = now - ttl;
        while entries.front().is_some_and(|v| v.timestamp < cutoff) {
            entries.pop_front();
        }
    }

    /// 最近的记录，新的在前
    pub fn recent(&self, limit: usize) -> Vec<RateLimitViolation> {
        let mut entries = self.entries.lock();
        Self::prune(&mut entries, self.ttl, Utc::now());
        entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        let mut entries = self.entries.lock();
        Self::prune(&mut entries, self.ttl, Utc::now());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 被限流次数最多的主体
    pub fn leaderboard(&self, top: usize) -> Vec<ViolationCount> {
        let mut entries = self.entries.lock();
        Self::prune(&mut entries, self.ttl, Utc::now());

        let mut counts: HashMap<(&str, IdentifierType), usize> = HashMap::new();
        for v in entries.iter() {
            *counts
                .entry((v.identifier.as_str(), v.identifier_type))
                .or_default() += 1;
        }
        let mut board: Vec<ViolationCount> = counts
            .into_iter()
            .map(|((identifier, identifier_type), count)| ViolationCount {
                identifier: identifier.to_string(),
                identifier_type,
                count,
            })
            .collect();
        board.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.identifier.cmp(&b.identifier)));
        board.truncate(top);
        board
    }
}
