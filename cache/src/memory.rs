use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use common::error::Error;

use crate::{Cache, WindowAdmission};

#[derive(Debug, Default)]
struct SortedSet {
    members: BTreeSet<(u64, String)>,
    expires_at: Option<Instant>,
}

impl SortedSet {
    fn insert(&mut self, score: u64, member: &str) {
        self.remove(member);
        self.members.insert((score, member.to_string()));
    }

    fn remove(&mut self, member: &str) -> bool {
        let existing = self
            .members
            .iter()
            .find(|(_, m)| m == member)
            .cloned();
        match existing {
            Some(entry) => self.members.remove(&entry),
            None => false,
        }
    }

    fn trim(&mut self, max_score: u64) -> u64 {
        let before = self.members.len();
        self.members.retain(|(score, _)| *score > max_score);
        (before - self.members.len()) as u64
    }

    fn oldest(&self) -> Option<u64> {
        self.members.iter().next().map(|(score, _)| *score)
    }
}

/// 进程内计数存储
///
/// 语义与Redis实现一致，过期时间按tokio时钟计算
#[derive(Debug, Default)]
pub struct MemoryCache {
    sets: Mutex<HashMap<String, SortedSet>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_set<T>(&self, key: &str, f: impl FnOnce(&mut SortedSet) -> T) -> T {
        let mut sets = self.sets.lock();
        let now = Instant::now();
        if sets
            .get(key)
            .and_then(|set| set.expires_at)
            .is_some_and(|at| at <= now)
        {
            sets.remove(key);
        }
        let set = sets.entry(key.to_string()).or_default();
        let result = f(set);
        if set.members.is_empty() {
            sets.remove(key);
        }
        result
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn add_member(&self, key: &str, score: u64, member: &str) -> Result<(), Error> {
        self.with_set(key, |set| set.insert(score, member));
        Ok(())
    }

    async fn trim_by_score(&self, key: &str, max_score: u64) -> Result<u64, Error> {
        Ok(self.with_set(key, |set| set.trim(max_score)))
    }

    async fn count_members(&self, key: &str) -> Result<u64, Error> {
        Ok(self.with_set(key, |set| set.members.len() as u64))
    }

    async fn set_expiry(&self, key: &str, ttl_ms: u64) -> Result<(), Error> {
        self.with_set(key, |set| {
            set.expires_at = Some(Instant::now() + Duration::from_millis(ttl_ms));
        });
        Ok(())
    }

    async fn remove_member(&self, key: &str, member: &str) -> Result<(), Error> {
        self.with_set(key, |set| set.remove(member));
        Ok(())
    }

    async fn ping(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn sliding_window(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        max: u64,
        member: &str,
    ) -> Result<WindowAdmission, Error> {
        Ok(self.with_set(key, |set| {
            set.trim(now_ms.saturating_sub(window_ms));
            let count = set.members.len() as u64;
            let admitted = count < max;
            if admitted {
                set.insert(now_ms, member);
            }
            set.expires_at = Some(Instant::now() + Duration::from_millis(window_ms));
            WindowAdmission {
                count,
                admitted,
                oldest_ms: set.oldest(),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_primitives() {
        let cache = MemoryCache::new();
        cache.add_member("k", 100, "a").await.unwrap();
        cache.add_member("k", 200, "b").await.unwrap();
        cache.add_member("k", 300, "c").await.unwrap();
        assert_eq!(cache.count_members("k").await.unwrap(), 3);

        assert_eq!(cache.trim_by_score("k", 200).await.unwrap(), 2);
        assert_eq!(cache.count_members("k").await.unwrap(), 1);

        cache.remove_member("k", "c").await.unwrap();
        assert_eq!(cache.count_members("k").await.unwrap(), 0);
        assert!(cache.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_sliding_window_quota() {
        let cache = MemoryCache::new();
        let window = 60_000;

        for i in 0..5u64 {
            let admission = cache
                .sliding_window("w", 1_000 + i, window, 5, &format!("m{}", i))
                .await
                .unwrap();
            assert!(admission.admitted);
            assert_eq!(admission.count, i);
            assert_eq!(admission.oldest_ms, Some(1_000));
        }

        let rejected = cache
            .sliding_window("w", 1_010, window, 5, "m5")
            .await
            .unwrap();
        assert!(!rejected.admitted);
        assert_eq!(rejected.count, 5);

        // 最早的条目滑出窗口后重新放行
        let later = cache
            .sliding_window("w", 1_000 + window, window, 5, "m6")
            .await
            .unwrap();
        assert!(later.admitted);
        assert_eq!(later.count, 4);
        assert_eq!(later.oldest_ms, Some(1_001));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let cache = MemoryCache::new();
        cache.add_member("k", 1, "a").await.unwrap();
        cache.set_expiry("k", 1_000).await.unwrap();
        assert_eq!(cache.count_members("k").await.unwrap(), 1);

        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert_eq!(cache.count_members("k").await.unwrap(), 0);
    }
}
