/**
 * 缓存模块
 *
 * 本模块提供限流使用的共享计数存储接口和实现。
 * 多个网关进程共享同一个Redis时，滑动窗口的
 * 清理-计数-写入在存储端原子完成，配额在进程间一致。
 */
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use common::config::RedisConfig;
use common::error::Error;

mod memory;
mod redis;

pub use self::memory::MemoryCache;
pub use self::redis::RedisCache;

/// 一次滑动窗口准入的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowAdmission {
    /// 写入前窗口内的条目数
    pub count: u64,
    /// 是否已写入本次请求的条目
    pub admitted: bool,
    /// 窗口内最早条目的分数（毫秒时间戳）
    pub oldest_ms: Option<u64>,
}

/// 缓存特征
///
/// 以有序集合为模型：成员带分数，分数即毫秒时间戳
#[async_trait]
pub trait Cache: Sync + Send + Debug {
    /// 写入成员
    async fn add_member(&self, key: &str, score: u64, member: &str) -> Result<(), Error>;

    /// 删除分数小于等于 `max_score` 的成员，返回删除个数
    async fn trim_by_score(&self, key: &str, max_score: u64) -> Result<u64, Error>;

    /// 成员个数
    async fn count_members(&self, key: &str) -> Result<u64, Error>;

    /// 设置过期时间（毫秒）
    async fn set_expiry(&self, key: &str, ttl_ms: u64) -> Result<(), Error>;

    /// 删除指定成员
    async fn remove_member(&self, key: &str, member: &str) -> Result<(), Error>;

    /// 存储连通性检查
    async fn ping(&self) -> Result<(), Error>;

    /// 滑动窗口准入：清理过期条目、计数、未超额时写入 `member`、刷新过期时间，
    /// 整个过程对同一个键是原子的
    async fn sliding_window(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        max: u64,
        member: &str,
    ) -> Result<WindowAdmission, Error>;
}

/// 根据配置创建缓存实例
///
/// `memory://` 使用进程内存储，其余连接串按Redis处理
pub fn cache(config: &RedisConfig) -> Result<Arc<dyn Cache>, Error> {
    if config.is_memory() {
        info!("使用进程内计数存储，限流配额只在本进程内生效");
        return Ok(Arc::new(MemoryCache::new()));
    }
    Ok(Arc::new(RedisCache::from_config(config)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_selects_memory() {
        let config = RedisConfig {
            url: "memory://".to_string(),
            ..Default::default()
        };
        let cache = cache(&config).expect("创建缓存失败");
        assert!(format!("{:?}", cache).starts_with("MemoryCache"));
    }

    #[test]
    fn test_factory_rejects_bad_url() {
        let config = RedisConfig {
            url: "not-a-redis-url".to_string(),
            ..Default::default()
        };
        assert!(cache(&config).is_err());
    }
}
