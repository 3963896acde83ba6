/**
 * Redis缓存模块实现
 *
 * 滑动窗口以有序集合保存：成员是请求标识，分数是毫秒时间戳。
 * 清理、计数、写入和续期通过一个Lua脚本原子执行。
 * 连接使用 ConnectionManager，断线后自动重连；启动时Redis不可达
 * 不会阻止网关启动，首次使用时在后台建立连接，同一时间只有一个连接任务。
 */
use crate::{Cache, WindowAdmission};
use async_trait::async_trait;
use common::config::RedisConfig;
use common::error::Error;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisResult, Script};
use parking_lot::Mutex;
use std::fmt::{self, Debug, Formatter};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// 连接失败后再次尝试前的最短间隔
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// 滑动窗口脚本
///
/// KEYS[1] 窗口键；ARGV: now_ms, window_ms, max, member
/// 返回 {写入前计数, 是否写入(0/1), 最早分数或-1}
const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local max = tonumber(ARGV[3])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
local admitted = 0
if count < max then
    redis.call('ZADD', key, now, ARGV[4])
    admitted = 1
end
redis.call('PEXPIRE', key, window)

local oldest = -1
local first = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if #first > 0 then
    oldest = tonumber(first[2])
end
return {count, admitted, oldest}
"#;

#[derive(Default)]
struct ConnectionSlot {
    manager: Option<ConnectionManager>,
    /// 已有后台连接任务在进行
    connecting: bool,
    /// 最近一次连接失败的时间
    last_failure: Option<Instant>,
}

/// Redis缓存实现
pub struct RedisCache {
    /// Redis客户端
    client: Client,
    /// 已建立的连接管理器，只在同步代码中加锁
    slot: Arc<Mutex<ConnectionSlot>>,
    /// 滑动窗口脚本
    window_script: Script,
    command_timeout: Duration,
    connection_timeout: Duration,
}

/// 为RedisCache实现Debug特征
impl Debug for RedisCache {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCache")
            .field("client", &self.client)
            .field("command_timeout", &self.command_timeout)
            .field("connection_timeout", &self.connection_timeout)
            .finish()
    }
}

impl RedisCache {
    /// 从配置创建RedisCache实例
    ///
    /// 只解析连接串，不建立连接。连接串无效时返回错误
    pub fn from_config(config: &RedisConfig) -> Result<Self, Error> {
        let client = Client::open(config.url.as_str())?;
        info!("Redis计数存储已配置: {}", config.url);

        Ok(Self {
            client,
            slot: Arc::new(Mutex::new(ConnectionSlot::default())),
            window_script: Script::new(SLIDING_WINDOW_SCRIPT),
            command_timeout: Duration::from_millis(config.command_timeout_ms),
            connection_timeout: Duration::from_millis(config.connection_timeout_ms),
        })
    }

    /// 获取连接
    ///
    /// 未连接时由第一个调用方启动后台连接任务并等待结果；
    /// 连接进行中或处于失败退避期内的调用方立即失败
    async fn connection(&self) -> Result<ConnectionManager, Error> {
        let pending = {
            let mut slot = self.slot.lock();
            if let Some(manager) = &slot.manager {
                return Ok(manager.clone());
            }
            if slot.connecting {
                return Err(Error::Redis("正在连接Redis".to_string()));
            }
            if let Some(at) = slot.last_failure {
                if at.elapsed() < RECONNECT_BACKOFF {
                    return Err(Error::Redis("Redis暂不可用".to_string()));
                }
            }
            slot.connecting = true;
            self.spawn_connect()
        };

        pending
            .await
            .map_err(|_| Error::Redis("Redis连接任务已退出".to_string()))?
    }

    /// 后台建立连接，结果写回连接槽
    ///
    /// 调用方放弃等待后任务照常完成，后续请求直接复用连接
    fn spawn_connect(&self) -> oneshot::Receiver<Result<ConnectionManager, Error>> {
        let (tx, rx) = oneshot::channel();
        let client = self.client.clone();
        let slot = self.slot.clone();
        let connection_timeout = self.connection_timeout;

        tokio::spawn(async move {
            let result =
                match tokio::time::timeout(connection_timeout, ConnectionManager::new(client)).await
                {
                    Ok(Ok(manager)) => Ok(manager),
                    Ok(Err(e)) => Err(Error::from(e)),
                    Err(_) => Err(Error::Timeout("连接Redis超时".to_string())),
                };

            {
                let mut slot = slot.lock();
                slot.connecting = false;
                match &result {
                    Ok(manager) => {
                        info!("已连接Redis");
                        slot.manager = Some(manager.clone());
                        slot.last_failure = None;
                    }
                    Err(e) => {
                        warn!("连接Redis失败: {}", e);
                        slot.last_failure = Some(Instant::now());
                    }
                }
            }
            let _ = tx.send(result);
        });

        rx
    }

    /// 获取连接并执行命令，两者合计受命令超时约束
    async fn bounded<T, F, Fut>(&self, op: &str, command: F) -> Result<T, Error>
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let call = async {
            let conn = self.connection().await?;
            command(conn).await.map_err(|e| {
                warn!("Redis命令 {} 失败: {}", op, e);
                Error::from(e)
            })
        };
        match tokio::time::timeout(self.command_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Redis命令 {} 超时", op);
                Err(Error::Timeout(format!("Redis命令 {} 超时", op)))
            }
        }
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn add_member(&self, key: &str, score: u64, member: &str) -> Result<(), Error> {
        self.bounded("ZADD", |mut conn| async move {
            conn.zadd::<_, _, _, ()>(key, member, score).await
        })
        .await
    }

    async fn trim_by_score(&self, key: &str, max_score: u64) -> Result<u64, Error> {
        self.bounded("ZREMRANGEBYSCORE", |mut conn| async move {
            conn.zrembyscore::<_, _, _, u64>(key, "-inf", max_score).await
        })
        .await
    }

    async fn count_members(&self, key: &str) -> Result<u64, Error> {
        self.bounded("ZCARD", |mut conn| async move { conn.zcard::<_, u64>(key).await })
            .await
    }

    async fn set_expiry(&self, key: &str, ttl_ms: u64) -> Result<(), Error> {
        let ttl = i64::try_from(ttl_ms).unwrap_or(i64::MAX);
        self.bounded("PEXPIRE", |mut conn| async move {
            conn.pexpire::<_, ()>(key, ttl).await
        })
        .await
    }

    async fn remove_member(&self, key: &str, member: &str) -> Result<(), Error> {
        self.bounded("ZREM", |mut conn| async move {
            conn.zrem::<_, _, ()>(key, member).await
        })
        .await
    }

    async fn ping(&self) -> Result<(), Error> {
        let pong: String = self
            .bounded("PING", |mut conn| async move {
                let cmd = redis::cmd("PING");
                cmd.query_async(&mut conn).await
            })
            .await?;
        debug!("Redis PING 返回: {}", pong);
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
        let script = &self.window_script;
        let (count, admitted, oldest): (i64, i64, i64) = self
            .bounded("EVALSHA", |mut conn| async move {
                let mut invocation = script.key(key);
                invocation
                    .arg(now_ms)
                    .arg(window_ms)
                    .arg(max)
                    .arg(member);
                invocation.invoke_async(&mut conn).await
            })
            .await?;

        Ok(WindowAdmission {
            count: count.max(0) as u64,
            admitted: admitted == 1,
            oldest_ms: u64::try_from(oldest).ok(),
        })
    }
}
