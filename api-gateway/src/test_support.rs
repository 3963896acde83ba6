//! 测试辅助：不可用的存储和本地模拟上游

use async_trait::async_trait;
use axum::Router;
use cache::{Cache, WindowAdmission};
use common::configs::RouteConfig;
use common::error::Error;

/// 所有操作都失败的存储
#[derive(Debug)]
pub struct FailingCache;

fn down() -> Error {
    Error::Redis("connection refused".to_string())
}

#[async_trait]
impl Cache for FailingCache {
    async fn add_member(&self, _key: &str, _score: u64, _member: &str) -> Result<(), Error> {
        Err(down())
    }

    async fn trim_by_score(&self, _key: &str, _max_score: u64) -> Result<u64, Error> {
        Err(down())
    }

    async fn count_members(&self, _key: &str) -> Result<u64, Error> {
        Err(down())
    }

    async fn set_expiry(&self, _key: &str, _ttl_ms: u64) -> Result<(), Error> {
        Err(down())
    }

    async fn remove_member(&self, _key: &str, _member: &str) -> Result<(), Error> {
        Err(down())
    }

    async fn ping(&self) -> Result<(), Error> {
        Err(down())
    }

    async fn sliding_window(
        &self,
        _key: &str,
        _now_ms: u64,
        _window_ms: u64,
        _max: u64,
        _member: &str,
    ) -> Result<WindowAdmission, Error> {
        Err(down())
    }
}

/// 在随机端口上启动模拟上游，返回基础地址
pub async fn spawn_upstream(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

/// 关闭后的端口，连接会被拒绝
pub async fn closed_upstream() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

pub fn route(value: serde_json::Value) -> RouteConfig {
    serde_json::from_value(value).unwrap()
}
