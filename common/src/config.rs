use config::{Config, ConfigError, File, FileFormat};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::info;

use crate::configs::{GatewayConfig, LogConfig};
use crate::Error;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_FILE: &str = "./config/config.yaml";

/// 指定配置文件路径的环境变量
pub const CONFIG_FILE_ENV: &str = "GATEWAY_CONFIG_FILE";

// 定义一个静态全局配置，可以在任何地方访问
pub static GLOBAL_CONFIG: Lazy<RwLock<Option<Arc<AppConfig>>>> = Lazy::new(|| RwLock::new(None));

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub log: LogConfig,
    pub gateway: GatewayConfig, //网关配置
}

/// 运行环境，决定错误响应是否暴露内部细节
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEnvironment {
    #[default]
    Development,
    Production,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub environment: RuntimeEnvironment,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            environment: RuntimeEnvironment::Development,
        }
    }
}

impl ServerConfig {
    pub fn server_url(&self) -> String {
        format!("{}:{}", &self.host, self.port)
    }

    pub fn is_production(&self) -> bool {
        self.environment == RuntimeEnvironment::Production
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// 连接串，`memory://` 表示使用进程内存储
    pub url: String,
    /// 单条命令超时（毫秒）
    pub command_timeout_ms: u64,
    /// 建立连接超时（毫秒）
    pub connection_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            command_timeout_ms: 1_000,
            connection_timeout_ms: 2_000,
        }
    }
}

impl RedisConfig {
    pub fn is_memory(&self) -> bool {
        self.url.starts_with("memory://")
    }
}

impl AppConfig {
    /// 按默认规则加载并校验配置
    ///
    /// 优先级从低到高：内置默认值、配置文件、`GATEWAY_` 前缀环境变量、`PORT`/`REDIS_URL`
    pub fn load() -> Result<Self, Error> {
        dotenv::dotenv().ok();

        let config = match env::var(CONFIG_FILE_ENV) {
            Ok(path) => {
                if !Path::new(&path).exists() {
                    return Err(Error::Config(format!("配置文件不存在: {}", path)));
                }
                Self::from_file(Some(&path))?
            }
            Err(_) => Self::from_file(None)?,
        };

        config.validate()?;
        Ok(config)
    }

    // 从多个来源加载配置
    pub fn from_file(file_path: Option<&str>) -> Result<Self, ConfigError> {
        // 开始构建配置
        let mut builder = Config::builder();

        match file_path {
            // 1. 指定的配置文件
            Some(path) => {
                let format = if path.ends_with(".json") {
                    FileFormat::Json
                } else if path.ends_with(".yaml") || path.ends_with(".yml") {
                    FileFormat::Yaml
                } else {
                    FileFormat::Toml
                };
                builder = builder.add_source(File::from(Path::new(path)).format(format));
            }
            // 2. 默认配置文件，不存在时只用内置默认值
            None => {
                builder = builder.add_source(
                    File::from(Path::new(DEFAULT_CONFIG_FILE))
                        .format(FileFormat::Yaml)
                        .required(false),
                );
            }
        }

        // 3. 读取环境变量，如 GATEWAY_GATEWAY__RATE_LIMIT__ENABLED=false
        builder = builder.add_source(
            config::Environment::with_prefix("GATEWAY")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("gateway.cors.allowed_origins")
                .try_parsing(true),
        );

        // 4. 常用的短环境变量 (最高优先级)
        builder = builder
            .set_override_option("server.port", env::var("PORT").ok())?
            .set_override_option("redis.url", env::var("REDIS_URL").ok())?;

        // 构建配置
        let config = builder.build()?;

        // 转换为AppConfig结构体
        config.try_deserialize()
    }

    /// 校验配置，一次性返回全部问题
    pub fn validate(&self) -> Result<(), Error> {
        let mut errors = Vec::new();

        if self.redis.url.is_empty() {
            errors.push("redis.url 不能为空".to_string());
        }
        if self.redis.command_timeout_ms == 0 || self.redis.connection_timeout_ms == 0 {
            errors.push("redis 超时时间必须大于0".to_string());
        }
        self.gateway.validate(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(errors.join("; ")))
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    // 初始化全局配置单例
    pub fn init_global() -> Result<Arc<AppConfig>, Error> {
        let config = Arc::new(AppConfig::load()?);
        Self::set_global_arc(config.clone());
        info!("全局配置初始化完成，共 {} 条路由", config.gateway.routes.len());
        Ok(config)
    }

    // 获取全局配置单例
    pub fn get_global() -> Option<Arc<AppConfig>> {
        GLOBAL_CONFIG
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    // 设置新的全局配置
    pub fn set_global(config: AppConfig) {
        Self::set_global_arc(Arc::new(config));
    }

    fn set_global_arc(config: Arc<AppConfig>) {
        let mut config_guard = GLOBAL_CONFIG
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *config_guard = Some(config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_yaml(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .expect("创建临时文件失败");
        file.write_all(content.as_bytes()).expect("写入临时文件失败");
        file
    }

    #[test]
    fn test_load_yaml() {
        let file = write_yaml(
            r#"
server:
  port: 9000
  environment: production
redis:
  url: "memory://"
gateway:
  cors:
    allowed_origins: ["https://app.example.com"]
  rate_limit:
    anonymous:
      window_ms: 60000
      max_requests: 5
      block_duration_ms: 30000
  routes:
    - path: /api/users
      target: http://localhost:3001
      retries: 2
      health_check_path: /health
      circuit_breaker:
        failure_threshold: 3
    - path: /search
      target: http://localhost:3004
      public: true
"#,
        );
        let path = file.path().to_str().expect("路径无效").to_string();

        let config = AppConfig::from_file(Some(&path)).expect("加载配置失败");
        assert!(config.validate().is_ok());
        assert!(config.server.is_production());
        assert_eq!(config.redis.command_timeout_ms, 1_000);
        assert_eq!(
            config.gateway.cors.allowed_origins,
            vec!["https://app.example.com".to_string()]
        );
        assert_eq!(config.gateway.rate_limit.anonymous.max_requests, 5);
        // 未出现的字段使用默认值
        assert_eq!(config.gateway.rate_limit.authenticated.max_requests, 1000);
        assert_eq!(config.gateway.routes.len(), 2);
        let users = &config.gateway.routes[0];
        assert_eq!(users.retries, 2);
        assert_eq!(users.circuit_breaker.failure_threshold, 3);
        assert_eq!(users.circuit_breaker.reset_timeout_ms, 60_000);
        assert!(config.gateway.routes[1].public);
    }

    #[test]
    fn test_invalid_routes_rejected() {
        let file = write_yaml(
            r#"
gateway:
  routes:
    - path: /api/users
      target: "users-service"
    - path: /api/users/
      target: http://localhost:3001
      timeout_ms: 0
"#,
        );
        let path = file.path().to_str().expect("路径无效").to_string();

        let config = AppConfig::from_file(Some(&path)).expect("加载配置失败");
        match config.validate() {
            Err(Error::Config(msg)) => {
                assert!(msg.contains("users-service"), "{}", msg);
                assert!(msg.contains("重复"), "{}", msg);
                assert!(msg.contains("timeout_ms"), "{}", msg);
            }
            other => panic!("应当校验失败: {:?}", other),
        }
    }

    #[test]
    fn test_invalid_health_thresholds() {
        let mut config = AppConfig::default();
        config.gateway.health.unhealthy_threshold = 0.8;
        config.gateway.health.degraded_threshold = 0.5;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_global_singleton() {
        ConfigLoader::set_global(AppConfig::default());
        let global = ConfigLoader::get_global().expect("全局配置未设置");
        assert_eq!(global.server.port, 8080);
        assert_eq!(global.gateway.name, "api-gateway");
    }
}
