use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub components: Option<HashMap<String, String>>, // 其他组件的日志级别
    pub format: Option<String>,                      // 日志输出格式: plain或json
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            components: None,
            format: None,
        }
    }
}

impl LogConfig {
    pub fn level(&self) -> tracing::Level {
        match self.level.as_str() {
            "trace" => tracing::Level::TRACE,
            "debug" => tracing::Level::DEBUG,
            "info" => tracing::Level::INFO,
            "warn" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        }
    }

    // 获取特定组件的日志级别
    pub fn component_level(&self, component: &str) -> Option<&str> {
        match &self.components {
            Some(components) => components.get(component).map(|s| s.as_str()),
            None => None,
        }
    }

    /// 构建EnvFilter指令字符串：全局级别在前，组件级别按名称排序追加
    pub fn filter_directives(&self) -> String {
        let mut filter_parts = vec![self.level.clone()];
        if let Some(components) = &self.components {
            let mut names: Vec<&String> = components.keys().collect();
            names.sort();
            for name in names {
                filter_parts.push(format!("{}={}", name, components[name]));
            }
        }
        filter_parts.join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directives() {
        let mut components = HashMap::new();
        components.insert("tower_http".to_string(), "debug".to_string());
        components.insert("api_gateway".to_string(), "trace".to_string());
        let config = LogConfig {
            level: "warn".to_string(),
            components: Some(components),
            format: None,
        };

        assert_eq!(
            config.filter_directives(),
            "warn,api_gateway=trace,tower_http=debug"
        );
        assert_eq!(config.component_level("tower_http"), Some("debug"));
        assert_eq!(config.level(), tracing::Level::WARN);
    }
}
