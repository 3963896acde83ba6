use common::configs::{normalize_pattern, validate_routes, RouteConfig};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// 编译后的路由
#[derive(Debug)]
pub struct CompiledRoute {
    pub config: RouteConfig,
    segments: Vec<Segment>,
    literal_count: usize,
    order: usize,
    next_target: AtomicUsize,
}

impl CompiledRoute {
    fn compile(config: RouteConfig, order: usize) -> Self {
        let segments: Vec<Segment> = split_segments(&normalize_pattern(&config.path))
            .map(|s| match s.strip_prefix(':') {
                Some(name) if !name.is_empty() => Segment::Param(name.to_string()),
                _ => Segment::Literal(s.to_string()),
            })
            .collect();
        let literal_count = segments
            .iter()
            .filter(|s| matches!(s, Segment::Literal(_)))
            .count();

        Self {
            config,
            segments,
            literal_count,
            order,
            next_target: AtomicUsize::new(0),
        }
    }

    /// 轮询选择上游目标
    pub fn next_target(&self) -> &str {
        let total = 1 + self.config.extra_targets.len();
        let idx = self.next_target.fetch_add(1, Ordering::Relaxed) % total;
        if idx == 0 {
            &self.config.target
        } else {
            &self.config.extra_targets[idx - 1]
        }
    }

    /// 按段匹配，成功时返回参数
    fn match_segments(&self, path: &[&str]) -> Option<HashMap<String, String>> {
        if path.len() < self.segments.len() {
            return None;
        }
        let mut params = HashMap::new();
        for (pattern, actual) in self.segments.iter().zip(path) {
            match pattern {
                Segment::Literal(lit) if lit == actual => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), (*actual).to_string());
                }
            }
        }
        Some(params)
    }
}

/// 路由解析结果
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub route: Arc<CompiledRoute>,
    /// 本次选中的上游目标
    pub target: String,
    pub params: HashMap<String, String>,
    /// 匹配到的路径部分，如 `/api/users/42`
    pub matched: String,
    /// 未匹配的剩余路径，如 `/posts`，无剩余时为空
    pub remainder: String,
}

impl RouteMatch {
    pub fn config(&self) -> &RouteConfig {
        &self.route.config
    }
}

fn split_segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// 规范化请求路径：去掉查询串和末尾斜杠
pub fn normalize_path(path: &str) -> String {
    let path = path.split(['?', '#']).next().unwrap_or("");
    normalize_pattern(path)
}

/// 路由表，创建后不可变
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Arc<CompiledRoute>>,
}

impl RouteTable {
    /// 校验并编译路由配置
    pub fn new(configs: Vec<RouteConfig>) -> Result<Self, Vec<String>> {
        let errors = validate_routes(&configs);
        if !errors.is_empty() {
            return Err(errors);
        }
        let routes = configs
            .into_iter()
            .enumerate()
            .map(|(order, config)| Arc::new(CompiledRoute::compile(config, order)))
            .collect();
        Ok(Self { routes })
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn configs(&self) -> Vec<RouteConfig> {
        self.routes.iter().map(|r| r.config.clone()).collect()
    }

    /// 路由表中出现的全部上游目标
    pub fn targets(&self) -> HashSet<String> {
        self.routes
            .iter()
            .flat_map(|r| r.config.targets())
            .map(str::to_string)
            .collect()
    }

    /// 解析路径
    ///
    /// 完全匹配优先；否则取段数最多的前缀匹配。
    /// 同等长度时字面段多者优先，再按注册顺序。
    pub fn resolve(&self, path: &str) -> Option<RouteMatch> {
        let normalized = normalize_path(path);
        let parts: Vec<&str> = split_segments(&normalized).collect();

        let mut best: Option<(&Arc<CompiledRoute>, HashMap<String, String>)> = None;
        for route in &self.routes {
            let Some(params) = route.match_segments(&parts) else {
                continue;
            };
            let better = match &best {
                None => true,
                Some((current, _)) => rank(route, &parts) > rank(current, &parts),
            };
            if better {
                best = Some((route, params));
            }
        }

        let (route, params) = best?;
        let depth = route.segments.len();
        let matched = format!("/{}", parts[..depth].join("/"));
        let remainder = if depth == parts.len() {
            String::new()
        } else {
            format!("/{}", parts[depth..].join("/"))
        };

        Some(RouteMatch {
            target: route.next_target().to_string(),
            route: route.clone(),
            params,
            matched,
            remainder,
        })
    }
}

/// 排序键：是否完全匹配、段数、字面段数、注册顺序（越早越优先）
fn rank(route: &CompiledRoute, parts: &[&str]) -> (bool, usize, usize, std::cmp::Reverse<usize>) {
    (
        route.segments.len() == parts.len(),
        route.segments.len(),
        route.literal_count,
        std::cmp::Reverse(route.order),
    )
}

/// 路由注册表，支持运行时整体替换
#[derive(Debug, Default)]
pub struct RouteRegistry {
    current: RwLock<Arc<RouteTable>>,
}

impl RouteRegistry {
    pub fn new(table: RouteTable) -> Self {
        Self {
            current: RwLock::new(Arc::new(table)),
        }
    }

    /// 当前路由表快照
    pub fn snapshot(&self) -> Arc<RouteTable> {
        self.current.read().clone()
    }

    pub fn resolve(&self, path: &str) -> Option<RouteMatch> {
        self.snapshot().resolve(path)
    }

    /// 校验后原子替换路由表，校验失败时保持原表
    pub fn replace(&self, configs: Vec<RouteConfig>) -> Result<usize, Vec<String>> {
        let table = RouteTable::new(configs)?;
        let count = table.len();
        *self.current.write() = Arc::new(table);
        info!("路由表已替换，共 {} 条路由", count);
        Ok(count)
    }
}
