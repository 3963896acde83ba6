use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// 调用方身份，对网关来说是不透明的ID
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
}

/// 从请求头提取身份
pub trait IdentityExtractor: Send + Sync {
    /// 无法识别时返回 `None`，按匿名处理
    fn extract(&self, headers: &HeaderMap) -> Option<Identity>;
}

/// JWT Token中的声明信息
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// 主题 (用户ID)
    pub sub: String,
    /// 过期时间
    pub exp: u64,
}

/// 校验 HS256 Bearer Token，取 `sub` 作为用户ID
pub struct JwtIdentityExtractor {
    key: Option<DecodingKey>,
    validation: Validation,
}

impl JwtIdentityExtractor {
    /// 未配置密钥时所有调用方都是匿名的
    pub fn new(secret: Option<&str>) -> Self {
        Self {
            key: secret
                .filter(|s| !s.is_empty())
                .map(|s| DecodingKey::from_secret(s.as_bytes())),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

/// 从请求头中提取token
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

impl IdentityExtractor for JwtIdentityExtractor {
    fn extract(&self, headers: &HeaderMap) -> Option<Identity> {
        let key = self.key.as_ref()?;
        let token = bearer_token(headers)?;
        match decode::<Claims>(token, key, &self.validation) {
            Ok(data) if !data.claims.sub.is_empty() => Some(Identity {
                user_id: data.claims.sub,
            }),
            Ok(_) => None,
            Err(e) => {
                debug!("Token无效，按匿名处理: {}", e);
                None
            }
        }
    }
}
