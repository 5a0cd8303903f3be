//! JWT 认证
//!
//! 提供 JWT token 生成、验证，并作为实时通道握手的认证方

use async_trait::async_trait;
use axum::http::HeaderMap;
use config::JwtConfig;
use domain::{AuthError, Authenticator, UserId};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// JWT Claims 结构
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: i64,
    pub exp: i64, // 过期时间 (Unix timestamp)
}

/// JWT Token 服务
#[derive(Clone)]
pub struct JwtService {
    config: JwtConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtService {
    pub fn new(config: JwtConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.secret.as_ref());
        let decoding_key = DecodingKey::from_secret(config.secret.as_ref());

        Self {
            config,
            encoding_key,
            decoding_key,
        }
    }

    /// 生成 JWT token。签发不属于本服务，这里供工具和测试使用。
    pub fn generate_token(&self, user_id: UserId) -> Result<String, ApiError> {
        let now = chrono::Utc::now();
        let exp = now + chrono::Duration::hours(self.config.expiration_hours);

        let claims = Claims {
            user_id: user_id.as_i64(),
            exp: exp.timestamp(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|err| ApiError::internal_server_error(format!("Token generation failed: {}", err)))
    }

    /// 验证并解析 JWT token
    pub fn verify_token(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map(|token_data| token_data.claims)
            .map_err(|err| match err.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidToken(err.to_string()),
            })
    }

    /// 从 Authorization 头中提取用户；没有头时返回 `None`
    pub fn user_from_headers(&self, headers: &HeaderMap) -> Option<Result<UserId, AuthError>> {
        let auth_header = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|header| header.to_str().ok())?;

        let result = auth_header
            .strip_prefix("Bearer ")
            .ok_or_else(|| AuthError::InvalidToken("invalid authorization header format".into()))
            .and_then(|token| self.verify_token(token))
            .map(|claims| UserId(claims.user_id));
        Some(result)
    }
}

#[async_trait]
impl Authenticator for JwtService {
    async fn validate(&self, token: &str) -> Result<UserId, AuthError> {
        self.verify_token(token).map(|claims| UserId(claims.user_id))
    }
}
