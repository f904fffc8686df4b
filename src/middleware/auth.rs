//! 认证与身份
//!
//! - `RequireApiKey`：校验 `x-api-key` header
//! - `Requester`：从 `x-shipdeck-user` header 取请求者身份，缺失时使用默认用户

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::HeaderMap, request::Parts},
};
use std::sync::Arc;

use crate::error::ApiError;
use crate::state::AppState;

/// 身份 header（由前置的登录层注入）
pub const USER_HEADER: &str = "x-shipdeck-user";

/// API Key 认证 Extractor
///
/// 在需要认证的 handler 中使用此 extractor，自动验证 `x-api-key` header
///
/// # Example
///
/// ```ignore
/// async fn protected_handler(
///     _auth: RequireApiKey,
///     State(state): State<Arc<AppState>>,
/// ) -> impl IntoResponse {
///     // handler 逻辑...
/// }
/// ```
#[derive(Debug, Clone)]
pub struct RequireApiKey;

#[async_trait]
impl FromRequestParts<Arc<AppState>> for RequireApiKey {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        verify_api_key(&parts.headers, &state.api_key)
    }
}

/// 验证 API Key
///
/// 检查 `x-api-key` header 是否与配置的 API key 匹配
pub fn verify_api_key(headers: &HeaderMap, expected_key: &str) -> Result<RequireApiKey, ApiError> {
    let provided_key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok());

    match provided_key {
        Some(key) if key == expected_key => Ok(RequireApiKey),
        Some(_) => {
            tracing::warn!("Invalid API key provided");
            Err(ApiError::unauthorized())
        }
        None => {
            tracing::warn!("Missing x-api-key header");
            Err(ApiError::unauthorized())
        }
    }
}

/// 请求者身份
#[derive(Debug, Clone)]
pub struct Requester(pub String);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for Requester {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts.headers.get(USER_HEADER).and_then(|v| v.to_str().ok());
        Ok(Requester(resolve_requester(header, &state.config.default_user)))
    }
}

/// 身份头缺失或为空时使用默认用户
pub fn resolve_requester(header: Option<&str>, default_user: &str) -> String {
    header
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(default_user)
        .to_string()
}
