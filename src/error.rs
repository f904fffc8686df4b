//! 统一错误处理
//!
//! 提供 `ApiError` 枚举实现 `IntoResponse`，并把各组件的错误映射到 HTTP 状态码

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::ConfigurationError;
use crate::services::deploy::DeployError;
use crate::state::{HubError, LockError, LogStoreError};

/// API 错误响应结构
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// 锁冲突时的当前持有者
    #[serde(flatten)]
    pub lock: Option<LockConflict>,
}

/// 锁冲突信息
#[derive(Debug, Serialize)]
pub struct LockConflict {
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    /// 已持有的秒数
    pub age_secs: i64,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            details: None,
            lock: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// 统一 API 错误类型
#[derive(Debug)]
pub enum ApiError {
    /// 401 - 未授权（API Key 无效或缺失）
    Unauthorized,
    /// 404 - 资源未找到
    NotFound(String),
    /// 400 - 请求无效
    BadRequest(String),
    /// 403 - 无权操作（如：释放他人持有的锁）
    Forbidden(String),
    /// 409 - 冲突
    Conflict(String),
    /// 409 - 环境已被他人锁定
    Locked {
        holder: String,
        acquired_at: DateTime<Utc>,
    },
    /// 428 - 需要确认后重试
    ConfirmationRequired(String),
    /// 500 - 内部错误
    Internal(String),
    /// 503 - 服务不可用
    ServiceUnavailable(String),
}

impl ApiError {
    /// 创建未授权错误
    pub fn unauthorized() -> Self {
        Self::Unauthorized
    }

    /// 创建请求无效错误
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                ErrorResponse::new("unauthorized", "Invalid or missing API key"),
            ),
            ApiError::NotFound(resource) => (
                StatusCode::NOT_FOUND,
                ErrorResponse::new("not_found", format!("{} not found", resource)),
            ),
            ApiError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, ErrorResponse::new("bad_request", msg))
            }
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, ErrorResponse::new("forbidden", msg)),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, ErrorResponse::new("conflict", msg)),
            ApiError::Locked {
                holder,
                acquired_at,
            } => {
                let mut body = ErrorResponse::new(
                    "locked",
                    format!("locked by {} since {}", holder, acquired_at),
                );
                body.lock = Some(LockConflict {
                    age_secs: (Utc::now() - acquired_at).num_seconds().max(0),
                    holder,
                    acquired_at,
                });
                (StatusCode::CONFLICT, body)
            }
            ApiError::ConfirmationRequired(msg) => (
                StatusCode::PRECONDITION_REQUIRED,
                ErrorResponse::new("confirmation_required", msg),
            ),
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::new("internal_error", msg),
            ),
            ApiError::ServiceUnavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorResponse::new("service_unavailable", msg),
            ),
        };

        (status, Json(body)).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Unauthorized => write!(f, "Unauthorized"),
            ApiError::NotFound(r) => write!(f, "Not found: {}", r),
            ApiError::BadRequest(m) => write!(f, "Bad request: {}", m),
            ApiError::Forbidden(m) => write!(f, "Forbidden: {}", m),
            ApiError::Conflict(m) => write!(f, "Conflict: {}", m),
            ApiError::Locked {
                holder,
                acquired_at,
            } => write!(f, "Locked by {} since {}", holder, acquired_at),
            ApiError::ConfirmationRequired(m) => write!(f, "Confirmation required: {}", m),
            ApiError::Internal(m) => write!(f, "Internal error: {}", m),
            ApiError::ServiceUnavailable(m) => write!(f, "Service unavailable: {}", m),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<ConfigurationError> for ApiError {
    fn from(e: ConfigurationError) -> Self {
        match e {
            ConfigurationError::ProjectNotFound(_) | ConfigurationError::EnvironmentNotFound { .. } => {
                ApiError::NotFound(e.to_string())
            }
            ConfigurationError::InvalidRevision { .. } => ApiError::BadRequest(e.to_string()),
            ConfigurationError::Invalid(_) | ConfigurationError::Load { .. } => {
                ApiError::Internal(e.to_string())
            }
        }
    }
}

impl From<LockError> for ApiError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::AlreadyLocked {
                holder,
                acquired_at,
            } => ApiError::Locked {
                holder,
                acquired_at,
            },
            LockError::Contended { .. } => ApiError::Conflict(e.to_string()),
            LockError::NotOwner { .. } => ApiError::Forbidden(e.to_string()),
            LockError::StoreUnavailable(_) => ApiError::ServiceUnavailable(e.to_string()),
            LockError::Corrupt { .. } => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<LogStoreError> for ApiError {
    fn from(e: LogStoreError) -> Self {
        match e {
            LogStoreError::NotFound(id) => ApiError::NotFound(format!("session {}", id)),
            LogStoreError::AlreadyExists(_) => ApiError::Conflict(e.to_string()),
            _ => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<HubError> for ApiError {
    fn from(e: HubError) -> Self {
        match e {
            HubError::UnknownSession(id) => ApiError::NotFound(format!("session {}", id)),
            HubError::Sealed(_) => ApiError::Conflict(e.to_string()),
            HubError::Store(e) => e.into(),
        }
    }
}

impl From<DeployError> for ApiError {
    fn from(e: DeployError) -> Self {
        match e {
            DeployError::Configuration(e) => e.into(),
            DeployError::ConfirmationRequired { .. } => ApiError::ConfirmationRequired(e.to_string()),
            DeployError::Lock(e) => e.into(),
            DeployError::Session(e) => e.into(),
            DeployError::Log(e) => e.into(),
            DeployError::Store(_) => ApiError::ServiceUnavailable(e.to_string()),
            DeployError::InvalidInput(msg) => ApiError::BadRequest(msg),
        }
    }
}

/// 便捷类型别名
pub type ApiResult<T> = Result<T, ApiError>;
