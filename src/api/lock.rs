//! 环境锁与备注 API
//!
//! 包含 /lock, /unlock, /comment 端点

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::domain::{EnvironmentNote, LockRecord};
use crate::error::ApiResult;
use crate::middleware::{RequireApiKey, Requester};
use crate::state::AppState;

/// 锁状态响应
#[derive(Debug, Serialize)]
pub struct LockStatusResponse {
    pub project: String,
    pub environment: String,
    pub locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock: Option<LockRecord>,
}

/// 备注请求
#[derive(Debug, Deserialize)]
pub struct CommentRequest {
    /// 空字符串清除备注
    #[serde(default)]
    pub comment: String,
}

#[derive(Debug, Serialize)]
pub struct CommentResponse {
    pub project: String,
    pub environment: String,
    pub note: Option<EnvironmentNote>,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/lock/:project/:environment", get(lock_status).post(lock_environment))
        .route("/unlock/:project/:environment", post(unlock_environment))
        .route("/comment/:project/:environment", post(set_comment))
}

/// 查询锁状态
///
/// GET /lock/:project/:environment
async fn lock_status(
    State(state): State<Arc<AppState>>,
    Path((project, environment)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let lock = state.deployer.lock_status(&project, &environment).await?;
    Ok(Json(LockStatusResponse {
        project,
        environment,
        locked: lock.is_some(),
        lock,
    }))
}

/// 手动锁定环境
///
/// POST /lock/:project/:environment
/// 需要 API Key
async fn lock_environment(
    _auth: RequireApiKey,
    Requester(requester): Requester,
    State(state): State<Arc<AppState>>,
    Path((project, environment)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let record = state
        .deployer
        .lock(&project, &environment, &requester)
        .await?;
    Ok(Json(LockStatusResponse {
        project,
        environment,
        locked: true,
        lock: Some(record),
    }))
}

/// 解锁环境（仅持有者）
///
/// POST /unlock/:project/:environment
/// 需要 API Key
async fn unlock_environment(
    _auth: RequireApiKey,
    Requester(requester): Requester,
    State(state): State<Arc<AppState>>,
    Path((project, environment)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    state
        .deployer
        .unlock(&project, &environment, &requester)
        .await?;
    Ok(Json(LockStatusResponse {
        project,
        environment,
        locked: false,
        lock: None,
    }))
}

/// 设置环境备注
///
/// POST /comment/:project/:environment
/// 需要 API Key
async fn set_comment(
    _auth: RequireApiKey,
    Requester(requester): Requester,
    State(state): State<Arc<AppState>>,
    Path((project, environment)): Path<(String, String)>,
    Json(request): Json<CommentRequest>,
) -> ApiResult<impl IntoResponse> {
    let note = state
        .deployer
        .set_note(&project, &environment, &requester, &request.comment)
        .await?;
    Ok(Json(CommentResponse {
        project,
        environment,
        note,
    }))
}
