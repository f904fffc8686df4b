//! 部署管理 API
//!
//! 包含 /deploy/:project/:environment, /deploys/running 端点

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::ApiResult;
use crate::middleware::{RequireApiKey, Requester};
use crate::services::deploy::DeployRequest;
use crate::state::AppState;

/// 触发部署请求
#[derive(Debug, Clone, Deserialize)]
pub struct TriggerRequest {
    /// 要部署的 revision
    pub revision: String,
    /// 用户已确认（需要确认的环境必须为 true）
    #[serde(default)]
    pub confirmed: bool,
}

/// 触发部署响应
#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub session: String,
    pub project: String,
    pub environment: String,
    pub revision: String,
    pub requester: String,
    pub status: String,
    pub stream_url: String,
}

/// 取消部署响应
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/deploy/:project/:environment", post(trigger_deploy))
        .route("/deploy/:project/:environment/cancel", post(cancel_deploy))
        .route("/deploys/running", get(running_deploys))
}

/// 触发部署
///
/// POST /deploy/:project/:environment
/// 需要 API Key
///
/// 加锁成功后立即返回 202，输出通过 stream_url 订阅
async fn trigger_deploy(
    _auth: RequireApiKey,
    Requester(requester): Requester,
    State(state): State<Arc<AppState>>,
    Path((project, environment)): Path<(String, String)>,
    Json(request): Json<TriggerRequest>,
) -> ApiResult<impl IntoResponse> {
    let started = state
        .deployer
        .start(DeployRequest {
            project: project.clone(),
            environment: environment.clone(),
            revision: request.revision.clone(),
            requester: requester.clone(),
            confirmed: request.confirmed,
        })
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(TriggerResponse {
            session: started.session,
            project,
            environment,
            revision: request.revision,
            requester,
            status: "started".to_string(),
            stream_url: started.stream_url,
        }),
    ))
}

/// 取消运行中的部署
///
/// POST /deploy/:project/:environment/cancel
/// 需要 API Key
async fn cancel_deploy(
    _auth: RequireApiKey,
    Requester(requester): Requester,
    State(state): State<Arc<AppState>>,
    Path((project, environment)): Path<(String, String)>,
) -> impl IntoResponse {
    let cancelled = state.deployer.cancel(&project, &environment).await;
    if cancelled {
        tracing::info!(project = %project, environment = %environment, requester = %requester, "Deployment cancel requested");
    }
    Json(CancelResponse { cancelled })
}

/// 运行中的部署
///
/// GET /deploys/running
async fn running_deploys(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.deployer.running().await)
}
