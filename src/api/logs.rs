//! 部署日志 API
//!
//! 包含 /sessions/:environment, /sessions/:environment/:timestamp(/stream) 端点

use axum::{
    extract::{Path, Query, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::get,
    Json, Router,
};
use futures::stream::Stream;
use serde::Deserialize;
use std::{convert::Infallible, sync::Arc};
use tracing::warn;

use crate::config::env::constants::HISTORY_LIMIT;
use crate::domain::{SessionEvent, SessionId};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// 历史查询参数
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// 返回数量限制
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    HISTORY_LIMIT
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sessions/:environment", get(session_history))
        .route("/sessions/:environment/:timestamp", get(read_session))
        .route("/sessions/:environment/:timestamp/stream", get(stream_session))
}

fn parse_session(environment: &str, timestamp: &str) -> ApiResult<SessionId> {
    SessionId::parse(environment, timestamp)
        .ok_or_else(|| ApiError::bad_request(format!("invalid session timestamp '{}'", timestamp)))
}

/// SSE 事件名
fn event_name(event: &SessionEvent) -> &'static str {
    match event {
        SessionEvent::Line(_) => "line",
        SessionEvent::HostStarted { .. } => "host_started",
        SessionEvent::HostFinished { .. } => "host_finished",
        SessionEvent::Notice { .. } => "notice",
        SessionEvent::Sealed(_) => "complete",
    }
}

/// 环境部署历史
///
/// GET /sessions/:environment?limit=N
async fn session_history(
    State(state): State<Arc<AppState>>,
    Path(environment): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<impl IntoResponse> {
    let limit = query.limit.clamp(1, 500);
    let history = state.deployer.history(&environment, limit).await?;
    Ok(Json(history))
}

/// 读取会话日志
///
/// GET /sessions/:environment/:timestamp
async fn read_session(
    State(state): State<Arc<AppState>>,
    Path((environment, timestamp)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let id = parse_session(&environment, &timestamp)?;
    let record = state.deployer.read_log(&id).await?;
    Ok(Json(record))
}

/// 实时日志流 (SSE)
///
/// GET /sessions/:environment/:timestamp/stream
///
/// 先回放已有输出，再推送实时事件；会话封存时发送 `complete` 事件并结束。
/// 跟不上输出被丢弃的观察者会收到 `dropped` 事件，可重新订阅
async fn stream_session(
    State(state): State<Arc<AppState>>,
    Path((environment, timestamp)): Path<(String, String)>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let id = parse_session(&environment, &timestamp)?;
    let mut subscription = state.log_hub.subscribe(&id).await?;

    let stream = async_stream::stream! {
        while let Some(event) = subscription.next().await {
            let json = serde_json::to_string(&event).unwrap_or_default();
            yield Ok(Event::default().event(event_name(&event)).data(json));
            if event.is_sealed() {
                break;
            }
        }

        if !subscription.saw_sealed() {
            warn!(session = %id, observer = subscription.observer_id(), "Log stream ended before session was sealed");
            yield Ok(Event::default().event("dropped").data(
                serde_json::json!({ "session": id.to_string() }).to_string()
            ));
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("keepalive"),
    ))
}
