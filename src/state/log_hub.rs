//! 日志中心
//!
//! 进程内唯一的发布/订阅点：把执行输出和生命周期事件扇出给会话的所有观察者，
//! 同时写入日志存储。
//!
//! - 每个会话一把互斥锁，串行化「写存储 → 追加 transcript → 扇出」，不同会话互不阻塞
//! - 每个观察者一个有界队列，`try_send` 失败即丢弃该观察者，发布者永不等待
//! - 订阅时在同一把锁内快照 transcript 并注册，回放与实时之间不重不漏

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::Stream;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, warn};

use crate::domain::{SessionEvent, SessionId, SessionMeta, SessionOutcome};

use super::log_store::{LogStore, LogStoreError};

/// 每个观察者的缓冲容量
pub const OBSERVER_BUFFER: usize = 256;

/// Hub 错误
#[derive(Debug, Error)]
pub enum HubError {
    #[error("session {0} not found")]
    UnknownSession(String),

    #[error("session {0} is sealed")]
    Sealed(String),

    #[error(transparent)]
    Store(#[from] LogStoreError),
}

struct Observer {
    id: u64,
    sender: mpsc::Sender<SessionEvent>,
}

/// 会话通道信息
struct SessionChannel {
    transcript: Vec<SessionEvent>,
    observers: Vec<Observer>,
    created_at: DateTime<Utc>,
    sealed: bool,
}

impl SessionChannel {
    /// 扇出到所有观察者，移除断开或跟不上的观察者
    fn fan_out(&mut self, session: &SessionId, event: &SessionEvent) {
        self.observers.retain(|observer| match observer.sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    session = %session,
                    observer = observer.id,
                    capacity = OBSERVER_BUFFER,
                    "Observer cannot keep up, dropping it"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(session = %session, observer = observer.id, "Observer disconnected");
                false
            }
        });
    }
}

/// 订阅：先回放历史，再接收实时事件
pub struct Subscription {
    observer_id: u64,
    backlog: VecDeque<SessionEvent>,
    receiver: mpsc::Receiver<SessionEvent>,
    saw_sealed: bool,
}

impl Subscription {
    fn closed(observer_id: u64, backlog: Vec<SessionEvent>) -> Self {
        let (_, receiver) = mpsc::channel(1);
        Self {
            observer_id,
            backlog: backlog.into(),
            receiver,
            saw_sealed: false,
        }
    }

    pub fn observer_id(&self) -> u64 {
        self.observer_id
    }

    /// 下一个事件；会话封存或观察者被丢弃后返回 None
    pub async fn next(&mut self) -> Option<SessionEvent> {
        let event = match self.backlog.pop_front() {
            Some(event) => Some(event),
            None => self.receiver.recv().await,
        };
        if let Some(ref e) = event {
            if e.is_sealed() {
                self.saw_sealed = true;
            }
        }
        event
    }

    /// 流是否以封存事件结束（false 表示被 Hub 丢弃或会话被放弃）
    pub fn saw_sealed(&self) -> bool {
        self.saw_sealed
    }

    pub fn into_stream(self) -> impl Stream<Item = SessionEvent> {
        futures::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|event| (event, sub))
        })
    }
}

/// 日志中心
pub struct LogHub {
    store: Arc<dyn LogStore>,
    /// 通道映射 (session -> SessionChannel)
    channels: RwLock<HashMap<SessionId, Arc<Mutex<SessionChannel>>>>,
    next_observer: AtomicU64,
}

impl LogHub {
    /// 创建新的日志中心
    pub fn new(store: Arc<dyn LogStore>) -> Self {
        Self {
            store,
            channels: RwLock::new(HashMap::new()),
            next_observer: AtomicU64::new(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn LogStore> {
        &self.store
    }

    async fn channel(&self, id: &SessionId) -> Option<Arc<Mutex<SessionChannel>>> {
        let channels = self.channels.read().await;
        channels.get(id).cloned()
    }

    /// 创建会话：写入日志头并建立通道
    pub async fn open(&self, meta: &SessionMeta) -> Result<(), HubError> {
        self.store.begin(meta).await?;

        let mut channels = self.channels.write().await;
        channels.insert(
            meta.id.clone(),
            Arc::new(Mutex::new(SessionChannel {
                transcript: Vec::new(),
                observers: Vec::new(),
                created_at: Utc::now(),
                sealed: false,
            })),
        );
        Ok(())
    }

    /// 发布事件
    ///
    /// 存储写入失败只记录日志，事件仍然推送给观察者
    pub async fn publish(&self, id: &SessionId, event: SessionEvent) -> Result<(), HubError> {
        let channel = self
            .channel(id)
            .await
            .ok_or_else(|| HubError::UnknownSession(id.to_string()))?;
        let mut channel = channel.lock().await;
        if channel.sealed {
            return Err(HubError::Sealed(id.to_string()));
        }

        if let Err(e) = self.store.append(id, &event).await {
            error!(session = %id, error = %e, "Failed to persist session event");
        }
        channel.fan_out(id, &event);
        channel.transcript.push(event);
        Ok(())
    }

    /// 封存会话：持久化结果，推送封存事件并关闭所有观察者
    pub async fn seal(&self, id: &SessionId, outcome: SessionOutcome) -> Result<(), HubError> {
        let channel = self
            .channel(id)
            .await
            .ok_or_else(|| HubError::UnknownSession(id.to_string()))?;
        let mut channel = channel.lock().await;
        if channel.sealed {
            return Err(HubError::Sealed(id.to_string()));
        }

        let stored = self.store.seal(id, &outcome).await;
        let event = SessionEvent::Sealed(outcome);
        channel.fan_out(id, &event);
        channel.transcript.push(event);
        channel.sealed = true;
        channel.observers.clear();

        stored.map_err(HubError::from)
    }

    /// 订阅会话
    ///
    /// 内存中没有的会话从日志存储回放（历史会话）
    pub async fn subscribe(&self, id: &SessionId) -> Result<Subscription, HubError> {
        let observer_id = self.next_observer.fetch_add(1, Ordering::Relaxed);

        let Some(channel) = self.channel(id).await else {
            let record = match self.store.read(id).await {
                Ok(record) => record,
                Err(LogStoreError::NotFound(_)) => {
                    return Err(HubError::UnknownSession(id.to_string()));
                }
                Err(e) => return Err(e.into()),
            };
            let mut backlog = record.transcript;
            if let Some(outcome) = record.outcome {
                backlog.push(SessionEvent::Sealed(outcome));
            }
            return Ok(Subscription::closed(observer_id, backlog));
        };

        let mut channel = channel.lock().await;
        let backlog = channel.transcript.clone();
        if channel.sealed {
            return Ok(Subscription::closed(observer_id, backlog));
        }

        let (sender, receiver) = mpsc::channel(OBSERVER_BUFFER);
        channel.observers.push(Observer {
            id: observer_id,
            sender,
        });
        debug!(session = %id, observer = observer_id, replayed = backlog.len(), "Observer subscribed");

        Ok(Subscription {
            observer_id,
            backlog: backlog.into(),
            receiver,
            saw_sealed: false,
        })
    }

    /// 主动取消订阅
    pub async fn unsubscribe(&self, id: &SessionId, observer_id: u64) {
        if let Some(channel) = self.channel(id).await {
            let mut channel = channel.lock().await;
            channel.observers.retain(|o| o.id != observer_id);
        }
    }

    /// 当前 transcript 快照
    pub async fn transcript(&self, id: &SessionId) -> Option<Vec<SessionEvent>> {
        let channel = self.channel(id).await?;
        let channel = channel.lock().await;
        Some(channel.transcript.clone())
    }

    /// 会话当前观察者数量
    pub async fn observer_count(&self, id: &SessionId) -> usize {
        match self.channel(id).await {
            Some(channel) => channel.lock().await.observers.len(),
            None => 0,
        }
    }

    /// 检查会话是否已封存
    pub async fn is_sealed(&self, id: &SessionId) -> bool {
        match self.channel(id).await {
            Some(channel) => channel.lock().await.sealed,
            None => true,
        }
    }

    /// 清理已封存的通道（历史仍可从日志存储回放）
    pub async fn cleanup(&self) {
        let snapshot: Vec<(SessionId, Arc<Mutex<SessionChannel>>)> = {
            let channels = self.channels.read().await;
            channels.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        let mut finished = Vec::new();
        for (id, channel) in snapshot {
            if channel.lock().await.sealed {
                finished.push(id);
            }
        }

        if !finished.is_empty() {
            let mut channels = self.channels.write().await;
            for id in &finished {
                channels.remove(id);
            }
            debug!(removed = finished.len(), "Cleaned up sealed session channels");
        }
    }

    /// 清理创建时间超过指定时长的已封存通道
    pub async fn cleanup_expired(&self, max_age_hours: i64) {
        let now = Utc::now();
        let snapshot: Vec<(SessionId, Arc<Mutex<SessionChannel>>)> = {
            let channels = self.channels.read().await;
            channels.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        let mut expired = Vec::new();
        for (id, channel) in snapshot {
            let channel = channel.lock().await;
            if channel.sealed && (now - channel.created_at).num_hours() >= max_age_hours {
                expired.push(id);
            }
        }

        let mut channels = self.channels.write().await;
        for id in &expired {
            channels.remove(id);
        }
    }

    /// 获取通道数量
    pub async fn count(&self) -> usize {
        let channels = self.channels.read().await;
        channels.len()
    }

    /// 获取活跃通道数量（未封存）
    pub async fn active_count(&self) -> usize {
        let snapshot: Vec<Arc<Mutex<SessionChannel>>> = {
            let channels = self.channels.read().await;
            channels.values().cloned().collect()
        };
        let mut active = 0;
        for channel in snapshot {
            if !channel.lock().await.sealed {
                active += 1;
            }
        }
        active
    }
}
