//! 部署日志存储
//!
//! 每个会话一份只追加的记录：会话头、事件序列、最终结果。封存后不可修改。
//! 文件布局：`<data_dir>/<environment>/<timestamp>.jsonl`

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::domain::{SessionEvent, SessionId, SessionMeta, SessionOutcome, SessionRecord, SessionSummary};

const LOG_EXTENSION: &str = "jsonl";

/// 日志存储错误
#[derive(Debug, Error)]
pub enum LogStoreError {
    #[error("session {0} not found")]
    NotFound(String),

    #[error("session {0} already exists")]
    AlreadyExists(String),

    #[error("session {0} is sealed")]
    Sealed(String),

    #[error("corrupt session log {0}: {1}")]
    Corrupt(String, String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait LogStore: Send + Sync {
    /// 创建会话记录
    async fn begin(&self, meta: &SessionMeta) -> Result<(), LogStoreError>;

    /// 追加事件，已封存的会话返回 `Sealed`
    async fn append(&self, id: &SessionId, event: &SessionEvent) -> Result<(), LogStoreError>;

    /// 写入最终结果并封存
    async fn seal(&self, id: &SessionId, outcome: &SessionOutcome) -> Result<(), LogStoreError>;

    async fn read(&self, id: &SessionId) -> Result<SessionRecord, LogStoreError>;

    /// 某环境最近的会话，按开始时间倒序
    async fn list(&self, environment: &str, limit: usize) -> Result<Vec<SessionSummary>, LogStoreError>;
}

/// 日志文件中的一行
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum StoredRecord {
    Header(SessionMeta),
    Event(SessionEvent),
    Outcome(SessionOutcome),
}

/// 基于文件的日志存储
pub struct FileLogStore {
    root: PathBuf,
    /// 本进程打开且未封存的会话，值为是否已封存
    open: Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<bool>>>>,
}

impl FileLogStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn environment_dir(&self, environment: &str) -> Result<PathBuf, LogStoreError> {
        if environment.is_empty()
            || environment.starts_with('.')
            || environment.contains(['/', '\\'])
        {
            return Err(LogStoreError::NotFound(environment.to_string()));
        }
        Ok(self.root.join(environment))
    }

    fn session_path(&self, id: &SessionId) -> Result<PathBuf, LogStoreError> {
        Ok(self
            .environment_dir(&id.environment)?
            .join(format!("{}.{}", id.timestamp(), LOG_EXTENSION)))
    }

    fn open_entry(&self, id: &SessionId) -> Option<Arc<tokio::sync::Mutex<bool>>> {
        self.open
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(id)
            .cloned()
    }

    async fn write_record(path: &Path, record: &StoredRecord) -> Result<(), LogStoreError> {
        let mut line = serde_json::to_vec(record)
            .map_err(|e| LogStoreError::Corrupt(path.display().to_string(), e.to_string()))?;
        line.push(b'\n');

        let mut file = fs::OpenOptions::new().append(true).open(path).await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    /// 会话不在本进程打开列表中时的错误
    async fn closed_error(&self, id: &SessionId) -> LogStoreError {
        match self.session_path(id) {
            Ok(path) if fs::try_exists(&path).await.unwrap_or(false) => {
                LogStoreError::Sealed(id.to_string())
            }
            _ => LogStoreError::NotFound(id.to_string()),
        }
    }

    async fn load(path: &Path) -> Result<SessionRecord, LogStoreError> {
        let content = fs::read_to_string(path).await?;
        parse_record(&path.display().to_string(), &content)
    }
}

#[async_trait]
impl LogStore for FileLogStore {
    async fn begin(&self, meta: &SessionMeta) -> Result<(), LogStoreError> {
        let dir = self.environment_dir(&meta.id.environment)?;
        fs::create_dir_all(&dir).await?;

        let path = self.session_path(&meta.id)?;
        let header = serde_json::to_vec(&StoredRecord::Header(meta.clone()))
            .map_err(|e| LogStoreError::Corrupt(path.display().to_string(), e.to_string()))?;

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(LogStoreError::AlreadyExists(meta.id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(&header).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;

        self.open
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(meta.id.clone(), Arc::new(tokio::sync::Mutex::new(false)));

        debug!(session = %meta.id, path = %path.display(), "Session log created");
        Ok(())
    }

    async fn append(&self, id: &SessionId, event: &SessionEvent) -> Result<(), LogStoreError> {
        let Some(entry) = self.open_entry(id) else {
            return Err(self.closed_error(id).await);
        };
        let sealed = entry.lock().await;
        if *sealed {
            return Err(LogStoreError::Sealed(id.to_string()));
        }
        Self::write_record(&self.session_path(id)?, &StoredRecord::Event(event.clone())).await
    }

    async fn seal(&self, id: &SessionId, outcome: &SessionOutcome) -> Result<(), LogStoreError> {
        let Some(entry) = self.open_entry(id) else {
            return Err(self.closed_error(id).await);
        };
        let mut sealed = entry.lock().await;
        if *sealed {
            return Err(LogStoreError::Sealed(id.to_string()));
        }
        Self::write_record(&self.session_path(id)?, &StoredRecord::Outcome(outcome.clone())).await?;
        *sealed = true;
        drop(sealed);

        self.open
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(id);
        Ok(())
    }

    async fn read(&self, id: &SessionId) -> Result<SessionRecord, LogStoreError> {
        let path = self.session_path(id)?;
        match Self::load(&path).await {
            Err(LogStoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(LogStoreError::NotFound(id.to_string()))
            }
            other => other,
        }
    }

    async fn list(&self, environment: &str, limit: usize) -> Result<Vec<SessionSummary>, LogStoreError> {
        let dir = self.environment_dir(environment)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(LOG_EXTENSION) {
                paths.push(path);
            }
        }
        // 时间戳文件名按字典序即时间序
        paths.sort();
        paths.reverse();

        let mut summaries = Vec::new();
        for path in paths.into_iter().take(limit) {
            match Self::load(&path).await {
                Ok(record) => summaries.push(summarize(&record)),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable session log"),
            }
        }
        Ok(summaries)
    }
}

fn parse_record(name: &str, content: &str) -> Result<SessionRecord, LogStoreError> {
    let mut meta = None;
    let mut transcript = Vec::new();
    let mut outcome = None;

    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: StoredRecord = serde_json::from_str(line).map_err(|e| {
            LogStoreError::Corrupt(name.to_string(), format!("line {}: {}", index + 1, e))
        })?;
        match record {
            StoredRecord::Header(m) => meta = Some(m),
            StoredRecord::Event(event) => transcript.push(event),
            StoredRecord::Outcome(o) => outcome = Some(o),
        }
    }

    let meta = meta.ok_or_else(|| LogStoreError::Corrupt(name.to_string(), "missing header".to_string()))?;
    Ok(SessionRecord {
        meta,
        transcript,
        outcome,
    })
}

fn summarize(record: &SessionRecord) -> SessionSummary {
    SessionSummary {
        id: record.meta.id.clone(),
        revision: record.meta.revision.clone(),
        requester: record.meta.requester.clone(),
        outcome: record.outcome.as_ref().map(|o| o.outcome),
        finished_at: record.outcome.as_ref().map(|o| o.finished_at),
    }
}

/// 内存日志存储（测试）
#[derive(Default)]
pub struct MemoryLogStore {
    sessions: tokio::sync::RwLock<HashMap<SessionId, SessionRecord>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn begin(&self, meta: &SessionMeta) -> Result<(), LogStoreError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&meta.id) {
            return Err(LogStoreError::AlreadyExists(meta.id.to_string()));
        }
        sessions.insert(
            meta.id.clone(),
            SessionRecord {
                meta: meta.clone(),
                transcript: Vec::new(),
                outcome: None,
            },
        );
        Ok(())
    }

    async fn append(&self, id: &SessionId, event: &SessionEvent) -> Result<(), LogStoreError> {
        let mut sessions = self.sessions.write().await;
        let record = sessions
            .get_mut(id)
            .ok_or_else(|| LogStoreError::NotFound(id.to_string()))?;
        if record.is_sealed() {
            return Err(LogStoreError::Sealed(id.to_string()));
        }
        record.transcript.push(event.clone());
        Ok(())
    }

    async fn seal(&self, id: &SessionId, outcome: &SessionOutcome) -> Result<(), LogStoreError> {
        let mut sessions = self.sessions.write().await;
        let record = sessions
            .get_mut(id)
            .ok_or_else(|| LogStoreError::NotFound(id.to_string()))?;
        if record.is_sealed() {
            return Err(LogStoreError::Sealed(id.to_string()));
        }
        record.outcome = Some(outcome.clone());
        Ok(())
    }

    async fn read(&self, id: &SessionId) -> Result<SessionRecord, LogStoreError> {
        let sessions = self.sessions.read().await;
        sessions
            .get(id)
            .cloned()
            .ok_or_else(|| LogStoreError::NotFound(id.to_string()))
    }

    async fn list(&self, environment: &str, limit: usize) -> Result<Vec<SessionSummary>, LogStoreError> {
        let sessions = self.sessions.read().await;
        let mut records: Vec<&SessionRecord> = sessions
            .values()
            .filter(|r| r.meta.id.environment == environment)
            .collect();
        records.sort_by(|a, b| b.meta.id.started_at.cmp(&a.meta.id.started_at));
        Ok(records.into_iter().take(limit).map(summarize).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{HostResult, OutputLine, OutputStream};
    use chrono::Utc;

    fn meta(environment: &str) -> SessionMeta {
        SessionMeta {
            id: SessionId::now(environment),
            project: "shop".to_string(),
            environment: "staging".to_string(),
            revision: "abc1234".to_string(),
            requester: "alice".to_string(),
            hosts: vec!["h1".to_string()],
        }
    }

    fn line(seq: u64, content: &str) -> SessionEvent {
        SessionEvent::Line(OutputLine {
            host: "h1".to_string(),
            seq,
            timestamp: Utc::now(),
            stream: OutputStream::Stdout,
            content: content.to_string(),
        })
    }

    fn outcome() -> SessionOutcome {
        let mut host = HostResult::pending("h1");
        host.succeed(0);
        SessionOutcome::from_results(vec![host])
    }

    async fn exercise_sealed_is_immutable(store: &dyn LogStore) {
        let meta = meta("shop-staging");
        store.begin(&meta).await.unwrap();
        store.append(&meta.id, &line(1, "pulling")).await.unwrap();
        store.append(&meta.id, &line(2, "done")).await.unwrap();
        store.seal(&meta.id, &outcome()).await.unwrap();

        assert!(matches!(
            store.append(&meta.id, &line(3, "late")).await,
            Err(LogStoreError::Sealed(_))
        ));
        assert!(matches!(
            store.seal(&meta.id, &outcome()).await,
            Err(LogStoreError::Sealed(_))
        ));

        let first = store.read(&meta.id).await.unwrap();
        let second = store.read(&meta.id).await.unwrap();
        assert_eq!(first.transcript.len(), 2);
        assert!(first.is_sealed());
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[tokio::test]
    async fn test_memory_store_sealed_is_immutable() {
        exercise_sealed_is_immutable(&MemoryLogStore::new()).await;
    }

    #[tokio::test]
    async fn test_file_store_sealed_is_immutable() {
        let dir = tempfile::tempdir().unwrap();
        exercise_sealed_is_immutable(&FileLogStore::new(dir.path())).await;
    }

    #[tokio::test]
    async fn test_file_store_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let meta = meta("shop-staging");
        {
            let store = FileLogStore::new(dir.path());
            store.begin(&meta).await.unwrap();
            store.append(&meta.id, &line(1, "pulling")).await.unwrap();
            store.seal(&meta.id, &outcome()).await.unwrap();
        }

        let reopened = FileLogStore::new(dir.path());
        let record = reopened.read(&meta.id).await.unwrap();
        assert_eq!(record.meta.revision, "abc1234");
        assert_eq!(record.transcript.len(), 1);
        assert!(matches!(
            reopened.append(&meta.id, &line(2, "late")).await,
            Err(LogStoreError::Sealed(_))
        ));
    }

    #[tokio::test]
    async fn test_file_store_list_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLogStore::new(dir.path());

        let older = meta("shop-staging");
        store.begin(&older).await.unwrap();
        store.seal(&older.id, &outcome()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let newer = meta("shop-staging");
        store.begin(&newer).await.unwrap();

        let list = store.list("shop-staging", 10).await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, newer.id);
        assert!(list[0].outcome.is_none());
        assert_eq!(list[1].id, older.id);
        assert!(list[1].outcome.is_some());

        assert!(store.list("other-env", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLogStore::new(dir.path());
        let id = SessionId::now("../etc");
        assert!(matches!(store.read(&id).await, Err(LogStoreError::NotFound(_))));
        assert!(matches!(store.list("..", 5).await, Err(LogStoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_unknown_session_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLogStore::new(dir.path());
        let id = SessionId::now("shop-staging");
        assert!(matches!(store.read(&id).await, Err(LogStoreError::NotFound(_))));
        assert!(matches!(
            store.append(&id, &line(1, "x")).await,
            Err(LogStoreError::NotFound(_))
        ));
    }
}
