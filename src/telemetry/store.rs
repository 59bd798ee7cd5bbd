//! 遥测存储：每个会话一个 JSON 文件，每次调用都直接落盘（无纯内存模式）
//!
//! 写入先写临时文件再 rename，轮询方不会读到半截 JSON。

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::telemetry::{SessionDescriptor, TelemetryError, TelemetrySession, ToolCall};

const SESSION_EXT: &str = "json";
const SENTINEL_EXT: &str = "complete";

pub struct TelemetryStore {
    dir: PathBuf,
    poll_interval: Duration,
    /// 同进程内的 load-modify-save 串行化
    write_lock: Mutex<()>,
}

impl TelemetryStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            poll_interval: Duration::from_millis(1000),
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn session_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", session_id, SESSION_EXT))
    }

    pub fn sentinel_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", session_id, SENTINEL_EXT))
    }

    /// 构造传给 Agent Runner 的会话描述
    pub fn descriptor(&self, session: &TelemetrySession) -> SessionDescriptor {
        SessionDescriptor {
            session_id: session.id.clone(),
            agent_id: session.agent_id.clone(),
            generation: session.generation,
            telemetry_dir: self.dir.clone(),
        }
    }

    /// 新建会话并立即落盘，返回会话 id
    pub async fn start_session(&self, agent_id: &str, generation: u32) -> Result<String, TelemetryError> {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("session_{}_{}", Utc::now().timestamp_millis(), &uuid[..8]);
        let session = TelemetrySession::new(&id, agent_id, generation);
        self.save(&session).await?;
        tracing::debug!(session_id = %id, agent_id, generation, "telemetry session started");
        Ok(id)
    }

    pub async fn record_call(&self, session_id: &str, call: ToolCall) -> Result<(), TelemetryError> {
        let _guard = self.write_lock.lock().await;
        let mut session = self.load(session_id).await?;
        session.push_call(call)?;
        self.save(&session).await
    }

    /// 结束会话：写入 endTime 并写完成哨兵
    pub async fn end_session(&self, session_id: &str) -> Result<TelemetrySession, TelemetryError> {
        let _guard = self.write_lock.lock().await;
        let mut session = self.load(session_id).await?;
        session.end();
        self.save(&session).await?;
        fs::write(self.sentinel_path(session_id), session.end_time.map(|t| t.to_rfc3339()).unwrap_or_default())
            .await?;
        tracing::debug!(session_id, calls = session.calls.len(), "telemetry session ended");
        Ok(session)
    }

    pub async fn is_complete(&self, session_id: &str) -> bool {
        fs::try_exists(self.sentinel_path(session_id))
            .await
            .unwrap_or(false)
    }

    /// 轮询完成哨兵；超时或被取消返回 false（不报错），调用方自行降级
    pub async fn wait_for_completion(
        &self,
        session_id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> bool {
        let poll = async {
            loop {
                if self.is_complete(session_id).await {
                    return true;
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(session_id, "completion wait cancelled");
                false
            }
            result = tokio::time::timeout(timeout, poll) => match result {
                Ok(done) => done,
                Err(_) => {
                    tracing::warn!(session_id, timeout_secs = timeout.as_secs(), "completion wait timed out");
                    false
                }
            }
        }
    }

    /// 读取会话；文件不存在返回 None
    pub async fn read_session(&self, session_id: &str) -> Result<Option<TelemetrySession>, TelemetryError> {
        match self.load(session_id).await {
            Ok(session) => Ok(Some(session)),
            Err(TelemetryError::SessionNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn save(&self, session: &TelemetrySession) -> Result<(), TelemetryError> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.session_path(&session.id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(session)?).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub async fn load(&self, session_id: &str) -> Result<TelemetrySession, TelemetryError> {
        let path = self.session_path(session_id);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TelemetryError::SessionNotFound(session_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&data)?)
    }

    /// 列出已持久化的会话，可按代过滤；无法解析的文件跳过并记录
    pub async fn list_sessions(&self, generation: Option<u32>) -> Result<Vec<TelemetrySession>, TelemetryError> {
        let mut sessions = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(sessions),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SESSION_EXT) {
                continue;
            }
            let data = fs::read(&path).await?;
            match serde_json::from_slice::<TelemetrySession>(&data) {
                Ok(session) if generation.map_or(true, |g| session.generation == g) => sessions.push(session),
                Ok(_) => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable telemetry file"),
            }
        }
        sessions.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));
        Ok(sessions)
    }
}
