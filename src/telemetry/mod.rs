//! 遥测：每次智能体试验的工具调用日志，按会话 id 一文件持久化
//!
//! 文件格式：`{id, startTime, endTime, agentId, generation, calls:[{timestamp, tool,
//! parameters, executionTime, result, errorMessage?}]}`；完成哨兵为同目录下的
//! `{id}.complete`，由外部 Agent Runner（或 end_session）写入。

pub mod store;
pub mod types;

pub use store::TelemetryStore;
pub use types::{CallOutcome, SessionDescriptor, TelemetrySession, ToolCall};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session already ended: {0}")]
    SessionEnded(String),

    #[error("Out-of-order call '{tool}' in session {session_id}")]
    OutOfOrder { session_id: String, tool: String },

    #[error("Telemetry IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Telemetry JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
