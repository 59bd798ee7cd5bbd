use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::telemetry::TelemetryError;

/// 截断到毫秒的当前时间（与文件中的毫秒时间戳往返一致）
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallOutcome {
    Success,
    Error,
}

/// 单次工具调用记录（对应遥测文件中 calls 数组的一项）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub tool: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(rename = "executionTime", default)]
    pub execution_time_ms: u64,
    #[serde(rename = "result")]
    pub outcome: CallOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ToolCall {
    pub fn success(tool: impl Into<String>, parameters: Map<String, Value>, execution_time_ms: u64) -> Self {
        Self {
            timestamp: now_millis(),
            tool: tool.into(),
            parameters,
            execution_time_ms,
            outcome: CallOutcome::Success,
            error_message: None,
        }
    }

    pub fn error(
        tool: impl Into<String>,
        parameters: Map<String, Value>,
        execution_time_ms: u64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: now_millis(),
            tool: tool.into(),
            parameters,
            execution_time_ms,
            outcome: CallOutcome::Error,
            error_message: Some(message.into()),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn is_error(&self) -> bool {
        self.outcome == CallOutcome::Error
    }
}

/// 一次智能体试验的工具调用日志
///
/// 调用按时间戳有序、结束前只追加；交给核心后视为只读。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySession {
    pub id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub start_time: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds_option", default)]
    pub end_time: Option<DateTime<Utc>>,
    pub agent_id: String,
    pub generation: u32,
    #[serde(default)]
    pub calls: Vec<ToolCall>,
}

impl TelemetrySession {
    pub fn new(id: impl Into<String>, agent_id: impl Into<String>, generation: u32) -> Self {
        Self {
            id: id.into(),
            start_time: now_millis(),
            end_time: None,
            agent_id: agent_id.into(),
            generation,
            calls: Vec::new(),
        }
    }

    pub fn is_ended(&self) -> bool {
        self.end_time.is_some()
    }

    /// 追加调用：已结束的会话拒绝写入，时间戳不得早于上一条
    pub fn push_call(&mut self, call: ToolCall) -> Result<(), TelemetryError> {
        if self.is_ended() {
            return Err(TelemetryError::SessionEnded(self.id.clone()));
        }
        if let Some(last) = self.calls.last() {
            if call.timestamp < last.timestamp {
                return Err(TelemetryError::OutOfOrder {
                    session_id: self.id.clone(),
                    tool: call.tool,
                });
            }
        }
        self.calls.push(call);
        Ok(())
    }

    pub fn end(&mut self) {
        if self.end_time.is_none() {
            self.end_time = Some(now_millis());
        }
    }

    pub fn error_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.calls.iter().filter(|c| c.is_error())
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds().max(0))
    }
}

/// 传给外部 Agent Runner 的会话标识（显式传参，不经由进程环境变量）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub session_id: String,
    pub agent_id: String,
    pub generation: u32,
    pub telemetry_dir: PathBuf,
}
