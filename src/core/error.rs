//! 进化循环错误类型
//!
//! 恢复策略：PreflightFailure 与 Cancelled 终止整个运行，
//! 其余错误只影响当前阶段（编排器记录日志后继续下一阶段）。

use thiserror::Error;

use crate::core::state::EvolutionPhase;
use crate::evolution::ledger::LedgerError;
use crate::telemetry::TelemetryError;
use crate::tools::DefinitionError;

/// 编排器层面的错误
#[derive(Error, Debug)]
pub enum EvolutionError {
    /// 预检失败（参考数据不可用、文档无法重置），致命
    #[error("Preflight failed: {0}")]
    PreflightFailure(String),

    #[error("Invalid phase transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: EvolutionPhase,
        to: EvolutionPhase,
    },

    #[error("Orchestrator not initialized: call initialize() first")]
    NotInitialized,

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("No more agents in generation {0}")]
    GenerationFull(u32),

    /// 同一时刻只允许一个试验：上一个会话尚未处理
    #[error("Trial still in progress: {0}")]
    TrialInProgress(String),

    /// 上一个已提交的改进还没有下一代分数
    #[error("Improvement still awaiting its score: {0}")]
    ImprovementPending(String),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),

    #[error("Definition error: {0}")]
    Definition(#[from] DefinitionError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// 外部协作方（Agent Runner / 比较器 / 文档环境）返回的错误
    #[error("External collaborator failed: {0}")]
    External(String),

    #[error("Cancelled")]
    Cancelled,
}

impl EvolutionError {
    /// 是否应终止整个运行（其余错误只影响当前阶段）
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EvolutionError::PreflightFailure(_)
                | EvolutionError::NotInitialized
                | EvolutionError::Cancelled
        )
    }
}
