//! 自我改进循环：试验 → 挖掘模式 → 提出并应用改进 → 回归验证 → 提交或丢弃 → 检查收敛

pub mod analyzer;
pub mod engine;
pub mod executor;
pub mod ledger;
pub mod loop_;
pub mod monitor;
pub mod planner;
pub mod regression;
pub mod runner;
pub mod types;
pub mod version_control;

pub use analyzer::{MinerConfig, PatternMiner};
pub use engine::{ConvergenceVerdict, EvolutionConfig, EvolutionEngine};
pub use executor::{ApplyError, ImprovementApplier, ModifiedDefinition};
pub use ledger::{ImprovementLedger, ImprovementParams, LedgerError, LedgerStatistics, Outcome, ValidationReport};
pub use loop_::{
    AgentCompletion, ApplyOutcome, EvolutionLoop, GenerationAnalysis, LoopComponents, NextGeneration, Progress,
    ProgressSnapshot,
};
pub use monitor::{EvolutionMonitor, FinalSummary, GenerationSummary};
pub use planner::ImprovementProposer;
pub use regression::{default_checks, RegressionCheck, RegressionReport, RegressionValidator, ScriptedCheck};
pub use runner::{
    AgentPrompt, AgentRunner, CommandAgentRunner, CommandComparator, CommandEnvironment, DocumentEnvironment,
    DocumentObservation, LayoutComparator, TestCase,
};
pub use types::{
    ComparisonResult, ConvergenceState, Deviation, GenerationResult, Improvement, ImprovementResult,
    ImprovementType, Pattern, PatternType, Severity, TestRun,
};
pub use version_control::{CommitMetadata, GitError, GitTracker, VersionControl};
