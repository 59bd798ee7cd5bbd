//! 进化循环编排器：独占循环状态，驱动阶段状态机
//!
//! 可以逐步调用（initialize → start_generation → get_next_agent_prompt / process_agent_completion
//! → analyze_generation → suggest_improvements → apply_improvement → next_generation），
//! 也可以用 run() 一次跑完。试验严格串行：上一个会话处理完之前不会开始下一个。
//!
//! 错误只影响所在阶段：git 失败只记日志，持久化失败只记日志并继续；
//! 只有预检失败和取消会终止整个运行。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Map;
use tokio_util::sync::CancellationToken;

use crate::core::{EvolutionError, EvolutionPhase};
use crate::evolution::analyzer::PatternMiner;
use crate::evolution::engine::{ConvergenceVerdict, EvolutionConfig, EvolutionEngine};
use crate::evolution::executor::ImprovementApplier;
use crate::evolution::ledger::{ImprovementLedger, LedgerStatistics, Outcome};
use crate::evolution::monitor::{EvolutionMonitor, FinalSummary, GenerationSummary};
use crate::evolution::planner::ImprovementProposer;
use crate::evolution::regression::RegressionValidator;
use crate::evolution::runner::{AgentPrompt, AgentRunner, DocumentEnvironment, LayoutComparator, TestCase};
use crate::evolution::types::{
    ConvergenceState, GenerationResult, Improvement, Pattern, TestRun,
};
use crate::evolution::version_control::{CommitMetadata, VersionControl};
use crate::telemetry::{TelemetrySession, TelemetryStore, ToolCall};
use crate::tools::{DefinitionRepository, ToolDefinition, ToolDefinitionStore};

/// 超时推断时代表“智能体无任何可观测效果”的调用名
pub const AGENT_FAILURE_TOOL: &str = "agent_failure_detected";
/// 超时推断时代表“文档有变化但没有遥测”的调用名
pub const INFERRED_ACTIVITY_TOOL: &str = "inferred_document_activity";

/// 编排器依赖的组件
pub struct LoopComponents {
    pub telemetry: Arc<TelemetryStore>,
    pub definitions: DefinitionRepository,
    pub ledger: ImprovementLedger,
    pub validator: RegressionValidator,
    pub environment: Arc<dyn DocumentEnvironment>,
    pub comparator: Arc<dyn LayoutComparator>,
    /// run() 需要；逐步调用时由外部自行启动智能体
    pub runner: Option<Arc<dyn AgentRunner>>,
    pub version_control: Option<Arc<dyn VersionControl>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCompletion {
    pub score: f64,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationAnalysis {
    pub patterns: Vec<Pattern>,
    pub report: String,
    pub scores: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum ApplyOutcome {
    /// 通过回归验证；commit 为 None 表示未启用或提交失败
    Accepted { commit: Option<String> },
    Reverted { errors: Vec<String> },
    Rejected { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "generation", rename_all = "camelCase")]
pub enum NextGeneration {
    Started(u32),
    Converged,
    MaxGenerationsReached,
}

/// 已提交、等待下一代分数确认的改进
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingImprovement {
    pub improvement: Improvement,
    pub before_score: f64,
    pub before_definition: ToolDefinition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub phase: EvolutionPhase,
    pub generation: u32,
    pub max_generations: u32,
    pub current_agent_index: usize,
    pub agent_count: usize,
    pub convergence: ConvergenceState,
    pub statistics: LedgerStatistics,
    pub generations: Vec<GenerationSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_improvement: Option<String>,
}

/// 断点续跑快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub phase: EvolutionPhase,
    pub generation: u32,
    pub current_agent_index: usize,
    pub agent_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_case: Option<TestCase>,
    pub runs: Vec<TestRun>,
    #[serde(default)]
    pub patterns: Vec<Pattern>,
    pub improvements: Vec<Improvement>,
    pub config: EvolutionConfig,
    #[serde(default)]
    pub generations: Vec<GenerationSummary>,
    #[serde(default)]
    pub active_sessions: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingImprovement>,
    #[serde(default)]
    pub best_tagged_score: f64,
}

pub struct EvolutionLoop {
    config: EvolutionConfig,
    phase: EvolutionPhase,
    test_case: Option<TestCase>,
    agent_count: usize,
    generation: u32,
    current_agent_index: usize,
    /// 本代已完成的试验
    runs: Vec<TestRun>,
    /// session_id → agent_id，尚未处理完成的试验
    active_sessions: BTreeMap<String, String>,
    patterns: Vec<Pattern>,
    current_result: Option<GenerationResult>,
    improvements: Vec<Improvement>,
    pending: Option<PendingImprovement>,
    best_tagged_score: f64,

    telemetry: Arc<TelemetryStore>,
    repository: DefinitionRepository,
    definitions: ToolDefinitionStore,
    miner: PatternMiner,
    proposer: ImprovementProposer,
    applier: ImprovementApplier,
    validator: RegressionValidator,
    ledger: ImprovementLedger,
    engine: EvolutionEngine,
    monitor: EvolutionMonitor,
    environment: Arc<dyn DocumentEnvironment>,
    comparator: Arc<dyn LayoutComparator>,
    runner: Option<Arc<dyn AgentRunner>>,
    version_control: Option<Arc<dyn VersionControl>>,

    cancel: CancellationToken,
    progress_file: Option<PathBuf>,
    report_file: Option<PathBuf>,
}

impl EvolutionLoop {
    /// 加载工具定义；定义文件为空时从回归桥接的注册表生成
    pub async fn new(config: EvolutionConfig, components: LoopComponents) -> Result<Self, EvolutionError> {
        let mut definitions = components.definitions.load().await?;
        if definitions.is_empty() {
            definitions = ToolDefinitionStore::from_registry(components.validator.bridge().as_ref());
            if !definitions.is_empty() {
                components.definitions.save(&definitions).await?;
                tracing::info!(
                    tools = definitions.len(),
                    path = %components.definitions.path().display(),
                    "tool definitions seeded from registry"
                );
            }
        }

        Ok(Self {
            miner: PatternMiner::new(config.miner_config()),
            engine: EvolutionEngine::new(config.clone()),
            config,
            phase: EvolutionPhase::Idle,
            test_case: None,
            agent_count: 0,
            generation: 0,
            current_agent_index: 0,
            runs: Vec::new(),
            active_sessions: BTreeMap::new(),
            patterns: Vec::new(),
            current_result: None,
            improvements: Vec::new(),
            pending: None,
            best_tagged_score: 0.0,
            telemetry: components.telemetry,
            repository: components.definitions,
            definitions,
            proposer: ImprovementProposer::new(),
            applier: ImprovementApplier::new(),
            validator: components.validator,
            ledger: components.ledger,
            monitor: EvolutionMonitor::new(),
            environment: components.environment,
            comparator: components.comparator,
            runner: components.runner,
            version_control: components.version_control,
            cancel: CancellationToken::new(),
            progress_file: None,
            report_file: None,
        })
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_progress_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.progress_file = Some(path.into());
        self
    }

    pub fn with_report_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.report_file = Some(path.into());
        self
    }

    pub fn phase(&self) -> EvolutionPhase {
        self.phase
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn config(&self) -> &EvolutionConfig {
        &self.config
    }

    pub fn definitions(&self) -> &ToolDefinitionStore {
        &self.definitions
    }

    pub fn ledger(&self) -> &ImprovementLedger {
        &self.ledger
    }

    pub fn monitor(&self) -> &EvolutionMonitor {
        &self.monitor
    }

    pub fn runs(&self) -> &[TestRun] {
        &self.runs
    }

    pub fn pending_improvement(&self) -> Option<&PendingImprovement> {
        self.pending.as_ref()
    }

    fn transition(&mut self, next: EvolutionPhase) -> Result<(), EvolutionError> {
        if !self.phase.can_transition_to(next) {
            return Err(EvolutionError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        tracing::debug!(from = %self.phase, to = %next, generation = self.generation, "phase transition");
        self.phase = next;
        Ok(())
    }

    fn require_phase(&self, expected: EvolutionPhase) -> Result<(), EvolutionError> {
        if self.test_case.is_none() {
            return Err(EvolutionError::NotInitialized);
        }
        if self.phase != expected {
            return Err(EvolutionError::InvalidTransition {
                from: self.phase,
                to: expected,
            });
        }
        Ok(())
    }

    fn test_case(&self) -> Result<&TestCase, EvolutionError> {
        self.test_case.as_ref().ok_or(EvolutionError::NotInitialized)
    }

    /// 当前代已有分数时的平均分
    fn current_average(&self) -> f64 {
        self.current_result
            .as_ref()
            .map(|r| r.average_score)
            .unwrap_or(0.0)
    }

    pub async fn initialize(&mut self, test_case: TestCase, agent_count: usize) -> Result<(), EvolutionError> {
        if self.phase != EvolutionPhase::Idle {
            return Err(EvolutionError::InvalidTransition {
                from: self.phase,
                to: EvolutionPhase::Idle,
            });
        }
        for tool in &test_case.expected_tools {
            if !self.config.expected_tools.contains(tool) {
                self.config.expected_tools.push(tool.clone());
            }
        }
        self.miner = PatternMiner::new(self.config.miner_config());
        self.agent_count = agent_count.max(1);
        self.generation = 0;
        self.current_agent_index = 0;
        tracing::info!(
            test_case = %test_case.name,
            agents = self.agent_count,
            max_generations = self.config.max_generations,
            "evolution initialized"
        );
        self.test_case = Some(test_case);

        if let Some(vc) = &self.version_control {
            if let Err(e) = vc.create_backup_branch().await {
                tracing::warn!(error = %e, "backup branch not created");
            }
        }
        Ok(())
    }

    /// 预检并开始一代。第一次调用从 Idle 进入第 1 代。
    pub async fn start_generation(&mut self) -> Result<u32, EvolutionError> {
        self.test_case()?;
        match self.phase {
            EvolutionPhase::Idle => {
                self.transition(EvolutionPhase::PreparingGeneration)?;
                self.generation = 1;
            }
            EvolutionPhase::PreparingGeneration => {}
            other => {
                return Err(EvolutionError::InvalidTransition {
                    from: other,
                    to: EvolutionPhase::PreparingGeneration,
                })
            }
        }

        self.preflight().await?;

        if let Some(vc) = &self.version_control {
            if let Err(e) = vc.create_improvement_branch(self.generation).await {
                tracing::warn!(generation = self.generation, error = %e, "improvement branch not created");
            }
        }

        self.runs.clear();
        self.active_sessions.clear();
        self.patterns.clear();
        self.current_result = None;
        self.current_agent_index = 0;
        self.monitor.generation_started(self.generation, self.agent_count);
        self.transition(EvolutionPhase::RunningAgents)?;
        Ok(self.generation)
    }

    async fn preflight(&self) -> Result<(), EvolutionError> {
        let test_case = self.test_case()?;
        self.environment
            .check_reset_capability()
            .await
            .map_err(|e| EvolutionError::PreflightFailure(format!("document reset unavailable: {}", e)))?;
        self.environment
            .check_reference(test_case)
            .await
            .map_err(|e| EvolutionError::PreflightFailure(format!("reference data unavailable: {}", e)))?;
        Ok(())
    }

    /// 重置文档并为下一个智能体开启会话
    pub async fn get_next_agent_prompt(&mut self) -> Result<AgentPrompt, EvolutionError> {
        self.require_phase(EvolutionPhase::RunningAgents)?;
        if let Some(session_id) = self.active_sessions.keys().next() {
            return Err(EvolutionError::TrialInProgress(session_id.clone()));
        }
        if self.current_agent_index >= self.agent_count {
            return Err(EvolutionError::GenerationFull(self.generation));
        }

        self.current_agent_index += 1;
        let agent_id = format!("gen{}-agent{}", self.generation, self.current_agent_index);
        self.environment
            .reset_document()
            .await
            .map_err(|e| EvolutionError::External(format!("document reset failed for {}: {}", agent_id, e)))?;

        let session_id = self.telemetry.start_session(&agent_id, self.generation).await?;
        self.active_sessions.insert(session_id.clone(), agent_id.clone());

        let prompt = AgentPrompt {
            session_id,
            agent_id,
            generation: self.generation,
            telemetry_dir: self.telemetry.dir().to_path_buf(),
            prompt: self.test_case()?.description.clone(),
        };
        tracing::info!(
            generation = self.generation,
            session_id = %prompt.session_id,
            agent_id = %prompt.agent_id,
            "agent trial prepared"
        );
        Ok(prompt)
    }

    /// 等待试验完成并评分；超时则根据文档状态推断会话
    pub async fn process_agent_completion(&mut self, session_id: &str) -> Result<AgentCompletion, EvolutionError> {
        self.require_phase(EvolutionPhase::RunningAgents)?;
        let agent_id = self
            .active_sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| EvolutionError::UnknownSession(session_id.to_string()))?;

        let started = Instant::now();
        let timeout = Duration::from_secs(self.config.completion_timeout_secs);
        let completed = self
            .telemetry
            .wait_for_completion(session_id, timeout, &self.cancel)
            .await;
        if self.cancel.is_cancelled() {
            return Err(EvolutionError::Cancelled);
        }

        let (session, synthesized) = if completed {
            (self.telemetry.load(session_id).await?, false)
        } else {
            (self.synthesize_session(session_id, &agent_id).await?, true)
        };

        let metrics = match self.environment.extract_metrics().await {
            Ok(metrics) => Some(metrics),
            Err(e) => {
                tracing::warn!(session_id, error = %e, "metric extraction failed");
                None
            }
        };
        let comparison = match &metrics {
            Some(metrics) => {
                let reference = &self.test_case()?.reference_metrics;
                match self
                    .comparator
                    .compare(metrics, reference, self.config.comparison_tolerance)
                    .await
                {
                    Ok(result) => Some(result),
                    Err(e) => {
                        tracing::warn!(session_id, error = %e, "layout comparison failed");
                        None
                    }
                }
            }
            None => None,
        };

        let duration_ms = session
            .duration_ms()
            .map(|ms| ms as u64)
            .unwrap_or_else(|| started.elapsed().as_millis() as u64);
        let run = TestRun {
            agent_id: agent_id.clone(),
            success: synthesized || comparison.is_some(),
            session,
            metrics,
            comparison,
            duration_ms,
            generation: self.generation,
            synthesized,
        };
        let score = run.score();
        let summary = format!(
            "{}: score {:.1} ({} calls, {} errors){}",
            agent_id,
            score,
            run.session.calls.len(),
            run.session.error_calls().count(),
            if synthesized { " [inferred from document state]" } else { "" }
        );
        tracing::info!(generation = self.generation, session_id, score, synthesized, "agent trial complete");

        self.runs.push(run);
        self.active_sessions.remove(session_id);
        Ok(AgentCompletion { score, summary })
    }

    /// 完成等待超时：根据文档是否变化推断一条调用。结果是近似值，不是真实遥测。
    async fn synthesize_session(&self, session_id: &str, agent_id: &str) -> Result<TelemetrySession, EvolutionError> {
        let mut session = self
            .telemetry
            .read_session(session_id)
            .await?
            .unwrap_or_else(|| TelemetrySession::new(session_id, agent_id, self.generation));
        if session.is_ended() {
            return Ok(session);
        }

        let observation = match self.environment.observe_state().await {
            Ok(obs) => obs,
            Err(e) => {
                tracing::warn!(session_id, error = %e, "document state unobservable, assuming no change");
                Default::default()
            }
        };
        let mut params = Map::new();
        params.insert("objectCount".to_string(), observation.object_count.into());
        params.insert("inferred".to_string(), true.into());
        let call = if observation.changed {
            ToolCall::success(INFERRED_ACTIVITY_TOOL, params, 0)
        } else {
            ToolCall::error(
                AGENT_FAILURE_TOOL,
                params,
                0,
                "no telemetry and no document change before timeout",
            )
        };
        if let Err(e) = session.push_call(call) {
            tracing::warn!(session_id, error = %e, "inferred call not recorded");
        }
        session.end();
        self.telemetry.save(&session).await?;
        tracing::warn!(
            session_id,
            changed = observation.changed,
            "session synthesized from document state"
        );
        Ok(session)
    }

    /// 挖掘模式、汇总分数，并用本代平均分结算上一代的改进
    pub async fn analyze_generation(&mut self) -> Result<GenerationAnalysis, EvolutionError> {
        self.require_phase(EvolutionPhase::RunningAgents)?;
        if let Some(session_id) = self.active_sessions.keys().next() {
            return Err(EvolutionError::TrialInProgress(session_id.clone()));
        }
        if self.runs.len() < self.agent_count {
            tracing::warn!(
                generation = self.generation,
                completed = self.runs.len(),
                expected = self.agent_count,
                "analyzing an incomplete generation"
            );
        }
        self.transition(EvolutionPhase::Analyzing)?;

        let patterns = self.miner.mine(&self.runs);
        let result = GenerationResult::from_runs(self.generation, self.runs.clone(), patterns.clone());
        self.monitor.generation_completed(&result);
        self.monitor.patterns_found(self.generation, &patterns);

        if self.runs.iter().any(|r| r.comparison.is_some()) {
            self.settle_pending(result.average_score).await;
        } else if self.pending.is_some() {
            tracing::warn!(
                generation = self.generation,
                runs = self.runs.len(),
                "no scored runs, pending improvement left unsettled"
            );
        }

        self.engine.record_generation(result.average_score, result.best_score);

        let scores = result.scores();
        self.patterns = patterns.clone();
        self.current_result = Some(result);

        if patterns.is_empty() {
            self.transition(EvolutionPhase::CheckingConvergence)?;
        }
        Ok(GenerationAnalysis {
            patterns,
            report: self.monitor.progress_report(),
            scores,
        })
    }

    /// 上一代提交的改进：分数下降超过容差则回滚
    async fn settle_pending(&mut self, after_score: f64) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let outcome = if after_score < pending.before_score - self.config.regression_tolerance {
            tracing::warn!(
                tool = %pending.improvement.tool,
                before = pending.before_score,
                after = after_score,
                "score regressed after improvement, rolling back"
            );
            if pending.commit.is_some() {
                if let Some(vc) = &self.version_control {
                    if let Err(e) = vc.revert_last_commit().await {
                        tracing::warn!(error = %e, "revert of regressed improvement failed");
                    }
                }
            }
            self.restore_definition(pending.before_definition.clone()).await;
            Outcome::reverted(
                pending.before_score,
                after_score,
                format!(
                    "average score dropped from {:.1} to {:.1}",
                    pending.before_score, after_score
                ),
            )
        } else {
            Outcome::success(pending.before_score, after_score)
        };
        self.record(&pending.improvement, outcome).await;
    }

    /// 运行终止时仍在等待分数的改进：已提交且未被否定，记为未验证的成功
    async fn settle_unverified(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        tracing::info!(
            tool = %pending.improvement.tool,
            generation = self.generation,
            "run ended before the improvement could be scored"
        );
        let outcome = Outcome::unverified(
            pending.before_score,
            "not verified: no later generation was scored",
        );
        self.record(&pending.improvement, outcome).await;
    }

    async fn restore_definition(&mut self, definition: ToolDefinition) {
        self.definitions.insert(definition);
        if let Err(e) = self.repository.save(&self.definitions).await {
            tracing::error!(error = %e, "restored tool definitions could not be persisted");
        }
    }

    async fn record(&mut self, improvement: &Improvement, outcome: Outcome) {
        match self.ledger.record_result(improvement, outcome).await {
            Ok(result) => self.monitor.improvement_result(&result),
            Err(e) => tracing::error!(id = %improvement.id, error = %e, "improvement history not persisted"),
        }
    }

    /// 候选改进（已排除尝试过的与不合法的）
    pub async fn suggest_improvements(&mut self) -> Result<Vec<Improvement>, EvolutionError> {
        self.require_phase(EvolutionPhase::Analyzing)?;
        self.transition(EvolutionPhase::ProposingImprovement)?;

        // 上一个改进还没有分数，或本代没有可作基线的分数
        let scored = self.runs.iter().any(|r| r.comparison.is_some());
        if self.pending.is_some() || !scored {
            tracing::info!(
                generation = self.generation,
                pending = self.pending.is_some(),
                scored,
                "no improvement this generation"
            );
            self.transition(EvolutionPhase::CheckingConvergence)?;
            return Ok(Vec::new());
        }

        let candidates: Vec<Improvement> = self
            .proposer
            .propose(&self.patterns, &self.definitions, self.generation)
            .into_iter()
            .filter(|imp| {
                if self.ledger.has_been_tried(imp) {
                    tracing::debug!(tool = %imp.tool, kind = %imp.kind, "skipping improvement already tried");
                    return false;
                }
                let report = self.ledger.validate_improvement(imp);
                if !report.valid {
                    tracing::debug!(tool = %imp.tool, issues = ?report.issues, "skipping invalid improvement");
                }
                report.valid
            })
            .collect();

        tracing::info!(generation = self.generation, candidates = candidates.len(), "improvements proposed");
        if candidates.is_empty() {
            self.transition(EvolutionPhase::CheckingConvergence)?;
        }
        Ok(candidates)
    }

    /// 应用、验证并提交（或丢弃）一个改进。每代最多一次。
    pub async fn apply_improvement(&mut self, improvement: &Improvement) -> Result<ApplyOutcome, EvolutionError> {
        self.require_phase(EvolutionPhase::ProposingImprovement)?;
        if let Some(pending) = &self.pending {
            return Err(EvolutionError::ImprovementPending(pending.improvement.id.clone()));
        }
        let before_score = self.current_average();

        let report = self.ledger.validate_improvement(improvement);
        if !report.valid {
            let reason = report.issues.join("; ");
            return self.reject(improvement, before_score, reason).await;
        }

        let modified = match self.applier.apply(improvement, &self.definitions) {
            Ok(modified) => modified,
            Err(e) => return self.reject(improvement, before_score, e.to_string()).await,
        };

        self.transition(EvolutionPhase::Validating)?;
        self.definitions.insert(modified.after.clone());
        if let Err(e) = self.repository.save(&self.definitions).await {
            self.definitions.insert(modified.before.clone());
            let reason = format!("tool definitions could not be persisted: {}", e);
            tracing::error!(tool = %improvement.tool, error = %e, "definition persistence failed");
            self.record(improvement, Outcome::failed(before_score, reason.clone())).await;
            self.transition(EvolutionPhase::Reverting)?;
            self.transition(EvolutionPhase::CheckingConvergence)?;
            return Ok(ApplyOutcome::Rejected { reason });
        }
        self.improvements.push(improvement.clone());
        self.monitor.improvement_applied(improvement);

        let regression = self.validator.test_improvement(improvement).await;
        if !regression.safe {
            self.transition(EvolutionPhase::Reverting)?;
            self.restore_definition(modified.before).await;
            let reason = format!("regression checks failed: {}", regression.errors.join("; "));
            self.record(improvement, Outcome::reverted(before_score, before_score, reason))
                .await;
            self.transition(EvolutionPhase::CheckingConvergence)?;
            return Ok(ApplyOutcome::Reverted {
                errors: regression.errors,
            });
        }

        self.transition(EvolutionPhase::Committing)?;
        let commit = self.commit(improvement, before_score).await;
        self.pending = Some(PendingImprovement {
            improvement: improvement.clone(),
            before_score,
            before_definition: modified.before,
            commit: commit.clone(),
        });
        self.transition(EvolutionPhase::CheckingConvergence)?;
        Ok(ApplyOutcome::Accepted { commit })
    }

    async fn reject(
        &mut self,
        improvement: &Improvement,
        before_score: f64,
        reason: String,
    ) -> Result<ApplyOutcome, EvolutionError> {
        tracing::warn!(tool = %improvement.tool, reason = %reason, "improvement rejected");
        self.record(improvement, Outcome::failed(before_score, reason.clone())).await;
        self.transition(EvolutionPhase::CheckingConvergence)?;
        Ok(ApplyOutcome::Rejected { reason })
    }

    /// git 失败只影响本代的提交
    async fn commit(&mut self, improvement: &Improvement, before_score: f64) -> Option<String> {
        let vc = self.version_control.clone()?;
        let metadata = CommitMetadata {
            generation: self.generation,
            before_score,
            actual_impact: None,
        };
        let commit = match vc.commit_improvement(improvement, &metadata).await {
            Ok(hash) => Some(hash),
            Err(e) => {
                tracing::warn!(generation = self.generation, error = %e, "commit failed, continuing without commit");
                None
            }
        };

        let best = self.current_result.as_ref().map(|r| r.best_score).unwrap_or(0.0);
        if commit.is_some() && best > self.best_tagged_score {
            match vc.tag_generation(self.generation, best).await {
                Ok(_) => self.best_tagged_score = best,
                Err(e) => tracing::warn!(generation = self.generation, error = %e, "generation tag failed"),
            }
        }
        commit
    }

    /// 检查收敛；未收敛则开始下一代
    pub async fn next_generation(&mut self) -> Result<NextGeneration, EvolutionError> {
        self.test_case()?;
        if matches!(
            self.phase,
            EvolutionPhase::Analyzing | EvolutionPhase::ProposingImprovement
        ) {
            self.transition(EvolutionPhase::CheckingConvergence)?;
        }
        self.require_phase(EvolutionPhase::CheckingConvergence)?;

        self.monitor.convergence(self.engine.state());
        match self.engine.verdict(self.generation) {
            ConvergenceVerdict::TargetReached | ConvergenceVerdict::Plateau => {
                self.settle_unverified().await;
                self.transition(EvolutionPhase::Converged)?;
                tracing::info!(generation = self.generation, best = self.engine.state().best_score, "evolution converged");
                Ok(NextGeneration::Converged)
            }
            ConvergenceVerdict::MaxGenerations => {
                self.settle_unverified().await;
                self.transition(EvolutionPhase::MaxGenerationsReached)?;
                tracing::info!(generation = self.generation, "maximum generations reached");
                Ok(NextGeneration::MaxGenerationsReached)
            }
            ConvergenceVerdict::Continue => {
                self.transition(EvolutionPhase::PreparingGeneration)?;
                self.generation += 1;
                let generation = self.start_generation().await?;
                Ok(NextGeneration::Started(generation))
            }
        }
    }

    pub fn get_progress(&self) -> Progress {
        Progress {
            phase: self.phase,
            generation: self.generation,
            max_generations: self.config.max_generations,
            current_agent_index: self.current_agent_index,
            agent_count: self.agent_count,
            convergence: self.engine.state().clone(),
            statistics: self.ledger.get_statistics(),
            generations: self.monitor.generations().to_vec(),
            pending_improvement: self.pending.as_ref().map(|p| p.improvement.id.clone()),
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            phase: self.phase,
            generation: self.generation,
            current_agent_index: self.current_agent_index,
            agent_count: self.agent_count,
            test_case: self.test_case.clone(),
            runs: self.runs.clone(),
            patterns: self.patterns.clone(),
            improvements: self.improvements.clone(),
            config: self.config.clone(),
            generations: self.monitor.generations().to_vec(),
            active_sessions: self.active_sessions.clone(),
            pending: self.pending.clone(),
            best_tagged_score: self.best_tagged_score,
        }
    }

    pub async fn save_progress(&self, path: &Path) -> Result<(), EvolutionError> {
        let json = serde_json::to_string_pretty(&self.snapshot())?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        tracing::debug!(path = %path.display(), generation = self.generation, "progress saved");
        Ok(())
    }

    /// 恢复快照；收敛状态由每代分数重建
    pub async fn load_progress(&mut self, path: &Path) -> Result<(), EvolutionError> {
        let content = tokio::fs::read_to_string(path).await?;
        let snapshot: ProgressSnapshot = serde_json::from_str(&content)?;

        let history: Vec<(f64, f64)> = snapshot
            .generations
            .iter()
            .map(|g| (g.average_score, g.best_score))
            .collect();
        self.engine = EvolutionEngine::restore(snapshot.config.clone(), &history);
        self.miner = PatternMiner::new(snapshot.config.miner_config());
        self.config = snapshot.config;
        self.phase = snapshot.phase;
        self.generation = snapshot.generation;
        self.current_agent_index = snapshot.current_agent_index;
        self.agent_count = snapshot.agent_count;
        self.test_case = snapshot.test_case;
        self.runs = snapshot.runs;
        self.patterns = snapshot.patterns;
        self.improvements = snapshot.improvements;
        self.active_sessions = snapshot.active_sessions;
        self.pending = snapshot.pending;
        self.best_tagged_score = snapshot.best_tagged_score;
        self.monitor = EvolutionMonitor::with_history(snapshot.generations.clone(), self.improvements.len());
        self.current_result = snapshot
            .generations
            .iter()
            .any(|g| g.generation == self.generation)
            .then(|| GenerationResult::from_runs(self.generation, self.runs.clone(), self.patterns.clone()));
        tracing::info!(
            path = %path.display(),
            generation = self.generation,
            phase = %self.phase,
            "progress restored"
        );
        Ok(())
    }

    async fn checkpoint(&self) {
        if let Some(path) = &self.progress_file {
            if let Err(e) = self.save_progress(path).await {
                tracing::warn!(path = %path.display(), error = %e, "progress not saved");
            }
        }
    }

    fn ensure_not_cancelled(&self) -> Result<(), EvolutionError> {
        if self.cancel.is_cancelled() {
            Err(EvolutionError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// 跑完整个循环直到收敛、代数上限、致命错误或取消
    pub async fn run(&mut self) -> Result<FinalSummary, EvolutionError> {
        let runner = self
            .runner
            .clone()
            .ok_or_else(|| EvolutionError::External("no agent runner configured".to_string()))?;
        self.test_case()?;

        if self.phase == EvolutionPhase::Idle {
            self.start_generation().await?;
        }

        let result = self.drive(runner.as_ref()).await;
        self.checkpoint().await;
        result?;

        let converged = self.phase == EvolutionPhase::Converged;
        let summary = self
            .monitor
            .final_summary(&self.ledger.get_statistics(), converged);
        tracing::info!(
            start = summary.start_score,
            final_score = summary.final_score,
            generations = summary.generations,
            "evolution finished"
        );
        if let Some(path) = &self.report_file {
            if let Err(e) = self.monitor.save_report(path, Some(&summary)).await {
                tracing::warn!(path = %path.display(), error = %e, "report not saved");
            }
        }
        Ok(summary)
    }

    async fn drive(&mut self, runner: &dyn AgentRunner) -> Result<(), EvolutionError> {
        while !self.phase.is_terminal() {
            self.ensure_not_cancelled()?;
            match self.phase {
                EvolutionPhase::RunningAgents => {
                    if self.current_agent_index < self.agent_count || !self.active_sessions.is_empty() {
                        self.run_one_trial(runner).await?;
                    } else {
                        self.analyze_generation().await?;
                    }
                }
                EvolutionPhase::Analyzing => {
                    let candidates = self.suggest_improvements().await?;
                    if let Some(first) = candidates.first() {
                        let outcome = self.apply_improvement(first).await?;
                        tracing::info!(generation = self.generation, outcome = ?outcome, "improvement processed");
                    }
                }
                EvolutionPhase::CheckingConvergence => {
                    self.checkpoint().await;
                    self.next_generation().await?;
                }
                EvolutionPhase::PreparingGeneration => {
                    self.start_generation().await?;
                }
                other => {
                    return Err(EvolutionError::InvalidTransition {
                        from: other,
                        to: EvolutionPhase::CheckingConvergence,
                    })
                }
            }
        }
        Ok(())
    }

    async fn run_one_trial(&mut self, runner: &dyn AgentRunner) -> Result<(), EvolutionError> {
        let session_id = match self.active_sessions.keys().next() {
            // 恢复的快照里仍未处理的会话
            Some(session_id) => session_id.clone(),
            None => {
                let prompt = match self.get_next_agent_prompt().await {
                    Ok(prompt) => prompt,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        tracing::warn!(generation = self.generation, error = %e, "trial skipped");
                        return Ok(());
                    }
                };
                if let Err(e) = runner.launch(&prompt).await {
                    tracing::warn!(session_id = %prompt.session_id, error = %e, "agent runner failed to launch");
                }
                prompt.session_id
            }
        };

        match self.process_agent_completion(&session_id).await {
            Ok(completion) => {
                tracing::info!(generation = self.generation, "{}", completion.summary);
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "trial could not be scored");
                self.active_sessions.remove(&session_id);
                Ok(())
            }
        }
    }
}
