use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::telemetry::TelemetrySession;

/// 单项布局偏差（外部比较器给出）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deviation {
    #[serde(rename = "type")]
    pub kind: String,
    pub field: String,
    pub expected: Value,
    pub actual: Value,
    pub deviation_percent: f64,
}

impl Deviation {
    /// 偏差方向：over / under；无法按数值比较时为 mismatch
    pub fn direction(&self) -> &'static str {
        match (as_number(&self.expected), as_number(&self.actual)) {
            (Some(e), Some(a)) if a > e => "over",
            (Some(e), Some(a)) if a < e => "under",
            (Some(_), Some(_)) => "match",
            _ if self.deviation_percent > 0.0 => "over",
            _ if self.deviation_percent < 0.0 => "under",
            _ => "mismatch",
        }
    }
}

pub(crate) fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches("pt").trim().parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonResult {
    #[serde(rename = "match")]
    pub is_match: bool,
    /// 0–100
    pub score: f64,
    #[serde(default)]
    pub deviations: Vec<Deviation>,
}

/// 一次试验的完整记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRun {
    pub agent_id: String,
    pub session: TelemetrySession,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparison: Option<ComparisonResult>,
    pub duration_ms: u64,
    pub success: bool,
    pub generation: u32,
    /// 会话由文档状态推断（完成等待超时），不是真实遥测
    #[serde(default)]
    pub synthesized: bool,
}

impl TestRun {
    pub fn score(&self) -> f64 {
        self.comparison.as_ref().map(|c| c.score).unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatternType {
    ToolSequence,
    ParameterChoice,
    ErrorPattern,
    VisualDeviation,
    MissingTool,
    RedundantCall,
}

impl PatternType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::ToolSequence => "tool-sequence",
            PatternType::ParameterChoice => "parameter-choice",
            PatternType::ErrorPattern => "error-pattern",
            PatternType::VisualDeviation => "visual-deviation",
            PatternType::MissingTool => "missing-tool",
            PatternType::RedundantCall => "redundant-call",
        }
    }
}

impl std::fmt::Display for PatternType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternExample {
    pub agent_id: String,
    pub evidence: String,
}

/// 跨试验反复出现的行为或偏差
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pattern {
    #[serde(rename = "type")]
    pub kind: PatternType,
    /// 表现出该特征的不同智能体数量
    pub frequency: usize,
    pub description: String,
    pub examples: Vec<PatternExample>,
    pub confidence: f64,
    pub severity: Severity,
    /// 涉及的工具（偏差类模式可能没有）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    /// 参数名 / 偏差字段 / 序列中的后继工具
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// 最常见的取值 / 偏差方向 / 错误信息
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl Pattern {
    pub fn significance(&self) -> f64 {
        self.confidence * self.frequency as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImprovementType {
    Description,
    Parameter,
    Example,
    Constraint,
}

impl std::fmt::Display for ImprovementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImprovementType::Description => write!(f, "description"),
            ImprovementType::Parameter => write!(f, "parameter"),
            ImprovementType::Example => write!(f, "example"),
            ImprovementType::Constraint => write!(f, "constraint"),
        }
    }
}

/// 针对某个工具定义的结构化修改提案
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Improvement {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ImprovementType,
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub current: String,
    pub proposed: String,
    pub rationale: String,
    /// 0–1
    pub expected_impact: f64,
    pub generation: u32,
}

impl Improvement {
    /// 去重键 (tool, type, field)
    pub fn same_target(&self, other: &Improvement) -> bool {
        self.tool == other.tool && self.kind == other.kind && self.field == other.field
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImprovementResult {
    pub improvement: Improvement,
    pub before_score: f64,
    pub after_score: f64,
    pub success: bool,
    pub reverted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ImprovementResult {
    pub fn impact(&self) -> f64 {
        self.after_score - self.before_score
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResult {
    pub generation: u32,
    pub runs: Vec<TestRun>,
    pub patterns: Vec<Pattern>,
    pub average_score: f64,
    pub best_score: f64,
    pub worst_score: f64,
}

impl GenerationResult {
    pub fn from_runs(generation: u32, runs: Vec<TestRun>, patterns: Vec<Pattern>) -> Self {
        let scores: Vec<f64> = runs.iter().map(|r| r.score()).collect();
        let (average_score, best_score, worst_score) = if scores.is_empty() {
            (0.0, 0.0, 0.0)
        } else {
            (
                scores.iter().sum::<f64>() / scores.len() as f64,
                scores.iter().cloned().fold(f64::MIN, f64::max),
                scores.iter().cloned().fold(f64::MAX, f64::min),
            )
        };
        Self {
            generation,
            runs,
            patterns,
            average_score,
            best_score,
            worst_score,
        }
    }

    pub fn scores(&self) -> Vec<f64> {
        self.runs.iter().map(|r| r.score()).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvergenceState {
    pub has_converged: bool,
    pub plateau_generations: u32,
    pub best_score: f64,
    pub average_improvement_per_generation: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(score: f64) -> TestRun {
        TestRun {
            agent_id: "a".into(),
            session: TelemetrySession::new("s", "a", 1),
            metrics: None,
            comparison: Some(ComparisonResult {
                is_match: false,
                score,
                deviations: vec![],
            }),
            duration_ms: 0,
            success: true,
            generation: 1,
            synthesized: false,
        }
    }

    #[test]
    fn test_generation_scores() {
        let result = GenerationResult::from_runs(1, vec![run(62.0), run(65.0), run(68.0)], vec![]);
        assert_eq!(result.average_score, 65.0);
        assert_eq!(result.best_score, 68.0);
        assert_eq!(result.worst_score, 62.0);
    }

    #[test]
    fn test_empty_generation() {
        let result = GenerationResult::from_runs(3, vec![], vec![]);
        assert_eq!(result.average_score, 0.0);
        assert_eq!(result.best_score, 0.0);
    }

    #[test]
    fn test_deviation_direction() {
        let dev = Deviation {
            kind: "size".into(),
            field: "fontSize".into(),
            expected: serde_json::json!(12),
            actual: serde_json::json!("15pt"),
            deviation_percent: 25.0,
        };
        assert_eq!(dev.direction(), "over");

        let dev = Deviation {
            expected: serde_json::json!("Helvetica"),
            actual: serde_json::json!("Arial"),
            deviation_percent: 0.0,
            ..dev
        };
        assert_eq!(dev.direction(), "mismatch");
    }

    #[test]
    fn test_pattern_type_serde_names() {
        let json = serde_json::to_string(&PatternType::VisualDeviation).unwrap();
        assert_eq!(json, "\"visual-deviation\"");
        assert!(PatternType::ErrorPattern.as_str() < PatternType::VisualDeviation.as_str());
    }
}
