//! 改进台账：记录每次尝试过的改进及其结果，持久化到历史文件
//!
//! 文件格式：`{timestamp, improvements, results, statistics}`。
//! 写入顺序是先更新内存再落盘，落盘失败只影响持久化，不影响本次运行的统计。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::evolution::planner::new_improvement_id;
use crate::evolution::types::{Improvement, ImprovementResult, ImprovementType};

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Ledger I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ledger JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// 创建改进所需的字段（id 与代数之外）
#[derive(Debug, Clone, PartialEq)]
pub struct ImprovementParams {
    pub kind: ImprovementType,
    pub tool: String,
    pub field: Option<String>,
    pub current: String,
    pub proposed: String,
    pub rationale: String,
    pub expected_impact: f64,
    pub generation: u32,
}

/// 一次尝试的结果
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub before_score: f64,
    pub after_score: f64,
    pub success: bool,
    pub reverted: bool,
    pub error: Option<String>,
}

impl Outcome {
    pub fn success(before_score: f64, after_score: f64) -> Self {
        Self {
            before_score,
            after_score,
            success: true,
            reverted: false,
            error: None,
        }
    }

    pub fn reverted(before_score: f64, after_score: f64, reason: impl Into<String>) -> Self {
        Self {
            before_score,
            after_score,
            success: false,
            reverted: true,
            error: Some(reason.into()),
        }
    }

    /// 运行结束时仍未被下一代打分的改进：视为成功，影响记为 0
    pub fn unverified(before_score: f64, note: impl Into<String>) -> Self {
        Self {
            before_score,
            after_score: before_score,
            success: true,
            reverted: false,
            error: Some(note.into()),
        }
    }

    pub fn failed(before_score: f64, reason: impl Into<String>) -> Self {
        Self {
            before_score,
            after_score: before_score,
            success: false,
            reverted: false,
            error: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub valid: bool,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerStatistics {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub reverted: usize,
    /// 只统计成功且未回滚的结果
    pub average_impact: f64,
    #[serde(default)]
    pub by_type: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryDocument {
    timestamp: DateTime<Utc>,
    improvements: Vec<Improvement>,
    results: Vec<ImprovementResult>,
    statistics: LedgerStatistics,
}

pub struct ImprovementLedger {
    path: Option<PathBuf>,
    improvements: Vec<Improvement>,
    results: Vec<ImprovementResult>,
}

impl ImprovementLedger {
    /// 仅内存（测试与 dry run 用）
    pub fn in_memory() -> Self {
        Self {
            path: None,
            improvements: Vec::new(),
            results: Vec::new(),
        }
    }

    /// 打开历史文件；不存在时从空台账开始
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        let mut ledger = Self {
            path: Some(path.clone()),
            improvements: Vec::new(),
            results: Vec::new(),
        };
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let doc: HistoryDocument = serde_json::from_str(&content)?;
                ledger.improvements = doc.improvements;
                ledger.results = doc.results;
                tracing::info!(
                    path = %path.display(),
                    results = ledger.results.len(),
                    "improvement history loaded"
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(ledger)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn improvements(&self) -> &[Improvement] {
        &self.improvements
    }

    pub fn results(&self) -> &[ImprovementResult] {
        &self.results
    }

    pub fn create_improvement(&mut self, params: ImprovementParams) -> Improvement {
        let improvement = Improvement {
            id: new_improvement_id(),
            kind: params.kind,
            tool: params.tool,
            field: params.field,
            current: params.current,
            proposed: params.proposed,
            rationale: params.rationale,
            expected_impact: params.expected_impact,
            generation: params.generation,
        };
        self.improvements.push(improvement.clone());
        improvement
    }

    /// 纯函数：同样的输入总是得到同样的结果
    pub fn validate_improvement(&self, improvement: &Improvement) -> ValidationReport {
        let mut issues = Vec::new();
        if improvement.tool.trim().is_empty() {
            issues.push("tool is required".to_string());
        }
        if improvement.proposed.trim().is_empty() {
            issues.push("proposed text is empty".to_string());
        }
        if improvement.proposed == improvement.current {
            issues.push("proposed text is identical to the current text".to_string());
        }
        if !(0.0..=1.0).contains(&improvement.expected_impact) {
            issues.push(format!(
                "expected impact {} is outside [0, 1]",
                improvement.expected_impact
            ));
        }
        if improvement.kind == ImprovementType::Parameter
            && improvement.field.as_deref().map_or(true, |f| f.trim().is_empty())
        {
            issues.push("parameter improvement requires a field".to_string());
        }
        if improvement.kind == ImprovementType::Example && !has_annotation(&improvement.proposed) {
            issues.push("example should carry an explanatory annotation (// or Note:)".to_string());
        }
        ValidationReport {
            valid: issues.is_empty(),
            issues,
        }
    }

    /// 记录结果并落盘。内存状态总是先更新。
    pub async fn record_result(
        &mut self,
        improvement: &Improvement,
        outcome: Outcome,
    ) -> Result<ImprovementResult, LedgerError> {
        if !self.improvements.iter().any(|i| i.id == improvement.id) {
            self.improvements.push(improvement.clone());
        }
        let result = ImprovementResult {
            improvement: improvement.clone(),
            before_score: outcome.before_score,
            after_score: outcome.after_score,
            success: outcome.success,
            reverted: outcome.reverted,
            error: outcome.error,
        };
        self.results.push(result.clone());
        tracing::info!(
            id = %improvement.id,
            tool = %improvement.tool,
            success = result.success,
            reverted = result.reverted,
            impact = result.impact(),
            "improvement result recorded"
        );
        self.save().await?;
        Ok(result)
    }

    pub fn get_statistics(&self) -> LedgerStatistics {
        let mut stats = LedgerStatistics {
            total: self.results.len(),
            ..Default::default()
        };
        let mut impact_sum = 0.0;
        for result in &self.results {
            if result.reverted {
                stats.reverted += 1;
            } else if result.success {
                stats.successful += 1;
                impact_sum += result.impact();
            } else {
                stats.failed += 1;
            }
            *stats
                .by_type
                .entry(result.improvement.kind.to_string())
                .or_insert(0) += 1;
        }
        if stats.successful > 0 {
            stats.average_impact = impact_sum / stats.successful as f64;
        }
        stats
    }

    /// 历史结果中是否存在完全相同的 (tool, type, field, proposed)
    pub fn has_been_tried(&self, improvement: &Improvement) -> bool {
        self.results.iter().any(|r| {
            r.improvement.same_target(improvement) && r.improvement.proposed == improvement.proposed
        })
    }

    /// 同一目标 (tool, type, field) 的历史结果
    pub fn find_similar_improvements(&self, improvement: &Improvement) -> Vec<&ImprovementResult> {
        self.results
            .iter()
            .filter(|r| r.improvement.same_target(improvement))
            .collect()
    }

    pub async fn save(&self) -> Result<(), LedgerError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let doc = HistoryDocument {
            timestamp: Utc::now(),
            improvements: self.improvements.clone(),
            results: self.results.clone(),
            statistics: self.get_statistics(),
        };
        let json = serde_json::to_string_pretty(&doc)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

fn has_annotation(text: &str) -> bool {
    text.contains("//") || text.to_lowercase().contains("note:")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn params(kind: ImprovementType, proposed: &str) -> ImprovementParams {
        ImprovementParams {
            kind,
            tool: "create_paragraph_style".into(),
            field: None,
            current: "Create a paragraph style".into(),
            proposed: proposed.into(),
            rationale: "fontSize deviates".into(),
            expected_impact: 0.6,
            generation: 1,
        }
    }

    #[test]
    fn test_validate_rules() {
        let mut ledger = ImprovementLedger::in_memory();
        let ok = ledger.create_improvement(params(ImprovementType::Description, "Measure fontSize"));
        assert!(ledger.validate_improvement(&ok).valid);

        let mut bad = ok.clone();
        bad.tool = String::new();
        bad.proposed = bad.current.clone();
        bad.expected_impact = 1.5;
        let report = ledger.validate_improvement(&bad);
        assert!(!report.valid);
        assert_eq!(report.issues.len(), 3);

        let param = ledger.create_improvement(params(ImprovementType::Parameter, "Use 12"));
        assert!(!ledger.validate_improvement(&param).valid);

        let example = ledger.create_improvement(params(ImprovementType::Example, "create_paragraph_style({})"));
        assert!(!ledger.validate_improvement(&example).valid);
        let example = ledger.create_improvement(params(
            ImprovementType::Example,
            "create_paragraph_style({}) // Note: call once per style",
        ));
        assert!(ledger.validate_improvement(&example).valid);
    }

    #[test]
    fn test_validate_is_idempotent() {
        let mut ledger = ImprovementLedger::in_memory();
        let imp = ledger.create_improvement(params(ImprovementType::Parameter, ""));
        let first = ledger.validate_improvement(&imp);
        let second = ledger.validate_improvement(&imp);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_statistics_counts_and_average_impact() {
        let mut ledger = ImprovementLedger::in_memory();
        let a = ledger.create_improvement(params(ImprovementType::Description, "a"));
        let b = ledger.create_improvement(params(ImprovementType::Description, "b"));
        let c = ledger.create_improvement(params(ImprovementType::Description, "c"));
        let d = ledger.create_improvement(params(ImprovementType::Description, "d"));

        ledger.record_result(&a, Outcome::success(65.0, 72.0)).await.unwrap();
        ledger.record_result(&b, Outcome::success(72.0, 75.0)).await.unwrap();
        ledger
            .record_result(&c, Outcome::reverted(75.0, 60.0, "regression"))
            .await
            .unwrap();
        ledger.record_result(&d, Outcome::failed(75.0, "FieldNotFound")).await.unwrap();

        let stats = ledger.get_statistics();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.successful + stats.failed + stats.reverted, stats.total);
        assert_eq!(stats.successful, 2);
        assert_eq!(stats.reverted, 1);
        assert_eq!(stats.failed, 1);
        assert!((stats.average_impact - 5.0).abs() < 1e-9);
        assert_eq!(stats.by_type.get("description"), Some(&4));
    }

    #[tokio::test]
    async fn test_has_been_tried_exact_match_only() {
        let mut ledger = ImprovementLedger::in_memory();
        let tried = ledger.create_improvement(params(ImprovementType::Description, "Measure fontSize"));
        assert!(!ledger.has_been_tried(&tried));
        ledger
            .record_result(&tried, Outcome::reverted(60.0, 55.0, "worse"))
            .await
            .unwrap();
        assert!(ledger.has_been_tried(&tried));

        let mut other = tried.clone();
        other.id = "other".into();
        assert!(ledger.has_been_tried(&other));
        other.proposed = "Something else".into();
        assert!(!ledger.has_been_tried(&other));
        assert_eq!(ledger.find_similar_improvements(&other).len(), 1);
        other.field = Some("fontSize".into());
        assert!(ledger.find_similar_improvements(&other).is_empty());
    }

    #[tokio::test]
    async fn test_history_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history").join("improvements.json");

        let mut ledger = ImprovementLedger::open(&path).await.unwrap();
        let imp = ledger.create_improvement(params(ImprovementType::Description, "x"));
        ledger.record_result(&imp, Outcome::success(60.0, 64.0)).await.unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(raw.get("timestamp").is_some());
        assert_eq!(raw["statistics"]["successful"], 1);
        assert_eq!(raw["results"][0]["beforeScore"], 60.0);

        let reopened = ImprovementLedger::open(&path).await.unwrap();
        assert_eq!(reopened.results().len(), 1);
        assert_eq!(reopened.improvements().len(), 1);
        assert!(reopened.has_been_tried(&imp));
    }
}
