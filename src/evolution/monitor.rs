//! 进化监控：日志、进度报告与最终总结
//!
//! 只读取核心状态的快照并保存自己的归档，从不修改循环状态。

use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::evolution::ledger::LedgerStatistics;
use crate::evolution::types::{
    ConvergenceState, GenerationResult, Improvement, ImprovementResult, Pattern,
};

const CHART_WIDTH: usize = 40;

/// 每代归档的摘要（运行明细可丢弃）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationSummary {
    pub generation: u32,
    pub average_score: f64,
    pub best_score: f64,
    pub worst_score: f64,
    pub runs: usize,
    pub patterns: usize,
}

impl From<&GenerationResult> for GenerationSummary {
    fn from(result: &GenerationResult) -> Self {
        Self {
            generation: result.generation,
            average_score: result.average_score,
            best_score: result.best_score,
            worst_score: result.worst_score,
            runs: result.runs.len(),
            patterns: result.patterns.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalSummary {
    pub start_score: f64,
    pub final_score: f64,
    pub generations: usize,
    pub improvements_applied: usize,
    pub improvements_successful: usize,
    pub improvements_reverted: usize,
    pub duration_secs: u64,
    pub converged: bool,
}

impl FinalSummary {
    pub fn total_gain(&self) -> f64 {
        self.final_score - self.start_score
    }
}

impl std::fmt::Display for FinalSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Evolution summary ===")?;
        writeln!(f, "Start score:   {:.1}", self.start_score)?;
        writeln!(
            f,
            "Final score:   {:.1} ({:+.1})",
            self.final_score,
            self.total_gain()
        )?;
        writeln!(f, "Generations:   {}", self.generations)?;
        writeln!(
            f,
            "Improvements:  {} applied, {} successful, {} reverted",
            self.improvements_applied, self.improvements_successful, self.improvements_reverted
        )?;
        writeln!(f, "Duration:      {}s", self.duration_secs)?;
        write!(
            f,
            "Outcome:       {}",
            if self.converged { "converged" } else { "stopped" }
        )
    }
}

pub struct EvolutionMonitor {
    started: Instant,
    generations: Vec<GenerationSummary>,
    applied: usize,
}

impl EvolutionMonitor {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            generations: Vec::new(),
            applied: 0,
        }
    }

    /// 从快照恢复已归档的代与已应用的改进数（计时从恢复时刻重新开始）
    pub fn with_history(generations: Vec<GenerationSummary>, applied: usize) -> Self {
        Self {
            generations,
            applied,
            ..Self::new()
        }
    }

    pub fn generations(&self) -> &[GenerationSummary] {
        &self.generations
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn generation_started(&self, generation: u32, agents: usize) {
        tracing::info!(generation, agents, "generation started");
    }

    /// 同一代重复上报时覆盖旧归档
    pub fn generation_completed(&mut self, result: &GenerationResult) {
        tracing::info!(
            generation = result.generation,
            average = result.average_score,
            best = result.best_score,
            worst = result.worst_score,
            runs = result.runs.len(),
            "generation complete"
        );
        let summary = GenerationSummary::from(result);
        match self
            .generations
            .iter_mut()
            .find(|g| g.generation == result.generation)
        {
            Some(existing) => *existing = summary,
            None => self.generations.push(summary),
        }
    }

    pub fn patterns_found(&self, generation: u32, patterns: &[Pattern]) {
        if patterns.is_empty() {
            tracing::info!(generation, "no significant patterns");
            return;
        }
        tracing::info!(generation, count = patterns.len(), "patterns found");
        for pattern in patterns {
            tracing::info!(
                generation,
                kind = %pattern.kind,
                frequency = pattern.frequency,
                confidence = pattern.confidence,
                severity = %pattern.severity,
                "{}",
                pattern.description
            );
        }
    }

    pub fn improvement_applied(&mut self, improvement: &Improvement) {
        self.applied += 1;
        tracing::info!(
            id = %improvement.id,
            kind = %improvement.kind,
            tool = %improvement.tool,
            field = ?improvement.field,
            expected_impact = improvement.expected_impact,
            "improvement applied"
        );
    }

    pub fn improvement_result(&self, result: &ImprovementResult) {
        if result.success {
            tracing::info!(
                tool = %result.improvement.tool,
                before = result.before_score,
                after = result.after_score,
                impact = result.impact(),
                "improvement succeeded"
            );
        } else {
            tracing::warn!(
                tool = %result.improvement.tool,
                reverted = result.reverted,
                error = ?result.error,
                "improvement did not succeed"
            );
        }
    }

    pub fn convergence(&self, state: &ConvergenceState) {
        tracing::info!(
            converged = state.has_converged,
            plateau = state.plateau_generations,
            best = state.best_score,
            avg_gain = state.average_improvement_per_generation,
            "convergence checked"
        );
    }

    /// 每代平均分的文本柱状图
    pub fn progress_report(&self) -> String {
        let mut out = String::from("Score per generation (average, best)\n");
        if self.generations.is_empty() {
            out.push_str("  (no generations yet)\n");
            return out;
        }
        for g in &self.generations {
            let filled = ((g.average_score.clamp(0.0, 100.0) / 100.0) * CHART_WIDTH as f64).round() as usize;
            out.push_str(&format!(
                "Gen {:>3} |{}{}| {:>5.1} (best {:.1})\n",
                g.generation,
                "#".repeat(filled),
                ".".repeat(CHART_WIDTH - filled),
                g.average_score,
                g.best_score
            ));
        }
        out
    }

    pub fn final_summary(&self, statistics: &LedgerStatistics, converged: bool) -> FinalSummary {
        let start_score = self.generations.first().map(|g| g.average_score).unwrap_or(0.0);
        let final_score = self
            .generations
            .last()
            .map(|g| g.average_score)
            .unwrap_or(start_score);
        FinalSummary {
            start_score,
            final_score,
            generations: self.generations.len(),
            improvements_applied: self.applied,
            improvements_successful: statistics.successful,
            improvements_reverted: statistics.reverted,
            duration_secs: self.started.elapsed().as_secs(),
            converged,
        }
    }

    pub async fn save_report(&self, path: &Path, summary: Option<&FinalSummary>) -> std::io::Result<()> {
        let mut text = self.progress_report();
        if let Some(summary) = summary {
            text.push('\n');
            text.push_str(&summary.to_string());
            text.push('\n');
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, text).await
    }
}

impl Default for EvolutionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn result(generation: u32, avg: f64) -> GenerationResult {
        GenerationResult {
            generation,
            runs: vec![],
            patterns: vec![],
            average_score: avg,
            best_score: avg + 3.0,
            worst_score: avg - 3.0,
        }
    }

    #[test]
    fn test_progress_report_chart() {
        let mut monitor = EvolutionMonitor::new();
        assert!(monitor.progress_report().contains("no generations"));
        monitor.generation_completed(&result(1, 50.0));
        monitor.generation_completed(&result(2, 100.0));
        let report = monitor.progress_report();
        let lines: Vec<&str> = report.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].contains(&format!("{}{}", "#".repeat(20), ".".repeat(20))));
        assert!(lines[2].contains(&"#".repeat(40)));
        assert!(lines[2].contains("best 103.0"));
    }

    #[test]
    fn test_regenerated_generation_overwrites() {
        let mut monitor = EvolutionMonitor::new();
        monitor.generation_completed(&result(1, 50.0));
        monitor.generation_completed(&result(1, 55.0));
        assert_eq!(monitor.generations().len(), 1);
        assert_eq!(monitor.generations()[0].average_score, 55.0);
    }

    #[tokio::test]
    async fn test_final_summary_and_report_file() {
        let mut monitor = EvolutionMonitor::new();
        monitor.generation_completed(&result(1, 65.0));
        monitor.generation_completed(&result(2, 72.0));
        monitor.improvement_applied(&Improvement {
            id: "i".into(),
            kind: crate::evolution::types::ImprovementType::Description,
            tool: "t".into(),
            field: None,
            current: "a".into(),
            proposed: "b".into(),
            rationale: "r".into(),
            expected_impact: 0.5,
            generation: 1,
        });
        let stats = LedgerStatistics {
            total: 1,
            successful: 1,
            average_impact: 7.0,
            ..Default::default()
        };
        let summary = monitor.final_summary(&stats, false);
        assert_eq!(summary.start_score, 65.0);
        assert_eq!(summary.final_score, 72.0);
        assert_eq!(summary.total_gain(), 7.0);
        assert_eq!(summary.improvements_applied, 1);
        assert_eq!(summary.improvements_successful, 1);

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reports").join("report.txt");
        monitor.save_report(&path, Some(&summary)).await.unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("Gen   2"));
        assert!(text.contains("Final score:   72.0 (+7.0)"));
    }
}
