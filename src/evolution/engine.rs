//! 进化引擎：运行时配置与收敛判定
//!
//! 每代结束时记录平均分与最高分。收敛条件：
//! - 最高分达到 target_score，或
//! - 连续 plateau_generations 代的平均分相对历史最佳平均分提升不超过 improvement_threshold

use serde::{Deserialize, Serialize};

use crate::config::EvolutionSection;
use crate::evolution::analyzer::MinerConfig;
use crate::evolution::types::ConvergenceState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvolutionConfig {
    pub max_generations: u32,
    pub agents_per_generation: usize,
    pub target_score: f64,
    pub improvement_threshold: f64,
    pub plateau_generations: u32,
    pub min_frequency: usize,
    pub confidence_threshold: f64,
    pub min_deviation_percent: f64,
    pub completion_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub comparison_tolerance: f64,
    pub regression_tolerance: f64,
    pub expected_tools: Vec<String>,
}

impl From<EvolutionSection> for EvolutionConfig {
    fn from(section: EvolutionSection) -> Self {
        Self {
            max_generations: section.max_generations,
            agents_per_generation: section.agents_per_generation,
            target_score: section.target_score,
            improvement_threshold: section.improvement_threshold,
            plateau_generations: section.plateau_generations,
            min_frequency: section.min_frequency,
            confidence_threshold: section.confidence_threshold,
            min_deviation_percent: section.min_deviation_percent,
            completion_timeout_secs: section.completion_timeout_secs,
            poll_interval_ms: section.poll_interval_ms,
            comparison_tolerance: section.comparison_tolerance,
            regression_tolerance: section.regression_tolerance,
            expected_tools: section.expected_tools,
        }
    }
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        EvolutionSection::default().into()
    }
}

impl EvolutionConfig {
    pub fn miner_config(&self) -> MinerConfig {
        MinerConfig {
            min_frequency: self.min_frequency.max(1),
            confidence_threshold: self.confidence_threshold.clamp(0.0, 1.0),
            min_deviation_percent: self.min_deviation_percent,
            expected_tools: self.expected_tools.clone(),
        }
    }
}

/// 收敛检查的结论
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceVerdict {
    Continue,
    TargetReached,
    Plateau,
    MaxGenerations,
}

impl ConvergenceVerdict {
    pub fn is_stop(&self) -> bool {
        !matches!(self, ConvergenceVerdict::Continue)
    }
}

pub struct EvolutionEngine {
    config: EvolutionConfig,
    averages: Vec<f64>,
    state: ConvergenceState,
}

impl EvolutionEngine {
    pub fn new(config: EvolutionConfig) -> Self {
        Self {
            config,
            averages: Vec::new(),
            state: ConvergenceState::default(),
        }
    }

    /// 从已保存的每代分数重建
    pub fn restore(config: EvolutionConfig, history: &[(f64, f64)]) -> Self {
        let mut engine = Self::new(config);
        for (average, best) in history {
            engine.record_generation(*average, *best);
        }
        engine
    }

    pub fn config(&self) -> &EvolutionConfig {
        &self.config
    }

    pub fn state(&self) -> &ConvergenceState {
        &self.state
    }

    pub fn can_continue(&self, generation: u32) -> bool {
        generation < self.config.max_generations
    }

    pub fn record_generation(&mut self, average: f64, best: f64) -> &ConvergenceState {
        let best_average_so_far = self.averages.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        if !self.averages.is_empty() {
            if average - best_average_so_far <= self.config.improvement_threshold {
                self.state.plateau_generations += 1;
            } else {
                self.state.plateau_generations = 0;
            }
        }
        self.averages.push(average);
        self.state.best_score = self.state.best_score.max(best);

        if self.averages.len() > 1 {
            let first = self.averages[0];
            let last = average;
            self.state.average_improvement_per_generation =
                (last - first) / (self.averages.len() - 1) as f64;
        }

        self.state.has_converged = self.state.best_score >= self.config.target_score
            || self.state.plateau_generations >= self.config.plateau_generations;
        &self.state
    }

    /// 收敛优先于代数上限
    pub fn verdict(&self, generation: u32) -> ConvergenceVerdict {
        if self.state.best_score >= self.config.target_score {
            ConvergenceVerdict::TargetReached
        } else if self.state.plateau_generations >= self.config.plateau_generations {
            ConvergenceVerdict::Plateau
        } else if !self.can_continue(generation) {
            ConvergenceVerdict::MaxGenerations
        } else {
            ConvergenceVerdict::Continue
        }
    }
}
