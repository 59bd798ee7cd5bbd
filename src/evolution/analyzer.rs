//! 模式挖掘：汇总一代试验的遥测与比较结果，找出跨智能体反复出现的问题
//!
//! 频次始终是「表现出该特征的不同智能体数」，不是原始出现次数。
//! 置信度 = 频次 / 试验数，证据取值不一致时按一致性系数下调。

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::evolution::types::{Pattern, PatternExample, PatternType, Severity, TestRun};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinerConfig {
    pub min_frequency: usize,
    pub confidence_threshold: f64,
    /// 偏差百分比（绝对值）超过该值才算显著
    pub min_deviation_percent: f64,
    /// 任务预期会用到的工具；从未被调用即产生 missing-tool
    pub expected_tools: Vec<String>,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            min_frequency: 2,
            confidence_threshold: 0.6,
            min_deviation_percent: 10.0,
            expected_tools: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Signature {
    kind: PatternType,
    tool: Option<String>,
    subject: Option<String>,
    value: Option<String>,
}

#[derive(Debug, Clone)]
enum Sample {
    Numeric(f64),
    Text(String),
}

impl Sample {
    fn from_value(value: &Value) -> Self {
        match value {
            Value::Number(n) => n.as_f64().map(Sample::Numeric).unwrap_or_else(|| Sample::Text(n.to_string())),
            Value::String(s) => Sample::Text(s.clone()),
            other => Sample::Text(other.to_string()),
        }
    }
}

#[derive(Debug, Default)]
struct Observation {
    agents: BTreeSet<String>,
    examples: Vec<PatternExample>,
    samples: Vec<Sample>,
}

#[derive(Default)]
struct Observations {
    by_signature: BTreeMap<Signature, Observation>,
}

impl Observations {
    fn observe(&mut self, signature: Signature, agent_id: &str, evidence: String, sample: Option<Sample>) {
        let obs = self.by_signature.entry(signature).or_default();
        // 每个智能体只保留第一条证据
        if obs.agents.insert(agent_id.to_string()) {
            obs.examples.push(PatternExample {
                agent_id: agent_id.to_string(),
                evidence,
            });
        }
        if let Some(sample) = sample {
            obs.samples.push(sample);
        }
    }
}

pub struct PatternMiner {
    config: MinerConfig,
}

impl PatternMiner {
    pub fn new(config: MinerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MinerConfig {
        &self.config
    }

    /// 分析一代的全部试验；空输入返回空列表
    pub fn mine(&self, runs: &[TestRun]) -> Vec<Pattern> {
        if runs.is_empty() {
            return Vec::new();
        }

        let mut observations = Observations::default();
        for run in runs {
            self.scan_deviations(run, &mut observations);
            // 推断出的会话不是真实遥测，不参与调用类特征
            if run.synthesized {
                continue;
            }
            self.scan_parameter_choices(run, &mut observations);
            self.scan_errors(run, &mut observations);
            self.scan_missing_tools(run, &mut observations);
            self.scan_sequences(run, &mut observations);
        }

        let total_runs = runs.len();
        let mut patterns: Vec<Pattern> = observations
            .by_signature
            .into_iter()
            .filter_map(|(signature, obs)| self.build_pattern(signature, obs, total_runs))
            .collect();

        patterns.sort_by(|a, b| {
            b.significance()
                .total_cmp(&a.significance())
                .then_with(|| a.kind.as_str().cmp(b.kind.as_str()))
                .then_with(|| a.description.cmp(&b.description))
        });

        tracing::debug!(runs = total_runs, patterns = patterns.len(), "pattern mining finished");
        patterns
    }

    fn significant_deviations<'a>(&self, run: &'a TestRun) -> impl Iterator<Item = &'a crate::evolution::types::Deviation> + 'a {
        let threshold = self.config.min_deviation_percent;
        run.comparison
            .iter()
            .flat_map(|c| c.deviations.iter())
            .filter(move |d| d.deviation_percent.abs() > threshold)
    }

    fn scan_deviations(&self, run: &TestRun, obs: &mut Observations) {
        for dev in self.significant_deviations(run) {
            let direction = dev.direction();
            obs.observe(
                Signature {
                    kind: PatternType::VisualDeviation,
                    tool: None,
                    subject: Some(dev.field.clone()),
                    value: Some(direction.to_string()),
                },
                &run.agent_id,
                format!(
                    "{}: expected {}, actual {} ({:+.1}%)",
                    dev.field, dev.expected, dev.actual, dev.deviation_percent
                ),
                // 方向已在签名里，幅度不同不算不一致
                None,
            );
        }
    }

    /// 只关注名称与本次试验显著偏差字段相同的参数
    fn scan_parameter_choices(&self, run: &TestRun, obs: &mut Observations) {
        let deviating: Vec<String> = self
            .significant_deviations(run)
            .map(|d| d.field.to_lowercase())
            .collect();
        if deviating.is_empty() {
            return;
        }

        for call in run.session.calls.iter().filter(|c| !c.is_error()) {
            for (param, value) in &call.parameters {
                if !deviating.contains(&param.to_lowercase()) {
                    continue;
                }
                obs.observe(
                    Signature {
                        kind: PatternType::ParameterChoice,
                        tool: Some(call.tool.clone()),
                        subject: Some(param.clone()),
                        value: None,
                    },
                    &run.agent_id,
                    format!("{}.{} = {}", call.tool, param, value),
                    Some(Sample::from_value(value)),
                );
            }
        }
    }

    fn scan_errors(&self, run: &TestRun, obs: &mut Observations) {
        for call in run.session.error_calls() {
            let message = call.error_message.as_deref().unwrap_or("unknown error");
            obs.observe(
                Signature {
                    kind: PatternType::ErrorPattern,
                    tool: Some(call.tool.clone()),
                    subject: None,
                    value: Some(normalize_error(message)),
                },
                &run.agent_id,
                format!("{} failed: {}", call.tool, message.trim()),
                None,
            );
        }
    }

    fn scan_missing_tools(&self, run: &TestRun, obs: &mut Observations) {
        for expected in &self.config.expected_tools {
            if run.session.calls.iter().any(|c| &c.tool == expected) {
                continue;
            }
            obs.observe(
                Signature {
                    kind: PatternType::MissingTool,
                    tool: Some(expected.clone()),
                    subject: None,
                    value: None,
                },
                &run.agent_id,
                format!("no call to {} among {} calls", expected, run.session.calls.len()),
                None,
            );
        }
    }

    /// 相邻调用对（不同工具）构成序列特征；相同工具且参数相同的连续调用为冗余调用
    fn scan_sequences(&self, run: &TestRun, obs: &mut Observations) {
        let mut seen_pairs = BTreeSet::new();
        for pair in run.session.calls.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            if prev.tool == next.tool {
                if prev.parameters == next.parameters && !prev.is_error() && !next.is_error() {
                    obs.observe(
                        Signature {
                            kind: PatternType::RedundantCall,
                            tool: Some(next.tool.clone()),
                            subject: None,
                            value: None,
                        },
                        &run.agent_id,
                        format!("{} repeated with identical parameters", next.tool),
                        None,
                    );
                }
                continue;
            }
            if seen_pairs.insert((prev.tool.clone(), next.tool.clone())) {
                obs.observe(
                    Signature {
                        kind: PatternType::ToolSequence,
                        tool: Some(prev.tool.clone()),
                        subject: Some(next.tool.clone()),
                        value: None,
                    },
                    &run.agent_id,
                    format!("{} -> {}", prev.tool, next.tool),
                    None,
                );
            }
        }
    }

    fn build_pattern(&self, signature: Signature, obs: Observation, total_runs: usize) -> Option<Pattern> {
        let frequency = obs.agents.len();
        if frequency < self.config.min_frequency.max(1) {
            return None;
        }

        let ratio = frequency as f64 / total_runs as f64;
        let confidence = (ratio * consistency(&obs.samples)).clamp(0.0, 1.0);
        if confidence < self.config.confidence_threshold {
            return None;
        }

        let severity = if ratio >= 0.66 {
            Severity::High
        } else if ratio >= 0.33 {
            Severity::Medium
        } else {
            Severity::Low
        };

        let value = match signature.kind {
            PatternType::ParameterChoice => dominant_value(&obs.samples),
            _ => signature.value.clone(),
        };
        let description = describe(&signature, value.as_deref(), frequency, total_runs);

        Some(Pattern {
            kind: signature.kind,
            frequency,
            description,
            examples: obs.examples,
            confidence,
            severity,
            tool: signature.tool,
            subject: signature.subject,
            value,
        })
    }
}

fn describe(signature: &Signature, value: Option<&str>, frequency: usize, total: usize) -> String {
    let tool = signature.tool.as_deref().unwrap_or("?");
    let subject = signature.subject.as_deref().unwrap_or("?");
    let value = value.unwrap_or("?");
    match signature.kind {
        PatternType::VisualDeviation => format!(
            "'{}' deviates ({}) from the reference in {}/{} runs",
            subject, value, frequency, total
        ),
        PatternType::ParameterChoice => format!(
            "{} agents set {}.{} (most often {}) while '{}' deviated from the reference",
            frequency, tool, subject, value, subject
        ),
        PatternType::ErrorPattern => format!(
            "{} fails with \"{}\" for {}/{} agents",
            tool, value, frequency, total
        ),
        PatternType::MissingTool => format!(
            "{} was never called by {}/{} agents",
            tool, frequency, total
        ),
        PatternType::ToolSequence => format!(
            "{} is followed by {} in {}/{} runs",
            tool, subject, frequency, total
        ),
        PatternType::RedundantCall => format!(
            "{} is called repeatedly with identical parameters by {}/{} agents",
            tool, frequency, total
        ),
    }
}

/// 错误信息归一化：小写、数字替换为 #、截断
fn normalize_error(message: &str) -> String {
    let normalized: String = message
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_digit() { '#' } else { c })
        .collect();
    normalized.chars().take(80).collect()
}

/// 证据一致性系数 ∈ [0.5, 1]：数值看变异系数，文本看众数占比
fn consistency(samples: &[Sample]) -> f64 {
    if samples.len() < 2 {
        return 1.0;
    }

    let numbers: Vec<f64> = samples
        .iter()
        .filter_map(|s| match s {
            Sample::Numeric(n) => Some(*n),
            Sample::Text(_) => None,
        })
        .collect();

    let factor = if numbers.len() == samples.len() {
        let mean = numbers.iter().sum::<f64>() / numbers.len() as f64;
        if mean.abs() < f64::EPSILON {
            1.0
        } else {
            let variance = numbers.iter().map(|n| (n - mean).powi(2)).sum::<f64>() / numbers.len() as f64;
            let cv = variance.sqrt() / mean.abs();
            1.0 / (1.0 + cv)
        }
    } else {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for sample in samples {
            *counts.entry(sample_key(sample)).or_default() += 1;
        }
        let top = counts.values().copied().max().unwrap_or(0);
        top as f64 / samples.len() as f64
    };

    factor.clamp(0.5, 1.0)
}

fn sample_key(sample: &Sample) -> String {
    match sample {
        Sample::Numeric(n) => format!("{}", n),
        Sample::Text(s) => s.clone(),
    }
}

/// 最常见的取值；并列时取字典序最小者
fn dominant_value(samples: &[Sample]) -> Option<String> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for sample in samples {
        *counts.entry(sample_key(sample)).or_default() += 1;
    }
    let max = counts.values().copied().max()?;
    counts.into_iter().find(|(_, c)| *c == max).map(|(v, _)| v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evolution::types::{ComparisonResult, Deviation};
    use crate::telemetry::{TelemetrySession, ToolCall};
    use serde_json::{json, Map};

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn run(agent: &str, calls: Vec<ToolCall>, deviations: Vec<Deviation>) -> TestRun {
        let mut session = TelemetrySession::new(format!("s-{agent}"), agent, 1);
        session.calls = calls;
        TestRun {
            agent_id: agent.to_string(),
            session,
            metrics: None,
            comparison: Some(ComparisonResult {
                is_match: deviations.is_empty(),
                score: 70.0,
                deviations,
            }),
            duration_ms: 1000,
            success: true,
            generation: 1,
            synthesized: false,
        }
    }

    fn font_size_deviation(actual: f64, percent: f64) -> Deviation {
        Deviation {
            kind: "size".into(),
            field: "fontSize".into(),
            expected: json!(12),
            actual: json!(actual),
            deviation_percent: percent,
        }
    }

    #[test]
    fn test_empty_input() {
        let miner = PatternMiner::new(MinerConfig::default());
        assert!(miner.mine(&[]).is_empty());
    }

    #[test]
    fn test_consistent_font_size_deviation() {
        let miner = PatternMiner::new(MinerConfig::default());
        let runs = vec![
            run("a1", vec![], vec![font_size_deviation(15.0, 25.0)]),
            run("a2", vec![], vec![font_size_deviation(15.6, 30.0)]),
            run("a3", vec![], vec![font_size_deviation(14.64, 22.0)]),
        ];

        let patterns = miner.mine(&runs);
        assert_eq!(patterns.len(), 1);
        let p = &patterns[0];
        assert_eq!(p.kind, PatternType::VisualDeviation);
        assert_eq!(p.frequency, 3);
        assert_eq!(p.severity, Severity::High);
        assert_eq!(p.subject.as_deref(), Some("fontSize"));
        assert_eq!(p.value.as_deref(), Some("over"));
        assert!(p.confidence >= 0.6 && p.confidence <= 1.0);
        assert_eq!(p.examples.len(), 3);
    }

    #[test]
    fn test_frequency_counts_distinct_agents() {
        let miner = PatternMiner::new(MinerConfig::default());
        let failing = || {
            vec![
                ToolCall::error("add_page", Map::new(), 1, "No document open"),
                ToolCall::error("add_page", Map::new(), 1, "No document open"),
                ToolCall::error("add_page", Map::new(), 1, "No document open"),
            ]
        };
        let runs = vec![
            run("a1", failing(), vec![]),
            run("a2", failing(), vec![]),
            run("a3", vec![], vec![]),
        ];

        let patterns = miner.mine(&runs);
        let errors: Vec<_> = patterns
            .iter()
            .filter(|p| p.kind == PatternType::ErrorPattern)
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].frequency, 2);
        assert_eq!(errors[0].severity, Severity::High);
        for p in &patterns {
            assert!(p.frequency <= runs.len());
        }
    }

    #[test]
    fn test_min_frequency_filters() {
        let miner = PatternMiner::new(MinerConfig {
            confidence_threshold: 0.0,
            ..MinerConfig::default()
        });
        let runs = vec![
            run("a1", vec![ToolCall::error("add_page", Map::new(), 1, "boom")], vec![]),
            run("a2", vec![], vec![]),
        ];
        assert!(miner.mine(&runs).is_empty());
    }

    #[test]
    fn test_inconsistent_values_lower_confidence() {
        let miner = PatternMiner::new(MinerConfig {
            confidence_threshold: 0.0,
            ..MinerConfig::default()
        });
        let styled = |agent: &str, size: i64| {
            run(
                agent,
                vec![ToolCall::success(
                    "create_paragraph_style",
                    params(json!({"fontSize": size})),
                    5,
                )],
                vec![font_size_deviation(size as f64, 50.0)],
            )
        };
        let choice = |patterns: Vec<Pattern>| {
            patterns
                .into_iter()
                .find(|p| p.kind == PatternType::ParameterChoice)
                .map(|p| p.confidence)
                .unwrap_or_default()
        };
        let c1 = choice(miner.mine(&[styled("a1", 18), styled("a2", 18)]));
        let c2 = choice(miner.mine(&[styled("a1", 18), styled("a2", 24)]));
        assert!((c1 - 1.0).abs() < 1e-9);
        assert!(c2 < c1);
    }

    #[test]
    fn test_same_direction_with_scattered_magnitudes() {
        let miner = PatternMiner::new(MinerConfig::default());
        let runs = vec![
            run("a1", vec![], vec![font_size_deviation(15.0, 25.0)]),
            run("a2", vec![], vec![font_size_deviation(21.6, 80.0)]),
            run("a3", vec![], vec![font_size_deviation(48.0, 300.0)]),
        ];

        let patterns = miner.mine(&runs);
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].kind, PatternType::VisualDeviation);
        assert_eq!(patterns[0].frequency, 3);
        assert_eq!(patterns[0].value.as_deref(), Some("over"));
        assert!((patterns[0].confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_parameter_choice_linked_to_deviation() {
        let miner = PatternMiner::new(MinerConfig::default());
        let styled = |size: i64| {
            vec![ToolCall::success(
                "create_paragraph_style",
                params(json!({"name": "Body", "fontSize": size})),
                5,
            )]
        };
        let runs = vec![
            run("a1", styled(18), vec![font_size_deviation(18.0, 50.0)]),
            run("a2", styled(18), vec![font_size_deviation(18.0, 50.0)]),
            run("a3", styled(18), vec![font_size_deviation(18.0, 50.0)]),
        ];

        let patterns = miner.mine(&runs);
        let choice = patterns
            .iter()
            .find(|p| p.kind == PatternType::ParameterChoice)
            .expect("parameter-choice pattern");
        assert_eq!(choice.tool.as_deref(), Some("create_paragraph_style"));
        assert_eq!(choice.subject.as_deref(), Some("fontSize"));
        assert_eq!(choice.value.as_deref(), Some("18"));
        // "name" 参数与偏差无关，不应产生模式
        assert!(patterns.iter().all(|p| p.subject.as_deref() != Some("name")));
    }

    #[test]
    fn test_missing_and_redundant_calls() {
        let miner = PatternMiner::new(MinerConfig {
            expected_tools: vec!["apply_paragraph_style".into()],
            ..MinerConfig::default()
        });
        let calls = || {
            vec![
                ToolCall::success("add_page", params(json!({"count": 1})), 1),
                ToolCall::success("add_page", params(json!({"count": 1})), 1),
            ]
        };
        let runs = vec![run("a1", calls(), vec![]), run("a2", calls(), vec![])];

        let patterns = miner.mine(&runs);
        assert!(patterns
            .iter()
            .any(|p| p.kind == PatternType::MissingTool && p.tool.as_deref() == Some("apply_paragraph_style")));
        assert!(patterns
            .iter()
            .any(|p| p.kind == PatternType::RedundantCall && p.tool.as_deref() == Some("add_page")));
    }

    #[test]
    fn test_tool_sequence() {
        let miner = PatternMiner::new(MinerConfig::default());
        let calls = || {
            vec![
                ToolCall::success("create_text_frame", Map::new(), 1),
                ToolCall::success("apply_paragraph_style", Map::new(), 1),
            ]
        };
        let runs = vec![run("a1", calls(), vec![]), run("a2", calls(), vec![])];
        let patterns = miner.mine(&runs);
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].kind, PatternType::ToolSequence);
        assert_eq!(patterns[0].subject.as_deref(), Some("apply_paragraph_style"));
    }

    #[test]
    fn test_equal_significance_ordered_by_type_name() {
        let miner = PatternMiner::new(MinerConfig::default());
        let runs = vec![
            run(
                "a1",
                vec![ToolCall::error("add_page", Map::new(), 1, "No document open")],
                vec![font_size_deviation(15.6, 30.0)],
            ),
            run(
                "a2",
                vec![ToolCall::error("add_page", Map::new(), 1, "No document open")],
                vec![font_size_deviation(15.6, 30.0)],
            ),
            run("a3", vec![], vec![]),
        ];

        let patterns = miner.mine(&runs);
        assert_eq!(patterns.len(), 2);
        assert_eq!(patterns[0].significance(), patterns[1].significance());
        assert_eq!(patterns[0].kind, PatternType::ErrorPattern);
        assert_eq!(patterns[1].kind, PatternType::VisualDeviation);
    }

    #[test]
    fn test_synthesized_runs_skip_call_signatures() {
        let miner = PatternMiner::new(MinerConfig::default());
        let mut runs = vec![
            run("a1", vec![ToolCall::error("agent_failure_detected", Map::new(), 0, "timeout")], vec![]),
            run("a2", vec![ToolCall::error("agent_failure_detected", Map::new(), 0, "timeout")], vec![]),
        ];
        for r in &mut runs {
            r.synthesized = true;
        }
        assert!(miner.mine(&runs).is_empty());
    }

    #[test]
    fn test_normalize_error() {
        assert_eq!(normalize_error("  Page 12 Not Found "), "page ## not found");
    }
}
