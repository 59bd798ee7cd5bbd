//! 改进提案：把高/中严重度模式映射为针对工具定义的结构化修改
//!
//! parameter-choice → parameter（明确取值建议）
//! visual-deviation → description（尺寸 / 定位提示）
//! missing-tool     → example
//! tool-sequence    → description（记录调用顺序）
//! error-pattern    → constraint
//! redundant-call   → description（说明一次调用即可）
//!
//! 每代选择几个候选由调用方决定，这里只负责排序。

use chrono::Utc;

use crate::evolution::types::{Improvement, ImprovementType, Pattern, PatternType, Severity};
use crate::tools::{ToolDefinition, ToolDefinitionStore};

/// 改进 id：时间戳 + 随机段
pub fn new_improvement_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("imp_{}_{}", Utc::now().timestamp_millis(), &uuid[..8])
}

pub struct ImprovementProposer;

impl ImprovementProposer {
    pub fn new() -> Self {
        Self
    }

    /// 按模式顺序生成候选，再按预期收益降序（稳定排序，并列保持模式顺序）
    pub fn propose(
        &self,
        patterns: &[Pattern],
        definitions: &ToolDefinitionStore,
        generation: u32,
    ) -> Vec<Improvement> {
        let mut candidates: Vec<Improvement> = patterns
            .iter()
            .filter(|p| p.severity >= Severity::Medium)
            .filter_map(|p| self.propose_one(p, definitions, generation))
            .filter(|imp| imp.proposed.trim() != imp.current.trim())
            .collect();

        candidates.sort_by(|a, b| b.expected_impact.total_cmp(&a.expected_impact));
        candidates
    }

    fn propose_one(
        &self,
        pattern: &Pattern,
        definitions: &ToolDefinitionStore,
        generation: u32,
    ) -> Option<Improvement> {
        let expected_impact = expected_impact(pattern);
        let rationale = format!(
            "{} (frequency {}, confidence {:.2}, severity {})",
            pattern.description, pattern.frequency, pattern.confidence, pattern.severity
        );

        let (kind, def, field, current, proposed) = match pattern.kind {
            PatternType::ParameterChoice => {
                let def = definitions.get(pattern.tool.as_deref()?)?;
                let field = def.find_parameter(pattern.subject.as_deref()?)?.to_string();
                let current = def.parameter(&field)?.description.clone();
                let proposed = parameter_guidance(&current, &field, pattern);
                (ImprovementType::Parameter, def, Some(field), current, proposed)
            }
            PatternType::VisualDeviation => {
                let subject = pattern.subject.as_deref()?;
                let def = tool_for_field(definitions, subject)?;
                let current = def.description.clone();
                let hint = format!(
                    "Sizing/positioning hint: '{}' is commonly {} the reference. Measure '{}' from the reference layout and pass it explicitly instead of relying on defaults.",
                    subject,
                    direction_phrase(pattern.value.as_deref()),
                    subject
                );
                (ImprovementType::Description, def, None, current.clone(), append(&current, &hint))
            }
            PatternType::MissingTool => {
                let def = definitions.get(pattern.tool.as_deref()?)?;
                let example = format!(
                    "{}({}) // Note: agents often skip this tool; use it when the layout requires it",
                    def.name,
                    example_arguments(def)
                );
                (ImprovementType::Example, def, None, def.examples.join("\n"), example)
            }
            PatternType::ToolSequence => {
                let def = definitions.get(pattern.tool.as_deref()?)?;
                let next = pattern.subject.as_deref()?;
                let current = def.description.clone();
                let note = format!(
                    "Ordering: call {} before {}; agents that succeed follow this order.",
                    def.name, next
                );
                (ImprovementType::Description, def, None, current.clone(), append(&current, &note))
            }
            PatternType::ErrorPattern => {
                let def = definitions.get(pattern.tool.as_deref()?)?;
                let message = pattern.value.as_deref().unwrap_or("unknown error");
                let constraint = format!(
                    "Constraint: calls fail with \"{}\"; check preconditions before calling {}.",
                    message, def.name
                );
                (ImprovementType::Constraint, def, None, def.description.clone(), constraint)
            }
            PatternType::RedundantCall => {
                let def = definitions.get(pattern.tool.as_deref()?)?;
                let current = def.description.clone();
                let note = "A single call is sufficient; repeating it with identical parameters has no further effect.";
                (ImprovementType::Description, def, None, current.clone(), append(&current, note))
            }
        };

        Some(Improvement {
            id: new_improvement_id(),
            kind,
            tool: def.name.clone(),
            field,
            current,
            proposed,
            rationale,
            expected_impact,
            generation,
        })
    }
}

impl Default for ImprovementProposer {
    fn default() -> Self {
        Self::new()
    }
}

fn expected_impact(pattern: &Pattern) -> f64 {
    let weight = match pattern.severity {
        Severity::High => 1.0,
        Severity::Medium => 0.6,
        Severity::Low => 0.3,
    };
    (pattern.confidence * weight).clamp(0.0, 1.0)
}

fn append(current: &str, text: &str) -> String {
    if current.trim().is_empty() {
        text.to_string()
    } else {
        format!("{}\n\n{}", current.trim_end(), text)
    }
}

fn direction_phrase(direction: Option<&str>) -> &'static str {
    match direction {
        Some("over") => "larger than",
        Some("under") => "smaller than",
        _ => "different from",
    }
}

fn parameter_guidance(current: &str, field: &str, pattern: &Pattern) -> String {
    let guidance = match pattern.value.as_deref() {
        Some(value) => format!(
            "Do not default to {}: agents chose it and '{}' deviated from the reference. Use the exact value measured from the reference layout.",
            value, field
        ),
        None => format!(
            "Set '{}' explicitly from the reference layout; default choices deviated from it.",
            field
        ),
    };
    append(current, &guidance)
}

/// 按参数名找到负责该字段的工具（参数最少者优先，名称为次序）
fn tool_for_field<'a>(definitions: &'a ToolDefinitionStore, field: &str) -> Option<&'a ToolDefinition> {
    definitions
        .tools_with_parameter(field)
        .into_iter()
        .filter_map(|name| definitions.get(name))
        .min_by(|a, b| {
            a.parameters
                .len()
                .cmp(&b.parameters.len())
                .then_with(|| a.name.cmp(&b.name))
        })
}

fn example_arguments(def: &ToolDefinition) -> String {
    def.parameters
        .iter()
        .filter(|(_, p)| p.required)
        .map(|(name, p)| format!("{}: <{}>", name, p.kind))
        .collect::<Vec<_>>()
        .join(", ")
}
