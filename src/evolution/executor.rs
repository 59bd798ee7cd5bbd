//! 改进应用：在内存中的结构化工具定义上执行一次修改
//!
//! 不产生任何副作用：返回修改前后的定义，由调用方决定是否持久化。

use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

use crate::evolution::types::{Improvement, ImprovementType};
use crate::tools::{ParameterConstraint, ToolDefinition, ToolDefinitionStore};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApplyError {
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Field '{field}' not found on tool '{tool}'")]
    FieldNotFound { tool: String, field: String },

    #[error("Invalid edit: {0}")]
    InvalidEdit(String),
}

/// 一次修改的结果（before 用于回滚）
#[derive(Debug, Clone, PartialEq)]
pub struct ModifiedDefinition {
    pub before: ToolDefinition,
    pub after: ToolDefinition,
}

impl ModifiedDefinition {
    pub fn tool(&self) -> &str {
        &self.after.name
    }
}

fn range_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(-?\d+(?:\.\d+)?)\s*(?:-|–|to|\.\.)\s*(-?\d+(?:\.\d+)?)").expect("valid range regex")
    })
}

fn one_of_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)one\s+of\s*:\s*(.+)$").expect("valid one-of regex"))
}

/// 解析约束文本："min-max" 或 "one of: a, b, c"
pub fn parse_constraint(text: &str) -> Option<ParameterConstraint> {
    let text = text.trim();
    if let Some(caps) = one_of_regex().captures(text) {
        let values: Vec<String> = caps[1]
            .split(',')
            .map(|v| v.trim().trim_matches(|c| c == '"' || c == '\'' || c == '.').to_string())
            .filter(|v| !v.is_empty())
            .collect();
        if !values.is_empty() {
            return Some(ParameterConstraint::OneOf { values });
        }
    }
    if let Some(caps) = range_regex().captures(text) {
        let min: f64 = caps[1].parse().ok()?;
        let max: f64 = caps[2].parse().ok()?;
        if min <= max {
            return Some(ParameterConstraint::Range { min, max });
        }
    }
    None
}

pub struct ImprovementApplier;

impl ImprovementApplier {
    pub fn new() -> Self {
        Self
    }

    pub fn apply(
        &self,
        improvement: &Improvement,
        definitions: &ToolDefinitionStore,
    ) -> Result<ModifiedDefinition, ApplyError> {
        let before = definitions
            .get(&improvement.tool)
            .cloned()
            .ok_or_else(|| ApplyError::ToolNotFound(improvement.tool.clone()))?;
        let mut after = before.clone();
        let proposed = improvement.proposed.as_str();

        match improvement.kind {
            ImprovementType::Description => {
                after.set_description(proposed);
            }
            ImprovementType::Parameter => {
                let field = self.require_field(improvement)?;
                let key = self.resolve_field(&after, field)?;
                after.set_parameter_description(&key, proposed);
            }
            ImprovementType::Example => {
                if proposed.trim().is_empty() {
                    return Err(ApplyError::InvalidEdit("empty example".to_string()));
                }
                after.add_example(proposed.trim());
            }
            ImprovementType::Constraint => match improvement.field.as_deref() {
                Some(field) => {
                    let key = self.resolve_field(&after, field)?;
                    let constraint = parse_constraint(proposed).ok_or_else(|| {
                        ApplyError::InvalidEdit(format!(
                            "constraint for '{}' is neither a range nor a set: {}",
                            key, proposed
                        ))
                    })?;
                    after.set_constraint(&key, constraint);
                }
                None => after.append_description(proposed),
            },
        }

        if after == before {
            return Err(ApplyError::InvalidEdit("edit does not change the definition".to_string()));
        }

        tracing::debug!(
            tool = %improvement.tool,
            kind = %improvement.kind,
            field = ?improvement.field,
            "improvement applied in memory"
        );
        Ok(ModifiedDefinition { before, after })
    }

    fn require_field<'a>(&self, improvement: &'a Improvement) -> Result<&'a str, ApplyError> {
        improvement
            .field
            .as_deref()
            .ok_or_else(|| ApplyError::InvalidEdit("parameter edit requires a field".to_string()))
    }

    fn resolve_field(&self, def: &ToolDefinition, field: &str) -> Result<String, ApplyError> {
        def.find_parameter(field)
            .map(|k| k.to_string())
            .ok_or_else(|| ApplyError::FieldNotFound {
                tool: def.name.clone(),
                field: field.to_string(),
            })
    }
}

impl Default for ImprovementApplier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ParameterDefinition;

    fn store() -> ToolDefinitionStore {
        ToolDefinitionStore::from_definitions([ToolDefinition::new(
            "create_paragraph_style",
            "Create a paragraph style",
        )
        .with_parameter("fontSize", ParameterDefinition::new("number", "Point size"))
        .with_parameter("alignment", ParameterDefinition::new("string", "Justification"))])
    }

    fn improvement(kind: ImprovementType, field: Option<&str>, proposed: &str) -> Improvement {
        Improvement {
            id: "imp_1".into(),
            kind,
            tool: "create_paragraph_style".into(),
            field: field.map(String::from),
            current: String::new(),
            proposed: proposed.into(),
            rationale: "test".into(),
            expected_impact: 0.5,
            generation: 1,
        }
    }

    #[test]
    fn test_description_replaced() {
        let out = ImprovementApplier::new()
            .apply(&improvement(ImprovementType::Description, None, "New text"), &store())
            .unwrap();
        assert_eq!(out.after.description, "New text");
        assert_eq!(out.before.description, "Create a paragraph style");
    }

    #[test]
    fn test_parameter_edit() {
        let out = ImprovementApplier::new()
            .apply(
                &improvement(ImprovementType::Parameter, Some("fontsize"), "Point size, measured from reference"),
                &store(),
            )
            .unwrap();
        assert_eq!(
            out.after.parameter("fontSize").unwrap().description,
            "Point size, measured from reference"
        );
    }

    #[test]
    fn test_parameter_edit_errors() {
        let applier = ImprovementApplier::new();
        let err = applier
            .apply(&improvement(ImprovementType::Parameter, Some("leading"), "x"), &store())
            .unwrap_err();
        assert!(matches!(err, ApplyError::FieldNotFound { .. }));

        let err = applier
            .apply(&improvement(ImprovementType::Parameter, None, "x"), &store())
            .unwrap_err();
        assert!(matches!(err, ApplyError::InvalidEdit(_)));

        let mut imp = improvement(ImprovementType::Description, None, "x");
        imp.tool = "place_image".into();
        assert_eq!(
            applier.apply(&imp, &store()).unwrap_err(),
            ApplyError::ToolNotFound("place_image".into())
        );
    }

    #[test]
    fn test_example_appended() {
        let out = ImprovementApplier::new()
            .apply(
                &improvement(ImprovementType::Example, None, "create_paragraph_style({name: \"Body\"}) // base style"),
                &store(),
            )
            .unwrap();
        assert_eq!(out.after.examples.len(), 1);
    }

    #[test]
    fn test_constraint_range_and_set() {
        let applier = ImprovementApplier::new();
        let out = applier
            .apply(&improvement(ImprovementType::Constraint, Some("fontSize"), "8-72"), &store())
            .unwrap();
        assert_eq!(
            out.after.parameter("fontSize").unwrap().constraint,
            Some(ParameterConstraint::Range { min: 8.0, max: 72.0 })
        );

        let out = applier
            .apply(
                &improvement(ImprovementType::Constraint, Some("alignment"), "Must be one of: left, center, right"),
                &store(),
            )
            .unwrap();
        assert_eq!(
            out.after.parameter("alignment").unwrap().constraint,
            Some(ParameterConstraint::OneOf {
                values: vec!["left".into(), "center".into(), "right".into()]
            })
        );
    }

    #[test]
    fn test_constraint_unrecognized() {
        let err = ImprovementApplier::new()
            .apply(&improvement(ImprovementType::Constraint, Some("fontSize"), "keep it readable"), &store())
            .unwrap_err();
        assert!(matches!(err, ApplyError::InvalidEdit(_)));
    }

    #[test]
    fn test_constraint_without_field_appends() {
        let out = ImprovementApplier::new()
            .apply(&improvement(ImprovementType::Constraint, None, "Requires an open document."), &store())
            .unwrap();
        assert_eq!(
            out.after.description,
            "Create a paragraph style\n\nRequires an open document."
        );
    }

    #[test]
    fn test_input_store_untouched() {
        let defs = store();
        ImprovementApplier::new()
            .apply(&improvement(ImprovementType::Description, None, "Changed"), &defs)
            .unwrap();
        assert_eq!(defs.get("create_paragraph_style").unwrap().description, "Create a paragraph style");
    }

    #[test]
    fn test_parse_constraint_variants() {
        assert_eq!(
            parse_constraint("-5 to 5"),
            Some(ParameterConstraint::Range { min: -5.0, max: 5.0 })
        );
        assert_eq!(parse_constraint("12.5-10"), None);
        assert!(parse_constraint("bold").is_none());
    }
}
