//! 回归验证：在接受一次修改前，对已修改的系统运行固定检查集
//!
//! 只选择 required_tools 与改进目标工具相交的检查；没有相关检查时直接判定安全。
//! 每个检查顺序执行 setup → execute → validate → cleanup，cleanup 在出错或 panic 时也会执行。
//! 单个检查失败只记为一条错误，不中断其余检查。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::evolution::types::Improvement;
use crate::tools::ToolRegistry;

/// 固定的功能检查（通过工具注册表驱动真实文档）
#[async_trait]
pub trait RegressionCheck: Send + Sync {
    fn name(&self) -> &str;

    fn required_tools(&self) -> &[String];

    async fn setup(&self, _bridge: &dyn ToolRegistry) -> Result<(), String> {
        Ok(())
    }

    async fn execute(&self, bridge: &dyn ToolRegistry) -> Result<(), String>;

    async fn validate(&self, bridge: &dyn ToolRegistry) -> Result<bool, String>;

    async fn cleanup(&self, _bridge: &dyn ToolRegistry) -> Result<(), String> {
        Ok(())
    }
}

/// 声明式检查中的一步工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckStep {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

impl CheckStep {
    pub fn new(tool: impl Into<String>, args: Value) -> Self {
        Self {
            tool: tool.into(),
            args,
        }
    }
}

/// 声明式检查：按步骤调用工具，validate 步骤的输出需包含 expect_contains
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptedCheck {
    pub name: String,
    pub required_tools: Vec<String>,
    #[serde(default)]
    pub setup: Vec<CheckStep>,
    pub execute: Vec<CheckStep>,
    pub validate: CheckStep,
    pub expect_contains: String,
    #[serde(default)]
    pub cleanup: Vec<CheckStep>,
}

impl ScriptedCheck {
    async fn run_steps(bridge: &dyn ToolRegistry, steps: &[CheckStep]) -> Result<(), String> {
        for step in steps {
            bridge
                .execute(&step.tool, step.args.clone())
                .await
                .map_err(|e| format!("{} failed: {}", step.tool, e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl RegressionCheck for ScriptedCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn required_tools(&self) -> &[String] {
        &self.required_tools
    }

    async fn setup(&self, bridge: &dyn ToolRegistry) -> Result<(), String> {
        Self::run_steps(bridge, &self.setup).await
    }

    async fn execute(&self, bridge: &dyn ToolRegistry) -> Result<(), String> {
        Self::run_steps(bridge, &self.execute).await
    }

    async fn validate(&self, bridge: &dyn ToolRegistry) -> Result<bool, String> {
        let output = bridge
            .execute(&self.validate.tool, self.validate.args.clone())
            .await
            .map_err(|e| format!("{} failed: {}", self.validate.tool, e))?;
        Ok(output.contains(&self.expect_contains))
    }

    async fn cleanup(&self, bridge: &dyn ToolRegistry) -> Result<(), String> {
        Self::run_steps(bridge, &self.cleanup).await
    }
}

/// 默认检查集：样式、页面、文本框
pub fn default_checks() -> Vec<ScriptedCheck> {
    vec![
        ScriptedCheck {
            name: "style-operations".to_string(),
            required_tools: vec![
                "create_paragraph_style".to_string(),
                "apply_paragraph_style".to_string(),
                "list_paragraph_styles".to_string(),
            ],
            setup: vec![],
            execute: vec![CheckStep::new(
                "create_paragraph_style",
                serde_json::json!({"name": "RegressionBody", "fontSize": 11}),
            )],
            validate: CheckStep::new("list_paragraph_styles", serde_json::json!({})),
            expect_contains: "RegressionBody".to_string(),
            cleanup: vec![CheckStep::new(
                "delete_paragraph_style",
                serde_json::json!({"name": "RegressionBody"}),
            )],
        },
        ScriptedCheck {
            name: "page-operations".to_string(),
            required_tools: vec![
                "add_page".to_string(),
                "delete_page".to_string(),
                "get_page_info".to_string(),
            ],
            setup: vec![],
            execute: vec![CheckStep::new("add_page", serde_json::json!({"count": 1}))],
            validate: CheckStep::new("get_page_info", serde_json::json!({})),
            expect_contains: "page".to_string(),
            cleanup: vec![CheckStep::new("delete_page", serde_json::json!({"position": "last"}))],
        },
        ScriptedCheck {
            name: "text-operations".to_string(),
            required_tools: vec![
                "create_text_frame".to_string(),
                "get_text_frame_info".to_string(),
            ],
            setup: vec![],
            execute: vec![CheckStep::new(
                "create_text_frame",
                serde_json::json!({"content": "Regression", "x": 10, "y": 10, "width": 100, "height": 20}),
            )],
            validate: CheckStep::new("get_text_frame_info", serde_json::json!({})),
            expect_contains: "Regression".to_string(),
            cleanup: vec![],
        },
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegressionReport {
    pub safe: bool,
    pub affected_checks: Vec<String>,
    pub errors: Vec<String>,
}

pub struct RegressionValidator {
    checks: Vec<Arc<dyn RegressionCheck>>,
    bridge: Arc<dyn ToolRegistry>,
}

impl RegressionValidator {
    pub fn new(bridge: Arc<dyn ToolRegistry>) -> Self {
        Self {
            checks: Vec::new(),
            bridge,
        }
    }

    pub fn with_default_checks(bridge: Arc<dyn ToolRegistry>) -> Self {
        let mut validator = Self::new(bridge);
        for check in default_checks() {
            validator.register(Arc::new(check));
        }
        validator
    }

    pub fn register(&mut self, check: Arc<dyn RegressionCheck>) {
        self.checks.push(check);
    }

    pub fn bridge(&self) -> &Arc<dyn ToolRegistry> {
        &self.bridge
    }

    pub fn check_names(&self) -> Vec<String> {
        self.checks.iter().map(|c| c.name().to_string()).collect()
    }

    /// 与改进目标工具相关的检查
    pub fn affected_checks(&self, improvement: &Improvement) -> Vec<Arc<dyn RegressionCheck>> {
        self.checks
            .iter()
            .filter(|c| c.required_tools().iter().any(|t| t == &improvement.tool))
            .cloned()
            .collect()
    }

    pub async fn test_improvement(&self, improvement: &Improvement) -> RegressionReport {
        let selected = self.affected_checks(improvement);
        let affected_checks: Vec<String> = selected.iter().map(|c| c.name().to_string()).collect();
        if selected.is_empty() {
            tracing::debug!(tool = %improvement.tool, "no regression checks cover this tool");
            return RegressionReport {
                safe: true,
                affected_checks,
                errors: Vec::new(),
            };
        }

        let mut errors = Vec::new();
        for check in &selected {
            if let Err(e) = self.run_check(check.as_ref()).await {
                tracing::warn!(check = check.name(), error = %e, "regression check failed");
                errors.push(format!("{}: {}", check.name(), e));
            }
        }

        tracing::info!(
            tool = %improvement.tool,
            checks = affected_checks.len(),
            errors = errors.len(),
            "regression validation finished"
        );
        RegressionReport {
            safe: errors.is_empty(),
            affected_checks,
            errors,
        }
    }

    async fn run_check(&self, check: &dyn RegressionCheck) -> Result<(), String> {
        let bridge = self.bridge.as_ref();
        let body = async {
            check.setup(bridge).await?;
            check.execute(bridge).await?;
            if check.validate(bridge).await? {
                Ok(())
            } else {
                Err("validation returned false".to_string())
            }
        };
        let result = match AssertUnwindSafe(body).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err("check panicked".to_string()),
        };

        let cleanup = match AssertUnwindSafe(check.cleanup(bridge)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err("cleanup panicked".to_string()),
        };
        if let Err(e) = &cleanup {
            tracing::warn!(check = check.name(), error = %e, "regression check cleanup failed");
        }

        match (result, cleanup) {
            (Err(e), _) => Err(e),
            (Ok(()), Err(e)) => Err(format!("cleanup: {}", e)),
            (Ok(()), Ok(())) => Ok(()),
        }
    }
}
