//! 外部协作方边界：Agent Runner、被测文档环境、布局比较器
//!
//! 核心只依赖这里的 trait；命令行实现把会话标识作为显式参数传给子进程
//! （`--session-id --agent-id --generation --telemetry-dir --prompt`），不经由环境变量。

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::evolution::types::ComparisonResult;
use crate::telemetry::SessionDescriptor;
use crate::tools::{InMemoryToolRegistry, Tool, ToolDefinitionStore, ToolRegistry};

/// 一次进化针对的测试用例
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub name: String,
    /// 交给智能体的任务描述
    pub description: String,
    /// 参考布局指标（比较器输入）
    pub reference_metrics: Value,
    #[serde(default)]
    pub expected_tools: Vec<String>,
}

impl TestCase {
    pub fn new(name: impl Into<String>, description: impl Into<String>, reference_metrics: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            reference_metrics,
            expected_tools: Vec::new(),
        }
    }

    pub fn has_reference(&self) -> bool {
        match &self.reference_metrics {
            Value::Null => false,
            Value::Object(map) => !map.is_empty(),
            Value::Array(items) => !items.is_empty(),
            _ => true,
        }
    }

    pub async fn load(path: &std::path::Path) -> Result<Self, std::io::Error> {
        let content = tokio::fs::read_to_string(path).await?;
        serde_json::from_str(&content).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

/// 交给 Agent Runner 的一次试验
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentPrompt {
    pub session_id: String,
    pub agent_id: String,
    pub generation: u32,
    pub telemetry_dir: PathBuf,
    pub prompt: String,
}

impl AgentPrompt {
    pub fn descriptor(&self) -> SessionDescriptor {
        SessionDescriptor {
            session_id: self.session_id.clone(),
            agent_id: self.agent_id.clone(),
            generation: self.generation,
            telemetry_dir: self.telemetry_dir.clone(),
        }
    }
}

/// 文档状态的粗略观测（完成等待超时时用于推断会话）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentObservation {
    pub object_count: usize,
    pub changed: bool,
}

/// 启动一次智能体试验；完成由遥测哨兵表示
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn launch(&self, prompt: &AgentPrompt) -> Result<(), String>;
}

/// 被所有试验共享的外部文档
#[async_trait]
pub trait DocumentEnvironment: Send + Sync {
    async fn check_reset_capability(&self) -> Result<(), String>;

    async fn check_reference(&self, test_case: &TestCase) -> Result<(), String> {
        if test_case.has_reference() {
            Ok(())
        } else {
            Err(format!("test case '{}' has no reference metrics", test_case.name))
        }
    }

    async fn reset_document(&self) -> Result<(), String>;

    async fn extract_metrics(&self) -> Result<Value, String>;

    async fn observe_state(&self) -> Result<DocumentObservation, String>;
}

#[async_trait]
pub trait LayoutComparator: Send + Sync {
    async fn compare(&self, extracted: &Value, reference: &Value, tolerance: f64) -> Result<ComparisonResult, String>;
}

/// 执行 argv，返回 stdout
async fn run_command(
    argv: &[String],
    extra_args: &[String],
    stdin: Option<&str>,
    timeout: Duration,
) -> Result<String, String> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| "command is not configured".to_string())?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .args(extra_args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| format!("Failed to spawn {}: {}", program, e))?;
    let pipe = child.stdin.take();

    // 写 stdin 也算在超时内：子进程可能从不读取输入
    let exchange = async move {
        if let (Some(input), Some(mut pipe)) = (stdin, pipe) {
            pipe.write_all(input.as_bytes())
                .await
                .map_err(|e| format!("Failed to write stdin of {}: {}", program, e))?;
        }
        child
            .wait_with_output()
            .await
            .map_err(|e| format!("{} failed: {}", program, e))
    };
    let output = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| format!("{} timed out after {}s", program, timeout.as_secs()))??;

    if !output.status.success() {
        return Err(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn parse_json<T: serde::de::DeserializeOwned>(program: &[String], stdout: &str) -> Result<T, String> {
    serde_json::from_str(stdout).map_err(|e| {
        format!(
            "{} returned invalid JSON: {}",
            program.first().map(String::as_str).unwrap_or("command"),
            e
        )
    })
}

/// 会话描述作为显式参数
pub fn runner_args(prompt: &AgentPrompt) -> Vec<String> {
    vec![
        "--session-id".to_string(),
        prompt.session_id.clone(),
        "--agent-id".to_string(),
        prompt.agent_id.clone(),
        "--generation".to_string(),
        prompt.generation.to_string(),
        "--telemetry-dir".to_string(),
        prompt.telemetry_dir.display().to_string(),
        "--prompt".to_string(),
        prompt.prompt.clone(),
    ]
}

/// 以子进程启动智能体；同一时间只保留一个试验进程
pub struct CommandAgentRunner {
    argv: Vec<String>,
    current: Mutex<Option<Child>>,
}

impl CommandAgentRunner {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            current: Mutex::new(None),
        }
    }
}

#[async_trait]
impl AgentRunner for CommandAgentRunner {
    async fn launch(&self, prompt: &AgentPrompt) -> Result<(), String> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| "runner command is not configured".to_string())?;

        let mut slot = self.current.lock().await;
        if let Some(mut previous) = slot.take() {
            if let Ok(None) = previous.try_wait() {
                tracing::warn!("previous agent process still running, killing it");
                if let Err(e) = previous.kill().await {
                    tracing::warn!(error = %e, "previous agent process could not be killed");
                }
            }
        }

        let child = Command::new(program)
            .args(args)
            .args(runner_args(prompt))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("Failed to spawn agent runner {}: {}", program, e))?;
        tracing::info!(
            session_id = %prompt.session_id,
            agent_id = %prompt.agent_id,
            pid = ?child.id(),
            "agent runner launched"
        );
        *slot = Some(child);
        Ok(())
    }
}

pub struct CommandEnvironment {
    reset: Vec<String>,
    metrics: Vec<String>,
    observe: Vec<String>,
    timeout: Duration,
}

impl CommandEnvironment {
    pub fn new(reset: Vec<String>, metrics: Vec<String>, observe: Vec<String>, timeout: Duration) -> Self {
        Self {
            reset,
            metrics,
            observe,
            timeout,
        }
    }
}

#[async_trait]
impl DocumentEnvironment for CommandEnvironment {
    async fn check_reset_capability(&self) -> Result<(), String> {
        let program = self
            .reset
            .first()
            .ok_or_else(|| "reset_command is not configured".to_string())?;
        let path = std::path::Path::new(program);
        if path.components().count() > 1 && !path.exists() {
            return Err(format!("reset command not found: {}", program));
        }
        Ok(())
    }

    async fn reset_document(&self) -> Result<(), String> {
        run_command(&self.reset, &[], None, self.timeout).await.map(|_| ())
    }

    async fn extract_metrics(&self) -> Result<Value, String> {
        let stdout = run_command(&self.metrics, &[], None, self.timeout).await?;
        parse_json(&self.metrics, &stdout)
    }

    async fn observe_state(&self) -> Result<DocumentObservation, String> {
        let stdout = run_command(&self.observe, &[], None, self.timeout).await?;
        parse_json(&self.observe, &stdout)
    }
}

/// 比较器：stdin 接收 `{extracted, reference, tolerance}`，stdout 返回 ComparisonResult
pub struct CommandComparator {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandComparator {
    pub fn new(argv: Vec<String>, timeout: Duration) -> Self {
        Self { argv, timeout }
    }
}

#[async_trait]
impl LayoutComparator for CommandComparator {
    async fn compare(&self, extracted: &Value, reference: &Value, tolerance: f64) -> Result<ComparisonResult, String> {
        let input = serde_json::json!({
            "extracted": extracted,
            "reference": reference,
            "tolerance": tolerance,
        })
        .to_string();
        let stdout = run_command(&self.argv, &[], Some(&input), self.timeout).await?;
        parse_json(&self.argv, &stdout)
    }
}

/// 通过外部命令执行一个文档工具：`argv --tool {name} --args {json}`，stdout 为结果
pub struct CommandTool {
    name: String,
    description: String,
    schema: Value,
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandTool {
    pub fn new(name: impl Into<String>, argv: Vec<String>, timeout: Duration) -> Self {
        let name = name.into();
        Self {
            description: format!("Document tool '{}' executed through the bridge command", name),
            name,
            schema: serde_json::json!({"type": "object", "properties": {}, "required": []}),
            argv,
            timeout,
        }
    }

    pub fn with_definition(mut self, description: impl Into<String>, schema: Value) -> Self {
        self.description = description.into();
        self.schema = schema;
        self
    }
}

#[async_trait]
impl Tool for CommandTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let extra = vec![
            "--tool".to_string(),
            self.name.clone(),
            "--args".to_string(),
            args.to_string(),
        ];
        run_command(&self.argv, &extra, None, self.timeout).await
    }
}

/// 回归检查用的桥接注册表：已知定义加上额外需要的工具名，全部走同一条命令
pub fn command_bridge(
    argv: &[String],
    definitions: &ToolDefinitionStore,
    extra_tools: &[String],
    timeout: Duration,
) -> InMemoryToolRegistry {
    let mut registry = InMemoryToolRegistry::new();
    for def in definitions.iter() {
        let tool = CommandTool::new(&def.name, argv.to_vec(), timeout)
            .with_definition(def.description.clone(), def.to_json_schema()["parameters"].clone());
        registry.register(Arc::new(tool));
    }
    for name in extra_tools {
        if !registry.contains(name) {
            registry.register(Arc::new(CommandTool::new(name, argv.to_vec(), timeout)));
        }
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn test_runner_args_are_explicit() {
        let prompt = AgentPrompt {
            session_id: "session_1_abcd".into(),
            agent_id: "gen1-agent2".into(),
            generation: 1,
            telemetry_dir: PathBuf::from("/tmp/telemetry"),
            prompt: "Recreate the layout".into(),
        };
        let args = runner_args(&prompt);
        assert_eq!(args[0], "--session-id");
        assert_eq!(args[1], "session_1_abcd");
        assert_eq!(args[5], "1");
        assert_eq!(args[9], "Recreate the layout");
        assert_eq!(prompt.descriptor().agent_id, "gen1-agent2");
    }

    #[test]
    fn test_reference_presence() {
        assert!(!TestCase::new("t", "d", Value::Null).has_reference());
        assert!(!TestCase::new("t", "d", serde_json::json!({})).has_reference());
        assert!(TestCase::new("t", "d", serde_json::json!({"fontSize": 12})).has_reference());
    }

    #[tokio::test]
    async fn test_command_environment_parses_json() {
        let env = CommandEnvironment::new(
            sh("true"),
            sh("echo '{\"fontSize\": 12}'"),
            sh("echo '{\"objectCount\": 3, \"changed\": true}'"),
            Duration::from_secs(10),
        );
        if env.reset_document().await.is_err() {
            eprintln!("sh unavailable, skipping");
            return;
        }
        assert_eq!(env.extract_metrics().await.unwrap()["fontSize"], 12);
        let obs = env.observe_state().await.unwrap();
        assert_eq!(obs.object_count, 3);
        assert!(obs.changed);
    }

    #[tokio::test]
    async fn test_command_failure_and_timeout() {
        let err = run_command(&sh("echo boom >&2; exit 3"), &[], None, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(err.contains("boom") || err.contains("spawn"));

        let err = run_command(&sh("sleep 5"), &[], None, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.contains("timed out") || err.contains("spawn"));

        let err = run_command(&[], &[], None, Duration::from_secs(1)).await.unwrap_err();
        assert!(err.contains("not configured"));
    }

    #[tokio::test]
    async fn test_unread_stdin_still_times_out() {
        // 超过管道缓冲区，子进程不读时写入会阻塞
        let input = "x".repeat(1 << 20);
        let started = std::time::Instant::now();
        let err = run_command(&sh("sleep 5"), &[], Some(&input), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(err.contains("timed out") || err.contains("spawn"));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_command_bridge_passes_tool_and_args() {
        let definitions = ToolDefinitionStore::from_definitions([crate::tools::ToolDefinition::new(
            "add_page",
            "Append a page",
        )]);
        let bridge = command_bridge(
            &sh("echo \"$@\"").into_iter().chain(["bridge".to_string()]).collect::<Vec<_>>(),
            &definitions,
            &["delete_page".to_string(), "add_page".to_string()],
            Duration::from_secs(10),
        );
        assert_eq!(bridge.tool_names(), vec!["add_page".to_string(), "delete_page".to_string()]);
        assert_eq!(bridge.get("add_page").unwrap().description(), "Append a page");

        match bridge.execute("delete_page", serde_json::json!({"position": "last"})).await {
            Ok(out) => {
                assert!(out.contains("--tool delete_page"));
                assert!(out.contains("\"position\""));
            }
            Err(e) => assert!(e.contains("spawn"), "{}", e),
        }
    }

    #[tokio::test]
    async fn test_comparator_reads_stdin() {
        let comparator = CommandComparator::new(
            sh("cat > /dev/null; echo '{\"match\": false, \"score\": 72.5, \"deviations\": []}'"),
            Duration::from_secs(10),
        );
        match comparator
            .compare(&serde_json::json!({}), &serde_json::json!({}), 2.0)
            .await
        {
            Ok(result) => {
                assert!(!result.is_match);
                assert_eq!(result.score, 72.5);
            }
            Err(e) => assert!(e.contains("spawn"), "{}", e),
        }
    }
}
