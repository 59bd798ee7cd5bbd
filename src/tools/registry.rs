//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），
//! 由 ToolRegistry 按名注册与查找。遥测采集通过 CapturingRegistry 装饰器完成：
//! 包装真实注册表，把每次 execute 写入 TelemetryStore，会话身份由构造参数显式传入。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::telemetry::{SessionDescriptor, TelemetryStore, ToolCall};

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认无参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String>;
}

/// 注册表接口：真实实现与遥测装饰器都实现它，回归检查也通过它驱动文档
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    fn register(&mut self, tool: Arc<dyn Tool>);

    fn get(&self, name: &str) -> Option<Arc<dyn Tool>>;

    fn tool_names(&self) -> Vec<String>;

    async fn execute(&self, name: &str, args: Value) -> Result<String, String>;

    fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }
}

/// 内存注册表：按名称存储 Arc<dyn Tool>
#[derive(Default)]
pub struct InMemoryToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl InMemoryToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.register(Arc::new(tool));
        self
    }
}

#[async_trait]
impl ToolRegistry for InMemoryToolRegistry {
    fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    async fn execute(&self, name: &str, args: Value) -> Result<String, String> {
        let tool = self.tools.get(name).ok_or_else(|| format!("Unknown tool: {name}"))?;
        tool.execute(args).await
    }
}

/// 遥测装饰器：转发到内层注册表，并把每次调用（含耗时与错误）记录到会话
pub struct CapturingRegistry<R: ToolRegistry> {
    inner: R,
    store: Arc<TelemetryStore>,
    session: SessionDescriptor,
}

impl<R: ToolRegistry> CapturingRegistry<R> {
    pub fn new(inner: R, store: Arc<TelemetryStore>, session: SessionDescriptor) -> Self {
        Self { inner, store, session }
    }

    fn parameters_of(args: &Value) -> Map<String, Value> {
        match args {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other.clone());
                map
            }
        }
    }
}

#[async_trait]
impl<R: ToolRegistry> ToolRegistry for CapturingRegistry<R> {
    fn register(&mut self, tool: Arc<dyn Tool>) {
        self.inner.register(tool);
    }

    fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.inner.get(name)
    }

    fn tool_names(&self) -> Vec<String> {
        self.inner.tool_names()
    }

    async fn execute(&self, name: &str, args: Value) -> Result<String, String> {
        let parameters = Self::parameters_of(&args);
        let started = Instant::now();
        let result = self.inner.execute(name, args).await;
        let elapsed = started.elapsed().as_millis() as u64;

        let call = match &result {
            Ok(_) => ToolCall::success(name, parameters, elapsed),
            Err(e) => ToolCall::error(name, parameters, elapsed, e.clone()),
        };
        // 遥测写入失败不影响工具结果本身
        if let Err(e) = self.store.record_call(&self.session.session_id, call).await {
            tracing::warn!(
                session_id = %self.session.session_id,
                tool = name,
                error = %e,
                "failed to record tool call"
            );
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo back the text parameter"
        }

        async fn execute(&self, args: Value) -> Result<String, String> {
            args.get("text")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .ok_or_else(|| "Missing required parameter: text".to_string())
        }
    }

    #[tokio::test]
    async fn test_in_memory_registry() {
        let registry = InMemoryToolRegistry::new().with_tool(EchoTool);
        assert!(registry.contains("echo"));
        assert_eq!(registry.tool_names(), vec!["echo".to_string()]);
        let out = registry
            .execute("echo", serde_json::json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(out, "hi");
        assert!(registry.execute("missing", Value::Null).await.is_err());
    }

    #[tokio::test]
    async fn test_capturing_registry_records_calls() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(TelemetryStore::new(dir.path()));
        let session_id = store.start_session("gen1-agent1", 1).await.unwrap();
        let session = store.read_session(&session_id).await.unwrap().unwrap();
        let descriptor = store.descriptor(&session);

        let registry = CapturingRegistry::new(
            InMemoryToolRegistry::new().with_tool(EchoTool),
            Arc::clone(&store),
            descriptor,
        );

        registry
            .execute("echo", serde_json::json!({"text": "hello"}))
            .await
            .unwrap();
        registry.execute("echo", serde_json::json!({})).await.unwrap_err();

        let session = store.load(&session_id).await.unwrap();
        assert_eq!(session.calls.len(), 2);
        assert_eq!(session.calls[0].tool, "echo");
        assert_eq!(session.calls[0].parameters["text"], "hello");
        assert!(session.calls[1].is_error());
        assert_eq!(
            session.calls[1].error_message.as_deref(),
            Some("Missing required parameter: text")
        );
    }
}
