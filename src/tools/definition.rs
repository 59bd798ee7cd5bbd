//! 结构化工具定义模型
//!
//! 改进只作用于这里的结构（描述 + 参数表 {type, description, constraint} + 示例），
//! 不直接改写任何源码文本。写回具体格式由可替换的 DefinitionSerializer 负责。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::tools::{Tool, ToolRegistry};

#[derive(Error, Debug)]
pub enum DefinitionError {
    #[error("Definition IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize definitions: {0}")]
    Serialize(String),

    #[error("Failed to parse definitions: {0}")]
    Parse(String),

    #[error("Unknown definition format: {0}")]
    UnknownFormat(String),
}

/// 参数约束：数值区间或枚举集合
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParameterConstraint {
    Range { min: f64, max: f64 },
    OneOf { values: Vec<String> },
}

impl ParameterConstraint {
    pub fn allows(&self, value: &Value) -> bool {
        match self {
            ParameterConstraint::Range { min, max } => value
                .as_f64()
                .map(|v| v >= *min && v <= *max)
                .unwrap_or(false),
            ParameterConstraint::OneOf { values } => {
                let text = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                values.iter().any(|v| v == &text)
            }
        }
    }
}

impl std::fmt::Display for ParameterConstraint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParameterConstraint::Range { min, max } => write!(f, "{}-{}", min, max),
            ParameterConstraint::OneOf { values } => write!(f, "one of: {}", values.join(", ")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraint: Option<ParameterConstraint>,
}

impl ParameterDefinition {
    pub fn new(kind: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            description: description.into(),
            required: false,
            constraint: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_constraint(mut self, constraint: ParameterConstraint) -> Self {
        self.constraint = Some(constraint);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// 非执行性的示例说明（附在描述之后给 LLM 看）
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterDefinition>,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: BTreeMap::new(),
            examples: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, parameter: ParameterDefinition) -> Self {
        self.parameters.insert(name.into(), parameter);
        self
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterDefinition> {
        self.parameters.get(name)
    }

    pub fn parameter_mut(&mut self, name: &str) -> Option<&mut ParameterDefinition> {
        self.parameters.get_mut(name)
    }

    /// 参数名大小写不敏感查找，返回定义中的原始键
    pub fn find_parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .keys()
            .find(|k| k.eq_ignore_ascii_case(name))
            .map(|k| k.as_str())
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = description.into();
    }

    pub fn append_description(&mut self, text: &str) {
        if self.description.trim().is_empty() {
            self.description = text.trim().to_string();
        } else {
            self.description = format!("{}\n\n{}", self.description.trim_end(), text.trim());
        }
    }

    /// 返回 false 表示没有该参数
    pub fn set_parameter_description(&mut self, name: &str, description: impl Into<String>) -> bool {
        match self.parameters.get_mut(name) {
            Some(param) => {
                param.description = description.into();
                true
            }
            None => false,
        }
    }

    pub fn set_constraint(&mut self, name: &str, constraint: ParameterConstraint) -> bool {
        match self.parameters.get_mut(name) {
            Some(param) => {
                param.constraint = Some(constraint);
                true
            }
            None => false,
        }
    }

    pub fn add_example(&mut self, example: impl Into<String>) {
        self.examples.push(example.into());
    }

    /// 从注册表中工具的 JSON Schema 构造结构化定义
    pub fn from_tool(tool: &dyn Tool) -> Self {
        let schema = tool.parameters_schema();
        let required: Vec<&str> = schema
            .get("required")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();

        let mut definition = ToolDefinition::new(tool.name(), tool.description());
        if let Some(props) = schema.get("properties").and_then(|v| v.as_object()) {
            for (name, prop) in props {
                let kind = prop.get("type").and_then(|v| v.as_str()).unwrap_or("string");
                let description = prop.get("description").and_then(|v| v.as_str()).unwrap_or("");
                let mut param = ParameterDefinition::new(kind, description);
                param.required = required.contains(&name.as_str());
                param.constraint = constraint_from_schema(prop);
                definition.parameters.insert(name.clone(), param);
            }
        }
        definition
    }

    /// 导出给 LLM 的 JSON Schema（示例附在描述末尾）
    pub fn to_json_schema(&self) -> Value {
        let mut description = self.description.clone();
        if !self.examples.is_empty() {
            description.push_str("\n\nExamples:");
            for example in &self.examples {
                description.push_str("\n- ");
                description.push_str(example);
            }
        }

        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for (name, param) in &self.parameters {
            let mut prop = serde_json::json!({
                "type": param.kind,
                "description": param.description,
            });
            match &param.constraint {
                Some(ParameterConstraint::Range { min, max }) => {
                    prop["minimum"] = serde_json::json!(min);
                    prop["maximum"] = serde_json::json!(max);
                }
                Some(ParameterConstraint::OneOf { values }) => {
                    prop["enum"] = serde_json::json!(values);
                }
                None => {}
            }
            if param.required {
                required.push(name.clone());
            }
            properties.insert(name.clone(), prop);
        }

        serde_json::json!({
            "name": self.name,
            "description": description,
            "parameters": {
                "type": "object",
                "properties": properties,
                "required": required,
            }
        })
    }
}

fn constraint_from_schema(prop: &Value) -> Option<ParameterConstraint> {
    if let Some(values) = prop.get("enum").and_then(|v| v.as_array()) {
        let values = values
            .iter()
            .map(|v| v.as_str().map(|s| s.to_string()).unwrap_or_else(|| v.to_string()))
            .collect();
        return Some(ParameterConstraint::OneOf { values });
    }
    match (
        prop.get("minimum").and_then(|v| v.as_f64()),
        prop.get("maximum").and_then(|v| v.as_f64()),
    ) {
        (Some(min), Some(max)) => Some(ParameterConstraint::Range { min, max }),
        _ => None,
    }
}

/// 工具定义集合，按工具名有序
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolDefinitionStore {
    tools: BTreeMap<String, ToolDefinition>,
}

impl ToolDefinitionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_definitions(definitions: impl IntoIterator<Item = ToolDefinition>) -> Self {
        let mut store = Self::new();
        for def in definitions {
            store.insert(def);
        }
        store
    }

    pub fn from_registry(registry: &dyn ToolRegistry) -> Self {
        Self::from_definitions(
            registry
                .tool_names()
                .iter()
                .filter_map(|name| registry.get(name))
                .map(|tool| ToolDefinition::from_tool(tool.as_ref())),
        )
    }

    /// 插入或替换，返回旧定义
    pub fn insert(&mut self, definition: ToolDefinition) -> Option<ToolDefinition> {
        self.tools.insert(definition.name.clone(), definition)
    }

    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ToolDefinition> {
        self.tools.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolDefinition> {
        self.tools.values()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 拥有某参数（大小写不敏感）的工具名
    pub fn tools_with_parameter(&self, parameter: &str) -> Vec<&str> {
        self.tools
            .values()
            .filter(|def| def.find_parameter(parameter).is_some())
            .map(|def| def.name.as_str())
            .collect()
    }

    pub fn to_schema_json(&self) -> String {
        let tools: Vec<Value> = self.tools.values().map(|d| d.to_json_schema()).collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }
}

#[derive(Serialize, Deserialize)]
struct DefinitionDocument {
    #[serde(default)]
    tools: BTreeMap<String, ToolDefinition>,
}

impl From<&ToolDefinitionStore> for DefinitionDocument {
    fn from(store: &ToolDefinitionStore) -> Self {
        Self {
            tools: store.tools.clone(),
        }
    }
}

impl From<DefinitionDocument> for ToolDefinitionStore {
    fn from(doc: DefinitionDocument) -> Self {
        // 以文档键为准，防止 name 字段与键不一致
        let tools = doc
            .tools
            .into_iter()
            .map(|(key, mut def)| {
                def.name = key.clone();
                (key, def)
            })
            .collect();
        Self { tools }
    }
}

/// 把结构化模型写成具体格式（可替换）
pub trait DefinitionSerializer: Send + Sync {
    fn format_name(&self) -> &'static str;

    fn serialize(&self, store: &ToolDefinitionStore) -> Result<String, DefinitionError>;

    fn deserialize(&self, text: &str) -> Result<ToolDefinitionStore, DefinitionError>;
}

pub struct JsonDefinitionSerializer;

impl DefinitionSerializer for JsonDefinitionSerializer {
    fn format_name(&self) -> &'static str {
        "json"
    }

    fn serialize(&self, store: &ToolDefinitionStore) -> Result<String, DefinitionError> {
        serde_json::to_string_pretty(&DefinitionDocument::from(store))
            .map_err(|e| DefinitionError::Serialize(e.to_string()))
    }

    fn deserialize(&self, text: &str) -> Result<ToolDefinitionStore, DefinitionError> {
        let doc: DefinitionDocument =
            serde_json::from_str(text).map_err(|e| DefinitionError::Parse(e.to_string()))?;
        Ok(doc.into())
    }
}

pub struct TomlDefinitionSerializer;

impl DefinitionSerializer for TomlDefinitionSerializer {
    fn format_name(&self) -> &'static str {
        "toml"
    }

    fn serialize(&self, store: &ToolDefinitionStore) -> Result<String, DefinitionError> {
        toml::to_string_pretty(&DefinitionDocument::from(store))
            .map_err(|e| DefinitionError::Serialize(e.to_string()))
    }

    fn deserialize(&self, text: &str) -> Result<ToolDefinitionStore, DefinitionError> {
        let doc: DefinitionDocument =
            toml::from_str(text).map_err(|e| DefinitionError::Parse(e.to_string()))?;
        Ok(doc.into())
    }
}

pub fn serializer_for(format: &str) -> Result<Box<dyn DefinitionSerializer>, DefinitionError> {
    match format.to_lowercase().as_str() {
        "json" => Ok(Box::new(JsonDefinitionSerializer)),
        "toml" => Ok(Box::new(TomlDefinitionSerializer)),
        other => Err(DefinitionError::UnknownFormat(other.to_string())),
    }
}

/// 定义文件：路径 + 序列化格式
pub struct DefinitionRepository {
    path: PathBuf,
    serializer: Box<dyn DefinitionSerializer>,
}

impl DefinitionRepository {
    pub fn new(path: impl AsRef<Path>, serializer: Box<dyn DefinitionSerializer>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            serializer,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format_name(&self) -> &'static str {
        self.serializer.format_name()
    }

    /// 文件不存在时返回空集合
    pub async fn load(&self) -> Result<ToolDefinitionStore, DefinitionError> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(ToolDefinitionStore::new());
        }
        let text = tokio::fs::read_to_string(&self.path).await?;
        self.serializer.deserialize(&text)
    }

    pub async fn save(&self, store: &ToolDefinitionStore) -> Result<(), DefinitionError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let text = self.serializer.serialize(store)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, text).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct ParagraphStyleTool;

    #[async_trait]
    impl Tool for ParagraphStyleTool {
        fn name(&self) -> &str {
            "create_paragraph_style"
        }

        fn description(&self) -> &str {
            "Create a paragraph style in the active document"
        }

        fn parameters_schema(&self) -> Value {
            serde_json::json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string", "description": "Style name"},
                    "fontSize": {"type": "number", "description": "Point size", "minimum": 4, "maximum": 144},
                    "alignment": {"type": "string", "description": "Justification", "enum": ["left", "center", "right"]}
                },
                "required": ["name"]
            })
        }

        async fn execute(&self, _args: Value) -> Result<String, String> {
            Ok("created".to_string())
        }
    }

    fn sample_store() -> ToolDefinitionStore {
        ToolDefinitionStore::from_definitions([
            ToolDefinition::from_tool(&ParagraphStyleTool),
            ToolDefinition::new("add_page", "Append a page").with_parameter(
                "count",
                ParameterDefinition::new("integer", "Number of pages"),
            ),
        ])
    }

    #[test]
    fn test_from_tool_schema() {
        let def = ToolDefinition::from_tool(&ParagraphStyleTool);
        assert_eq!(def.parameters.len(), 3);
        assert!(def.parameter("name").unwrap().required);
        assert_eq!(
            def.parameter("fontSize").unwrap().constraint,
            Some(ParameterConstraint::Range { min: 4.0, max: 144.0 })
        );
        assert!(matches!(
            def.parameter("alignment").unwrap().constraint,
            Some(ParameterConstraint::OneOf { .. })
        ));
        assert_eq!(def.find_parameter("FONTSIZE"), Some("fontSize"));
    }

    #[test]
    fn test_json_schema_export() {
        let mut def = ToolDefinition::from_tool(&ParagraphStyleTool);
        def.add_example("create_paragraph_style({name: \"Body\"}) // base style first");
        let schema = def.to_json_schema();
        assert_eq!(schema["parameters"]["properties"]["fontSize"]["minimum"], 4.0);
        assert_eq!(schema["parameters"]["properties"]["alignment"]["enum"][1], "center");
        assert_eq!(schema["parameters"]["required"][0], "name");
        assert!(schema["description"].as_str().unwrap().contains("Examples:"));
    }

    #[test]
    fn test_json_round_trip() {
        let store = sample_store();
        let serializer = JsonDefinitionSerializer;
        let text = serializer.serialize(&store).unwrap();
        assert_eq!(serializer.deserialize(&text).unwrap(), store);
    }

    #[test]
    fn test_toml_round_trip() {
        let mut store = sample_store();
        store.get_mut("add_page").unwrap().add_example("add_page({count: 2})");
        let serializer = TomlDefinitionSerializer;
        let text = serializer.serialize(&store).unwrap();
        assert!(text.contains("[tools.add_page]"));
        assert_eq!(serializer.deserialize(&text).unwrap(), store);
    }

    #[test]
    fn test_unknown_format() {
        assert!(matches!(
            serializer_for("yaml"),
            Err(DefinitionError::UnknownFormat(_))
        ));
        assert_eq!(serializer_for("TOML").unwrap().format_name(), "toml");
    }

    #[tokio::test]
    async fn test_repository_save_load() {
        let dir = TempDir::new().unwrap();
        let repo = DefinitionRepository::new(
            dir.path().join("defs/tools.json"),
            Box::new(JsonDefinitionSerializer),
        );
        assert!(repo.load().await.unwrap().is_empty());

        let store = sample_store();
        repo.save(&store).await.unwrap();
        assert_eq!(repo.load().await.unwrap(), store);
        assert!(!dir.path().join("defs/tools.tmp").exists());
    }

    #[test]
    fn test_constraint_allows() {
        let range = ParameterConstraint::Range { min: 8.0, max: 72.0 };
        assert!(range.allows(&serde_json::json!(12)));
        assert!(!range.allows(&serde_json::json!(100)));
        let one_of = ParameterConstraint::OneOf {
            values: vec!["left".into(), "right".into()],
        };
        assert!(one_of.allows(&serde_json::json!("left")));
        assert!(!one_of.allows(&serde_json::json!("center")));
        assert_eq!(one_of.to_string(), "one of: left, right");
    }

    #[test]
    fn test_tools_with_parameter() {
        let store = sample_store();
        assert_eq!(store.tools_with_parameter("fontsize"), vec!["create_paragraph_style"]);
        assert!(store.tools_with_parameter("leading").is_empty());
    }
}
