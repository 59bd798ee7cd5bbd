//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TOOLTUNE__*` 覆盖（双下划线表示嵌套，如 `TOOLTUNE__EVOLUTION__TARGET_SCORE=92`）。
//! 所有阈值都是可调配置，没有写死在算法里。

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub evolution: EvolutionSection,
    pub storage: StorageSection,
    pub git: GitSection,
    pub runner: RunnerSection,
}

impl AppConfig {
    pub fn workspace_root(&self) -> PathBuf {
        self.app
            .workspace_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("./evolution"))
    }

    /// 相对路径基于 workspace_root
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root().join(path)
        }
    }

    pub fn telemetry_dir(&self) -> PathBuf {
        self.resolve(&self.storage.telemetry_dir)
    }

    pub fn history_file(&self) -> PathBuf {
        self.resolve(&self.storage.history_file)
    }

    pub fn definitions_file(&self) -> PathBuf {
        self.resolve(&self.storage.definitions_file)
    }

    pub fn progress_file(&self) -> PathBuf {
        self.resolve(&self.storage.progress_file)
    }

    pub fn report_file(&self) -> PathBuf {
        self.resolve(&self.storage.report_file)
    }
}

/// [app] 段：工作目录与测试用例
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    /// 存储根目录，未设置时用 ./evolution
    pub workspace_root: Option<PathBuf>,
    /// 测试用例 JSON（参考指标、任务描述）
    pub test_case: Option<PathBuf>,
}

/// [evolution] 段：循环控制与挖掘阈值
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EvolutionSection {
    pub max_generations: u32,
    pub agents_per_generation: usize,
    pub target_score: f64,
    /// 一代平均分至少提升这么多才不算平台期
    pub improvement_threshold: f64,
    pub plateau_generations: u32,
    pub min_frequency: usize,
    pub confidence_threshold: f64,
    /// 低于该百分比的偏差不参与挖掘
    pub min_deviation_percent: f64,
    pub completion_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub comparison_tolerance: f64,
    /// 已提交的修改让下一代平均分下降超过该值时回滚
    pub regression_tolerance: f64,
    /// 任务期望使用的工具（missing-tool 模式依据）
    pub expected_tools: Vec<String>,
}

impl Default for EvolutionSection {
    fn default() -> Self {
        Self {
            max_generations: 10,
            agents_per_generation: 3,
            target_score: 90.0,
            improvement_threshold: 5.0,
            plateau_generations: 3,
            min_frequency: 2,
            confidence_threshold: 0.6,
            min_deviation_percent: 10.0,
            completion_timeout_secs: 300,
            poll_interval_ms: 1000,
            comparison_tolerance: 2.0,
            regression_tolerance: 2.0,
            expected_tools: Vec::new(),
        }
    }
}

/// [storage] 段：相对路径基于 workspace_root
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub telemetry_dir: PathBuf,
    pub history_file: PathBuf,
    pub definitions_file: PathBuf,
    /// json / toml
    pub definitions_format: String,
    pub progress_file: PathBuf,
    pub report_file: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            telemetry_dir: PathBuf::from("telemetry"),
            history_file: PathBuf::from("improvement-history.json"),
            definitions_file: PathBuf::from("tool-definitions.json"),
            definitions_format: "json".to_string(),
            progress_file: PathBuf::from("progress.json"),
            report_file: PathBuf::from("report.txt"),
        }
    }
}

/// [git] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GitSection {
    pub enabled: bool,
    pub repo_root: PathBuf,
    pub timeout_secs: u64,
    pub branch_prefix: String,
}

impl Default for GitSection {
    fn default() -> Self {
        Self {
            enabled: true,
            repo_root: PathBuf::from("."),
            timeout_secs: 30,
            branch_prefix: "evolution".to_string(),
        }
    }
}

/// [runner] 段：外部协作进程的命令行（argv 列表）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunnerSection {
    pub command: Vec<String>,
    pub reset_command: Vec<String>,
    pub metrics_command: Vec<String>,
    pub observe_command: Vec<String>,
    pub compare_command: Vec<String>,
    /// 回归检查的工具桥接：`tool_command --tool {name} --args {json}`
    pub tool_command: Vec<String>,
    pub command_timeout_secs: u64,
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            reset_command: Vec::new(),
            metrics_command: Vec::new(),
            observe_command: Vec::new(),
            compare_command: Vec::new(),
            tool_command: Vec::new(),
            command_timeout_secs: 120,
        }
    }
}

/// 从 config 目录加载配置，环境变量 TOOLTUNE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TOOLTUNE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TOOLTUNE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.evolution.max_generations, 10);
        assert_eq!(cfg.evolution.plateau_generations, 3);
        assert_eq!(cfg.evolution.min_frequency, 2);
        assert_eq!(cfg.evolution.confidence_threshold, 0.6);
        assert_eq!(cfg.git.timeout_secs, 30);
        assert_eq!(cfg.telemetry_dir(), PathBuf::from("./evolution/telemetry"));
    }

    #[test]
    fn test_explicit_file_overrides_and_partial_sections() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            r#"
[app]
workspace_root = "/tmp/tt"

[evolution]
target_score = 95.0
expected_tools = ["add_page"]

[storage]
definitions_format = "toml"
"#,
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.evolution.target_score, 95.0);
        assert_eq!(cfg.evolution.agents_per_generation, 3);
        assert_eq!(cfg.evolution.expected_tools, vec!["add_page".to_string()]);
        assert_eq!(cfg.storage.definitions_format, "toml");
        assert_eq!(cfg.history_file(), PathBuf::from("/tmp/tt/improvement-history.json"));
        assert_eq!(cfg.resolve(Path::new("/abs/x")), PathBuf::from("/abs/x"));
    }
}
