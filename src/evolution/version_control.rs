//! 版本控制：进化分支上 HEAD 变化的唯一写入者
//!
//! 每个操作都是一次带超时的 git 子进程调用。超时或非零退出只让当前操作失败，
//! 由调用方决定是否继续本轮循环。

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;

use crate::evolution::types::Improvement;

#[derive(Error, Debug)]
pub enum GitError {
    #[error("Failed to spawn git {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git {command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("git {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
}

/// 提交消息中除改进本身以外的字段
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommitMetadata {
    pub generation: u32,
    pub before_score: f64,
    /// 提交时往往还不知道实际效果
    pub actual_impact: Option<f64>,
}

/// 从 git log 解析出的一条进化提交
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub hash: String,
    pub date: String,
    pub kind: String,
    pub tool: String,
    pub generation: Option<u32>,
}

#[async_trait]
pub trait VersionControl: Send + Sync {
    async fn create_backup_branch(&self) -> Result<String, GitError>;

    async fn create_improvement_branch(&self, generation: u32) -> Result<String, GitError>;

    async fn commit_improvement(
        &self,
        improvement: &Improvement,
        metadata: &CommitMetadata,
    ) -> Result<String, GitError>;

    async fn revert_last_commit(&self) -> Result<String, GitError>;

    async fn tag_generation(&self, generation: u32, score: f64) -> Result<String, GitError>;

    async fn get_improvement_history(&self, limit: usize) -> Result<Vec<HistoryEntry>, GitError>;
}

/// 固定的提交消息模板（外部工具会解析历史，格式不可随意改动）
pub fn format_commit_message(improvement: &Improvement, metadata: &CommitMetadata) -> String {
    let actual = metadata
        .actual_impact
        .map(|v| format!("{:+.2}", v))
        .unwrap_or_else(|| "pending".to_string());
    let mut lines = vec![
        format!("[Evolution] {}: {}", improvement.kind, improvement.tool),
        String::new(),
        format!("Generation: {}", metadata.generation),
        format!("Expected impact: {:.2}", improvement.expected_impact),
        format!("Actual impact: {}", actual),
        format!("Rationale: {}", improvement.rationale),
    ];
    if let Some(field) = &improvement.field {
        lines.push(format!("Field: {}", field));
    }
    lines.push(String::new());
    lines.push("Before:".to_string());
    lines.push(improvement.current.clone());
    lines.push(String::new());
    lines.push("After:".to_string());
    lines.push(improvement.proposed.clone());
    lines.join("\n")
}

fn subject_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\[Evolution\] (\w+): (\S+)").expect("valid subject regex"))
}

fn generation_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^Generation: (\d+)").expect("valid generation regex"))
}

const FIELD_SEP: char = '\u{1f}';
const RECORD_SEP: char = '\u{1e}';

/// 解析 `git log --format=%H%x1f%aI%x1f%s%x1f%b%x1e` 的输出
pub fn parse_history(output: &str) -> Vec<HistoryEntry> {
    output
        .split(RECORD_SEP)
        .filter_map(|record| {
            let record = record.trim_start_matches('\n');
            let mut parts = record.splitn(4, FIELD_SEP);
            let hash = parts.next()?.trim();
            let date = parts.next()?.trim();
            let subject = parts.next()?.trim();
            let body = parts.next().unwrap_or("");
            let caps = subject_regex().captures(subject)?;
            Some(HistoryEntry {
                hash: hash.to_string(),
                date: date.to_string(),
                kind: caps[1].to_string(),
                tool: caps[2].to_string(),
                generation: generation_regex()
                    .captures(body)
                    .and_then(|c| c[1].parse().ok()),
            })
        })
        .collect()
}

/// 基于 git 命令行的实现
pub struct GitTracker {
    repo_root: PathBuf,
    timeout: Duration,
    branch_prefix: String,
    /// 提交时 add 的路径；为空时 add 全部修改
    tracked_paths: Vec<PathBuf>,
}

impl GitTracker {
    pub fn new(repo_root: impl AsRef<Path>) -> Self {
        Self {
            repo_root: repo_root.as_ref().to_path_buf(),
            timeout: Duration::from_secs(30),
            branch_prefix: "evolution".to_string(),
            tracked_paths: Vec::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_branch_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.branch_prefix = prefix.into();
        self
    }

    pub fn with_tracked_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.tracked_paths.push(path.into());
        self
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn improvement_branch_name(&self, generation: u32) -> String {
        format!("{}/gen-{}", self.branch_prefix, generation)
    }

    async fn git<I, S>(&self, args: I) -> Result<String, GitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let args: Vec<std::ffi::OsString> = args.into_iter().map(|a| a.as_ref().to_owned()).collect();
        let command = args
            .first()
            .map(|a| a.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut cmd = Command::new("git");
        cmd.args(&args).current_dir(&self.repo_root).kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(result) => result.map_err(|source| GitError::Spawn {
                command: command.clone(),
                source,
            })?,
            Err(_) => {
                return Err(GitError::Timeout {
                    command,
                    timeout: self.timeout,
                })
            }
        };

        if !output.status.success() {
            return Err(GitError::CommandFailed {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl VersionControl for GitTracker {
    async fn create_backup_branch(&self) -> Result<String, GitError> {
        let name = format!("evolution-backup-{}", Utc::now().format("%Y%m%d%H%M%S"));
        self.git(["branch", name.as_str()]).await?;
        tracing::info!(branch = %name, "backup branch created");
        Ok(name)
    }

    async fn create_improvement_branch(&self, generation: u32) -> Result<String, GitError> {
        let name = self.improvement_branch_name(generation);
        self.git(["checkout", "-B", name.as_str()]).await?;
        tracing::info!(branch = %name, generation, "improvement branch checked out");
        Ok(name)
    }

    async fn commit_improvement(
        &self,
        improvement: &Improvement,
        metadata: &CommitMetadata,
    ) -> Result<String, GitError> {
        if self.tracked_paths.is_empty() {
            self.git(["add", "-A"]).await?;
        } else {
            let mut args: Vec<std::ffi::OsString> = vec!["add".into(), "--".into()];
            args.extend(self.tracked_paths.iter().map(|p| p.as_os_str().to_owned()));
            self.git(args).await?;
        }
        let message = format_commit_message(improvement, metadata);
        self.git(["commit", "-m", message.as_str()]).await?;
        let hash = self.git(["rev-parse", "HEAD"]).await?;
        tracing::info!(
            commit = %hash,
            tool = %improvement.tool,
            generation = metadata.generation,
            "improvement committed"
        );
        Ok(hash)
    }

    async fn revert_last_commit(&self) -> Result<String, GitError> {
        self.git(["revert", "--no-edit", "HEAD"]).await?;
        let hash = self.git(["rev-parse", "HEAD"]).await?;
        tracing::warn!(commit = %hash, "last evolution commit reverted");
        Ok(hash)
    }

    async fn tag_generation(&self, generation: u32, score: f64) -> Result<String, GitError> {
        let tag = format!("evolution-gen-{}", generation);
        let message = format!("Generation {} best score {:.1}", generation, score);
        self.git(["tag", "-a", "-f", tag.as_str(), "-m", message.as_str()])
            .await?;
        tracing::info!(tag = %tag, score, "generation tagged");
        Ok(tag)
    }

    async fn get_improvement_history(&self, limit: usize) -> Result<Vec<HistoryEntry>, GitError> {
        let count = format!("-n{}", limit.max(1));
        let output = self
            .git([
                "log",
                count.as_str(),
                "--grep=^\\[Evolution\\]",
                "--format=%H%x1f%aI%x1f%s%x1f%b%x1e",
            ])
            .await?;
        Ok(parse_history(&output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evolution::types::ImprovementType;
    use tempfile::TempDir;

    fn improvement() -> Improvement {
        Improvement {
            id: "imp_1".into(),
            kind: ImprovementType::Parameter,
            tool: "create_paragraph_style".into(),
            field: Some("fontSize".into()),
            current: "Point size".into(),
            proposed: "Point size, measured from the reference".into(),
            rationale: "fontSize over reference in 3 runs".into(),
            expected_impact: 0.9,
            generation: 2,
        }
    }

    #[test]
    fn test_commit_message_template() {
        let msg = format_commit_message(
            &improvement(),
            &CommitMetadata {
                generation: 2,
                before_score: 65.0,
                actual_impact: None,
            },
        );
        let lines: Vec<&str> = msg.lines().collect();
        assert_eq!(lines[0], "[Evolution] parameter: create_paragraph_style");
        assert_eq!(lines[1], "");
        assert_eq!(lines[2], "Generation: 2");
        assert_eq!(lines[3], "Expected impact: 0.90");
        assert_eq!(lines[4], "Actual impact: pending");
        assert!(msg.contains("Field: fontSize"));
        assert!(msg.ends_with("After:\nPoint size, measured from the reference"));
    }

    #[test]
    fn test_parse_history() {
        let body = format_commit_message(
            &improvement(),
            &CommitMetadata {
                generation: 4,
                before_score: 0.0,
                actual_impact: Some(3.0),
            },
        );
        let (subject, rest) = body.split_once('\n').unwrap();
        let output = format!(
            "abc123\u{1f}2026-01-01T00:00:00+00:00\u{1f}{}\u{1f}{}\u{1e}\ndef456\u{1f}2026-01-01T00:00:00+00:00\u{1f}unrelated\u{1f}\u{1e}",
            subject, rest
        );
        let entries = parse_history(&output);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].hash, "abc123");
        assert_eq!(entries[0].kind, "parameter");
        assert_eq!(entries[0].tool, "create_paragraph_style");
        assert_eq!(entries[0].generation, Some(4));
    }

    async fn init_repo(dir: &Path) -> Option<GitTracker> {
        let tracker = GitTracker::new(dir).with_timeout(Duration::from_secs(10));
        tracker.git(["init", "-q"]).await.ok()?;
        tracker.git(["config", "user.email", "loop@example.com"]).await.ok()?;
        tracker.git(["config", "user.name", "loop"]).await.ok()?;
        tracker.git(["config", "commit.gpgsign", "false"]).await.ok()?;
        std::fs::write(dir.join("tools.json"), "{}").ok()?;
        tracker.git(["add", "-A"]).await.ok()?;
        tracker.git(["commit", "-q", "-m", "init"]).await.ok()?;
        Some(tracker)
    }

    #[tokio::test]
    async fn test_commit_tag_revert_history() {
        let dir = TempDir::new().unwrap();
        let Some(tracker) = init_repo(dir.path()).await else {
            eprintln!("git unavailable, skipping");
            return;
        };

        let backup = tracker.create_backup_branch().await.unwrap();
        assert!(backup.starts_with("evolution-backup-"));
        assert_eq!(tracker.create_improvement_branch(2).await.unwrap(), "evolution/gen-2");

        std::fs::write(dir.path().join("tools.json"), "{\"changed\":true}").unwrap();
        let hash = tracker
            .commit_improvement(
                &improvement(),
                &CommitMetadata {
                    generation: 2,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(hash.len(), 40);
        assert_eq!(tracker.tag_generation(2, 72.0).await.unwrap(), "evolution-gen-2");

        let history = tracker.get_improvement_history(10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].hash, hash);
        assert_eq!(history[0].generation, Some(2));

        let reverted = tracker.revert_last_commit().await.unwrap();
        assert_ne!(reverted, hash);
        assert_eq!(std::fs::read_to_string(dir.path().join("tools.json")).unwrap(), "{}");
    }

    #[tokio::test]
    async fn test_failure_is_reported_not_panicking() {
        let dir = TempDir::new().unwrap();
        let tracker = GitTracker::new(dir.path()).with_timeout(Duration::from_secs(10));
        match tracker.revert_last_commit().await {
            Err(GitError::CommandFailed { command, .. }) => assert_eq!(command, "revert"),
            Err(GitError::Spawn { .. }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }
}
