//! Tooltune - 工具定义自我调优循环
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、阶段状态机、优雅关闭
//! - **evolution**: 模式挖掘、改进提案与应用、回归验证、台账、版本追踪、监控与编排
//! - **observability**: 日志初始化
//! - **telemetry**: 试验会话的工具调用遥测
//! - **tools**: 工具注册表、遥测装饰器、结构化工具定义

pub mod config;
pub mod core;
pub mod evolution;
pub mod observability;
pub mod telemetry;
pub mod tools;

pub use evolution::{EvolutionConfig, EvolutionLoop};
