//! 核心层：错误分类、阶段状态机、优雅关闭

pub mod error;
pub mod shutdown;
pub mod state;

pub use error::EvolutionError;
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use state::EvolutionPhase;
