//! 优雅关闭
//!
//! 信号只取消 token，不强行中断：编排器在阶段边界检查取消，
//! 所以台账的每条记录、git 提交与回滚都是完整的；等待试验完成的轮询会立即返回。
//! 中断后可用 `tooltune run --resume` 从进度快照继续。

use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::Interrupt => write!(f, "interrupt"),
            ShutdownReason::Terminate => write!(f, "terminate signal"),
        }
    }
}

pub struct ShutdownManager {
    token: CancellationToken,
    /// 只记录第一次触发的原因
    reason: OnceLock<ShutdownReason>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: OnceLock::new(),
        }
    }

    /// 交给编排器（`EvolutionLoop::with_cancellation`）
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn trigger(&self, reason: ShutdownReason) {
        if self.reason.set(reason).is_ok() {
            tracing::info!(%reason, "stop requested, finishing the current step");
        }
        self.token.cancel();
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.get().copied()
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 安装 Ctrl+C 与 SIGTERM 处理器
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                manager.trigger(ShutdownReason::Interrupt);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        if sigterm.recv().await.is_some() {
                            manager.trigger(ShutdownReason::Terminate);
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "SIGTERM handler not installed"),
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_cancels_token() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(!manager.is_shutdown());
        assert_eq!(manager.reason(), None);

        manager.trigger(ShutdownReason::Interrupt);
        assert!(token.is_cancelled());
        assert!(manager.is_shutdown());
    }

    #[test]
    fn test_first_reason_wins() {
        let manager = ShutdownManager::new();
        manager.trigger(ShutdownReason::Terminate);
        manager.trigger(ShutdownReason::Interrupt);
        assert_eq!(manager.reason(), Some(ShutdownReason::Terminate));
        assert_eq!(manager.reason().map(|r| r.to_string()).as_deref(), Some("terminate signal"));
    }
}
