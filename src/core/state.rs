//! 状态定义：进化循环的阶段状态机
//!
//! Idle → PreparingGeneration → RunningAgents → Analyzing → ProposingImprovement
//! → Validating → {Committing | Reverting} → CheckingConvergence
//! → {Converged | MaxGenerationsReached} 或回到 PreparingGeneration。

use serde::{Deserialize, Serialize};

/// 编排器所处阶段（编排器独占，外部只读）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvolutionPhase {
    Idle,
    PreparingGeneration,
    RunningAgents,
    Analyzing,
    ProposingImprovement,
    Validating,
    Committing,
    Reverting,
    CheckingConvergence,
    Converged,
    MaxGenerationsReached,
}

impl EvolutionPhase {
    /// 终止态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EvolutionPhase::Converged | EvolutionPhase::MaxGenerationsReached
        )
    }

    /// 状态机允许的转换
    pub fn can_transition_to(&self, next: EvolutionPhase) -> bool {
        use EvolutionPhase::*;
        matches!(
            (self, next),
            (Idle, PreparingGeneration)
                | (PreparingGeneration, RunningAgents)
                | (RunningAgents, Analyzing)
                | (Analyzing, ProposingImprovement)
                // 没有符合阈值的模式：直接检查收敛
                | (Analyzing, CheckingConvergence)
                | (ProposingImprovement, Validating)
                // 无候选，或改进在验证前被拒绝
                | (ProposingImprovement, CheckingConvergence)
                | (Validating, Committing)
                | (Validating, Reverting)
                | (Committing, CheckingConvergence)
                | (Reverting, CheckingConvergence)
                | (CheckingConvergence, PreparingGeneration)
                | (CheckingConvergence, Converged)
                | (CheckingConvergence, MaxGenerationsReached)
        )
    }
}

impl std::fmt::Display for EvolutionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        use EvolutionPhase::*;
        let path = [
            Idle,
            PreparingGeneration,
            RunningAgents,
            Analyzing,
            ProposingImprovement,
            Validating,
            Committing,
            CheckingConvergence,
            PreparingGeneration,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_rejected_transitions() {
        use EvolutionPhase::*;
        assert!(!Idle.can_transition_to(Analyzing));
        assert!(!RunningAgents.can_transition_to(Committing));
        assert!(!Converged.can_transition_to(PreparingGeneration));
        assert!(!Validating.can_transition_to(CheckingConvergence));
    }

    #[test]
    fn test_terminal() {
        assert!(EvolutionPhase::Converged.is_terminal());
        assert!(EvolutionPhase::MaxGenerationsReached.is_terminal());
        assert!(!EvolutionPhase::CheckingConvergence.is_terminal());
    }
}
