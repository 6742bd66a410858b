// 6.1: messages crossing the transport between the state machine and the
// decision engine. notifications flow in to the decision engine, instructions
// flow back out. delivery is best-effort and at-least-once in both directions.

use crate::events::PositionChangedEvent;
use crate::types::{Amount, AssetId, BlockHeight, Identity, PoolId, Price, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Signals consumed by the decision engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Notification {
    PositionChanged {
        event: PositionChangedEvent,
        height: BlockHeight,
    },
    ApprovalGranted {
        owner: UserId,
        token: AssetId,
        spender: Identity,
        amount: Amount,
        height: BlockHeight,
    },
    PriceSync {
        pool: PoolId,
        price: Price,
        height: BlockHeight,
    },
    Timer {
        height: BlockHeight,
    },
    LiquidationFailure {
        user: UserId,
        reason: String,
        height: BlockHeight,
    },
}

impl Notification {
    pub fn height(&self) -> BlockHeight {
        match self {
            Notification::PositionChanged { height, .. }
            | Notification::ApprovalGranted { height, .. }
            | Notification::PriceSync { height, .. }
            | Notification::Timer { height }
            | Notification::LiquidationFailure { height, .. } => *height,
        }
    }
}

/// What an instruction asks the state machine to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Action {
    LoopStep,
    UnwindStep,
    HealthCheck,
    TakeProfit,
    StopLoss,
    LiquidationResponse,
    AutoDeposit {
        collateral_asset: AssetId,
        amount: Amount,
        target_leverage: Decimal,
        max_iterations: u32,
    },
}

impl Action {
    /// Actions that move funds out of the loop and must carry the current
    /// execution salt when one is configured.
    pub fn is_sensitive(&self) -> bool {
        matches!(
            self,
            Action::UnwindStep | Action::TakeProfit | Action::StopLoss | Action::LiquidationResponse
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::LoopStep => "loop_step",
            Action::UnwindStep => "unwind_step",
            Action::HealthCheck => "health_check",
            Action::TakeProfit => "take_profit",
            Action::StopLoss => "stop_loss",
            Action::LiquidationResponse => "liquidation_response",
            Action::AutoDeposit { .. } => "auto_deposit",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub user: UserId,
    pub action: Action,
    /// Salt the decision engine last saw for this position.
    pub salt: Option<u64>,
    pub issued_at: BlockHeight,
}

impl Instruction {
    pub fn new(user: UserId, action: Action, salt: Option<u64>, issued_at: BlockHeight) -> Self {
        Self {
            user,
            action,
            salt,
            issued_at,
        }
    }
}

/// Stamped by the transport on delivery. never supplied by the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub verified_identity: Identity,
}

impl ExecutionContext {
    pub fn new(verified_identity: Identity) -> Self {
        Self { verified_identity }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensitive_actions() {
        assert!(Action::UnwindStep.is_sensitive());
        assert!(Action::StopLoss.is_sensitive());
        assert!(!Action::LoopStep.is_sensitive());
        assert!(!Action::HealthCheck.is_sensitive());
    }

    #[test]
    fn notification_height() {
        let n = Notification::Timer { height: BlockHeight(42) };
        assert_eq!(n.height(), BlockHeight(42));
    }
}
