// 8.0.2: result types and errors for state machine operations.

use crate::events::StepPhase;
use crate::leverage::LeverageError;
use crate::market::MarketError;
use crate::position::PositionState;
use crate::risk::RiskViolation;
use crate::types::{Amount, AssetId, BlockHeight, Identity, Leverage, Price, UserId};
use rust_decimal::Decimal;

/// What a step or instruction did. Safety trips are outcomes, not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Opened {
        user: UserId,
    },
    Applied {
        leverage: Leverage,
        health_factor: Decimal,
        state: PositionState,
    },
    Deferred {
        next_eligible: BlockHeight,
    },
    TargetReached,
    IterationCapReached,
    /// No borrow headroom or liquidity left for another iteration.
    CapacityExhausted,
    GasBudgetExhausted,
    SkippedUnprofitable,
    CircuitBreakerTripped {
        asset: AssetId,
    },
    /// A leg failed and was unwound locally.
    Recovered {
        phase: StepPhase,
    },
    /// Unwind has no withdrawal room left at any permitted floor.
    Stalled,
    Checked {
        health_factor: Decimal,
        leverage: Leverage,
    },
    Closed {
        collateral_returned: Amount,
        borrow_refund: Amount,
    },
}

impl StepOutcome {
    pub fn is_closed(&self) -> bool {
        matches!(self, StepOutcome::Closed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("position for {0:?} already exists")]
    PositionExists(UserId),

    #[error("position for {0:?} not found")]
    PositionNotFound(UserId),

    #[error("amount must be positive")]
    ZeroAmount,

    #[error("target leverage {requested} outside (1, {max})")]
    InvalidLeverage { requested: Decimal, max: Decimal },

    #[error("max iterations {requested} outside 1..={max}")]
    InvalidIterations { requested: u32, max: u32 },

    #[error("health factor floor {0} must exceed 1")]
    InvalidHealthFactor(Decimal),

    #[error("{action} not allowed for {user:?} in state {state}")]
    InvalidState {
        user: UserId,
        state: PositionState,
        action: &'static str,
    },

    #[error("take profit {take_profit} must exceed stop loss {stop_loss}")]
    InvalidTriggers { take_profit: Price, stop_loss: Price },

    #[error("{trigger} trigger not met: trigger {trigger_price}, observed {observed}")]
    TriggerNotMet {
        trigger: &'static str,
        trigger_price: Price,
        observed: Price,
    },

    #[error("{trigger} trigger not set for {user:?}")]
    TriggerNotSet { user: UserId, trigger: &'static str },

    #[error("leverage {0} not unwound")]
    NotUnwound(Leverage),

    #[error("health factor {health_factor} below floor {floor}")]
    Unhealthy { health_factor: Decimal, floor: Decimal },

    #[error("identity {0} is not the authorized executor")]
    UnauthorizedExecutor(Identity),

    #[error("identity {0} is not the owner")]
    NotOwner(Identity),

    #[error("protocol is paused")]
    Paused,

    #[error("batch execution is disabled")]
    BatchDisabled,

    #[error("batch of {size} exceeds limit {max}")]
    BatchTooLarge { size: usize, max: usize },

    #[error("risk: {0}")]
    Risk(#[from] RiskViolation),

    #[error("market: {0}")]
    Market(#[from] MarketError),

    #[error("arithmetic: {0}")]
    Leverage(#[from] LeverageError),
}
