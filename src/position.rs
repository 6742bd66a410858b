//! Leveraged position model and its state machine table.
//!
//! A position is one user's looped supply/borrow exposure in a single
//! collateral/borrow asset pair. The struct only records what the ledger
//! decided; every live quantity (collateral, debt, health) is re-read from the
//! lending market on each step.

use crate::types::{Amount, AssetId, BlockHeight, Bps, Leverage, Price, UserId};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionState {
    /// Holding. target reached, cap hit, budget exhausted, or freshly reset.
    Idle,
    /// Borrow -> convert -> re-supply steps pending.
    Looping,
    /// Withdraw -> convert -> repay steps pending, user or trigger initiated.
    Unwinding,
    /// Safety trip. looping halted, unwinding allowed.
    Emergency,
}

impl PositionState {
    /// Allowed edges: Idle->{Looping, Unwinding}, Looping->{Idle, Emergency},
    /// Unwinding->{Idle}, any->Emergency, Emergency->Idle.
    pub fn can_transition_to(&self, next: PositionState) -> bool {
        use PositionState::*;
        if next == Emergency {
            return true;
        }
        matches!(
            (self, next),
            (Idle, Looping) | (Idle, Unwinding) | (Looping, Idle) | (Unwinding, Idle) | (Emergency, Idle)
        )
    }

    pub fn is_unwinding(&self) -> bool {
        matches!(self, PositionState::Unwinding | PositionState::Emergency)
    }
}

impl fmt::Display for PositionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PositionState::Idle => "IDLE",
            PositionState::Looping => "LOOPING",
            PositionState::Unwinding => "UNWINDING",
            PositionState::Emergency => "EMERGENCY",
        };
        f.write_str(s)
    }
}

/// Parameters for opening a position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRequest {
    pub collateral_asset: AssetId,
    /// `None` loops the collateral asset against itself.
    pub borrow_asset: Option<AssetId>,
    pub amount: Amount,
    pub target_leverage: Decimal,
    pub max_iterations: u32,
    pub use_flash_loan: bool,
    /// Overrides the engine default when set.
    pub min_health_factor: Option<Decimal>,
    pub slippage_tolerance: Option<Bps>,
}

impl OpenRequest {
    pub fn new(
        collateral_asset: AssetId,
        borrow_asset: AssetId,
        amount: Amount,
        target_leverage: Decimal,
        max_iterations: u32,
    ) -> Self {
        Self {
            collateral_asset,
            borrow_asset: Some(borrow_asset),
            amount,
            target_leverage,
            max_iterations,
            use_flash_loan: false,
            min_health_factor: None,
            slippage_tolerance: None,
        }
    }

    pub fn same_asset(collateral_asset: AssetId, amount: Amount, target_leverage: Decimal, max_iterations: u32) -> Self {
        Self {
            borrow_asset: None,
            ..Self::new(collateral_asset, collateral_asset, amount, target_leverage, max_iterations)
        }
    }

    pub fn with_flash_loan(mut self) -> Self {
        self.use_flash_loan = true;
        self
    }

    pub fn with_min_health_factor(mut self, hf: Decimal) -> Self {
        self.min_health_factor = Some(hf);
        self
    }

    pub fn with_slippage(mut self, slippage: Bps) -> Self {
        self.slippage_tolerance = Some(slippage);
        self
    }

    pub fn is_same_asset(&self) -> bool {
        self.borrow_asset.map_or(true, |b| b == self.collateral_asset)
    }
}

/// A user's leveraged position as recorded by the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub user: UserId,
    pub collateral_asset: AssetId,
    pub borrow_asset: AssetId,
    pub initial_collateral: Amount,
    pub target_leverage: Leverage,
    pub current_leverage: Leverage,
    pub max_iterations: u32,
    pub current_iteration: u32,
    pub min_health_factor: Decimal,
    pub slippage_tolerance: Bps,
    pub state: PositionState,
    pub last_update_height: BlockHeight,
    pub use_flash_loan: bool,
    pub same_asset_loop: bool,
    pub max_gas_spend: Option<Amount>,
    pub gas_spent: Amount,
    pub twap_min_interval: Option<u64>,
    pub execution_salt: Option<u64>,
    pub take_profit_price: Option<Price>,
    pub stop_loss_price: Option<Price>,
    pub opened_at: BlockHeight,
    pub last_health_factor: Decimal,
    pub unwind_steps: u32,
    // tokens stranded by a failed recovery or left after the last repayment,
    // refunded on finalize
    pub residual_borrow: Amount,
    pub residual_collateral: Amount,
}

impl Position {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user: UserId,
        collateral_asset: AssetId,
        borrow_asset: AssetId,
        initial_collateral: Amount,
        target_leverage: Leverage,
        max_iterations: u32,
        min_health_factor: Decimal,
        slippage_tolerance: Bps,
        use_flash_loan: bool,
        height: BlockHeight,
    ) -> Self {
        Self {
            user,
            collateral_asset,
            borrow_asset,
            initial_collateral,
            target_leverage,
            current_leverage: Leverage::ONE,
            max_iterations,
            current_iteration: 0,
            min_health_factor,
            slippage_tolerance,
            state: PositionState::Looping,
            last_update_height: height,
            use_flash_loan,
            same_asset_loop: collateral_asset == borrow_asset,
            max_gas_spend: None,
            gas_spent: Amount::zero(),
            twap_min_interval: None,
            execution_salt: None,
            take_profit_price: None,
            stop_loss_price: None,
            opened_at: height,
            last_health_factor: Decimal::MAX,
            unwind_steps: 0,
            residual_borrow: Amount::zero(),
            residual_collateral: Amount::zero(),
        }
    }

    pub fn iterations_exhausted(&self) -> bool {
        self.current_iteration >= self.max_iterations
    }

    pub fn below_health_floor(&self, health_factor: Decimal) -> bool {
        health_factor < self.min_health_factor
    }

    // remaining gas allowance, None when unlimited
    pub fn gas_remaining(&self) -> Option<Amount> {
        self.max_gas_spend.map(|cap| cap.saturating_sub(self.gas_spent))
    }
}

/// Default health-factor floor for new positions.
pub const DEFAULT_MIN_HEALTH_FACTOR: Decimal = dec!(1.15);
