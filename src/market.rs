// 5.0 market.rs: adapter seams to the external lending market and swap venue.
// the engine only ever talks to these traits. failures come back as MarketError
// and are treated as recoverable signals, never panics.

use crate::types::{Amount, AssetId, BlockHeight, Bps, Price, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Aggregated account view from the lending market, in base currency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub total_collateral: Decimal,
    pub total_debt: Decimal,
    pub available_borrow: Decimal,
    /// Collateral-weighted liquidation threshold.
    pub liquidation_threshold: Decimal,
    /// Collateral-weighted loan-to-value limit.
    pub ltv: Decimal,
    /// `Decimal::MAX` with no debt.
    pub health_factor: Decimal,
}

impl AccountSnapshot {
    pub fn has_debt(&self) -> bool {
        self.total_debt > Decimal::ZERO
    }
}

/// Static risk parameters of one reserve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReserveParams {
    pub ltv: Decimal,
    pub liquidation_threshold: Decimal,
}

/// Annualized rates of one reserve, as fractions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReserveRates {
    pub supply_rate: Decimal,
    pub borrow_rate: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum MarketError {
    #[error("asset {0:?} is not listed")]
    UnknownAsset(AssetId),

    #[error("insufficient liquidity in {asset:?}: requested {requested}, available {available}")]
    InsufficientLiquidity {
        asset: AssetId,
        requested: Amount,
        available: Amount,
    },

    #[error("operation would leave account unhealthy")]
    HealthFactorTooLow,

    #[error("insufficient balance: requested {requested}, held {held}")]
    InsufficientBalance { requested: Amount, held: Amount },

    #[error("slippage: expected at least {min_out}, got {actual}")]
    Slippage { min_out: Amount, actual: Amount },

    #[error("swap deadline {0} passed")]
    DeadlineExpired(BlockHeight),

    #[error("no route from {from:?} to {to:?}")]
    NoRoute { from: AssetId, to: AssetId },

    #[error("flash loan repayment short: owed {owed}, offered {offered}")]
    FlashRepayShort { owed: Amount, offered: Amount },

    #[error("venue unavailable: {0}")]
    Unavailable(String),
}

/// Lending market consumed by the state machine. All accounting is per user:
/// the engine operates on the user's account on their behalf.
pub trait LendingMarket {
    fn supply(&mut self, user: UserId, asset: AssetId, amount: Amount) -> Result<(), MarketError>;

    /// Returns the amount actually withdrawn.
    fn withdraw(&mut self, user: UserId, asset: AssetId, amount: Amount) -> Result<Amount, MarketError>;

    fn borrow(&mut self, user: UserId, asset: AssetId, amount: Amount) -> Result<Amount, MarketError>;

    /// Repays up to `amount`; returns the amount applied to the debt.
    fn repay(&mut self, user: UserId, asset: AssetId, amount: Amount) -> Result<Amount, MarketError>;

    fn enable_collateral(&mut self, user: UserId, asset: AssetId) -> Result<(), MarketError>;

    /// Drops every allowance the engine holds over the user's tokens.
    fn revoke_allowances(&mut self, user: UserId) -> Result<(), MarketError>;

    fn account_snapshot(&self, user: UserId) -> Result<AccountSnapshot, MarketError>;

    fn collateral_balance(&self, user: UserId, asset: AssetId) -> Result<Amount, MarketError>;

    fn debt_balance(&self, user: UserId, asset: AssetId) -> Result<Amount, MarketError>;

    fn reserve_params(&self, asset: AssetId) -> Result<ReserveParams, MarketError>;

    fn reserve_rates(&self, asset: AssetId) -> Result<ReserveRates, MarketError>;

    fn asset_price(&self, asset: AssetId) -> Result<Price, MarketError>;

    fn available_liquidity(&self, asset: AssetId) -> Result<Amount, MarketError>;

    fn flash_premium(&self) -> Bps;

    /// Lends `amount` for the duration of one sequence.
    fn flash_borrow(&mut self, asset: AssetId, amount: Amount) -> Result<Amount, MarketError>;

    /// Closes the flash loan; `amount` must cover principal plus premium.
    fn flash_repay(&mut self, asset: AssetId, amount: Amount) -> Result<(), MarketError>;

    /// Abandons an open flash loan. the sequence reverts, so no premium is due.
    fn flash_revert(&mut self, asset: AssetId, amount: Amount);
}

/// A single-hop swap order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SwapRequest {
    pub from: AssetId,
    pub to: AssetId,
    pub amount_in: Amount,
    pub min_out: Amount,
    pub deadline: BlockHeight,
}

/// Swap venue consumed by the state machine.
pub trait SwapRouter {
    fn quote(&self, from: AssetId, to: AssetId, amount_in: Amount) -> Result<Amount, MarketError>;

    fn swap(&mut self, request: SwapRequest) -> Result<Amount, MarketError>;
}
