//! Decision engine configuration.

use crate::types::{Amount, AssetId, Bps, Identity, PoolId};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Which collateral asset a price pool quotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolBinding {
    pub pool: PoolId,
    pub asset: AssetId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    pub owner: Identity,
    /// Spender identity of the state machine; approvals to anyone else are ignored.
    pub state_machine: Identity,
    /// Tokens eligible for approval-driven auto-deposit.
    pub tracked_tokens: Vec<AssetId>,
    pub dust_floor: Amount,
    pub default_leverage: Decimal,
    pub default_iterations: u32,
    pub target_tolerance: Bps,
    /// Pool move that triggers a trigger re-evaluation.
    pub price_deviation_threshold: Bps,
    pub pools: Vec<PoolBinding>,
    /// Minimum blocks between two instructions for the same user.
    pub min_height_delta: u64,
    pub finality_enabled: bool,
    pub finality_delay: u64,
    /// Unwinds from at least this leverage are critical.
    pub large_unwind_leverage: Decimal,
    pub staleness_enabled: bool,
    pub stale_block_limit: u64,
    /// Health checks per timer tick, stale ones first.
    pub sweep_batch_size: usize,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            owner: Identity(1),
            state_machine: Identity(3),
            tracked_tokens: Vec::new(),
            dust_floor: Amount::new(dec!(0.0001)),
            default_leverage: dec!(2),
            default_iterations: 5,
            target_tolerance: Bps::new(50),
            price_deviation_threshold: Bps::new(200),
            pools: Vec::new(),
            min_height_delta: 1,
            finality_enabled: false,
            finality_delay: 12,
            large_unwind_leverage: dec!(3),
            staleness_enabled: true,
            stale_block_limit: 100,
            sweep_batch_size: 20,
        }
    }
}

impl DecisionConfig {
    pub fn asset_for_pool(&self, pool: PoolId) -> Option<AssetId> {
        self.pools.iter().find(|b| b.pool == pool).map(|b| b.asset)
    }

    pub fn pool_for_asset(&self, asset: AssetId) -> Option<PoolId> {
        self.pools.iter().find(|b| b.asset == asset).map(|b| b.pool)
    }
}
