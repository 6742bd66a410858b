//! State machine configuration.

use crate::position::DEFAULT_MIN_HEALTH_FACTOR;
use crate::types::{Amount, Bps, Identity};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of events to retain in memory.
    pub max_events: usize,
    /// Administrator allowed to pause, retune and collect fees.
    pub owner: Identity,
    /// The only identity whose instructions are executed.
    pub authorized_executor: Identity,
    /// Health floor for positions that do not set their own.
    pub default_min_health_factor: Decimal,
    pub default_slippage: Bps,
    /// Hard ceiling on requested leverage, on top of the ltv-implied one.
    pub max_target_leverage: Decimal,
    pub max_iterations_cap: u32,
    /// Swap deadline, in blocks past the current height.
    pub swap_deadline_blocks: u64,
    /// Protocol fee accrued when a position opens, in native units.
    pub open_fee: Amount,
    /// Protocol fee accrued per applied step, in native units.
    pub step_fee: Amount,
    pub batch_execution_enabled: bool,
    pub max_batch_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_events: 100_000,
            owner: Identity(1),
            authorized_executor: Identity(2),
            default_min_health_factor: DEFAULT_MIN_HEALTH_FACTOR,
            default_slippage: Bps::new(50),
            max_target_leverage: dec!(10),
            max_iterations_cap: 20,
            swap_deadline_blocks: 3,
            open_fee: Amount::new(dec!(0.001)),
            step_fee: Amount::new(dec!(0.0002)),
            batch_execution_enabled: true,
            max_batch_size: 50,
        }
    }
}
