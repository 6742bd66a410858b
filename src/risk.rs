//! Risk guards applied around every automated step.
//!
//! Circuit breaker, gas budget, profitability gate, execution-salt replay
//! guard and TWAP pacing. None of these revert a step on their own: they
//! return a verdict and the state machine turns it into a state transition
//! or a skip.

use crate::position::Position;
use crate::types::{Amount, AssetId, BlockHeight, Bps, Price, UserId};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Risk parameters and feature toggles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskParams {
    pub circuit_breaker_enabled: bool,
    /// Max move of either leg between two checks before tripping.
    pub circuit_breaker_threshold: Bps,
    pub profitability_check_enabled: bool,
    /// Annualized net yield the loop must clear, as a fraction.
    pub profitability_margin: Decimal,
    /// Haircut applied to the ltv limit when sizing a borrow.
    pub safety_buffer: Bps,
    /// How close to target counts as "reached".
    pub target_tolerance: Bps,
    /// Estimated execution cost of one step, in native units.
    pub gas_per_step: Amount,
    /// Estimated execution cost of a flash sequence.
    pub gas_per_flash_step: Amount,
    /// Health floor used by unwinds when the position's own floor leaves no room.
    pub unwind_health_floor: Decimal,
}

impl Default for RiskParams {
    fn default() -> Self {
        Self {
            circuit_breaker_enabled: true,
            circuit_breaker_threshold: Bps::new(1_000),
            profitability_check_enabled: false,
            profitability_margin: dec!(0.005),
            safety_buffer: Bps::new(500),
            target_tolerance: Bps::new(50),
            gas_per_step: Amount::new(dec!(0.002)),
            gas_per_flash_step: Amount::new(dec!(0.006)),
            unwind_health_floor: dec!(1.02),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum RiskViolation {
    #[error("execution salt mismatch for {user:?}: possible replay")]
    ReplayDetected { user: UserId },

    #[error("execution salt required for {user:?}")]
    MissingSalt { user: UserId },
}

/// Details of a circuit-breaker trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerTrip {
    pub asset: AssetId,
    pub previous: Price,
    pub current: Price,
    pub deviation_bps: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GasCheck {
    Within,
    Exhausted { spent: Amount, budget: Amount },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProfitCheck {
    pub profitable: bool,
    pub expected_yield: Decimal,
    pub borrow_cost: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct LegBaseline {
    collateral: Option<(AssetId, Price)>,
    borrow: Option<(AssetId, Price)>,
}

/// Per-position risk state owned by the state machine.
#[derive(Debug, Clone)]
pub struct RiskGuard {
    pub params: RiskParams,
    baselines: HashMap<UserId, LegBaseline>,
}

impl RiskGuard {
    pub fn new(params: RiskParams) -> Self {
        Self {
            params,
            baselines: HashMap::new(),
        }
    }

    /// Compares both legs against the last tracked prices and re-baselines.
    /// The first observation of a leg never trips.
    pub fn check_circuit_breaker(
        &mut self,
        user: UserId,
        collateral: (AssetId, Price),
        borrow: (AssetId, Price),
    ) -> Option<CircuitBreakerTrip> {
        let previous = self.baselines.insert(
            user,
            LegBaseline {
                collateral: Some(collateral),
                borrow: Some(borrow),
            },
        );
        if !self.params.circuit_breaker_enabled {
            return None;
        }
        let previous = previous?;
        let threshold = Decimal::from(self.params.circuit_breaker_threshold.value());

        [(previous.collateral, collateral), (previous.borrow, borrow)]
            .into_iter()
            .filter_map(|(before, (asset, now))| {
                let (_, before) = before.filter(|(a, _)| *a == asset)?;
                let deviation_bps = now.deviation_bps(before);
                (deviation_bps > threshold).then_some(CircuitBreakerTrip {
                    asset,
                    previous: before,
                    current: now,
                    deviation_bps,
                })
            })
            .max_by(|a, b| a.deviation_bps.cmp(&b.deviation_bps))
    }

    pub fn has_baseline(&self, user: UserId) -> bool {
        self.baselines.contains_key(&user)
    }

    pub fn forget(&mut self, user: UserId) {
        self.baselines.remove(&user);
    }

    /// Whether one more step of cost `estimate` fits the position's budget.
    pub fn check_gas_budget(&self, position: &Position, estimate: Amount) -> GasCheck {
        match position.max_gas_spend {
            Some(budget) if position.gas_spent.add(estimate) > budget => GasCheck::Exhausted {
                spent: position.gas_spent,
                budget,
            },
            _ => GasCheck::Within,
        }
    }

    /// supply_rate * L >= borrow_rate * (L - 1) + margin
    pub fn check_profitability(&self, supply_rate: Decimal, borrow_rate: Decimal, leverage: Decimal) -> ProfitCheck {
        let expected_yield = supply_rate * leverage;
        let borrow_cost = borrow_rate * (leverage - Decimal::ONE) + self.params.profitability_margin;
        ProfitCheck {
            profitable: !self.params.profitability_check_enabled || expected_yield >= borrow_cost,
            expected_yield,
            borrow_cost,
        }
    }

    /// Next block at which a paced position may loop again, if it is too early now.
    pub fn twap_wait(&self, position: &Position, height: BlockHeight) -> Option<BlockHeight> {
        let interval = position.twap_min_interval.filter(|i| *i > 0)?;
        if position.current_iteration == 0 {
            return None;
        }
        let next = position.last_update_height.advance(interval);
        (height < next).then_some(next)
    }
}

/// Checks the salt carried by a sensitive instruction against the position's.
pub fn verify_salt(user: UserId, expected: Option<u64>, presented: Option<u64>) -> Result<(), RiskViolation> {
    match (expected, presented) {
        (None, _) => Ok(()),
        (Some(_), None) => Err(RiskViolation::MissingSalt { user }),
        (Some(e), Some(p)) if e == p => Ok(()),
        (Some(_), Some(_)) => Err(RiskViolation::ReplayDetected { user }),
    }
}

/// Deterministic salt rotation (splitmix64 over salt and height).
pub fn rotate_salt(salt: u64, height: BlockHeight) -> u64 {
    let mut z = salt ^ height.value().wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    let rotated = z ^ (z >> 31);
    // zero means "disabled" on the wire
    if rotated == 0 {
        1
    } else {
        rotated
    }
}
