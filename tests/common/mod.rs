//! Shared fixtures: a WETH/USDC market at 2000, a 30 bps router and the
//! identities the relay and the admin calls use.

#![allow(dead_code)]

use leverage_core::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

pub const WETH: AssetId = AssetId(1);
pub const USDC: AssetId = AssetId(2);
pub const WETH_POOL: PoolId = PoolId(1);

pub const OWNER: Identity = Identity(1);
pub const EXECUTOR: Identity = Identity(2);
pub const STATE_MACHINE: Identity = Identity(3);

pub type Machine = PositionStateMachine<MockLendingMarket, MockSwapRouter>;

pub fn market() -> MockLendingMarket {
    MockLendingMarket::new()
        .with_reserve(WETH, dec!(2000), dec!(0.8), dec!(0.85), dec!(10_000))
        .with_reserve(USDC, dec!(1), dec!(0.8), dec!(0.85), dec!(50_000_000))
}

pub fn router() -> MockSwapRouter {
    MockSwapRouter::default()
        .with_price(WETH, dec!(2000))
        .with_price(USDC, dec!(1))
}

pub fn machine_with(config: EngineConfig, risk: RiskParams) -> Machine {
    PositionStateMachine::new(config, risk, market(), router())
}

pub fn machine() -> Machine {
    machine_with(EngineConfig::default(), RiskParams::default())
}

pub fn decision_config() -> DecisionConfig {
    DecisionConfig {
        state_machine: STATE_MACHINE,
        tracked_tokens: vec![WETH],
        pools: vec![PoolBinding {
            pool: WETH_POOL,
            asset: WETH,
        }],
        ..DecisionConfig::default()
    }
}

pub fn decision() -> ReactiveDecisionEngine {
    ReactiveDecisionEngine::new(decision_config())
}

pub fn ctx() -> ExecutionContext {
    ExecutionContext::new(EXECUTOR)
}

/// Moves the price on the market and the router together.
pub fn set_weth_price(sm: &mut Machine, price: Decimal) {
    sm.market_mut().set_price(WETH, price);
    sm.router_mut().set_price(WETH, price);
}

pub fn open_weth_usdc(sm: &mut Machine, user: UserId, amount: Decimal, target: Decimal) {
    sm.open(user, OpenRequest::new(WETH, USDC, Amount::new(amount), target, 5))
        .unwrap();
}

/// Applies loop steps until the position leaves Looping.
pub fn drive_loop(sm: &mut Machine, user: UserId) -> Vec<StepOutcome> {
    let mut outcomes = Vec::new();
    for _ in 0..20 {
        if sm.position(user).map(|p| p.state) != Some(PositionState::Looping) {
            break;
        }
        outcomes.push(sm.apply_loop_step(user).unwrap());
        sm.advance_height(1);
    }
    outcomes
}

/// Applies unwind steps until the position is gone.
pub fn drive_unwind(sm: &mut Machine, user: UserId) -> Vec<StepOutcome> {
    let mut outcomes = Vec::new();
    for _ in 0..20 {
        if sm.position(user).is_none() {
            break;
        }
        outcomes.push(sm.apply_unwind_step(user).unwrap());
        sm.advance_height(1);
    }
    outcomes
}

pub fn count_events(sm: &Machine, matches: impl Fn(&EventPayload) -> bool) -> usize {
    sm.events().iter().filter(|e| matches(&e.payload)).count()
}
