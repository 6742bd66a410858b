//! Leverage loop simulation.
//!
//! Runs the state machine and the decision engine against the in-memory
//! market through the mocked relay: looping to target, flash entry, batched
//! execution with a failing user, a circuit breaker trip, take-profit on a
//! price sync, and fee bridging.

use std::error::Error;

use chrono::Utc;
use leverage_core::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::Level;
use tracing_subscriber::EnvFilter;

const WETH: AssetId = AssetId(1);
const USDC: AssetId = AssetId(2);
const WETH_POOL: PoolId = PoolId(1);

const OWNER: Identity = Identity(1);
const EXECUTOR: Identity = Identity(2);

type Machine = PositionStateMachine<MockLendingMarket, MockSwapRouter>;

fn main() -> Result<(), Box<dyn Error>> {
    init_logging()?;

    println!("Leverage Loop Core Simulation");
    println!("WETH collateral, USDC debt, reactive execution\n");

    scenario_1_loop_to_target()?;
    scenario_2_flash_entry()?;
    scenario_3_batch_isolation()?;
    scenario_4_circuit_breaker()?;
    scenario_5_take_profit()?;
    scenario_6_fee_bridge()?;

    println!("\nAll simulations completed successfully.");
    Ok(())
}

/// RUST_LOG wins; otherwise info. Logs go to stderr so the report stays readable.
fn init_logging() -> Result<(), Box<dyn Error>> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::default().add_directive(Level::INFO.into()),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
    Ok(())
}

fn setup() -> (Machine, ReactiveDecisionEngine, Relay) {
    let config = ProtocolConfig::default();
    let market = MockLendingMarket::new()
        .with_reserve(WETH, dec!(2000), dec!(0.8), dec!(0.85), dec!(10_000))
        .with_reserve(USDC, dec!(1), dec!(0.8), dec!(0.85), dec!(50_000_000));
    let router = MockSwapRouter::default()
        .with_price(WETH, dec!(2000))
        .with_price(USDC, dec!(1));
    let sm = PositionStateMachine::new(config.engine, config.risk, market, router);

    let decision = ReactiveDecisionEngine::new(DecisionConfig {
        tracked_tokens: vec![WETH],
        pools: vec![PoolBinding {
            pool: WETH_POOL,
            asset: WETH,
        }],
        ..config.decision
    });
    (sm, decision, Relay::new(EXECUTOR))
}

fn set_weth_price(sm: &mut Machine, price: Decimal) {
    sm.market_mut().set_price(WETH, price);
    sm.router_mut().set_price(WETH, price);
}

fn describe(sm: &Machine, user: UserId) {
    match sm.position(user) {
        Some(p) => println!(
            "  {:?}: {} at {}, HF {}, {} iterations",
            user,
            p.state,
            p.current_leverage,
            p.last_health_factor.round_dp(4),
            p.current_iteration
        ),
        None => println!("  {:?}: closed", user),
    }
}

/// Open, let the reactive loop reach 2x, then unwind to a close.
fn scenario_1_loop_to_target() -> Result<(), Box<dyn Error>> {
    println!("Scenario 1: Loop To Target And Unwind\n");
    let (mut sm, mut decision, mut relay) = setup();
    let alice = UserId(1);

    sm.open(alice, OpenRequest::new(WETH, USDC, Amount::new(dec!(1)), dec!(2), 5))?;
    let report = relay.pump(&mut sm, &mut decision, 20);
    println!("  Looping took {} rounds, {} steps landed", report.rounds, report.succeeded());
    describe(&sm, alice);

    sm.request_unwind(alice)?;
    let report = relay.pump(&mut sm, &mut decision, 20);
    println!("  Unwind took {} rounds", report.rounds);
    describe(&sm, alice);
    println!("  Allowances revoked: {}\n", sm.market().allowances_revoked(alice));
    Ok(())
}

/// A flash loan reaches the target in one step.
fn scenario_2_flash_entry() -> Result<(), Box<dyn Error>> {
    println!("Scenario 2: Flash Loan Entry\n");
    let (mut sm, mut decision, mut relay) = setup();
    let bob = UserId(2);

    let request = OpenRequest::new(WETH, USDC, Amount::new(dec!(2)), dec!(3), 5).with_flash_loan();
    sm.open(bob, request)?;
    relay.pump(&mut sm, &mut decision, 10);
    describe(&sm, bob);
    println!("  Flash outstanding: {}\n", sm.market().flash_outstanding(USDC));
    Ok(())
}

/// One failing user never blocks the rest of a batch.
fn scenario_3_batch_isolation() -> Result<(), Box<dyn Error>> {
    println!("Scenario 3: Batch With A Failing User\n");
    let (mut sm, _, _) = setup();
    let users: Vec<UserId> = (1..=5).map(UserId).collect();
    for user in &users {
        sm.open(*user, OpenRequest::new(WETH, USDC, Amount::new(dec!(1)), dec!(2), 5))?;
    }
    sm.market_mut().fail_user(UserId(3));

    let instructions: Vec<Instruction> = users
        .iter()
        .map(|u| Instruction::new(*u, Action::LoopStep, None, sm.height()))
        .collect();
    let summary = BatchExecutor::new().execute(&mut sm, &ExecutionContext::new(EXECUTOR), &instructions)?;
    println!("  Batch: {} total, {} ok, {} failed", summary.total, summary.success, summary.fail);
    for item in summary.items.iter().filter(|i| i.result.is_err()) {
        println!("  {:?} failed: {:?}", item.user, item.result);
    }
    println!();
    Ok(())
}

/// A sharp move between two steps trips the breaker before any funds move.
fn scenario_4_circuit_breaker() -> Result<(), Box<dyn Error>> {
    println!("Scenario 4: Circuit Breaker\n");
    let (mut sm, mut decision, mut relay) = setup();
    let carol = UserId(3);

    sm.open(carol, OpenRequest::new(WETH, USDC, Amount::new(dec!(1)), dec!(2), 5))?;
    set_weth_price(&mut sm, dec!(1700));
    relay.pump(&mut sm, &mut decision, 5);
    describe(&sm, carol);

    sm.reset_emergency(carol)?;
    println!("  After reset at the new price:");
    describe(&sm, carol);
    println!();
    Ok(())
}

/// A price sync above the take-profit level unwinds the position.
fn scenario_5_take_profit() -> Result<(), Box<dyn Error>> {
    println!("Scenario 5: Take Profit On Price Sync\n");
    let (mut sm, mut decision, mut relay) = setup();
    let dave = UserId(4);

    sm.open(dave, OpenRequest::new(WETH, USDC, Amount::new(dec!(1)), dec!(2), 5))?;
    relay.pump(&mut sm, &mut decision, 20);
    sm.set_risk_triggers(dave, Price::new(dec!(2200)), Price::new(dec!(1500)))?;
    relay.pump(&mut sm, &mut decision, 5);
    describe(&sm, dave);

    let seed = price_sync(WETH_POOL, Price::new_unchecked(dec!(2000)), sm.height());
    relay.relay(&mut sm, &mut decision, &seed);

    set_weth_price(&mut sm, dec!(2300));
    let spike = price_sync(WETH_POOL, Price::new_unchecked(dec!(2300)), sm.height());
    let deliveries = relay.relay(&mut sm, &mut decision, &spike);
    for d in &deliveries {
        println!("  {} -> {:?}", d.instruction.action, d.result);
    }
    relay.pump(&mut sm, &mut decision, 20);
    describe(&sm, dave);
    println!();
    Ok(())
}

/// Protocol fees flow to the bridge and on to the executor account.
fn scenario_6_fee_bridge() -> Result<(), Box<dyn Error>> {
    println!("Scenario 6: Fee Bridge\n");
    let (mut sm, mut decision, mut relay) = setup();
    for user in (10..20).map(UserId) {
        sm.open(user, OpenRequest::new(WETH, USDC, Amount::new(dec!(1)), dec!(2), 5))?;
    }
    relay.pump(&mut sm, &mut decision, 20);

    let mut bridge = FundingBridge::new(BridgeConfig {
        bridge_threshold: Amount::new(dec!(0.001)),
        gas_reserve: Amount::new(dec!(0.005)),
        ..BridgeConfig::default()
    });
    let fees = sm.collect_fees(OWNER)?;
    let due = bridge.receive_fee(fees);
    println!("  Collected {} in fees, bridge due: {}", fees, due);

    let mut rail = MockBridgeRail {
        fail_structured: true,
        ..MockBridgeRail::default()
    };
    match bridge.cover_debt(&mut rail, sm.height(), Utc::now())? {
        Some(receipt) => println!("  Bridged {} (fallback: {})", receipt.amount, receipt.fallback),
        None => println!("  Nothing to bridge"),
    }
    println!("  Bridge balance: {}, total bridged: {}", bridge.balance(), bridge.ledger().total_bridged);
    Ok(())
}
