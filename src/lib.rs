// leverage-core: autonomous leverage-loop engine.
// solvency-first architecture: every step re-reads live health from the
// lending market and the risk guard runs before any funds move.
// all computation is deterministic; markets, swaps, transport and the bridge
// rail sit behind traits with in-memory mocks.
//
// file map (search X.0 for structs, X.1+ for logic):
//   1.x  types.rs: primitives: UserId, BlockHeight, Amount, Price, Leverage, Bps
//   2.x  leverage.rs: sizing and ratio maths, 18-dp, overflow checked
//   3.x  position.rs: position struct, state table, open requests
//   4.x  risk.rs: circuit breaker, gas budget, profitability, salts, TWAP
//   5.0  market.rs: lending market and swap router seams
//   5.1  mock.rs: in-memory market, router and bridge rail (mocked)
//   6.0  events.rs: state transition events, PositionChanged feeds the relay
//   6.1  instruction.rs: notifications in, instructions out
//   7.x  config.rs: protocol config bundle, env presets, validation
//   8.x  engine/: position state machine: open, loop, unwind, flash, admin
//   8.5  batch.rs: multi-user execution with failure isolation
//   9.x  decision/: reactive decision engine, registry, finality, pacing
//   10.x funding.rs: fee ledger and bridge to the executor account
//   11.x relay.rs: transport between the two halves (mocked)

// core modules
pub mod engine;
pub mod events;
pub mod leverage;
pub mod position;
pub mod types;

// risk and safety modules
pub mod risk;

// reactive side
pub mod batch;
pub mod decision;
pub mod instruction;

// integration modules
pub mod config;
pub mod funding;
pub mod market;
pub mod mock;
pub mod relay;

// re exports for convenience
pub use engine::*;
pub use events::*;
pub use leverage::*;
pub use market::*;
pub use position::*;
pub use risk::*;
pub use types::*;
pub use batch::{BatchExecutor, BatchItem, BatchSummary};
pub use config::{ConfigError, Environment, ProtocolConfig};
pub use decision::{DecisionConfig, DecisionError, PoolBinding, ReactiveDecisionEngine};
pub use funding::{BridgeConfig, BridgeRail, BridgeReceipt, FundingBridge, FundingError, FundingLedger, RailError};
pub use instruction::{Action, ExecutionContext, Instruction, Notification};
pub use mock::{MockBridgeRail, MockLendingMarket, MockSwapRouter};
pub use relay::{price_sync, timer, Delivery, PumpReport, Relay};
