// 6.0: every state change produces an event. the relay turns PositionChanged
// into notifications for the decision engine; everything else is audit trail
// and diagnostics. the EventPayload enum lists all event types.

use crate::position::PositionState;
use crate::types::{Amount, AssetId, BlockHeight, Bps, Identity, Leverage, Price, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub u64);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub height: BlockHeight,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(id: EventId, height: BlockHeight, payload: EventPayload) -> Self {
        Self { id, height, payload }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    // Lifecycle
    PositionCreated(PositionCreatedEvent),
    PositionChanged(PositionChangedEvent),
    PositionClosed(PositionClosedEvent),
    RiskTriggersUpdated(RiskTriggersUpdatedEvent),

    // Steps
    LoopStepApplied(LoopStepEvent),
    UnwindStepApplied(UnwindStepEvent),
    LoopStepDeferred(LoopStepDeferredEvent),
    StepRecovered(StepRecoveredEvent),
    UnwindStalled(UnwindStalledEvent),
    HealthChecked(HealthCheckedEvent),

    // Safety
    EmergencyStop(EmergencyStopEvent),
    CircuitBreakerTripped(CircuitBreakerEvent),
    GasBudgetExceeded(GasBudgetEvent),
    LoopSkippedUnprofitable(UnprofitableEvent),
    TakeProfitTriggered(PriceTriggerEvent),
    StopLossTriggered(PriceTriggerEvent),

    // Execution and funding
    BatchExecuted(BatchExecutedEvent),
    FeeCollected(FeeCollectedEvent),
    FundsBridged(FundsBridgedEvent),

    // Admin
    Paused { by: Identity },
    Unpaused { by: Identity },
    ConfigUpdated { by: Identity, field: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionCreatedEvent {
    pub user: UserId,
    pub collateral_asset: AssetId,
    pub borrow_asset: AssetId,
    pub initial_collateral: Amount,
    pub target_leverage: Leverage,
    pub max_iterations: u32,
    pub use_flash_loan: bool,
}

/// The notification payload the decision engine reacts to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionChangedEvent {
    pub user: UserId,
    pub current_leverage: Leverage,
    pub target_leverage: Leverage,
    pub health_factor: Decimal,
    pub min_health_factor: Decimal,
    pub iteration: u32,
    pub max_iterations: u32,
    pub state: PositionState,
    pub collateral_asset: AssetId,
    pub execution_salt: Option<u64>,
    pub take_profit_price: Option<Price>,
    pub stop_loss_price: Option<Price>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionClosedEvent {
    pub user: UserId,
    pub collateral_returned: Amount,
    pub borrow_refund: Amount,
    pub loop_iterations: u32,
    pub unwind_steps: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskTriggersUpdatedEvent {
    pub user: UserId,
    pub take_profit_price: Option<Price>,
    pub stop_loss_price: Option<Price>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopStepEvent {
    pub user: UserId,
    pub iteration: u32,
    pub borrowed: Amount,
    pub supplied: Amount,
    pub leverage: Leverage,
    pub health_factor: Decimal,
    pub flash: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnwindStepEvent {
    pub user: UserId,
    pub withdrawn: Amount,
    pub repaid: Amount,
    pub leverage: Leverage,
    pub health_factor: Decimal,
    pub flash: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopStepDeferredEvent {
    pub user: UserId,
    pub next_eligible: BlockHeight,
}

/// Which leg of a step failed and was unwound locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepPhase {
    Borrow,
    Swap,
    Supply,
    Withdraw,
    Repay,
    FlashLoan,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecoveredEvent {
    pub user: UserId,
    pub phase: StepPhase,
    pub reason: String,
    // tokens that could not be restored to the market and are held for refund
    pub parked_borrow: Amount,
    pub parked_collateral: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnwindStalledEvent {
    pub user: UserId,
    pub health_factor: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckedEvent {
    pub user: UserId,
    pub health_factor: Decimal,
    pub leverage: Leverage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmergencyReason {
    UserRequested,
    HealthFactorBreach,
    CircuitBreaker,
    StopLoss,
    LiquidationThreat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyStopEvent {
    pub user: UserId,
    pub reason: EmergencyReason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerEvent {
    pub user: UserId,
    pub asset: AssetId,
    pub previous: Price,
    pub current: Price,
    pub deviation_bps: Decimal,
    pub threshold: Bps,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GasBudgetEvent {
    pub user: UserId,
    pub spent: Amount,
    pub budget: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnprofitableEvent {
    pub user: UserId,
    pub expected_yield: Decimal,
    pub borrow_cost: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceTriggerEvent {
    pub user: UserId,
    pub trigger_price: Price,
    pub observed_price: Price,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchExecutedEvent {
    pub total: usize,
    pub success: usize,
    pub fail: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeCollectedEvent {
    pub user: UserId,
    pub amount: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundsBridgedEvent {
    pub target: Identity,
    pub amount: Amount,
    pub fallback: bool,
}

/// Bounded in-memory event log with monotonically increasing ids.
#[derive(Debug)]
pub struct EventLog {
    events: Vec<Event>,
    next_id: u64,
    max_events: usize,
}

impl EventLog {
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Vec::new(),
            next_id: 1,
            max_events,
        }
    }

    pub fn emit(&mut self, height: BlockHeight, payload: EventPayload) -> EventId {
        let id = EventId(self.next_id);
        self.next_id += 1;
        debug!(event_id = id.0, height = height.0, payload = ?payload, "event");
        self.events.push(Event::new(id, height, payload));

        if self.events.len() > self.max_events {
            let drain_count = self.events.len() - self.max_events;
            self.events.drain(0..drain_count);
        }
        id
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn recent(&self, count: usize) -> &[Event] {
        let start = self.events.len().saturating_sub(count);
        &self.events[start..]
    }

    /// Events with an id strictly greater than `cursor`.
    pub fn since(&self, cursor: EventId) -> &[Event] {
        let start = self.events.partition_point(|e| e.id <= cursor);
        &self.events[start..]
    }

    pub fn last_id(&self) -> EventId {
        EventId(self.next_id - 1)
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}
