// 11.0 relay.rs: MOCKED. stands in for the message transport between the
// state machine and the decision engine. in prod this is an async,
// at-least-once network hop; here it is a loop that turns PositionChanged
// events into notifications, stamps the executor identity on the way back
// and can deliver every notification twice.

use crate::batch::BatchExecutor;
use crate::decision::ReactiveDecisionEngine;
use crate::engine::{EngineError, PositionStateMachine, StepOutcome};
use crate::events::{EventId, EventPayload};
use crate::instruction::{ExecutionContext, Instruction, Notification};
use crate::market::{LendingMarket, SwapRouter};
use crate::types::{BlockHeight, Identity, PoolId, Price};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub instruction: Instruction,
    pub result: Result<StepOutcome, EngineError>,
}

#[derive(Debug, Clone, Default)]
pub struct PumpReport {
    pub rounds: usize,
    pub notifications: usize,
    pub deliveries: Vec<Delivery>,
}

impl PumpReport {
    pub fn failures(&self) -> impl Iterator<Item = &Delivery> {
        self.deliveries.iter().filter(|d| d.result.is_err())
    }

    pub fn succeeded(&self) -> usize {
        self.deliveries.iter().filter(|d| d.result.is_ok()).count()
    }
}

#[derive(Debug, Clone)]
pub struct Relay {
    executor: Identity,
    cursor: EventId,
    // blocks between an instruction leaving the decision engine and landing
    latency: u64,
    duplicate_delivery: bool,
    batching: bool,
}

impl Relay {
    pub fn new(executor: Identity) -> Self {
        Self {
            executor,
            cursor: EventId(0),
            latency: 1,
            duplicate_delivery: false,
            batching: false,
        }
    }

    pub fn with_latency(mut self, blocks: u64) -> Self {
        self.latency = blocks;
        self
    }

    /// Hands every notification to the decision engine twice.
    pub fn with_duplicate_delivery(mut self, enabled: bool) -> Self {
        self.duplicate_delivery = enabled;
        self
    }

    /// Lands multi-instruction rounds through the batch executor.
    pub fn with_batching(mut self, enabled: bool) -> Self {
        self.batching = enabled;
        self
    }

    pub fn cursor(&self) -> EventId {
        self.cursor
    }

    /// Notifications for every position change since the last collect,
    /// stamped with the current height.
    pub fn collect<L: LendingMarket, S: SwapRouter>(&mut self, sm: &PositionStateMachine<L, S>) -> Vec<Notification> {
        let height = sm.height();
        let notifications: Vec<Notification> = sm
            .events_since(self.cursor)
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::PositionChanged(changed) => Some(Notification::PositionChanged {
                    event: changed.clone(),
                    height,
                }),
                _ => None,
            })
            .collect();
        self.cursor = sm.last_event_id();
        notifications
    }

    /// Runs one notification through the decision engine and lands the
    /// resulting instructions after the transport latency.
    pub fn relay<L: LendingMarket, S: SwapRouter>(
        &mut self,
        sm: &mut PositionStateMachine<L, S>,
        decision: &mut ReactiveDecisionEngine,
        notification: &Notification,
    ) -> Vec<Delivery> {
        let mut instructions = decision.handle(notification);
        if self.duplicate_delivery {
            instructions.extend(decision.handle(notification));
        }
        sm.advance_height(self.latency);
        self.deliver(sm, &instructions)
    }

    pub fn deliver<L: LendingMarket, S: SwapRouter>(
        &self,
        sm: &mut PositionStateMachine<L, S>,
        instructions: &[Instruction],
    ) -> Vec<Delivery> {
        if instructions.is_empty() {
            return Vec::new();
        }
        let ctx = ExecutionContext::new(self.executor);
        if self.batching && instructions.len() > 1 {
            match BatchExecutor::new().execute(sm, &ctx, instructions) {
                Ok(summary) => {
                    return instructions
                        .iter()
                        .cloned()
                        .zip(summary.items)
                        .map(|(instruction, item)| Delivery {
                            instruction,
                            result: item.result,
                        })
                        .collect();
                }
                // a rejected batch falls through to single delivery
                Err(e) => debug!(error = %e, "batch rejected, delivering one by one"),
            }
        }
        instructions
            .iter()
            .map(|instruction| {
                let result = sm.execute(&ctx, instruction);
                if let Err(e) = &result {
                    warn!(user = instruction.user.0, action = %instruction.action, error = %e, "instruction rejected");
                }
                Delivery {
                    instruction: instruction.clone(),
                    result,
                }
            })
            .collect()
    }

    /// Drives the feedback loop until the state machine goes quiet or
    /// `max_rounds` is hit. Each round collects new notifications, lets the
    /// decision engine answer all of them, then lands the answers.
    pub fn pump<L: LendingMarket, S: SwapRouter>(
        &mut self,
        sm: &mut PositionStateMachine<L, S>,
        decision: &mut ReactiveDecisionEngine,
        max_rounds: usize,
    ) -> PumpReport {
        let mut report = PumpReport::default();
        while report.rounds < max_rounds {
            let notifications = self.collect(sm);
            if notifications.is_empty() {
                break;
            }
            report.rounds += 1;
            report.notifications += notifications.len();

            let mut instructions: Vec<Instruction> = Vec::new();
            for notification in &notifications {
                instructions.extend(decision.handle(notification));
                if self.duplicate_delivery {
                    instructions.extend(decision.handle(notification));
                }
            }
            sm.advance_height(self.latency);
            report.deliveries.extend(self.deliver(sm, &instructions));
        }
        report
    }

    /// Fires a timer tick at the current height and lands the answers.
    pub fn tick<L: LendingMarket, S: SwapRouter>(
        &mut self,
        sm: &mut PositionStateMachine<L, S>,
        decision: &mut ReactiveDecisionEngine,
    ) -> Vec<Delivery> {
        let notification = timer(sm.height());
        self.relay(sm, decision, &notification)
    }
}

pub fn timer(height: BlockHeight) -> Notification {
    Notification::Timer { height }
}

pub fn price_sync(pool: PoolId, price: Price, height: BlockHeight) -> Notification {
    Notification::PriceSync { pool, price, height }
}
