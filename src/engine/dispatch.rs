//! Instruction dispatch for the automated executor.

use super::core::PositionStateMachine;
use super::results::{EngineError, StepOutcome};
use crate::events::{EmergencyReason, EventPayload, HealthCheckedEvent, PriceTriggerEvent};
use crate::instruction::{Action, ExecutionContext, Instruction};
use crate::market::{LendingMarket, SwapRouter};
use crate::position::{OpenRequest, PositionState};
use crate::risk::{rotate_salt, verify_salt};
use crate::types::UserId;
use tracing::{debug, info, warn};

impl<L: LendingMarket, S: SwapRouter> PositionStateMachine<L, S> {
    /// Entry point for instructions arriving over the transport. The
    /// transport-stamped identity is checked before anything else.
    pub fn execute(&mut self, ctx: &ExecutionContext, instruction: &Instruction) -> Result<StepOutcome, EngineError> {
        self.authorize(ctx)?;
        self.apply_instruction(instruction)
    }

    pub(crate) fn authorize(&self, ctx: &ExecutionContext) -> Result<(), EngineError> {
        if ctx.verified_identity != self.config.authorized_executor {
            warn!(identity = %ctx.verified_identity, "rejected unauthorized executor");
            return Err(EngineError::UnauthorizedExecutor(ctx.verified_identity));
        }
        Ok(())
    }

    /// Dispatches an already-authorized instruction.
    pub(crate) fn apply_instruction(&mut self, instruction: &Instruction) -> Result<StepOutcome, EngineError> {
        let user = instruction.user;
        debug!(user = user.0, action = %instruction.action, "executing instruction");

        if let Action::AutoDeposit {
            collateral_asset,
            amount,
            target_leverage,
            max_iterations,
        } = &instruction.action
        {
            let request = OpenRequest::same_asset(*collateral_asset, *amount, *target_leverage, *max_iterations);
            return self.open(user, request);
        }

        if !instruction.action.is_sensitive() {
            return match instruction.action {
                Action::LoopStep => self.apply_loop_step(user),
                _ => self.health_check(user),
            };
        }

        // sensitive actions burn the salt they present once the action lands.
        // the rotated salt is staged first so the step's own notification carries it
        let expected = self.require_position(user)?.execution_salt;
        verify_salt(user, expected, instruction.salt)?;
        let cursor = self.last_event_id();
        if let Some(salt) = expected {
            let rotated = rotate_salt(salt, self.height);
            self.require_position_mut(user)?.execution_salt = Some(rotated);
        }

        let result = match instruction.action {
            Action::UnwindStep => self.apply_unwind_step(user),
            Action::TakeProfit => self.take_profit(user),
            Action::StopLoss => self.stop_loss(user),
            _ => self.liquidation_response(user),
        };

        // a rejected action leaves the salt the decision engine holds intact
        if result.is_err() {
            if let Some(position) = self.positions.get_mut(&user) {
                position.execution_salt = expected;
            }
            return result;
        }

        // the decision engine only learns the rotated salt from a notification
        if expected.is_some() && self.positions.contains_key(&user) {
            let published = self.events_since(cursor).iter().any(|e| {
                matches!(&e.payload, EventPayload::PositionChanged(c) if c.user == user)
            });
            if !published {
                self.emit_position_changed(user);
            }
        }
        result
    }

    /// Re-reads live health, records it, and trips to Emergency below the floor.
    pub fn health_check(&mut self, user: UserId) -> Result<StepOutcome, EngineError> {
        let (snapshot, leverage) = self.refresh(user)?;
        self.emit_event(EventPayload::HealthChecked(HealthCheckedEvent {
            user,
            health_factor: snapshot.health_factor,
            leverage,
        }));

        let position = self.require_position(user)?;
        if snapshot.has_debt() && position.below_health_floor(snapshot.health_factor) {
            self.enter_emergency(user, EmergencyReason::HealthFactorBreach)?;
        }
        self.emit_position_changed(user);
        Ok(StepOutcome::Checked {
            health_factor: snapshot.health_factor,
            leverage,
        })
    }

    /// Unwinds once the live collateral price is at or above take-profit.
    pub fn take_profit(&mut self, user: UserId) -> Result<StepOutcome, EngineError> {
        let position = self.require_position(user)?;
        let trigger_price = position.take_profit_price.ok_or(EngineError::TriggerNotSet {
            user,
            trigger: "take_profit",
        })?;
        let (state, asset) = (position.state, position.collateral_asset);
        let observed = self.market.asset_price(asset)?;
        if observed < trigger_price {
            return Err(EngineError::TriggerNotMet {
                trigger: "take_profit",
                trigger_price,
                observed,
            });
        }

        info!(user = user.0, trigger = %trigger_price, observed = %observed, "take profit triggered");
        self.emit_event(EventPayload::TakeProfitTriggered(PriceTriggerEvent {
            user,
            trigger_price,
            observed_price: observed,
        }));
        if !state.is_unwinding() {
            self.transition(user, PositionState::Idle)?;
            self.transition(user, PositionState::Unwinding)?;
        }
        self.apply_unwind_step(user)
    }

    /// Emergency unwind once the live collateral price is at or below stop-loss.
    pub fn stop_loss(&mut self, user: UserId) -> Result<StepOutcome, EngineError> {
        let position = self.require_position(user)?;
        let trigger_price = position.stop_loss_price.ok_or(EngineError::TriggerNotSet {
            user,
            trigger: "stop_loss",
        })?;
        let observed = self.market.asset_price(position.collateral_asset)?;
        if observed > trigger_price {
            return Err(EngineError::TriggerNotMet {
                trigger: "stop_loss",
                trigger_price,
                observed,
            });
        }

        warn!(user = user.0, trigger = %trigger_price, observed = %observed, "stop loss triggered");
        self.emit_event(EventPayload::StopLossTriggered(PriceTriggerEvent {
            user,
            trigger_price,
            observed_price: observed,
        }));
        self.enter_emergency(user, EmergencyReason::StopLoss)?;
        self.apply_unwind_step(user)
    }

    /// Response to a failed external liquidation attempt: stop and deleverage.
    pub fn liquidation_response(&mut self, user: UserId) -> Result<StepOutcome, EngineError> {
        self.enter_emergency(user, EmergencyReason::LiquidationThreat)?;
        self.apply_unwind_step(user)
    }
}
