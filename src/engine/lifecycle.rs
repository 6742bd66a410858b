//! Opening, owner controls, and finalization.

use super::core::PositionStateMachine;
use super::results::{EngineError, StepOutcome};
use crate::events::{
    EmergencyReason, EmergencyStopEvent, EventPayload, PositionClosedEvent, PositionCreatedEvent,
    RiskTriggersUpdatedEvent,
};
use crate::leverage::{max_leverage_for_ltv, target_reached};
use crate::market::{LendingMarket, SwapRouter};
use crate::position::{OpenRequest, Position, PositionState};
use crate::types::{Amount, Leverage, Price, UserId};
use rust_decimal::Decimal;
use tracing::{info, warn};

impl<L: LendingMarket, S: SwapRouter> PositionStateMachine<L, S> {
    /// Supplies the user's collateral and starts a looping position at 1x.
    pub fn open(&mut self, user: UserId, request: OpenRequest) -> Result<StepOutcome, EngineError> {
        self.ensure_running()?;
        if self.positions.contains_key(&user) {
            return Err(EngineError::PositionExists(user));
        }
        if request.amount.is_zero() {
            return Err(EngineError::ZeroAmount);
        }

        let collateral_asset = request.collateral_asset;
        let borrow_asset = request.borrow_asset.unwrap_or(collateral_asset);
        let reserve = self.market.reserve_params(collateral_asset)?;
        self.market.reserve_params(borrow_asset)?;

        let max = max_leverage_for_ltv(reserve.ltv)?.min(self.config.max_target_leverage);
        let target = Leverage::new(request.target_leverage)
            .filter(|t| !t.is_unlevered() && t.value() < max)
            .ok_or(EngineError::InvalidLeverage {
                requested: request.target_leverage,
                max,
            })?;
        if request.max_iterations == 0 || request.max_iterations > self.config.max_iterations_cap {
            return Err(EngineError::InvalidIterations {
                requested: request.max_iterations,
                max: self.config.max_iterations_cap,
            });
        }
        let min_health_factor = request
            .min_health_factor
            .unwrap_or(self.config.default_min_health_factor);
        if min_health_factor <= Decimal::ONE {
            return Err(EngineError::InvalidHealthFactor(min_health_factor));
        }
        let slippage = request.slippage_tolerance.unwrap_or(self.config.default_slippage);

        self.market.supply(user, collateral_asset, request.amount)?;
        self.market.enable_collateral(user, collateral_asset)?;

        let position = Position::new(
            user,
            collateral_asset,
            borrow_asset,
            request.amount,
            target,
            request.max_iterations,
            min_health_factor,
            slippage,
            request.use_flash_loan,
            self.height,
        );
        self.positions.insert(user, position);
        self.refresh(user)?;

        // first observation sets the circuit-breaker baseline
        let prices = (
            (collateral_asset, self.market.asset_price(collateral_asset)?),
            (borrow_asset, self.market.asset_price(borrow_asset)?),
        );
        self.risk.check_circuit_breaker(user, prices.0, prices.1);

        info!(user = user.0, target = %target, amount = %request.amount, flash = request.use_flash_loan, "position opened");
        self.emit_event(EventPayload::PositionCreated(PositionCreatedEvent {
            user,
            collateral_asset,
            borrow_asset,
            initial_collateral: request.amount,
            target_leverage: target,
            max_iterations: request.max_iterations,
            use_flash_loan: request.use_flash_loan,
        }));
        self.accrue_fee(user, self.config.open_fee);
        self.emit_position_changed(user);
        Ok(StepOutcome::Opened { user })
    }

    /// Moves along one edge of the state table. no-op when already there.
    pub(super) fn transition(&mut self, user: UserId, next: PositionState) -> Result<(), EngineError> {
        let position = self.require_position_mut(user)?;
        if position.state == next {
            return Ok(());
        }
        if !position.state.can_transition_to(next) {
            return Err(EngineError::InvalidState {
                user,
                state: position.state,
                action: "transition",
            });
        }
        position.state = next;
        Ok(())
    }

    pub(super) fn enter_emergency(&mut self, user: UserId, reason: EmergencyReason) -> Result<(), EngineError> {
        let already = self.require_position(user)?.state == PositionState::Emergency;
        self.transition(user, PositionState::Emergency)?;
        if !already {
            warn!(user = user.0, reason = ?reason, "emergency stop");
            self.emit_event(EventPayload::EmergencyStop(EmergencyStopEvent { user, reason }));
        }
        Ok(())
    }

    /// User-initiated unwind. Looping positions pass through Idle first.
    pub fn request_unwind(&mut self, user: UserId) -> Result<StepOutcome, EngineError> {
        let state = self.require_position(user)?.state;
        match state {
            PositionState::Unwinding => {}
            PositionState::Looping | PositionState::Idle => {
                self.transition(user, PositionState::Idle)?;
                self.transition(user, PositionState::Unwinding)?;
            }
            PositionState::Emergency => {
                return Err(EngineError::InvalidState {
                    user,
                    state,
                    action: "request_unwind",
                })
            }
        }
        self.finish_if_debt_free(user)
    }

    pub fn emergency_stop(&mut self, user: UserId) -> Result<StepOutcome, EngineError> {
        self.enter_emergency(user, EmergencyReason::UserRequested)?;
        self.finish_if_debt_free(user)
    }

    fn finish_if_debt_free(&mut self, user: UserId) -> Result<StepOutcome, EngineError> {
        let (snapshot, leverage) = self.refresh(user)?;
        if !snapshot.has_debt() {
            return self.finalize(user);
        }
        self.emit_position_changed(user);
        let state = self.require_position(user)?.state;
        Ok(StepOutcome::Applied {
            leverage,
            health_factor: snapshot.health_factor,
            state,
        })
    }

    /// Closes an unlevered position. Looping positions must unwind first.
    pub fn close(&mut self, user: UserId) -> Result<StepOutcome, EngineError> {
        let state = self.require_position(user)?.state;
        if state == PositionState::Looping {
            return Err(EngineError::InvalidState {
                user,
                state,
                action: "close",
            });
        }
        let (snapshot, leverage) = self.refresh(user)?;
        if !leverage.is_unlevered() || snapshot.has_debt() {
            return Err(EngineError::NotUnwound(leverage));
        }
        self.finalize(user)
    }

    /// Withdraws what is left, revokes allowances and deletes the position.
    pub(super) fn finalize(&mut self, user: UserId) -> Result<StepOutcome, EngineError> {
        let (collateral_asset, borrow_asset) = {
            let p = self.require_position(user)?;
            (p.collateral_asset, p.borrow_asset)
        };

        // settle dust debt out of parked borrow tokens before pulling collateral
        let debt = self.market.debt_balance(user, borrow_asset)?;
        let parked = self.require_position(user)?.residual_borrow;
        if !debt.is_zero() && !parked.is_zero() {
            let applied = self.market.repay(user, borrow_asset, parked.min(debt))?;
            let position = self.require_position_mut(user)?;
            position.residual_borrow = position.residual_borrow.saturating_sub(applied);
        }

        let held = self.market.collateral_balance(user, collateral_asset)?;
        let withdrawn = if held.is_zero() {
            Amount::zero()
        } else {
            self.market.withdraw(user, collateral_asset, held)?
        };
        self.market.revoke_allowances(user)?;

        let Some(mut position) = self.positions.remove(&user) else {
            return Err(EngineError::PositionNotFound(user));
        };
        self.risk.forget(user);

        let collateral_returned = withdrawn.add(position.residual_collateral);
        let borrow_refund = position.residual_borrow;
        info!(
            user = user.0,
            collateral = %collateral_returned,
            refund = %borrow_refund,
            iterations = position.current_iteration,
            "position closed"
        );
        self.emit_event(EventPayload::PositionClosed(PositionClosedEvent {
            user,
            collateral_returned,
            borrow_refund,
            loop_iterations: position.current_iteration,
            unwind_steps: position.unwind_steps,
        }));

        position.state = PositionState::Idle;
        position.current_leverage = Leverage::ONE;
        position.last_health_factor = Decimal::MAX;
        let event = Self::changed_event(&position);
        self.emit_event(EventPayload::PositionChanged(event));

        Ok(StepOutcome::Closed {
            collateral_returned,
            borrow_refund,
        })
    }

    /// `None` disables a trigger.
    pub fn set_risk_triggers(
        &mut self,
        user: UserId,
        take_profit: Option<Price>,
        stop_loss: Option<Price>,
    ) -> Result<(), EngineError> {
        if let (Some(tp), Some(sl)) = (take_profit, stop_loss) {
            if tp <= sl {
                return Err(EngineError::InvalidTriggers {
                    take_profit: tp,
                    stop_loss: sl,
                });
            }
        }
        let position = self.require_position_mut(user)?;
        position.take_profit_price = take_profit;
        position.stop_loss_price = stop_loss;

        self.emit_event(EventPayload::RiskTriggersUpdated(RiskTriggersUpdatedEvent {
            user,
            take_profit_price: take_profit,
            stop_loss_price: stop_loss,
        }));
        self.emit_position_changed(user);
        Ok(())
    }

    pub fn set_execution_salt(&mut self, user: UserId, salt: Option<u64>) -> Result<(), EngineError> {
        self.require_position_mut(user)?.execution_salt = salt.filter(|s| *s != 0);
        self.emit_position_changed(user);
        Ok(())
    }

    pub fn set_gas_budget(&mut self, user: UserId, budget: Option<Amount>) -> Result<(), EngineError> {
        self.require_position_mut(user)?.max_gas_spend = budget.filter(|b| !b.is_zero());
        Ok(())
    }

    pub fn set_twap_interval(&mut self, user: UserId, blocks: Option<u64>) -> Result<(), EngineError> {
        self.require_position_mut(user)?.twap_min_interval = blocks.filter(|b| *b > 0);
        Ok(())
    }

    /// Emergency -> Idle once the position is back above its floor. The
    /// circuit breaker re-baselines at current prices.
    pub fn reset_emergency(&mut self, user: UserId) -> Result<(), EngineError> {
        let position = self.require_position(user)?;
        if position.state != PositionState::Emergency {
            return Err(EngineError::InvalidState {
                user,
                state: position.state,
                action: "reset_emergency",
            });
        }
        let floor = position.min_health_factor;
        let (collateral_asset, borrow_asset) = (position.collateral_asset, position.borrow_asset);

        let (snapshot, _) = self.refresh(user)?;
        if snapshot.health_factor < floor {
            return Err(EngineError::Unhealthy {
                health_factor: snapshot.health_factor,
                floor,
            });
        }
        self.transition(user, PositionState::Idle)?;
        self.risk.forget(user);
        let collateral = (collateral_asset, self.market.asset_price(collateral_asset)?);
        let borrow = (borrow_asset, self.market.asset_price(borrow_asset)?);
        self.risk.check_circuit_breaker(user, collateral, borrow);

        info!(user = user.0, health_factor = %snapshot.health_factor, "emergency reset");
        self.emit_position_changed(user);
        Ok(())
    }

    /// Idle -> Looping for a position still below target with iterations left.
    pub fn resume_looping(&mut self, user: UserId) -> Result<(), EngineError> {
        self.ensure_running()?;
        let (state, target, exhausted) = {
            let p = self.require_position(user)?;
            (p.state, p.target_leverage, p.iterations_exhausted())
        };
        if state != PositionState::Idle || exhausted {
            return Err(EngineError::InvalidState {
                user,
                state,
                action: "resume_looping",
            });
        }
        let (_, leverage) = self.refresh(user)?;
        if target_reached(leverage.value(), target.value(), self.risk.params.target_tolerance) {
            return Err(EngineError::InvalidState {
                user,
                state,
                action: "resume_looping",
            });
        }
        self.transition(user, PositionState::Looping)?;
        self.emit_position_changed(user);
        Ok(())
    }
}
