//! Loop steps: borrow -> convert -> re-supply, guarded by the risk checks.

use super::core::PositionStateMachine;
use super::results::{EngineError, StepOutcome};
use crate::events::{
    CircuitBreakerEvent, EmergencyReason, EventPayload, GasBudgetEvent, LoopStepDeferredEvent, LoopStepEvent,
    StepPhase, StepRecoveredEvent, UnprofitableEvent,
};
use crate::leverage::{borrow_to_target, safe_borrow, target_reached, to_units};
use crate::market::{LendingMarket, MarketError, SwapRouter};
use crate::position::PositionState;
use crate::risk::GasCheck;
use crate::types::{Amount, AssetId, Bps, UserId};
use tracing::{debug, info, warn};

impl<L: LendingMarket, S: SwapRouter> PositionStateMachine<L, S> {
    /// 8.2: one automated lever-up step. Gates run in a fixed order: pacing,
    /// circuit breaker, target, gas budget, profitability. Only then is the
    /// iteration executed against live market totals.
    pub fn apply_loop_step(&mut self, user: UserId) -> Result<StepOutcome, EngineError> {
        self.ensure_running()?;
        let position = self.require_position(user)?.clone();
        if position.state != PositionState::Looping {
            return Err(EngineError::InvalidState {
                user,
                state: position.state,
                action: "loop_step",
            });
        }

        if let Some(next_eligible) = self.risk.twap_wait(&position, self.height) {
            debug!(user = user.0, next = next_eligible.0, "loop step deferred");
            self.emit_event(EventPayload::LoopStepDeferred(LoopStepDeferredEvent {
                user,
                next_eligible,
            }));
            return Ok(StepOutcome::Deferred { next_eligible });
        }

        let collateral_price = self.market.asset_price(position.collateral_asset)?;
        let borrow_price = self.market.asset_price(position.borrow_asset)?;
        if let Some(trip) = self.risk.check_circuit_breaker(
            user,
            (position.collateral_asset, collateral_price),
            (position.borrow_asset, borrow_price),
        ) {
            warn!(user = user.0, asset = trip.asset.0, deviation_bps = %trip.deviation_bps, "circuit breaker tripped");
            self.emit_event(EventPayload::CircuitBreakerTripped(CircuitBreakerEvent {
                user,
                asset: trip.asset,
                previous: trip.previous,
                current: trip.current,
                deviation_bps: trip.deviation_bps,
                threshold: self.risk.params.circuit_breaker_threshold,
            }));
            self.enter_emergency(user, EmergencyReason::CircuitBreaker)?;
            self.refresh(user)?;
            self.emit_position_changed(user);
            return Ok(StepOutcome::CircuitBreakerTripped { asset: trip.asset });
        }

        let (snapshot, leverage) = self.refresh(user)?;
        let tolerance = self.risk.params.target_tolerance;
        if target_reached(leverage.value(), position.target_leverage.value(), tolerance) {
            self.settle_idle(user)?;
            return Ok(StepOutcome::TargetReached);
        }
        if position.iterations_exhausted() {
            self.settle_idle(user)?;
            return Ok(StepOutcome::IterationCapReached);
        }

        let flash = position.use_flash_loan && position.current_iteration == 0;
        let estimate = if flash {
            self.risk.params.gas_per_flash_step
        } else {
            self.risk.params.gas_per_step
        };
        if let GasCheck::Exhausted { spent, budget } = self.risk.check_gas_budget(&position, estimate) {
            info!(user = user.0, spent = %spent, budget = %budget, "gas budget exhausted");
            self.emit_event(EventPayload::GasBudgetExceeded(GasBudgetEvent { user, spent, budget }));
            self.settle_idle(user)?;
            return Ok(StepOutcome::GasBudgetExhausted);
        }

        if self.risk.params.profitability_check_enabled {
            let supply = self.market.reserve_rates(position.collateral_asset)?;
            let borrow = self.market.reserve_rates(position.borrow_asset)?;
            let check = self.risk.check_profitability(
                supply.supply_rate,
                borrow.borrow_rate,
                position.target_leverage.value(),
            );
            if !check.profitable {
                debug!(user = user.0, yield_ = %check.expected_yield, cost = %check.borrow_cost, "loop unprofitable");
                self.emit_event(EventPayload::LoopSkippedUnprofitable(UnprofitableEvent {
                    user,
                    expected_yield: check.expected_yield,
                    borrow_cost: check.borrow_cost,
                }));
                return Ok(StepOutcome::SkippedUnprofitable);
            }
        }

        if flash {
            return self.flash_lever_up(user, &snapshot);
        }

        // size from the live snapshot: buffered ltv headroom, never past target
        let headroom = safe_borrow(
            snapshot.total_collateral,
            snapshot.total_debt,
            snapshot.ltv,
            self.risk.params.safety_buffer,
            snapshot.available_borrow,
        )?;
        let to_target = borrow_to_target(
            snapshot.total_collateral,
            snapshot.total_debt,
            position.target_leverage.value(),
        )?;
        let liquidity = self.market.available_liquidity(position.borrow_asset)?;
        let units = Amount::new(to_units(headroom.min(to_target), borrow_price.value())?).min(liquidity);
        if units.is_zero() {
            debug!(user = user.0, "no borrow capacity left");
            self.settle_idle(user)?;
            return Ok(StepOutcome::CapacityExhausted);
        }

        let borrowed = match self.market.borrow(user, position.borrow_asset, units) {
            Ok(amount) => amount,
            Err(e) => return self.recover(user, StepPhase::Borrow, &e, Amount::zero(), Amount::zero()),
        };

        let received = match self.convert(
            position.borrow_asset,
            position.collateral_asset,
            borrowed,
            position.slippage_tolerance,
        ) {
            Ok(amount) => amount,
            Err(e) => {
                let parked = self.repay_or_park(user, position.borrow_asset, borrowed);
                return self.recover(user, StepPhase::Swap, &e, parked, Amount::zero());
            }
        };

        if let Err(e) = self.market.supply(user, position.collateral_asset, received) {
            let (parked_borrow, parked_collateral) = self.reverse_conversion(
                user,
                position.collateral_asset,
                position.borrow_asset,
                received,
                position.slippage_tolerance,
            );
            return self.recover(user, StepPhase::Supply, &e, parked_borrow, parked_collateral);
        }

        self.require_position_mut(user)?.current_iteration += 1;
        self.finish_loop_step(user, borrowed, received, false)
    }

    /// Post-step bookkeeping shared by the normal and flash paths.
    pub(super) fn finish_loop_step(
        &mut self,
        user: UserId,
        borrowed: Amount,
        supplied: Amount,
        flash: bool,
    ) -> Result<StepOutcome, EngineError> {
        // gas is only spent on a step that landed
        let estimate = if flash {
            self.risk.params.gas_per_flash_step
        } else {
            self.risk.params.gas_per_step
        };
        self.charge_step(user, estimate)?;
        let (snapshot, leverage) = self.refresh(user)?;
        let tolerance = self.risk.params.target_tolerance;
        let height = self.height;
        let (iteration, floor_breached, done) = {
            let p = self.require_position_mut(user)?;
            p.last_update_height = height;
            (
                p.current_iteration,
                p.below_health_floor(snapshot.health_factor),
                target_reached(leverage.value(), p.target_leverage.value(), tolerance) || p.iterations_exhausted(),
            )
        };

        self.emit_event(EventPayload::LoopStepApplied(LoopStepEvent {
            user,
            iteration,
            borrowed,
            supplied,
            leverage,
            health_factor: snapshot.health_factor,
            flash,
        }));
        self.accrue_fee(user, self.config.step_fee);

        if floor_breached {
            self.enter_emergency(user, EmergencyReason::HealthFactorBreach)?;
        } else if done {
            self.transition(user, PositionState::Idle)?;
        }
        let state = self.require_position(user)?.state;
        info!(user = user.0, iteration, leverage = %leverage, health_factor = %snapshot.health_factor, state = %state, "loop step applied");
        self.emit_position_changed(user);
        Ok(StepOutcome::Applied {
            leverage,
            health_factor: snapshot.health_factor,
            state,
        })
    }

    pub(super) fn charge_step(&mut self, user: UserId, estimate: Amount) -> Result<(), EngineError> {
        let position = self.require_position_mut(user)?;
        position.gas_spent = position.gas_spent.add(estimate);
        Ok(())
    }

    /// Looping -> Idle with a fresh notification.
    fn settle_idle(&mut self, user: UserId) -> Result<(), EngineError> {
        self.transition(user, PositionState::Idle)?;
        self.emit_position_changed(user);
        Ok(())
    }

    /// Repays freshly borrowed tokens. Whatever the market refuses is parked
    /// on the position for refund at close.
    pub(super) fn repay_or_park(&mut self, user: UserId, asset: AssetId, amount: Amount) -> Amount {
        let applied = self.market.repay(user, asset, amount).unwrap_or_else(|e| {
            warn!(user = user.0, error = %e, "repay during recovery failed");
            Amount::zero()
        });
        let parked = amount.saturating_sub(applied);
        if let Some(position) = self.positions.get_mut(&user) {
            position.residual_borrow = position.residual_borrow.add(parked);
        }
        parked
    }

    /// Swaps collateral back to the borrow asset and repays. Returns what
    /// had to be parked as (borrow, collateral).
    pub(super) fn reverse_conversion(
        &mut self,
        user: UserId,
        collateral_asset: AssetId,
        borrow_asset: AssetId,
        amount: Amount,
        slippage: Bps,
    ) -> (Amount, Amount) {
        match self.convert(collateral_asset, borrow_asset, amount, slippage) {
            Ok(back) => (self.repay_or_park(user, borrow_asset, back), Amount::zero()),
            Err(e) => {
                warn!(user = user.0, error = %e, "swap back failed, parking collateral");
                if let Some(position) = self.positions.get_mut(&user) {
                    position.residual_collateral = position.residual_collateral.add(amount);
                }
                (Amount::zero(), amount)
            }
        }
    }

    /// Reports a recovered leg. The position keeps its state; the next
    /// instruction retries from live totals.
    pub(super) fn recover(
        &mut self,
        user: UserId,
        phase: StepPhase,
        error: &MarketError,
        parked_borrow: Amount,
        parked_collateral: Amount,
    ) -> Result<StepOutcome, EngineError> {
        warn!(user = user.0, phase = ?phase, error = %error, "step recovered");
        self.emit_event(EventPayload::StepRecovered(StepRecoveredEvent {
            user,
            phase,
            reason: error.to_string(),
            parked_borrow,
            parked_collateral,
        }));
        if let Err(e) = self.refresh(user) {
            debug!(user = user.0, error = %e, "refresh after recovery failed");
        }
        Ok(StepOutcome::Recovered { phase })
    }
}
