//! Unwind steps: withdraw -> convert -> repay, bounded by the health floor.

use super::core::PositionStateMachine;
use super::results::{EngineError, StepOutcome};
use crate::events::{EventPayload, StepPhase, UnwindStalledEvent, UnwindStepEvent};
use crate::leverage::{safe_withdraw, to_units, withdraw_for_repay};
use crate::market::{LendingMarket, SwapRouter};
use crate::types::{Amount, UserId};
use tracing::{info, warn};

impl<L: LendingMarket, S: SwapRouter> PositionStateMachine<L, S> {
    /// 8.3: one deleveraging step. Allowed while paused: unwinding only ever
    /// reduces risk.
    pub fn apply_unwind_step(&mut self, user: UserId) -> Result<StepOutcome, EngineError> {
        let position = self.require_position(user)?.clone();
        if !position.state.is_unwinding() {
            return Err(EngineError::InvalidState {
                user,
                state: position.state,
                action: "unwind_step",
            });
        }

        let (snapshot, _) = self.refresh(user)?;
        if !snapshot.has_debt() {
            return self.finalize(user);
        }
        if position.use_flash_loan {
            return self.flash_unwind(user);
        }

        // the position floor first, the protocol unwind floor when that leaves no room
        let mut room = safe_withdraw(
            snapshot.total_collateral,
            snapshot.total_debt,
            snapshot.liquidation_threshold,
            position.min_health_factor,
        )?;
        if room.is_zero() {
            room = safe_withdraw(
                snapshot.total_collateral,
                snapshot.total_debt,
                snapshot.liquidation_threshold,
                self.risk.params.unwind_health_floor,
            )?;
        }
        let needed = withdraw_for_repay(snapshot.total_debt, position.slippage_tolerance)?;
        let value = room.min(needed);

        // every read happens before funds move
        let collateral_price = self.market.asset_price(position.collateral_asset)?;
        let held = self.market.collateral_balance(user, position.collateral_asset)?;
        let debt = self.market.debt_balance(user, position.borrow_asset)?;
        let units = Amount::new(to_units(value, collateral_price.value())?).min(held);
        if units.is_zero() {
            warn!(user = user.0, health_factor = %snapshot.health_factor, "unwind stalled");
            self.emit_event(EventPayload::UnwindStalled(UnwindStalledEvent {
                user,
                health_factor: snapshot.health_factor,
            }));
            return Ok(StepOutcome::Stalled);
        }

        let withdrawn = match self.market.withdraw(user, position.collateral_asset, units) {
            Ok(amount) => amount,
            Err(e) => return self.recover(user, StepPhase::Withdraw, &e, Amount::zero(), Amount::zero()),
        };

        let received = match self.convert(
            position.collateral_asset,
            position.borrow_asset,
            withdrawn,
            position.slippage_tolerance,
        ) {
            Ok(amount) => amount,
            Err(e) => {
                let parked = self.resupply_or_park(user, withdrawn);
                return self.recover(user, StepPhase::Swap, &e, Amount::zero(), parked);
            }
        };

        let repaid = match self.market.repay(user, position.borrow_asset, received.min(debt)) {
            Ok(amount) => amount,
            Err(e) => {
                let p = self.require_position_mut(user)?;
                p.residual_borrow = p.residual_borrow.add(received);
                return self.recover(user, StepPhase::Repay, &e, received, Amount::zero());
            }
        };
        {
            let p = self.require_position_mut(user)?;
            p.residual_borrow = p.residual_borrow.add(received.saturating_sub(repaid));
            p.unwind_steps += 1;
        }

        self.finish_unwind_step(user, withdrawn, repaid, false)
    }

    pub(super) fn finish_unwind_step(
        &mut self,
        user: UserId,
        withdrawn: Amount,
        repaid: Amount,
        flash: bool,
    ) -> Result<StepOutcome, EngineError> {
        let estimate = if flash {
            self.risk.params.gas_per_flash_step
        } else {
            self.risk.params.gas_per_step
        };
        self.charge_step(user, estimate)?;
        let (snapshot, leverage) = self.refresh(user)?;
        let height = self.height;
        self.require_position_mut(user)?.last_update_height = height;
        self.emit_event(EventPayload::UnwindStepApplied(UnwindStepEvent {
            user,
            withdrawn,
            repaid,
            leverage,
            health_factor: snapshot.health_factor,
            flash,
        }));
        self.accrue_fee(user, self.config.step_fee);

        if !snapshot.has_debt() {
            return self.finalize(user);
        }
        let state = self.require_position(user)?.state;
        info!(user = user.0, leverage = %leverage, health_factor = %snapshot.health_factor, "unwind step applied");
        self.emit_position_changed(user);
        Ok(StepOutcome::Applied {
            leverage,
            health_factor: snapshot.health_factor,
            state,
        })
    }

    /// Puts withdrawn collateral back. Parks it on the position if the market refuses.
    fn resupply_or_park(&mut self, user: UserId, amount: Amount) -> Amount {
        let Some(asset) = self.positions.get(&user).map(|p| p.collateral_asset) else {
            return amount;
        };
        match self.market.supply(user, asset, amount) {
            Ok(()) => Amount::zero(),
            Err(e) => {
                warn!(user = user.0, error = %e, "resupply failed, parking collateral");
                if let Some(position) = self.positions.get_mut(&user) {
                    position.residual_collateral = position.residual_collateral.add(amount);
                }
                amount
            }
        }
    }
}
