//! Flash-loan paths. Each runs as one transaction-shaped sequence: any leg
//! failing compensates the legs already done and reverts the loan.

use super::core::PositionStateMachine;
use super::results::{EngineError, StepOutcome};
use crate::events::StepPhase;
use crate::leverage::{
    flash_leverage_amount, flash_owed, flash_unwind_amount, to_units, withdraw_for_repay, LeverageError,
};
use crate::market::{AccountSnapshot, LendingMarket, MarketError, SwapRouter};
use crate::position::{Position, PositionState};
use crate::types::{Amount, UserId};
use tracing::{debug, error, warn};

impl<L: LendingMarket, S: SwapRouter> PositionStateMachine<L, S> {
    /// flash borrow -> swap -> supply -> borrow -> flash repay.
    pub(super) fn flash_lever_up(
        &mut self,
        user: UserId,
        snapshot: &AccountSnapshot,
    ) -> Result<StepOutcome, EngineError> {
        let p = self.require_position(user)?.clone();
        let premium = self.market.flash_premium();
        let value = flash_leverage_amount(
            snapshot.total_collateral,
            snapshot.total_debt,
            p.target_leverage.value(),
            snapshot.ltv,
            self.risk.params.safety_buffer,
            premium,
            p.slippage_tolerance,
        )?;
        let borrow_price = self.market.asset_price(p.borrow_asset)?;
        let units = Amount::new(to_units(value, borrow_price.value())?);
        if units.is_zero() {
            debug!(user = user.0, "no flash capacity");
            self.transition(user, PositionState::Idle)?;
            self.emit_position_changed(user);
            return Ok(StepOutcome::CapacityExhausted);
        }

        let loan = match self.market.flash_borrow(p.borrow_asset, units) {
            Ok(amount) => amount,
            Err(e) => return self.recover(user, StepPhase::FlashLoan, &e, Amount::zero(), Amount::zero()),
        };
        let received = match self.convert(p.borrow_asset, p.collateral_asset, loan, p.slippage_tolerance) {
            Ok(amount) => amount,
            Err(e) => {
                self.market.flash_revert(p.borrow_asset, loan);
                return self.recover(user, StepPhase::Swap, &e, Amount::zero(), Amount::zero());
            }
        };
        if let Err(e) = self.market.supply(user, p.collateral_asset, received) {
            self.market.flash_revert(p.borrow_asset, loan);
            return self.recover(user, StepPhase::Supply, &e, Amount::zero(), Amount::zero());
        }

        let owed = Amount::new(flash_owed(loan.value(), premium)?);
        if let Err(e) = self.market.borrow(user, p.borrow_asset, owed) {
            self.revert_lever_up(user, &p, loan, received, Amount::zero());
            return self.recover(user, StepPhase::Borrow, &e, Amount::zero(), Amount::zero());
        }
        if let Err(e) = self.market.flash_repay(p.borrow_asset, owed) {
            self.revert_lever_up(user, &p, loan, received, owed);
            return self.recover(user, StepPhase::FlashLoan, &e, Amount::zero(), Amount::zero());
        }

        self.require_position_mut(user)?.current_iteration += 1;
        self.finish_loop_step(user, owed, received, true)
    }

    fn revert_lever_up(&mut self, user: UserId, p: &Position, loan: Amount, supplied: Amount, borrowed: Amount) {
        if !borrowed.is_zero() {
            if let Err(e) = self.market.repay(user, p.borrow_asset, borrowed) {
                error!(user = user.0, error = %e, "flash revert: repay failed");
            }
        }
        if let Err(e) = self.market.withdraw(user, p.collateral_asset, supplied) {
            error!(user = user.0, error = %e, "flash revert: withdraw failed");
        }
        self.market.flash_revert(p.borrow_asset, loan);
    }

    /// flash borrow debt -> repay -> withdraw -> swap -> flash repay.
    pub(super) fn flash_unwind(&mut self, user: UserId) -> Result<StepOutcome, EngineError> {
        let p = self.require_position(user)?.clone();
        let premium = self.market.flash_premium();
        let debt = self.market.debt_balance(user, p.borrow_asset)?;
        let (principal, owed) = flash_unwind_amount(debt.value(), premium)?;
        let owed = Amount::new(owed);

        // enough collateral to buy back the loan plus premium after slippage,
        // sized before the loan opens so a failed read leaves nothing to unwind
        let collateral_price = self.market.asset_price(p.collateral_asset)?;
        let borrow_price = self.market.asset_price(p.borrow_asset)?;
        let owed_value = owed
            .value()
            .checked_mul(borrow_price.value())
            .ok_or(LeverageError::Overflow("flash_unwind"))?;
        let needed = withdraw_for_repay(owed_value, p.slippage_tolerance)?;
        let held = self.market.collateral_balance(user, p.collateral_asset)?;
        let units = Amount::new(to_units(needed, collateral_price.value())?).min(held);

        let loan = match self.market.flash_borrow(p.borrow_asset, Amount::new(principal)) {
            Ok(amount) => amount,
            Err(e) => return self.recover(user, StepPhase::FlashLoan, &e, Amount::zero(), Amount::zero()),
        };
        let repaid = match self.market.repay(user, p.borrow_asset, loan) {
            Ok(amount) => amount,
            Err(e) => {
                self.market.flash_revert(p.borrow_asset, loan);
                return self.recover(user, StepPhase::Repay, &e, Amount::zero(), Amount::zero());
            }
        };

        let withdrawn = match self.market.withdraw(user, p.collateral_asset, units) {
            Ok(amount) => amount,
            Err(e) => {
                self.revert_unwind(user, &p, loan, repaid, Amount::zero());
                return self.recover(user, StepPhase::Withdraw, &e, Amount::zero(), Amount::zero());
            }
        };
        let received = match self.convert(p.collateral_asset, p.borrow_asset, withdrawn, p.slippage_tolerance) {
            Ok(amount) => amount,
            Err(e) => {
                self.revert_unwind(user, &p, loan, repaid, withdrawn);
                return self.recover(user, StepPhase::Swap, &e, Amount::zero(), Amount::zero());
            }
        };
        if received < owed {
            let e = MarketError::FlashRepayShort { owed, offered: received };
            self.revert_unwind(user, &p, loan, repaid, withdrawn);
            return self.recover(user, StepPhase::FlashLoan, &e, Amount::zero(), Amount::zero());
        }
        if let Err(e) = self.market.flash_repay(p.borrow_asset, owed) {
            self.revert_unwind(user, &p, loan, repaid, withdrawn);
            return self.recover(user, StepPhase::FlashLoan, &e, Amount::zero(), Amount::zero());
        }

        {
            let position = self.require_position_mut(user)?;
            position.residual_borrow = position.residual_borrow.add(received.saturating_sub(owed));
            position.unwind_steps += 1;
        }
        self.finish_unwind_step(user, withdrawn, repaid, true)
    }

    fn revert_unwind(&mut self, user: UserId, p: &Position, loan: Amount, repaid: Amount, withdrawn: Amount) {
        if !withdrawn.is_zero() {
            if let Err(e) = self.market.supply(user, p.collateral_asset, withdrawn) {
                warn!(user = user.0, error = %e, "flash revert: resupply failed, parking collateral");
                if let Some(position) = self.positions.get_mut(&user) {
                    position.residual_collateral = position.residual_collateral.add(withdrawn);
                }
            }
        }
        if !repaid.is_zero() {
            if let Err(e) = self.market.borrow(user, p.borrow_asset, repaid) {
                error!(user = user.0, error = %e, "flash revert: re-borrow failed");
            }
        }
        self.market.flash_revert(p.borrow_asset, loan);
    }
}
