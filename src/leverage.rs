//! Leverage sizing and ratio arithmetic.
//!
//! Pure and stateless. Every input is a base-currency value (or a fraction for
//! ltv / liquidation threshold), every output is rounded to 18 decimals in the
//! direction that keeps the position safe: borrow and withdraw sizes round
//! down, required collateral rounds up.

use crate::types::Bps;
use rust_decimal::{Decimal, RoundingStrategy};

/// Fixed-point precision of every sizing result.
pub const WAD_DECIMALS: u32 = 18;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LeverageError {
    #[error("arithmetic overflow in {0}")]
    Overflow(&'static str),

    #[error("debt {debt} is not below collateral {collateral}")]
    Insolvent { collateral: Decimal, debt: Decimal },

    #[error("ratio {name} = {value} outside [0, 1)")]
    InvalidRatio { name: &'static str, value: Decimal },

    #[error("negative input {name} = {value}")]
    NegativeInput { name: &'static str, value: Decimal },

    #[error("health factor floor must be positive, got {0}")]
    InvalidHealthFloor(Decimal),
}

fn round_down(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(WAD_DECIMALS, RoundingStrategy::ToZero)
}

fn round_up(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(WAD_DECIMALS, RoundingStrategy::AwayFromZero)
}

fn mul(a: Decimal, b: Decimal, op: &'static str) -> Result<Decimal, LeverageError> {
    a.checked_mul(b).ok_or(LeverageError::Overflow(op))
}

fn div(a: Decimal, b: Decimal, op: &'static str) -> Result<Decimal, LeverageError> {
    a.checked_div(b).ok_or(LeverageError::Overflow(op))
}

fn non_negative(name: &'static str, value: Decimal) -> Result<(), LeverageError> {
    if value < Decimal::ZERO {
        return Err(LeverageError::NegativeInput { name, value });
    }
    Ok(())
}

fn fraction(name: &'static str, value: Decimal) -> Result<(), LeverageError> {
    if value < Decimal::ZERO || value >= Decimal::ONE {
        return Err(LeverageError::InvalidRatio { name, value });
    }
    Ok(())
}

/// 2.1: collateral / (collateral - debt). 1.0 with no debt.
pub fn leverage_ratio(total_collateral: Decimal, total_debt: Decimal) -> Result<Decimal, LeverageError> {
    non_negative("total_collateral", total_collateral)?;
    non_negative("total_debt", total_debt)?;
    if total_debt.is_zero() {
        return Ok(Decimal::ONE);
    }
    if total_debt >= total_collateral {
        return Err(LeverageError::Insolvent {
            collateral: total_collateral,
            debt: total_debt,
        });
    }
    let equity = total_collateral - total_debt;
    let ratio = round_down(div(total_collateral, equity, "leverage_ratio")?);
    Ok(ratio.max(Decimal::ONE))
}

/// 2.2: collateral * liquidation threshold / debt. `Decimal::MAX` with no debt.
pub fn health_factor(
    total_collateral: Decimal,
    total_debt: Decimal,
    liquidation_threshold: Decimal,
) -> Result<Decimal, LeverageError> {
    non_negative("total_collateral", total_collateral)?;
    non_negative("total_debt", total_debt)?;
    if total_debt.is_zero() {
        return Ok(Decimal::MAX);
    }
    let weighted = mul(total_collateral, liquidation_threshold, "health_factor")?;
    Ok(round_down(div(weighted, total_debt, "health_factor")?))
}

/// 2.3: largest borrow value keeping debt under a buffered fraction of the
/// ltv limit, capped by what the market says is still borrowable.
pub fn safe_borrow(
    total_collateral: Decimal,
    total_debt: Decimal,
    ltv: Decimal,
    safety_buffer: Bps,
    available_borrow: Decimal,
) -> Result<Decimal, LeverageError> {
    non_negative("total_collateral", total_collateral)?;
    non_negative("total_debt", total_debt)?;
    fraction("ltv", ltv)?;

    let limit = mul(
        mul(total_collateral, ltv, "safe_borrow")?,
        safety_buffer.complement(),
        "safe_borrow",
    )?;
    let headroom = (limit - total_debt).max(Decimal::ZERO);
    Ok(round_down(headroom.min(available_borrow.max(Decimal::ZERO))))
}

/// 2.4: borrow value that lands exactly on `target` leverage, assuming a
/// lossless conversion. zero once the target is reached.
pub fn borrow_to_target(
    total_collateral: Decimal,
    total_debt: Decimal,
    target: Decimal,
) -> Result<Decimal, LeverageError> {
    let current = leverage_ratio(total_collateral, total_debt)?;
    if current >= target {
        return Ok(Decimal::ZERO);
    }
    let equity = total_collateral - total_debt;
    let goal = mul(target, equity, "borrow_to_target")?;
    Ok(round_down((goal - total_collateral).max(Decimal::ZERO)))
}

/// 2.5: largest withdrawal value that keeps the health factor at or above
/// `min_health_factor`. everything when there is no debt, zero when there is
/// no room.
pub fn safe_withdraw(
    total_collateral: Decimal,
    total_debt: Decimal,
    liquidation_threshold: Decimal,
    min_health_factor: Decimal,
) -> Result<Decimal, LeverageError> {
    non_negative("total_collateral", total_collateral)?;
    non_negative("total_debt", total_debt)?;
    if min_health_factor <= Decimal::ZERO {
        return Err(LeverageError::InvalidHealthFloor(min_health_factor));
    }
    if total_debt.is_zero() {
        return Ok(total_collateral);
    }
    if liquidation_threshold <= Decimal::ZERO || liquidation_threshold > Decimal::ONE {
        return Err(LeverageError::InvalidRatio {
            name: "liquidation_threshold",
            value: liquidation_threshold,
        });
    }

    let required = round_up(div(
        mul(min_health_factor, total_debt, "safe_withdraw")?,
        liquidation_threshold,
        "safe_withdraw",
    )?);
    if required >= total_collateral {
        return Ok(Decimal::ZERO);
    }
    Ok(round_down(total_collateral - required))
}

/// 2.6: collateral value to withdraw so its conversion still covers `debt`
/// after worst-case slippage.
pub fn withdraw_for_repay(debt: Decimal, slippage: Bps) -> Result<Decimal, LeverageError> {
    non_negative("debt", debt)?;
    let gross = Decimal::ONE + slippage.as_fraction();
    Ok(round_up(mul(debt, gross, "withdraw_for_repay")?))
}

/// 2.7: flash-borrow value for a one-shot lever-up to `target`.
///
/// Starts from the lossless amount and shrinks it until the debt after
/// repaying the flash premium still fits the buffered ltv limit:
/// `debt + n * (1 + premium) <= (collateral + n * (1 - slippage)) * ltv * (1 - buffer)`.
pub fn flash_leverage_amount(
    total_collateral: Decimal,
    total_debt: Decimal,
    target: Decimal,
    ltv: Decimal,
    safety_buffer: Bps,
    premium: Bps,
    slippage: Bps,
) -> Result<Decimal, LeverageError> {
    fraction("ltv", ltv)?;
    let wanted = borrow_to_target(total_collateral, total_debt, target)?;
    if wanted.is_zero() {
        return Ok(Decimal::ZERO);
    }

    let k = mul(ltv, safety_buffer.complement(), "flash_leverage_amount")?;
    let cost = Decimal::ONE + premium.as_fraction();
    let gain = mul(slippage.complement(), k, "flash_leverage_amount")?;
    let denominator = cost - gain;
    let capacity = mul(total_collateral, k, "flash_leverage_amount")? - total_debt;
    if capacity <= Decimal::ZERO {
        return Ok(Decimal::ZERO);
    }
    // denominator > 0 because k < 1 and cost >= 1
    let cap = round_down(div(capacity, denominator, "flash_leverage_amount")?);
    Ok(wanted.min(cap))
}

/// 2.8: flash-borrow amount that repays all debt, plus the lender's premium
/// owed back at the end of the sequence.
pub fn flash_unwind_amount(total_debt: Decimal, premium: Bps) -> Result<(Decimal, Decimal), LeverageError> {
    Ok((total_debt, flash_owed(total_debt, premium)?))
}

/// Principal plus premium due when a flash loan closes, rounded up.
pub fn flash_owed(principal: Decimal, premium: Bps) -> Result<Decimal, LeverageError> {
    non_negative("principal", principal)?;
    Ok(round_up(mul(principal, Decimal::ONE + premium.as_fraction(), "flash_owed")?))
}

/// 2.9: theoretical ceiling of looped leverage for a given ltv: 1 / (1 - ltv).
pub fn max_leverage_for_ltv(ltv: Decimal) -> Result<Decimal, LeverageError> {
    fraction("ltv", ltv)?;
    Ok(round_down(div(Decimal::ONE, Decimal::ONE - ltv, "max_leverage_for_ltv")?))
}

/// Minimum acceptable swap output for a quote under `slippage`.
pub fn min_amount_out(quoted: Decimal, slippage: Bps) -> Decimal {
    round_down(quoted * slippage.complement())
}

/// Converts a base-currency value into asset units at `price`.
pub fn to_units(value: Decimal, price: Decimal) -> Result<Decimal, LeverageError> {
    if price <= Decimal::ZERO {
        return Err(LeverageError::InvalidRatio { name: "price", value: price });
    }
    Ok(round_down(div(value, price, "to_units")?))
}

/// Whether `current` is within `tolerance` of `target` (or beyond it).
pub fn target_reached(current: Decimal, target: Decimal, tolerance: Bps) -> bool {
    current >= target * tolerance.complement()
}
