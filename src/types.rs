// 1.0: all the primitives live here. ids, heights, amounts, prices, leverage, bps.
// each is a newtype so the compiler catches a price passed where an amount belongs.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoolId(pub u32);

// an execution identity on either ledger: owner keys, the relay's verified
// sender, the state machine's own address as an approval spender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity(pub u64);

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

// 1.1: block height. every "wait" in the system is a height comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockHeight(pub u64);

impl BlockHeight {
    pub fn genesis() -> Self {
        Self(0)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn advance(&self, blocks: u64) -> Self {
        Self(self.0.saturating_add(blocks))
    }

    /// Blocks elapsed since `earlier`, zero if `earlier` is in the future.
    pub fn since(&self, earlier: BlockHeight) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl fmt::Display for BlockHeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// 1.2: token amount in asset units, or a base-currency value. never negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Amount(Decimal);

impl Amount {
    pub fn new(value: Decimal) -> Self {
        debug_assert!(value >= Decimal::ZERO);
        Self(value.max(Decimal::ZERO))
    }

    pub fn zero() -> Self {
        Self(Decimal::ZERO)
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn add(&self, other: Amount) -> Self {
        Self(self.0 + other.0)
    }

    // floors at zero
    pub fn saturating_sub(&self, other: Amount) -> Self {
        Self((self.0 - other.0).max(Decimal::ZERO))
    }

    pub fn min(self, other: Amount) -> Self {
        if self.0 <= other.0 {
            self
        } else {
            other
        }
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PartialOrd for Amount {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Amount {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::zero(), |acc, a| acc.add(a))
    }
}

// 1.3: price of one unit of an asset in the lending market's base currency. must be positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Price(Decimal);

impl Price {
    #[must_use]
    pub fn new(value: Decimal) -> Option<Self> {
        if value > Decimal::ZERO {
            Some(Self(value))
        } else {
            None
        }
    }

    pub fn new_unchecked(value: Decimal) -> Self {
        debug_assert!(value > Decimal::ZERO);
        Self(value)
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    /// Absolute relative move from `baseline`, in basis points.
    pub fn deviation_bps(&self, baseline: Price) -> Decimal {
        ((self.0 - baseline.0) / baseline.0).abs() * dec!(10_000)
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// 1.4: leverage ratio. collateral / equity, so never below 1x.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Leverage(Decimal);

impl Leverage {
    pub const ONE: Leverage = Leverage(Decimal::ONE);

    #[must_use]
    pub fn new(value: Decimal) -> Option<Self> {
        if value >= Decimal::ONE {
            Some(Self(value))
        } else {
            None
        }
    }

    // clamps rounding noise below 1x back to 1x
    pub fn saturating(value: Decimal) -> Self {
        Self(value.max(Decimal::ONE))
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    pub fn is_unlevered(&self) -> bool {
        self.0 <= Decimal::ONE
    }
}

impl fmt::Display for Leverage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x", self.0.round_dp(4))
    }
}

// 1.5: basis points. 100 bps = 1%.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Bps(u32);

impl Bps {
    pub const MAX: u32 = 10_000;

    pub fn new(bps: u32) -> Self {
        Self(bps)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    pub fn as_fraction(&self) -> Decimal {
        Decimal::new(self.0 as i64, 4)
    }

    // 1 - fraction, floored at zero
    pub fn complement(&self) -> Decimal {
        (Decimal::ONE - self.as_fraction()).max(Decimal::ZERO)
    }
}

impl fmt::Display for Bps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}bps", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn leverage_floor() {
        assert!(Leverage::new(dec!(0.99)).is_none());
        assert_eq!(Leverage::saturating(dec!(0.999999)), Leverage::ONE);
        assert!(Leverage::new(dec!(1)).unwrap().is_unlevered());
    }

    #[test]
    fn bps_conversion() {
        assert_eq!(Bps::new(100).as_fraction(), dec!(0.01));
        assert_eq!(Bps::new(50).complement(), dec!(0.995));
        assert_eq!(Bps::new(20_000).complement(), Decimal::ZERO);
    }

    #[test]
    fn price_deviation() {
        let base = Price::new_unchecked(dec!(2000));
        let moved = Price::new_unchecked(dec!(2250));
        assert_eq!(moved.deviation_bps(base), dec!(1250));
    }

    #[test]
    fn height_since_saturates() {
        let h = BlockHeight(10);
        assert_eq!(h.since(BlockHeight(4)), 6);
        assert_eq!(h.since(BlockHeight(12)), 0);
    }

    #[test]
    fn amount_saturating_sub() {
        let a = Amount::new(dec!(5));
        assert_eq!(a.saturating_sub(Amount::new(dec!(7))), Amount::zero());
    }
}
