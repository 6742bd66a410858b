// 9.2: last observed price per pool. used only to detect moves and evaluate
// triggers before instructing; the state machine re-reads live prices.

use crate::types::{PoolId, Price};
use rust_decimal::Decimal;
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct PriceCache {
    prices: HashMap<PoolId, Price>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `price` and returns its deviation from the previous one in bps.
    /// `None` on the first observation of a pool.
    pub fn update(&mut self, pool: PoolId, price: Price) -> Option<Decimal> {
        self.prices
            .insert(pool, price)
            .map(|previous| price.deviation_bps(previous))
    }

    pub fn get(&self, pool: PoolId) -> Option<Price> {
        self.prices.get(&pool).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn reports_deviation_from_previous() {
        let mut cache = PriceCache::new();
        let pool = PoolId(1);
        assert_eq!(cache.update(pool, Price::new_unchecked(dec!(100))), None);
        assert_eq!(cache.update(pool, Price::new_unchecked(dec!(103))), Some(dec!(300)));
        assert_eq!(cache.get(pool), Some(Price::new_unchecked(dec!(103))));
    }
}
