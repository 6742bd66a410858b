// 5.1 mock.rs: MOCKED. in-memory lending market, swap venue and bridge rail.
// used by tests and the simulator. no tokens move, only balances change.
// failure injection lets tests drive every recovery path.

use std::collections::{HashMap, HashSet};

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

use crate::funding::{BridgeRail, RailError};
use crate::leverage::WAD_DECIMALS;
use crate::market::{
    AccountSnapshot, LendingMarket, MarketError, ReserveParams, ReserveRates, SwapRequest, SwapRouter,
};
use crate::types::{Amount, AssetId, BlockHeight, Bps, Identity, Price, UserId};

fn wad(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(WAD_DECIMALS, RoundingStrategy::ToZero)
}

#[derive(Debug, Clone)]
pub struct MockReserve {
    pub price: Decimal,
    pub ltv: Decimal,
    pub liquidation_threshold: Decimal,
    pub liquidity: Decimal,
    pub supply_rate: Decimal,
    pub borrow_rate: Decimal,
}

#[derive(Debug, Clone, Default)]
struct MockAccount {
    supplied: HashMap<AssetId, Decimal>,
    borrowed: HashMap<AssetId, Decimal>,
    collateral_enabled: HashSet<AssetId>,
}

/// In-memory lending market with per-reserve prices and liquidity.
#[derive(Debug, Clone)]
pub struct MockLendingMarket {
    reserves: HashMap<AssetId, MockReserve>,
    accounts: HashMap<UserId, MockAccount>,
    flash_premium: Bps,
    flash_outstanding: HashMap<AssetId, Decimal>,
    failing_users: HashSet<UserId>,
    // balance reads that error while writes keep working
    fail_collateral_reads: bool,
    fail_debt_reads: bool,
    revoked: HashSet<UserId>,
}

impl Default for MockLendingMarket {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLendingMarket {
    pub fn new() -> Self {
        Self {
            reserves: HashMap::new(),
            accounts: HashMap::new(),
            flash_premium: Bps::new(9),
            flash_outstanding: HashMap::new(),
            failing_users: HashSet::new(),
            fail_collateral_reads: false,
            fail_debt_reads: false,
            revoked: HashSet::new(),
        }
    }

    pub fn with_reserve(
        mut self,
        asset: AssetId,
        price: Decimal,
        ltv: Decimal,
        liquidation_threshold: Decimal,
        liquidity: Decimal,
    ) -> Self {
        self.reserves.insert(
            asset,
            MockReserve {
                price,
                ltv,
                liquidation_threshold,
                liquidity,
                supply_rate: dec!(0.03),
                borrow_rate: dec!(0.02),
            },
        );
        self
    }

    pub fn set_price(&mut self, asset: AssetId, price: Decimal) {
        if let Some(r) = self.reserves.get_mut(&asset) {
            r.price = price;
        }
    }

    pub fn set_liquidity(&mut self, asset: AssetId, liquidity: Decimal) {
        if let Some(r) = self.reserves.get_mut(&asset) {
            r.liquidity = liquidity;
        }
    }

    pub fn set_rates(&mut self, asset: AssetId, supply_rate: Decimal, borrow_rate: Decimal) {
        if let Some(r) = self.reserves.get_mut(&asset) {
            r.supply_rate = supply_rate;
            r.borrow_rate = borrow_rate;
        }
    }

    pub fn set_flash_premium(&mut self, premium: Bps) {
        self.flash_premium = premium;
    }

    /// Every call scoped to `user` fails until cleared.
    pub fn fail_user(&mut self, user: UserId) {
        self.failing_users.insert(user);
    }

    /// Makes `collateral_balance` and/or `debt_balance` fail for everyone.
    pub fn fail_balance_reads(&mut self, collateral: bool, debt: bool) {
        self.fail_collateral_reads = collateral;
        self.fail_debt_reads = debt;
    }

    pub fn clear_failures(&mut self) {
        self.failing_users.clear();
        self.fail_collateral_reads = false;
        self.fail_debt_reads = false;
    }

    pub fn allowances_revoked(&self, user: UserId) -> bool {
        self.revoked.contains(&user)
    }

    pub fn supplied(&self, user: UserId, asset: AssetId) -> Decimal {
        self.accounts
            .get(&user)
            .and_then(|a| a.supplied.get(&asset).copied())
            .unwrap_or(Decimal::ZERO)
    }

    pub fn borrowed(&self, user: UserId, asset: AssetId) -> Decimal {
        self.accounts
            .get(&user)
            .and_then(|a| a.borrowed.get(&asset).copied())
            .unwrap_or(Decimal::ZERO)
    }

    pub fn flash_outstanding(&self, asset: AssetId) -> Decimal {
        self.flash_outstanding.get(&asset).copied().unwrap_or(Decimal::ZERO)
    }

    fn reserve(&self, asset: AssetId) -> Result<&MockReserve, MarketError> {
        self.reserves.get(&asset).ok_or(MarketError::UnknownAsset(asset))
    }

    fn reserve_mut(&mut self, asset: AssetId) -> Result<&mut MockReserve, MarketError> {
        self.reserves.get_mut(&asset).ok_or(MarketError::UnknownAsset(asset))
    }

    fn guard(&self, user: UserId) -> Result<(), MarketError> {
        if self.failing_users.contains(&user) {
            return Err(MarketError::Unavailable(format!("account {} frozen", user.0)));
        }
        Ok(())
    }

    fn snapshot_of(&self, account: &MockAccount) -> AccountSnapshot {
        let mut collateral = Decimal::ZERO;
        let mut weighted_ltv = Decimal::ZERO;
        let mut weighted_lt = Decimal::ZERO;
        for (asset, amount) in &account.supplied {
            if !account.collateral_enabled.contains(asset) {
                continue;
            }
            if let Some(r) = self.reserves.get(asset) {
                let value = *amount * r.price;
                collateral += value;
                weighted_ltv += value * r.ltv;
                weighted_lt += value * r.liquidation_threshold;
            }
        }
        let debt: Decimal = account
            .borrowed
            .iter()
            .filter_map(|(asset, amount)| self.reserves.get(asset).map(|r| *amount * r.price))
            .sum();

        let (ltv, lt) = if collateral.is_zero() {
            (Decimal::ZERO, Decimal::ZERO)
        } else {
            (weighted_ltv / collateral, weighted_lt / collateral)
        };
        let health_factor = if debt.is_zero() {
            Decimal::MAX
        } else {
            wad(weighted_lt / debt)
        };

        AccountSnapshot {
            total_collateral: wad(collateral),
            total_debt: wad(debt),
            available_borrow: wad((weighted_ltv - debt).max(Decimal::ZERO)),
            liquidation_threshold: wad(lt),
            ltv: wad(ltv),
            health_factor,
        }
    }
}

impl LendingMarket for MockLendingMarket {
    fn supply(&mut self, user: UserId, asset: AssetId, amount: Amount) -> Result<(), MarketError> {
        self.guard(user)?;
        self.reserve_mut(asset)?.liquidity += amount.value();
        let account = self.accounts.entry(user).or_default();
        *account.supplied.entry(asset).or_insert(Decimal::ZERO) += amount.value();
        Ok(())
    }

    fn withdraw(&mut self, user: UserId, asset: AssetId, amount: Amount) -> Result<Amount, MarketError> {
        self.guard(user)?;
        self.reserve(asset)?;
        let held = self.supplied(user, asset);
        if amount.value() > held {
            return Err(MarketError::InsufficientBalance {
                requested: amount,
                held: Amount::new(held),
            });
        }

        let mut after = self.accounts.get(&user).cloned().unwrap_or_default();
        after.supplied.insert(asset, held - amount.value());
        let snapshot = self.snapshot_of(&after);
        if snapshot.has_debt() && snapshot.health_factor < Decimal::ONE {
            return Err(MarketError::HealthFactorTooLow);
        }

        self.accounts.insert(user, after);
        let reserve = self.reserve_mut(asset)?;
        reserve.liquidity = (reserve.liquidity - amount.value()).max(Decimal::ZERO);
        Ok(amount)
    }

    fn borrow(&mut self, user: UserId, asset: AssetId, amount: Amount) -> Result<Amount, MarketError> {
        self.guard(user)?;
        let reserve = self.reserve(asset)?;
        if amount.value() > reserve.liquidity {
            return Err(MarketError::InsufficientLiquidity {
                asset,
                requested: amount,
                available: Amount::new(reserve.liquidity),
            });
        }
        let value = amount.value() * reserve.price;
        let account = self.accounts.get(&user).cloned().unwrap_or_default();
        if value > self.snapshot_of(&account).available_borrow {
            return Err(MarketError::HealthFactorTooLow);
        }

        self.reserve_mut(asset)?.liquidity -= amount.value();
        let account = self.accounts.entry(user).or_default();
        *account.borrowed.entry(asset).or_insert(Decimal::ZERO) += amount.value();
        Ok(amount)
    }

    fn repay(&mut self, user: UserId, asset: AssetId, amount: Amount) -> Result<Amount, MarketError> {
        self.guard(user)?;
        self.reserve(asset)?;
        let owed = self.borrowed(user, asset);
        let applied = amount.value().min(owed);
        if let Some(account) = self.accounts.get_mut(&user) {
            account.borrowed.insert(asset, owed - applied);
        }
        self.reserve_mut(asset)?.liquidity += applied;
        Ok(Amount::new(applied))
    }

    fn enable_collateral(&mut self, user: UserId, asset: AssetId) -> Result<(), MarketError> {
        self.guard(user)?;
        self.reserve(asset)?;
        self.accounts.entry(user).or_default().collateral_enabled.insert(asset);
        Ok(())
    }

    fn revoke_allowances(&mut self, user: UserId) -> Result<(), MarketError> {
        self.guard(user)?;
        self.revoked.insert(user);
        Ok(())
    }

    fn account_snapshot(&self, user: UserId) -> Result<AccountSnapshot, MarketError> {
        self.guard(user)?;
        let account = self.accounts.get(&user).cloned().unwrap_or_default();
        Ok(self.snapshot_of(&account))
    }

    fn collateral_balance(&self, user: UserId, asset: AssetId) -> Result<Amount, MarketError> {
        self.guard(user)?;
        if self.fail_collateral_reads {
            return Err(MarketError::Unavailable("collateral read timed out".to_string()));
        }
        Ok(Amount::new(self.supplied(user, asset)))
    }

    fn debt_balance(&self, user: UserId, asset: AssetId) -> Result<Amount, MarketError> {
        self.guard(user)?;
        if self.fail_debt_reads {
            return Err(MarketError::Unavailable("debt read timed out".to_string()));
        }
        Ok(Amount::new(self.borrowed(user, asset)))
    }

    fn reserve_params(&self, asset: AssetId) -> Result<ReserveParams, MarketError> {
        let r = self.reserve(asset)?;
        Ok(ReserveParams {
            ltv: r.ltv,
            liquidation_threshold: r.liquidation_threshold,
        })
    }

    fn reserve_rates(&self, asset: AssetId) -> Result<ReserveRates, MarketError> {
        let r = self.reserve(asset)?;
        Ok(ReserveRates {
            supply_rate: r.supply_rate,
            borrow_rate: r.borrow_rate,
        })
    }

    fn asset_price(&self, asset: AssetId) -> Result<Price, MarketError> {
        let r = self.reserve(asset)?;
        Price::new(r.price).ok_or_else(|| MarketError::Unavailable(format!("no price for {:?}", asset)))
    }

    fn available_liquidity(&self, asset: AssetId) -> Result<Amount, MarketError> {
        Ok(Amount::new(self.reserve(asset)?.liquidity))
    }

    fn flash_premium(&self) -> Bps {
        self.flash_premium
    }

    fn flash_borrow(&mut self, asset: AssetId, amount: Amount) -> Result<Amount, MarketError> {
        let reserve = self.reserve_mut(asset)?;
        if amount.value() > reserve.liquidity {
            return Err(MarketError::InsufficientLiquidity {
                asset,
                requested: amount,
                available: Amount::new(reserve.liquidity),
            });
        }
        reserve.liquidity -= amount.value();
        *self.flash_outstanding.entry(asset).or_insert(Decimal::ZERO) += amount.value();
        Ok(amount)
    }

    fn flash_repay(&mut self, asset: AssetId, amount: Amount) -> Result<(), MarketError> {
        let principal = self.flash_outstanding(asset);
        let owed = (principal * (Decimal::ONE + self.flash_premium.as_fraction()))
            .round_dp_with_strategy(WAD_DECIMALS, RoundingStrategy::AwayFromZero);
        if amount.value() < owed {
            return Err(MarketError::FlashRepayShort {
                owed: Amount::new(owed),
                offered: amount,
            });
        }
        self.flash_outstanding.remove(&asset);
        self.reserve_mut(asset)?.liquidity += amount.value();
        Ok(())
    }

    fn flash_revert(&mut self, asset: AssetId, amount: Amount) {
        let outstanding = self.flash_outstanding(asset);
        let remaining = (outstanding - amount.value()).max(Decimal::ZERO);
        if remaining.is_zero() {
            self.flash_outstanding.remove(&asset);
        } else {
            self.flash_outstanding.insert(asset, remaining);
        }
        if let Some(r) = self.reserves.get_mut(&asset) {
            r.liquidity += amount.value();
        }
    }
}

/// Constant-price swap venue with a flat fee and optional execution shortfall.
#[derive(Debug, Clone)]
pub struct MockSwapRouter {
    prices: HashMap<AssetId, Decimal>,
    fee: Bps,
    // extra loss applied at execution vs. the quote
    shortfall: Bps,
    height: BlockHeight,
    failures_remaining: u32,
}

impl Default for MockSwapRouter {
    fn default() -> Self {
        Self::new(Bps::new(30))
    }
}

impl MockSwapRouter {
    pub fn new(fee: Bps) -> Self {
        Self {
            prices: HashMap::new(),
            fee,
            shortfall: Bps::new(0),
            height: BlockHeight::genesis(),
            failures_remaining: 0,
        }
    }

    pub fn with_price(mut self, asset: AssetId, price: Decimal) -> Self {
        self.prices.insert(asset, price);
        self
    }

    pub fn set_price(&mut self, asset: AssetId, price: Decimal) {
        self.prices.insert(asset, price);
    }

    pub fn set_height(&mut self, height: BlockHeight) {
        self.height = height;
    }

    pub fn set_shortfall(&mut self, shortfall: Bps) {
        self.shortfall = shortfall;
    }

    /// The next `count` swaps fail as if the venue were down.
    pub fn fail_next(&mut self, count: u32) {
        self.failures_remaining = count;
    }

    fn price(&self, asset: AssetId) -> Option<Decimal> {
        self.prices.get(&asset).copied().filter(|p| *p > Decimal::ZERO)
    }
}

impl SwapRouter for MockSwapRouter {
    fn quote(&self, from: AssetId, to: AssetId, amount_in: Amount) -> Result<Amount, MarketError> {
        let (Some(p_from), Some(p_to)) = (self.price(from), self.price(to)) else {
            return Err(MarketError::NoRoute { from, to });
        };
        let out = amount_in.value() * p_from / p_to * self.fee.complement();
        Ok(Amount::new(wad(out)))
    }

    fn swap(&mut self, request: SwapRequest) -> Result<Amount, MarketError> {
        if self.failures_remaining > 0 {
            self.failures_remaining -= 1;
            return Err(MarketError::Unavailable("swap venue down".to_string()));
        }
        if self.height > request.deadline {
            return Err(MarketError::DeadlineExpired(request.deadline));
        }
        let quoted = self.quote(request.from, request.to, request.amount_in)?;
        let actual = Amount::new(wad(quoted.value() * self.shortfall.complement()));
        if actual < request.min_out {
            return Err(MarketError::Slippage {
                min_out: request.min_out,
                actual,
            });
        }
        Ok(actual)
    }
}

/// Records every transfer. Each path can be switched off independently.
#[derive(Debug, Clone, Default)]
pub struct MockBridgeRail {
    pub fail_structured: bool,
    pub fail_transfer: bool,
    pub deposits: Vec<(Identity, Amount)>,
    pub transfers: Vec<(Identity, Amount)>,
}

impl BridgeRail for MockBridgeRail {
    fn deposit_for(&mut self, target: Identity, amount: Amount) -> Result<(), RailError> {
        if self.fail_structured {
            return Err(RailError("deposit contract reverted".to_string()));
        }
        self.deposits.push((target, amount));
        Ok(())
    }

    fn transfer(&mut self, target: Identity, amount: Amount) -> Result<(), RailError> {
        if self.fail_transfer {
            return Err(RailError("transfer rejected".to_string()));
        }
        self.transfers.push((target, amount));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WETH: AssetId = AssetId(1);
    const USDC: AssetId = AssetId(2);

    fn market() -> MockLendingMarket {
        MockLendingMarket::new()
            .with_reserve(WETH, dec!(2000), dec!(0.8), dec!(0.85), dec!(1_000))
            .with_reserve(USDC, dec!(1), dec!(0.8), dec!(0.85), dec!(1_000_000))
    }

    #[test]
    fn snapshot_tracks_enabled_collateral() {
        let mut m = market();
        let user = UserId(1);
        m.supply(user, WETH, Amount::new(dec!(1))).unwrap();
        assert_eq!(m.account_snapshot(user).unwrap().total_collateral, Decimal::ZERO);

        m.enable_collateral(user, WETH).unwrap();
        let snap = m.account_snapshot(user).unwrap();
        assert_eq!(snap.total_collateral, dec!(2000));
        assert_eq!(snap.available_borrow, dec!(1600));
        assert_eq!(snap.health_factor, Decimal::MAX);
    }

    #[test]
    fn borrow_respects_ltv() {
        let mut m = market();
        let user = UserId(1);
        m.supply(user, WETH, Amount::new(dec!(1))).unwrap();
        m.enable_collateral(user, WETH).unwrap();

        assert!(matches!(
            m.borrow(user, USDC, Amount::new(dec!(1700))),
            Err(MarketError::HealthFactorTooLow)
        ));
        m.borrow(user, USDC, Amount::new(dec!(1000))).unwrap();
        let snap = m.account_snapshot(user).unwrap();
        assert_eq!(snap.total_debt, dec!(1000));
        assert_eq!(snap.health_factor, dec!(1.7));
    }

    #[test]
    fn withdraw_blocked_below_health_one() {
        let mut m = market();
        let user = UserId(1);
        m.supply(user, WETH, Amount::new(dec!(1))).unwrap();
        m.enable_collateral(user, WETH).unwrap();
        m.borrow(user, USDC, Amount::new(dec!(1500))).unwrap();
        assert!(matches!(
            m.withdraw(user, WETH, Amount::new(dec!(0.5))),
            Err(MarketError::HealthFactorTooLow)
        ));
    }

    #[test]
    fn flash_loan_requires_premium() {
        let mut m = market();
        m.flash_borrow(USDC, Amount::new(dec!(1000))).unwrap();
        assert!(matches!(
            m.flash_repay(USDC, Amount::new(dec!(1000))),
            Err(MarketError::FlashRepayShort { .. })
        ));
        m.flash_repay(USDC, Amount::new(dec!(1000.9))).unwrap();
        assert_eq!(m.flash_outstanding(USDC), Decimal::ZERO);
    }

    #[test]
    fn swap_applies_fee_and_min_out() {
        let mut router = MockSwapRouter::new(Bps::new(30))
            .with_price(WETH, dec!(2000))
            .with_price(USDC, dec!(1));
        let quoted = router.quote(USDC, WETH, Amount::new(dec!(2000))).unwrap();
        assert_eq!(quoted.value(), dec!(0.997));

        router.set_shortfall(Bps::new(100));
        let err = router
            .swap(SwapRequest {
                from: USDC,
                to: WETH,
                amount_in: Amount::new(dec!(2000)),
                min_out: quoted,
                deadline: BlockHeight(10),
            })
            .unwrap_err();
        assert!(matches!(err, MarketError::Slippage { .. }));
    }

    #[test]
    fn injected_failures_are_consumed() {
        let mut router = MockSwapRouter::default()
            .with_price(WETH, dec!(2000))
            .with_price(USDC, dec!(1));
        router.fail_next(1);
        let req = SwapRequest {
            from: WETH,
            to: USDC,
            amount_in: Amount::new(dec!(1)),
            min_out: Amount::zero(),
            deadline: BlockHeight(1),
        };
        assert!(router.swap(req).is_err());
        assert!(router.swap(req).is_ok());
    }
}
