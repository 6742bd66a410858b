//! Cache of positions the decision engine is watching.
//!
//! Never authoritative: quantities here are whatever the last notification
//! said, and the state machine re-reads everything live when it acts.

use crate::events::PositionChangedEvent;
use crate::position::PositionState;
use crate::types::{AssetId, BlockHeight, Leverage, Price, UserId};
use rust_decimal::Decimal;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct TrackedPosition {
    pub user: UserId,
    pub state: PositionState,
    pub current_leverage: Leverage,
    pub target_leverage: Leverage,
    pub health_factor: Decimal,
    pub min_health_factor: Decimal,
    pub iteration: u32,
    pub max_iterations: u32,
    pub collateral_asset: AssetId,
    pub salt: Option<u64>,
    pub take_profit: Option<Price>,
    pub stop_loss: Option<Price>,
    pub last_check: BlockHeight,
    pub liquidation_failures: u32,
    pub last_failure: Option<String>,
}

impl TrackedPosition {
    fn from_event(event: &PositionChangedEvent, height: BlockHeight) -> Self {
        Self {
            user: event.user,
            state: event.state,
            current_leverage: event.current_leverage,
            target_leverage: event.target_leverage,
            health_factor: event.health_factor,
            min_health_factor: event.min_health_factor,
            iteration: event.iteration,
            max_iterations: event.max_iterations,
            collateral_asset: event.collateral_asset,
            salt: event.execution_salt,
            take_profit: event.take_profit_price,
            stop_loss: event.stop_loss_price,
            last_check: height,
            liquidation_failures: 0,
            last_failure: None,
        }
    }
}

/// Ordered by user id so sweeps are deterministic.
#[derive(Debug, Clone, Default)]
pub struct ActiveRegistry {
    entries: BTreeMap<UserId, TrackedPosition>,
    // last user served by the round-robin health sweep
    cursor: Option<UserId>,
}

impl ActiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a notification. Unlevered idle reports drop the entry;
    /// failure counters survive updates.
    pub fn observe(&mut self, event: &PositionChangedEvent, height: BlockHeight) {
        if event.state == PositionState::Idle && event.current_leverage.is_unlevered() {
            self.entries.remove(&event.user);
            return;
        }
        let mut entry = TrackedPosition::from_event(event, height);
        if let Some(previous) = self.entries.get(&event.user) {
            entry.liquidation_failures = previous.liquidation_failures;
            entry.last_failure = previous.last_failure.clone();
        }
        self.entries.insert(event.user, entry);
    }

    pub fn get(&self, user: UserId) -> Option<&TrackedPosition> {
        self.entries.get(&user)
    }

    pub fn get_mut(&mut self, user: UserId) -> Option<&mut TrackedPosition> {
        self.entries.get_mut(&user)
    }

    pub fn contains(&self, user: UserId) -> bool {
        self.entries.contains_key(&user)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackedPosition> {
        self.entries.values()
    }

    pub fn on_asset(&self, asset: AssetId) -> Vec<UserId> {
        self.entries
            .values()
            .filter(|t| t.collateral_asset == asset)
            .map(|t| t.user)
            .collect()
    }

    /// Up to `cap` users not checked for `limit` blocks, oldest first.
    pub fn stale(&self, height: BlockHeight, limit: u64, cap: usize) -> Vec<UserId> {
        let mut stale: Vec<&TrackedPosition> = self
            .entries
            .values()
            .filter(|t| height.since(t.last_check) >= limit)
            .collect();
        stale.sort_by_key(|t| (t.last_check, t.user));
        stale.into_iter().take(cap).map(|t| t.user).collect()
    }

    /// Next `count` users after the cursor, wrapping, skipping `exclude`.
    pub fn round_robin(&mut self, count: usize, exclude: &[UserId]) -> Vec<UserId> {
        let eligible: Vec<UserId> = self.entries.keys().copied().filter(|u| !exclude.contains(u)).collect();
        if eligible.is_empty() || count == 0 {
            return Vec::new();
        }
        let start = match self.cursor {
            Some(c) => eligible.iter().position(|u| *u > c).unwrap_or(0),
            None => 0,
        };
        let picked: Vec<UserId> = eligible
            .iter()
            .cycle()
            .skip(start)
            .take(count.min(eligible.len()))
            .copied()
            .collect();
        self.cursor = picked.last().copied();
        picked
    }

    pub fn restamp(&mut self, users: &[UserId], height: BlockHeight) {
        for user in users {
            if let Some(entry) = self.entries.get_mut(user) {
                entry.last_check = height;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn changed(user: u64, state: PositionState, leverage: Decimal) -> PositionChangedEvent {
        PositionChangedEvent {
            user: UserId(user),
            current_leverage: Leverage::saturating(leverage),
            target_leverage: Leverage::saturating(dec!(2)),
            health_factor: dec!(2),
            min_health_factor: dec!(1.15),
            iteration: 0,
            max_iterations: 5,
            state,
            collateral_asset: AssetId(1),
            execution_salt: None,
            take_profit_price: None,
            stop_loss_price: None,
        }
    }

    #[test]
    fn idle_with_exposure_stays_tracked() {
        let mut reg = ActiveRegistry::new();
        reg.observe(&changed(1, PositionState::Looping, dec!(1)), BlockHeight(1));
        reg.observe(&changed(1, PositionState::Idle, dec!(2)), BlockHeight(2));
        assert!(reg.contains(UserId(1)));

        reg.observe(&changed(1, PositionState::Idle, dec!(1)), BlockHeight(3));
        assert!(!reg.contains(UserId(1)));
    }

    #[test]
    fn stale_sorted_and_capped() {
        let mut reg = ActiveRegistry::new();
        reg.observe(&changed(1, PositionState::Looping, dec!(1.5)), BlockHeight(10));
        reg.observe(&changed(2, PositionState::Looping, dec!(1.5)), BlockHeight(5));
        reg.observe(&changed(3, PositionState::Looping, dec!(1.5)), BlockHeight(90));
        assert_eq!(reg.stale(BlockHeight(110), 100, 5), vec![UserId(2), UserId(1)]);
        assert_eq!(reg.stale(BlockHeight(110), 100, 1), vec![UserId(2)]);
    }

    #[test]
    fn round_robin_wraps() {
        let mut reg = ActiveRegistry::new();
        for u in 1..=3 {
            reg.observe(&changed(u, PositionState::Looping, dec!(1.5)), BlockHeight(1));
        }
        assert_eq!(reg.round_robin(2, &[]), vec![UserId(1), UserId(2)]);
        assert_eq!(reg.round_robin(2, &[]), vec![UserId(3), UserId(1)]);
        assert_eq!(reg.round_robin(5, &[UserId(2)]), vec![UserId(3), UserId(1)]);
    }
}
