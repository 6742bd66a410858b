// 8.0 engine/core.rs: the position state machine. owns every position, the
// risk guard and the event log, and talks to the outside world only through
// the LendingMarket and SwapRouter adapters.

use super::config::EngineConfig;
use super::results::EngineError;
use crate::events::{Event, EventId, EventLog, EventPayload, FeeCollectedEvent, PositionChangedEvent};
use crate::leverage::{leverage_ratio, min_amount_out};
use crate::market::{AccountSnapshot, LendingMarket, MarketError, SwapRequest, SwapRouter};
use crate::position::Position;
use crate::risk::{RiskGuard, RiskParams};
use crate::types::{Amount, AssetId, BlockHeight, Bps, Leverage, UserId};
use std::collections::HashMap;

/** 8.1: main state machine struct. all ledger state lives here */
#[derive(Debug)]
pub struct PositionStateMachine<L, S> {
    pub(super) config: EngineConfig,
    pub(super) market: L,
    pub(super) router: S,
    pub(super) positions: HashMap<UserId, Position>,
    pub(super) risk: RiskGuard,
    pub(super) events: EventLog,
    pub(super) height: BlockHeight,
    pub(super) paused: bool,
    pub(super) fees_accrued: Amount,
}

impl<L: LendingMarket, S: SwapRouter> PositionStateMachine<L, S> {
    pub fn new(config: EngineConfig, risk: RiskParams, market: L, router: S) -> Self {
        let events = EventLog::new(config.max_events);
        Self {
            config,
            market,
            router,
            positions: HashMap::new(),
            risk: RiskGuard::new(risk),
            events,
            height: BlockHeight::genesis(),
            paused: false,
            fees_accrued: Amount::zero(),
        }
    }

    pub fn height(&self) -> BlockHeight {
        self.height
    }

    pub fn set_height(&mut self, height: BlockHeight) {
        self.height = height;
    }

    pub fn advance_height(&mut self, blocks: u64) {
        self.height = self.height.advance(blocks);
    }

    pub fn position(&self, user: UserId) -> Option<&Position> {
        self.positions.get(&user)
    }

    pub fn positions_iter(&self) -> impl Iterator<Item = (&UserId, &Position)> {
        self.positions.iter()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn risk_params(&self) -> &RiskParams {
        &self.risk.params
    }

    pub fn market(&self) -> &L {
        &self.market
    }

    pub fn market_mut(&mut self) -> &mut L {
        &mut self.market
    }

    pub fn router(&self) -> &S {
        &self.router
    }

    pub fn router_mut(&mut self) -> &mut S {
        &mut self.router
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn fees_accrued(&self) -> Amount {
        self.fees_accrued
    }

    pub fn events(&self) -> &[Event] {
        self.events.events()
    }

    pub fn recent_events(&self, count: usize) -> &[Event] {
        self.events.recent(count)
    }

    pub fn events_since(&self, cursor: EventId) -> &[Event] {
        self.events.since(cursor)
    }

    pub fn last_event_id(&self) -> EventId {
        self.events.last_id()
    }

    pub(crate) fn emit_event(&mut self, payload: EventPayload) -> EventId {
        self.events.emit(self.height, payload)
    }

    pub(super) fn require_position(&self, user: UserId) -> Result<&Position, EngineError> {
        self.positions.get(&user).ok_or(EngineError::PositionNotFound(user))
    }

    pub(super) fn require_position_mut(&mut self, user: UserId) -> Result<&mut Position, EngineError> {
        self.positions.get_mut(&user).ok_or(EngineError::PositionNotFound(user))
    }

    pub(super) fn ensure_running(&self) -> Result<(), EngineError> {
        if self.paused {
            return Err(EngineError::Paused);
        }
        Ok(())
    }

    pub(super) fn changed_event(position: &Position) -> PositionChangedEvent {
        PositionChangedEvent {
            user: position.user,
            current_leverage: position.current_leverage,
            target_leverage: position.target_leverage,
            health_factor: position.last_health_factor,
            min_health_factor: position.min_health_factor,
            iteration: position.current_iteration,
            max_iterations: position.max_iterations,
            state: position.state,
            collateral_asset: position.collateral_asset,
            execution_salt: position.execution_salt,
            take_profit_price: position.take_profit_price,
            stop_loss_price: position.stop_loss_price,
        }
    }

    /// Publishes the position's current view for the decision engine.
    pub(super) fn emit_position_changed(&mut self, user: UserId) {
        if let Some(position) = self.positions.get(&user) {
            let event = Self::changed_event(position);
            self.emit_event(EventPayload::PositionChanged(event));
        }
    }

    /// Re-reads live totals and writes leverage and health back to the position.
    pub(super) fn refresh(&mut self, user: UserId) -> Result<(AccountSnapshot, Leverage), EngineError> {
        let snapshot = self.market.account_snapshot(user)?;
        let leverage = Leverage::saturating(leverage_ratio(snapshot.total_collateral, snapshot.total_debt)?);
        let position = self.require_position_mut(user)?;
        position.current_leverage = leverage;
        position.last_health_factor = snapshot.health_factor;
        Ok((snapshot, leverage))
    }

    /// Swaps `amount` of `from` into `to` with a slippage-bounded minimum out.
    /// Identity when both assets match.
    pub(super) fn convert(
        &mut self,
        from: AssetId,
        to: AssetId,
        amount: Amount,
        slippage: Bps,
    ) -> Result<Amount, MarketError> {
        if from == to {
            return Ok(amount);
        }
        let quoted = self.router.quote(from, to, amount)?;
        let request = SwapRequest {
            from,
            to,
            amount_in: amount,
            min_out: Amount::new(min_amount_out(quoted.value(), slippage)),
            deadline: self.height.advance(self.config.swap_deadline_blocks),
        };
        self.router.swap(request)
    }

    pub(super) fn accrue_fee(&mut self, user: UserId, amount: Amount) {
        if amount.is_zero() {
            return;
        }
        self.fees_accrued = self.fees_accrued.add(amount);
        self.emit_event(EventPayload::FeeCollected(FeeCollectedEvent { user, amount }));
    }
}
