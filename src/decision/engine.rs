// 9.0 decision/engine.rs: maps one notification to the next instructions.
// the only mutable state is the side tables (registry, price cache, rate
// limiter, finality queue); financial quantities always come from the
// notification or get re-read by the state machine.

use super::config::DecisionConfig;
use super::finality::FinalityQueue;
use super::price_cache::PriceCache;
use super::rate_limit::RateLimiter;
use super::registry::{ActiveRegistry, TrackedPosition};
use crate::events::PositionChangedEvent;
use crate::instruction::{Action, Instruction, Notification};
use crate::leverage::target_reached;
use crate::position::PositionState;
use crate::types::{Amount, AssetId, BlockHeight, Identity, PoolId, Price, UserId};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecisionError {
    #[error("identity {0} is not the owner")]
    NotOwner(Identity),
}

/// A candidate instruction before pacing and gating.
struct Candidate {
    instruction: Instruction,
    critical: bool,
    // set when released from the finality queue, with its original queue height
    released_from: Option<BlockHeight>,
}

#[derive(Debug)]
pub struct ReactiveDecisionEngine {
    config: DecisionConfig,
    registry: ActiveRegistry,
    prices: PriceCache,
    limiter: RateLimiter,
    finality: FinalityQueue,
}

impl ReactiveDecisionEngine {
    pub fn new(config: DecisionConfig) -> Self {
        let limiter = RateLimiter::new(config.min_height_delta);
        let finality = FinalityQueue::new(config.finality_delay);
        Self {
            config,
            registry: ActiveRegistry::new(),
            prices: PriceCache::new(),
            limiter,
            finality,
        }
    }

    pub fn config(&self) -> &DecisionConfig {
        &self.config
    }

    pub fn registry(&self) -> &ActiveRegistry {
        &self.registry
    }

    pub fn tracked(&self, user: UserId) -> Option<&TrackedPosition> {
        self.registry.get(user)
    }

    pub fn cached_price(&self, pool: PoolId) -> Option<Price> {
        self.prices.get(pool)
    }

    pub fn pending_critical(&self) -> usize {
        self.finality.len()
    }

    /// 9.1: single entry point. returns zero or more instructions, at most
    /// one per user.
    pub fn handle(&mut self, notification: &Notification) -> Vec<Instruction> {
        let height = notification.height();
        let candidates = match notification {
            Notification::PositionChanged { event, height } => self.on_position_changed(event, *height),
            Notification::ApprovalGranted {
                owner,
                token,
                spender,
                amount,
                height,
            } => self.on_approval(*owner, *token, *spender, *amount, *height),
            Notification::PriceSync { pool, price, height } => self.on_price_sync(*pool, *price, *height),
            Notification::Timer { height } => self.on_timer(*height),
            Notification::LiquidationFailure { user, reason, height } => {
                self.on_liquidation_failure(*user, reason, *height)
            }
        };

        let mut out: Vec<Instruction> = Vec::new();
        for candidate in candidates {
            let user = candidate.instruction.user;
            if out.iter().any(|i| i.user == user) || !self.limiter.permits(user, height) {
                debug!(user = user.0, action = %candidate.instruction.action, "rate limited");
                if let Some(queued_at) = candidate.released_from {
                    self.finality.restore(candidate.instruction, queued_at);
                }
                continue;
            }
            let instruction = if candidate.critical && self.config.finality_enabled {
                match self.finality.gate(candidate.instruction, height) {
                    Some(i) => i,
                    None => continue,
                }
            } else {
                candidate.instruction
            };
            self.limiter.record(user, height);
            out.push(instruction);
        }
        out
    }

    fn instruct(&self, user: UserId, action: Action, height: BlockHeight, critical: bool) -> Candidate {
        let salt = self.registry.get(user).and_then(|t| t.salt);
        Candidate {
            instruction: Instruction::new(user, action, salt, height),
            critical,
            released_from: None,
        }
    }

    fn on_position_changed(&mut self, event: &PositionChangedEvent, height: BlockHeight) -> Vec<Candidate> {
        self.registry.observe(event, height);
        if !self.registry.contains(event.user) {
            self.finality.forget(event.user);
            self.limiter.forget(event.user);
        }
        self.classify(event, height).into_iter().collect()
    }

    /// Core trigger: what should happen next for this reported state.
    fn classify(&self, event: &PositionChangedEvent, height: BlockHeight) -> Option<Candidate> {
        let user = event.user;
        let breached = event.health_factor < event.min_health_factor;
        match event.state {
            PositionState::Idle => None,
            // a looping report below the floor is stale; a health check trips it for real
            PositionState::Looping if breached => Some(self.instruct(user, Action::HealthCheck, height, false)),
            PositionState::Looping => {
                let at_target = target_reached(
                    event.current_leverage.value(),
                    event.target_leverage.value(),
                    self.config.target_tolerance,
                );
                (!at_target && event.iteration < event.max_iterations)
                    .then(|| self.instruct(user, Action::LoopStep, height, false))
            }
            PositionState::Unwinding | PositionState::Emergency => {
                if event.current_leverage.is_unlevered() && !breached {
                    return None;
                }
                let critical = breached
                    || event.state == PositionState::Emergency
                    || event.current_leverage.value() >= self.config.large_unwind_leverage;
                Some(self.instruct(user, Action::UnwindStep, height, critical))
            }
        }
    }

    fn on_approval(
        &mut self,
        owner: UserId,
        token: AssetId,
        spender: Identity,
        amount: Amount,
        height: BlockHeight,
    ) -> Vec<Candidate> {
        if !self.config.tracked_tokens.contains(&token)
            || spender != self.config.state_machine
            || amount < self.config.dust_floor
            || self.registry.contains(owner)
        {
            debug!(user = owner.0, token = token.0, "approval ignored");
            return Vec::new();
        }
        info!(user = owner.0, token = token.0, amount = %amount, "auto deposit");
        let action = Action::AutoDeposit {
            collateral_asset: token,
            amount,
            target_leverage: self.config.default_leverage,
            max_iterations: self.config.default_iterations,
        };
        vec![self.instruct(owner, action, height, false)]
    }

    fn on_price_sync(&mut self, pool: PoolId, price: Price, height: BlockHeight) -> Vec<Candidate> {
        let deviation = self.prices.update(pool, price);
        let threshold = Decimal::from(self.config.price_deviation_threshold.value());
        let (Some(deviation), Some(asset)) = (deviation, self.config.asset_for_pool(pool)) else {
            return Vec::new();
        };
        if deviation < threshold {
            return Vec::new();
        }
        debug!(pool = pool.0, deviation_bps = %deviation, "price moved, re-evaluating triggers");

        self.registry
            .on_asset(asset)
            .into_iter()
            .filter_map(|user| self.trigger_for(user, price, height, true))
            .collect()
    }

    /// Stop-loss wins over take-profit when both hold.
    fn trigger_for(&self, user: UserId, price: Price, height: BlockHeight, check_stop: bool) -> Option<Candidate> {
        let tracked = self.registry.get(user)?;
        if tracked.state == PositionState::Emergency {
            return None;
        }
        if check_stop && tracked.stop_loss.is_some_and(|sl| price <= sl) {
            return Some(self.instruct(user, Action::StopLoss, height, true));
        }
        if tracked.take_profit.is_some_and(|tp| price >= tp) && !tracked.current_leverage.is_unlevered() {
            return Some(self.instruct(user, Action::TakeProfit, height, false));
        }
        None
    }

    /// Stale sweep, then round-robin health checks, then take-profit on
    /// cached prices, then finality releases. Released ops go first in the
    /// returned list so a health check never displaces them.
    fn on_timer(&mut self, height: BlockHeight) -> Vec<Candidate> {
        let cap = self.config.sweep_batch_size;
        let stale = if self.config.staleness_enabled {
            self.registry.stale(height, self.config.stale_block_limit, cap)
        } else {
            Vec::new()
        };
        if !stale.is_empty() {
            info!(count = stale.len(), "stale positions swept");
        }
        let regular = self.registry.round_robin(cap.saturating_sub(stale.len()), &stale);

        let checked: Vec<UserId> = stale.iter().chain(regular.iter()).copied().collect();
        self.registry.restamp(&checked, height);
        let mut candidates: Vec<Candidate> = checked
            .iter()
            .map(|user| self.instruct(*user, Action::HealthCheck, height, false))
            .collect();

        let profit_checks: Vec<Candidate> = self
            .registry
            .iter()
            .filter(|t| !checked.contains(&t.user))
            .filter_map(|t| {
                let pool = self.config.pool_for_asset(t.collateral_asset)?;
                let price = self.prices.get(pool)?;
                self.trigger_for(t.user, price, height, false)
            })
            .collect();
        candidates.extend(profit_checks);

        if !self.config.finality_enabled {
            return candidates;
        }
        let mut released: Vec<Candidate> = self
            .finality
            .release_matured(height)
            .into_iter()
            .map(|(queued_at, mut instruction)| {
                // refresh the salt: it may have rotated while the op waited
                instruction.salt = self.registry.get(instruction.user).and_then(|t| t.salt);
                Candidate {
                    instruction,
                    critical: false,
                    released_from: Some(queued_at),
                }
            })
            .collect();
        released.extend(candidates);
        released
    }

    fn on_liquidation_failure(&mut self, user: UserId, reason: &str, height: BlockHeight) -> Vec<Candidate> {
        let Some(tracked) = self.registry.get_mut(user) else {
            debug!(user = user.0, "liquidation failure for untracked user");
            return Vec::new();
        };
        tracked.liquidation_failures += 1;
        tracked.last_failure = Some(reason.to_string());
        tracked.state = PositionState::Emergency;
        warn!(user = user.0, failures = tracked.liquidation_failures, reason, "liquidation guardian failure");
        vec![self.instruct(user, Action::LiquidationResponse, height, true)]
    }

    fn ensure_owner(&self, caller: Identity) -> Result<(), DecisionError> {
        if caller != self.config.owner {
            return Err(DecisionError::NotOwner(caller));
        }
        Ok(())
    }

    pub fn set_finality_enabled(&mut self, caller: Identity, enabled: bool) -> Result<(), DecisionError> {
        self.ensure_owner(caller)?;
        self.config.finality_enabled = enabled;
        Ok(())
    }

    pub fn set_finality_delay(&mut self, caller: Identity, delay: u64) -> Result<(), DecisionError> {
        self.ensure_owner(caller)?;
        self.config.finality_delay = delay;
        self.finality.set_delay(delay);
        Ok(())
    }

    pub fn set_staleness_enabled(&mut self, caller: Identity, enabled: bool) -> Result<(), DecisionError> {
        self.ensure_owner(caller)?;
        self.config.staleness_enabled = enabled;
        Ok(())
    }

    pub fn set_stale_block_limit(&mut self, caller: Identity, limit: u64) -> Result<(), DecisionError> {
        self.ensure_owner(caller)?;
        self.config.stale_block_limit = limit;
        Ok(())
    }
}
