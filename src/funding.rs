// 10.0 funding.rs: keeps the decision engine's execution account solvent.
// protocol fees collect here; everything above the gas reserve is bridged to
// the target account, through the structured deposit path when it works and
// a plain transfer once when it does not. losing funds silently is never ok:
// if both paths fail the call fails loudly and the balance stays put.

use crate::events::{Event, EventLog, EventPayload, FundsBridgedEvent};
use crate::types::{Amount, BlockHeight, Identity};
use chrono::{DateTime, Utc};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub owner: Identity,
    /// Account that pays for the decision engine's execution.
    pub target: Identity,
    /// Kept back on this side for our own execution costs.
    pub gas_reserve: Amount,
    /// Surplus at which `receive_fee` reports a bridge is due.
    pub bridge_threshold: Amount,
    /// Smaller surpluses are not worth a transfer.
    pub min_transfer: Amount,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            owner: Identity(1),
            target: Identity(4),
            gas_reserve: Amount::new(dec!(0.05)),
            bridge_threshold: Amount::new(dec!(0.5)),
            min_transfer: Amount::new(dec!(0.001)),
        }
    }
}

/// Running totals of the fee account.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FundingLedger {
    pub total_collected: Amount,
    pub total_bridged: Amount,
    pub bridge_count: u64,
    pub last_bridged_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct RailError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FundingError {
    #[error("bridge failed on both paths: structured: {structured}; fallback: {fallback}")]
    BothPathsFailed { structured: RailError, fallback: RailError },

    #[error("identity {0} is not the owner")]
    NotOwner(Identity),
}

/// Cross-ledger value transfer consumed by the bridge.
pub trait BridgeRail {
    /// Structured deposit credited to `target` on the other ledger.
    fn deposit_for(&mut self, target: Identity, amount: Amount) -> Result<(), RailError>;

    /// Plain value transfer.
    fn transfer(&mut self, target: Identity, amount: Amount) -> Result<(), RailError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BridgeReceipt {
    pub amount: Amount,
    pub fallback: bool,
}

#[derive(Debug)]
pub struct FundingBridge {
    config: BridgeConfig,
    ledger: FundingLedger,
    balance: Amount,
    events: EventLog,
}

impl FundingBridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            ledger: FundingLedger::default(),
            balance: Amount::zero(),
            events: EventLog::new(10_000),
        }
    }

    pub fn balance(&self) -> Amount {
        self.balance
    }

    pub fn ledger(&self) -> &FundingLedger {
        &self.ledger
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn events(&self) -> &[Event] {
        self.events.events()
    }

    fn surplus(&self) -> Amount {
        self.balance.saturating_sub(self.config.gas_reserve)
    }

    /// Books an incoming fee. Returns true once the surplus reaches the
    /// bridge threshold.
    pub fn receive_fee(&mut self, amount: Amount) -> bool {
        self.balance = self.balance.add(amount);
        self.ledger.total_collected = self.ledger.total_collected.add(amount);
        self.surplus() >= self.config.bridge_threshold
    }

    /// Bridges everything above the gas reserve. `Ok(None)` when the surplus
    /// is below the minimum transfer.
    pub fn cover_debt<R: BridgeRail>(
        &mut self,
        rail: &mut R,
        height: BlockHeight,
        now: DateTime<Utc>,
    ) -> Result<Option<BridgeReceipt>, FundingError> {
        let amount = self.surplus();
        if amount < self.config.min_transfer {
            return Ok(None);
        }
        let target = self.config.target;

        let fallback = match rail.deposit_for(target, amount) {
            Ok(()) => false,
            Err(structured) => {
                warn!(error = %structured, amount = %amount, "structured bridge failed, falling back to transfer");
                if let Err(fallback) = rail.transfer(target, amount) {
                    error!(structured = %structured, fallback = %fallback, amount = %amount, "bridge failed on both paths");
                    return Err(FundingError::BothPathsFailed { structured, fallback });
                }
                true
            }
        };

        self.balance = self.balance.saturating_sub(amount);
        self.ledger.total_bridged = self.ledger.total_bridged.add(amount);
        self.ledger.bridge_count += 1;
        self.ledger.last_bridged_at = Some(now);
        info!(target = %target, amount = %amount, fallback, "funds bridged");
        self.events.emit(
            height,
            EventPayload::FundsBridged(FundsBridgedEvent {
                target,
                amount,
                fallback,
            }),
        );
        Ok(Some(BridgeReceipt { amount, fallback }))
    }

    fn ensure_owner(&self, caller: Identity) -> Result<(), FundingError> {
        if caller != self.config.owner {
            return Err(FundingError::NotOwner(caller));
        }
        Ok(())
    }

    pub fn set_gas_reserve(&mut self, caller: Identity, reserve: Amount) -> Result<(), FundingError> {
        self.ensure_owner(caller)?;
        self.config.gas_reserve = reserve;
        Ok(())
    }

    pub fn set_bridge_threshold(&mut self, caller: Identity, threshold: Amount) -> Result<(), FundingError> {
        self.ensure_owner(caller)?;
        self.config.bridge_threshold = threshold;
        Ok(())
    }

    pub fn set_target(&mut self, caller: Identity, target: Identity) -> Result<(), FundingError> {
        self.ensure_owner(caller)?;
        self.config.target = target;
        Ok(())
    }
}
