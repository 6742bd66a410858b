//! Owner-gated administration: pause, toggles, thresholds, fees.

use super::core::PositionStateMachine;
use super::results::EngineError;
use crate::events::EventPayload;
use crate::market::{LendingMarket, SwapRouter};
use crate::types::{Amount, Identity};
use rust_decimal::Decimal;
use tracing::info;

impl<L: LendingMarket, S: SwapRouter> PositionStateMachine<L, S> {
    pub fn owner(&self) -> Identity {
        self.config.owner
    }

    fn ensure_owner(&self, caller: Identity) -> Result<(), EngineError> {
        if caller != self.config.owner {
            return Err(EngineError::NotOwner(caller));
        }
        Ok(())
    }

    fn config_updated(&mut self, by: Identity, field: &str) {
        info!(by = %by, field, "config updated");
        self.emit_event(EventPayload::ConfigUpdated {
            by,
            field: field.to_string(),
        });
    }

    /// Blocks opens and loop steps. Unwinds and closes still run.
    pub fn pause(&mut self, caller: Identity) -> Result<(), EngineError> {
        self.ensure_owner(caller)?;
        self.paused = true;
        self.emit_event(EventPayload::Paused { by: caller });
        Ok(())
    }

    pub fn unpause(&mut self, caller: Identity) -> Result<(), EngineError> {
        self.ensure_owner(caller)?;
        self.paused = false;
        self.emit_event(EventPayload::Unpaused { by: caller });
        Ok(())
    }

    pub fn set_authorized_executor(&mut self, caller: Identity, executor: Identity) -> Result<(), EngineError> {
        self.ensure_owner(caller)?;
        self.config.authorized_executor = executor;
        self.config_updated(caller, "authorized_executor");
        Ok(())
    }

    pub fn set_circuit_breaker_enabled(&mut self, caller: Identity, enabled: bool) -> Result<(), EngineError> {
        self.ensure_owner(caller)?;
        self.risk.params.circuit_breaker_enabled = enabled;
        self.config_updated(caller, "circuit_breaker_enabled");
        Ok(())
    }

    pub fn set_profitability_check_enabled(&mut self, caller: Identity, enabled: bool) -> Result<(), EngineError> {
        self.ensure_owner(caller)?;
        self.risk.params.profitability_check_enabled = enabled;
        self.config_updated(caller, "profitability_check_enabled");
        Ok(())
    }

    pub fn set_profitability_margin(&mut self, caller: Identity, margin: Decimal) -> Result<(), EngineError> {
        self.ensure_owner(caller)?;
        self.risk.params.profitability_margin = margin.max(Decimal::ZERO);
        self.config_updated(caller, "profitability_margin");
        Ok(())
    }

    pub fn set_batch_execution_enabled(&mut self, caller: Identity, enabled: bool) -> Result<(), EngineError> {
        self.ensure_owner(caller)?;
        self.config.batch_execution_enabled = enabled;
        self.config_updated(caller, "batch_execution_enabled");
        Ok(())
    }

    pub fn set_fees(&mut self, caller: Identity, open_fee: Amount, step_fee: Amount) -> Result<(), EngineError> {
        self.ensure_owner(caller)?;
        self.config.open_fee = open_fee;
        self.config.step_fee = step_fee;
        self.config_updated(caller, "fees");
        Ok(())
    }

    /// Drains accrued protocol fees, typically into the funding bridge.
    pub fn collect_fees(&mut self, caller: Identity) -> Result<Amount, EngineError> {
        self.ensure_owner(caller)?;
        let amount = std::mem::take(&mut self.fees_accrued);
        info!(amount = %amount, "fees collected");
        Ok(amount)
    }
}
