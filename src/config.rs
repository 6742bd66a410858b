// 7.0 config.rs: all settings in one place. state machine, risk guard,
// decision engine and bridge.
// 7.1 each component owns its own struct; this file bundles them, ships the
// environment presets and checks that the pieces agree with each other.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::decision::DecisionConfig;
use crate::engine::EngineConfig;
use crate::funding::BridgeConfig;
use crate::risk::RiskParams;
use crate::types::{Amount, Bps};

// The complete protocol configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub engine: EngineConfig,
    pub risk: RiskParams,
    pub decision: DecisionConfig,
    pub bridge: BridgeConfig,
}

impl ProtocolConfig {
    // Testnet: short finality, cheap steps, aggressive sweeps
    pub fn testnet() -> Self {
        let mut config = Self::default();
        config.engine.open_fee = Amount::zero();
        config.engine.step_fee = Amount::zero();
        config.decision.finality_delay = 2;
        config.decision.stale_block_limit = 20;
        config.bridge.bridge_threshold = Amount::new(dec!(0.05));
        config
    }

    // Mainnet with conservative settings
    pub fn mainnet_conservative() -> Self {
        let mut config = Self::default();
        config.engine.max_target_leverage = dec!(5);
        config.engine.default_min_health_factor = dec!(1.25);
        config.engine.max_iterations_cap = 10;
        config.risk.circuit_breaker_threshold = Bps::new(500); // 5%
        config.risk.profitability_check_enabled = true;
        config.decision.finality_enabled = true;
        config.decision.finality_delay = 12;
        config.decision.large_unwind_leverage = dec!(2);
        config
    }

    /// Parses a JSON document and validates it. Missing sections fall back
    /// to their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    // Validate the configuration for internal consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        let engine = &self.engine;
        // a floor at or below 1 lets a step end liquidatable
        if engine.default_min_health_factor <= Decimal::ONE {
            return Err(ConfigError::InvalidEngine {
                reason: "Default min health factor must exceed 1".to_string(),
            });
        }
        if engine.max_target_leverage <= Decimal::ONE {
            return Err(ConfigError::InvalidEngine {
                reason: "Max target leverage must exceed 1x".to_string(),
            });
        }
        if engine.max_iterations_cap == 0 {
            return Err(ConfigError::InvalidEngine {
                reason: "Iteration cap must be at least 1".to_string(),
            });
        }
        if engine.max_batch_size == 0 {
            return Err(ConfigError::InvalidEngine {
                reason: "Batch size must be at least 1".to_string(),
            });
        }
        if engine.default_slippage.value() >= 10_000 {
            return Err(ConfigError::InvalidEngine {
                reason: "Slippage must be below 100%".to_string(),
            });
        }

        let risk = &self.risk;
        if risk.circuit_breaker_threshold.value() == 0 {
            return Err(ConfigError::InvalidRisk {
                reason: "Circuit breaker threshold must be positive".to_string(),
            });
        }
        if risk.safety_buffer.value() >= 10_000 {
            return Err(ConfigError::InvalidRisk {
                reason: "Safety buffer must be below 100%".to_string(),
            });
        }
        if risk.unwind_health_floor <= Decimal::ONE {
            return Err(ConfigError::InvalidRisk {
                reason: "Unwind health floor must exceed 1".to_string(),
            });
        }

        let decision = &self.decision;
        if decision.default_leverage <= Decimal::ONE || decision.default_leverage >= engine.max_target_leverage {
            return Err(ConfigError::InvalidDecision {
                reason: "Default leverage must be within (1, max target leverage)".to_string(),
            });
        }
        if decision.default_iterations == 0 || decision.default_iterations > engine.max_iterations_cap {
            return Err(ConfigError::InvalidDecision {
                reason: "Default iterations must be within [1, iteration cap]".to_string(),
            });
        }
        if decision.min_height_delta == 0 {
            return Err(ConfigError::InvalidDecision {
                reason: "Rate limit must be at least one block".to_string(),
            });
        }
        if decision.sweep_batch_size == 0 {
            return Err(ConfigError::InvalidDecision {
                reason: "Sweep batch size must be at least 1".to_string(),
            });
        }
        // the executor is the decision engine, never the state machine itself
        if decision.state_machine == engine.authorized_executor {
            return Err(ConfigError::InvalidDecision {
                reason: "State machine identity must differ from the executor".to_string(),
            });
        }

        let bridge = &self.bridge;
        if bridge.min_transfer.is_zero() {
            return Err(ConfigError::InvalidBridge {
                reason: "Minimum transfer must be positive".to_string(),
            });
        }
        if bridge.bridge_threshold < bridge.min_transfer {
            return Err(ConfigError::InvalidBridge {
                reason: "Bridge threshold below minimum transfer".to_string(),
            });
        }

        Ok(())
    }
}

// Configuration validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid engine config: {reason}")]
    InvalidEngine { reason: String },
    #[error("invalid risk config: {reason}")]
    InvalidRisk { reason: String },
    #[error("invalid decision config: {reason}")]
    InvalidDecision { reason: String },
    #[error("invalid bridge config: {reason}")]
    InvalidBridge { reason: String },
    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),
}

// Environment presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    Testnet,
    Mainnet,
}

impl Environment {
    pub fn config(&self) -> ProtocolConfig {
        match self {
            Environment::Development => ProtocolConfig::default(),
            Environment::Testnet => ProtocolConfig::testnet(),
            Environment::Mainnet => ProtocolConfig::mainnet_conservative(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Identity;

    #[test]
    fn test_default_config_valid() {
        let config = ProtocolConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_testnet_config_valid() {
        let config = ProtocolConfig::testnet();
        assert!(config.validate().is_ok());
        assert!(config.engine.step_fee.is_zero());
    }

    #[test]
    fn test_mainnet_config_valid() {
        let config = ProtocolConfig::mainnet_conservative();
        assert!(config.validate().is_ok());
        assert!(config.decision.finality_enabled);
        assert_eq!(config.engine.max_target_leverage, dec!(5));
    }

    #[test]
    fn test_invalid_health_floor() {
        let mut config = ProtocolConfig::default();
        config.engine.default_min_health_factor = dec!(1.0);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidEngine { .. })));
    }

    #[test]
    fn test_default_leverage_above_cap() {
        let mut config = ProtocolConfig::default();
        config.decision.default_leverage = dec!(12);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidDecision { .. })));
    }

    #[test]
    fn test_default_leverage_at_cap() {
        // auto-deposit opens at the default, and an open must sit strictly below the cap
        let mut config = ProtocolConfig::default();
        config.decision.default_leverage = config.engine.max_target_leverage;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidDecision { .. })));

        config.decision.default_leverage = config.engine.max_target_leverage - dec!(0.5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_executor_and_spender_must_differ() {
        let mut config = ProtocolConfig::default();
        config.decision.state_machine = Identity(2);
        config.engine.authorized_executor = Identity(2);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidDecision { .. })));
    }

    #[test]
    fn test_invalid_bridge() {
        let mut config = ProtocolConfig::default();
        config.bridge.bridge_threshold = Amount::new(dec!(0.0001));
        assert!(matches!(config.validate(), Err(ConfigError::InvalidBridge { .. })));
    }

    #[test]
    fn test_environment_presets() {
        assert!(Environment::Development.config().validate().is_ok());
        assert!(Environment::Testnet.config().validate().is_ok());
        assert!(Environment::Mainnet.config().validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = ProtocolConfig::mainnet_conservative();
        let json = serde_json::to_string(&config).unwrap();
        let back = ProtocolConfig::from_json_str(&json).unwrap();
        assert_eq!(back.engine.max_target_leverage, config.engine.max_target_leverage);
        assert_eq!(back.decision.finality_delay, 12);
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            ProtocolConfig::from_json_str("{\"engine\": 7}"),
            Err(ConfigError::Parse(_))
        ));
    }
}
