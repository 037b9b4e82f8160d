use crate::error::{Result, SettlementError};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::time::Duration;

/// Business knobs handed to the settlement service at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementPolicy {
    /// Platform share of each lesson price, in `[0, 1]`.
    pub commission_rate: Decimal,
    /// How long a lesson may sit in awaiting_payment before the expiry sweep reclaims it.
    pub checkout_timeout: chrono::Duration,
    /// Upper bound on a single gateway call.
    pub gateway_timeout: Duration,
    /// Attempts per gateway call when it reports itself unavailable.
    pub gateway_max_attempts: u32,
}

impl Default for SettlementPolicy {
    fn default() -> Self {
        Self {
            commission_rate: dec!(0.10),
            checkout_timeout: chrono::Duration::minutes(30),
            gateway_timeout: Duration::from_secs(10),
            gateway_max_attempts: 3,
        }
    }
}

impl SettlementPolicy {
    pub fn validate(self) -> Result<Self> {
        if self.commission_rate < Decimal::ZERO || self.commission_rate > Decimal::ONE {
            return Err(SettlementError::Validation(
                "Commission rate must be between 0 and 1".to_string(),
            ));
        }
        if self.checkout_timeout <= chrono::Duration::zero() {
            return Err(SettlementError::Validation(
                "Checkout timeout must be positive".to_string(),
            ));
        }
        if self.gateway_timeout.is_zero() {
            return Err(SettlementError::Validation(
                "Gateway timeout must be positive".to_string(),
            ));
        }
        if self.gateway_max_attempts == 0 {
            return Err(SettlementError::Validation(
                "At least one gateway attempt is required".to_string(),
            ));
        }
        Ok(self)
    }
}
