//! Layered configuration: built-in defaults, an optional TOML file, then
//! `TUTORPAY__*` environment variables.

use crate::domain::policy::SettlementPolicy;
use crate::error::Result;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Default `tracing` filter, overridden by `RUST_LOG`.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

/// Settlement policy knobs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_commission_rate")]
    pub commission_rate: Decimal,
    #[serde(default = "default_checkout_timeout_minutes")]
    pub checkout_timeout_minutes: i64,
    #[serde(default = "default_gateway_timeout_ms")]
    pub gateway_timeout_ms: u64,
    #[serde(default = "default_gateway_max_attempts")]
    pub gateway_max_attempts: u32,
}

fn default_log_filter() -> String {
    "tutorpay=warn".to_string()
}

fn default_commission_rate() -> Decimal {
    dec!(0.10)
}

fn default_checkout_timeout_minutes() -> i64 {
    30
}

fn default_gateway_timeout_ms() -> u64 {
    10_000
}

fn default_gateway_max_attempts() -> u32 {
    3
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            commission_rate: default_commission_rate(),
            checkout_timeout_minutes: default_checkout_timeout_minutes(),
            gateway_timeout_ms: default_gateway_timeout_ms(),
            gateway_max_attempts: default_gateway_max_attempts(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            policy: PolicyConfig::default(),
            log_filter: default_log_filter(),
        }
    }
}

impl PolicyConfig {
    /// Converts into a validated `SettlementPolicy`.
    pub fn to_policy(&self) -> Result<SettlementPolicy> {
        SettlementPolicy {
            commission_rate: self.commission_rate,
            checkout_timeout: chrono::Duration::minutes(self.checkout_timeout_minutes),
            gateway_timeout: Duration::from_millis(self.gateway_timeout_ms),
            gateway_max_attempts: self.gateway_max_attempts,
        }
        .validate()
    }
}

impl AppConfig {
    /// Loads configuration from an optional file and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or a value has the wrong type.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(config::Environment::with_prefix("TUTORPAY").separator("__"))
            .build()?;
        Ok(config.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.log_filter, "tutorpay=warn");
        let policy = config.policy.to_policy().unwrap();
        assert_eq!(policy, SettlementPolicy::default());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "log_filter = \"tutorpay=debug\"").unwrap();
        writeln!(file, "[policy]").unwrap();
        writeln!(file, "commission_rate = 0.15").unwrap();
        writeln!(file, "gateway_max_attempts = 5").unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.log_filter, "tutorpay=debug");
        assert_eq!(config.policy.commission_rate, dec!(0.15));
        assert_eq!(config.policy.gateway_max_attempts, 5);
        assert_eq!(config.policy.checkout_timeout_minutes, 30);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = AppConfig::load(Some(Path::new("/definitely/not/here.toml")));
        assert!(matches!(result, Err(crate::error::SettlementError::Config(_))));
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let policy = PolicyConfig {
            gateway_max_attempts: 0,
            ..PolicyConfig::default()
        };
        assert!(policy.to_policy().is_err());
    }
}
