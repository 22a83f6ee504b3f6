use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::balance::WithdrawalLimits;
use crate::referral::{AggregatorSettings, CommissionPolicy};

/// Service configuration, read from the environment (and `.env`).
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server_port: u16,
    pub database_url: String,
    pub database_max_connections: u32,
    /// Origin used to build referral links, e.g. `https://app.example.com`.
    pub public_origin: String,
    pub load_timeout_secs: u64,
    /// Reject unauthenticated referral loads instead of answering empty.
    pub strict_auth: bool,
    pub referral_depth: u8,
    pub commission_policy: CommissionPolicy,
    /// Term applied to investments that carry no `cycle_days` of their own
    /// when the store has no `investment_cycle_days` setting either.
    pub default_cycle_days: u32,
    /// Seconds between maturity sweeps; 0 disables the sweep.
    pub maturity_sweep_secs: u64,
    pub session_heartbeat_secs: u64,
    /// Returns minimum for users whose plans set none.
    pub min_withdrawal: Decimal,
    pub min_commission_withdrawal: Decimal,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .set_default("server_port", 8000)?
            .set_default("database_max_connections", 8)?
            .set_default("public_origin", "http://localhost:5173")?
            .set_default("load_timeout_secs", 10)?
            .set_default("strict_auth", false)?
            .set_default("referral_depth", 1)?
            .set_default("commission_policy", "plan_daily_roi")?
            .set_default("default_cycle_days", 60)?
            .set_default("maturity_sweep_secs", 3600)?
            .set_default("session_heartbeat_secs", 30)?
            .set_default("min_withdrawal", 1000)?
            .set_default("min_commission_withdrawal", 500)?
            .add_source(config::Environment::default().try_parsing(true))
            .build()?;
        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), config::ConfigError> {
        if !(1..=crate::referral::MAX_REFERRAL_DEPTH).contains(&self.referral_depth) {
            return Err(config::ConfigError::Message(format!(
                "referral_depth must be between 1 and {}, got {}",
                crate::referral::MAX_REFERRAL_DEPTH,
                self.referral_depth
            )));
        }
        if self.default_cycle_days > crate::accrual::MAX_CYCLE_DAYS {
            return Err(config::ConfigError::Message(format!(
                "default_cycle_days must be at most {}, got {}",
                crate::accrual::MAX_CYCLE_DAYS,
                self.default_cycle_days
            )));
        }
        if self.min_withdrawal <= Decimal::ZERO || self.min_commission_withdrawal <= Decimal::ZERO {
            return Err(config::ConfigError::Message(
                "withdrawal minimums must be > 0".into(),
            ));
        }
        if self.load_timeout_secs == 0 {
            return Err(config::ConfigError::Message(
                "load_timeout_secs must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn aggregator_settings(&self) -> AggregatorSettings {
        AggregatorSettings {
            depth: self.referral_depth,
            timeout: Duration::from_secs(self.load_timeout_secs),
            strict_auth: self.strict_auth,
            policy: self.commission_policy,
        }
    }

    pub fn withdrawal_limits(&self) -> WithdrawalLimits {
        WithdrawalLimits {
            min_withdrawal: self.min_withdrawal,
            min_commission_withdrawal: self.min_commission_withdrawal,
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.session_heartbeat_secs.max(1))
    }
}
