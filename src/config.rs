//! Ledger configuration.
//!
//! Every setting has a default. Values are layered through the `config`
//! crate: either from an injected [`SettingsProvider`] or from
//! `COIN_LEDGER_*` environment variables, then deserialized into
//! [`LedgerConfig`] and checked by [`LedgerConfig::validate`].

use std::collections::HashMap;

use ::config::{Config, ConfigBuilder, Environment, builder::DefaultState};
use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::types::{Coins, TimeStamp};

pub const ENV_PREFIX: &str = "COIN_LEDGER";

pub const MIN_BILL_AMOUNT: &str = "min_bill_amount";
pub const MAX_BILL_AGE_DAYS: &str = "max_bill_age_days";
pub const SUBMISSION_COOLDOWN_MINUTES: &str = "submission_cooldown_minutes";
pub const WELCOME_BONUS_AMOUNT: &str = "welcome_bonus_amount";
pub const PAYMENT_EXCHANGE_RATE: &str = "payment_exchange_rate";
pub const PAYMENT_AMOUNT_TOLERANCE: &str = "payment_amount_tolerance";
pub const MAX_PAGE_SIZE: &str = "max_page_size";
pub const NOTIFICATION_MAX_ATTEMPTS: &str = "notification_max_attempts";

const KEYS: [&str; 8] = [
    MIN_BILL_AMOUNT,
    MAX_BILL_AGE_DAYS,
    SUBMISSION_COOLDOWN_MINUTES,
    WELCOME_BONUS_AMOUNT,
    PAYMENT_EXCHANGE_RATE,
    PAYMENT_AMOUNT_TOLERANCE,
    MAX_PAGE_SIZE,
    NOTIFICATION_MAX_ATTEMPTS,
];

/// Longest bill age or cooldown window accepted, in days.
pub const MAX_WINDOW_DAYS: i64 = 36_500;

/// Source of named string settings.
pub trait SettingsProvider {
    fn setting(&self, key: &str) -> Option<String>;
}

impl SettingsProvider for HashMap<String, String> {
    fn setting(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Smallest bill accepted for earn and redeem requests
    pub min_bill_amount: Coins,
    /// Oldest bill accepted for an earn request
    pub max_bill_age_days: i64,
    /// Window in which a second pending earn at the same brand is refused
    pub submission_cooldown_minutes: i64,
    pub welcome_bonus_amount: Coins,
    /// Payout units per coin
    pub payment_exchange_rate: Decimal,
    pub payment_amount_tolerance: Decimal,
    pub max_page_size: usize,
    /// Delivery attempts before a queued notification is dropped
    pub notification_max_attempts: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            min_bill_amount: Coins::new(Decimal::ONE),
            max_bill_age_days: 30,
            submission_cooldown_minutes: 5,
            welcome_bonus_amount: Coins::new(Decimal::ONE_HUNDRED),
            payment_exchange_rate: Decimal::ONE,
            payment_amount_tolerance: Decimal::new(1, 2),
            max_page_size: 100,
            notification_max_attempts: 3,
        }
    }
}

impl LedgerConfig {
    /// Build a config from `provider`, falling back to defaults for unset keys.
    pub fn from_provider(provider: &dyn SettingsProvider) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        for key in KEYS {
            if let Some(value) = provider.setting(key) {
                builder = builder.set_override(key, value.trim().to_string())?;
            }
        }
        Self::from_builder(builder)
    }

    /// Load `COIN_LEDGER_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_prefix(ENV_PREFIX)
    }

    /// Load `<prefix>_*` variables, e.g. `COIN_LEDGER_MAX_PAGE_SIZE=50`.
    pub fn from_env_prefix(prefix: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder().add_source(
            Environment::with_prefix(prefix)
                .prefix_separator("_")
                .try_parsing(true),
        );
        Self::from_builder(builder)
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Start of the duplicate-submission window ending at `now`; `None` when
    /// the cooldown is off.
    pub fn cooldown_start(&self, now: DateTime<Utc>) -> Option<TimeStamp> {
        if self.submission_cooldown_minutes <= 0 {
            return None;
        }
        TimeDelta::try_minutes(self.submission_cooldown_minutes)
            .and_then(|window| now.checked_sub_signed(window))
            .map(TimeStamp::from)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_bill_amount.is_negative() {
            return Err(invalid(MIN_BILL_AMOUNT, "must not be negative"));
        }
        if !(0..=MAX_WINDOW_DAYS).contains(&self.max_bill_age_days) {
            return Err(invalid(MAX_BILL_AGE_DAYS, "must be between 0 and 36500"));
        }
        if !(0..=MAX_WINDOW_DAYS * 24 * 60).contains(&self.submission_cooldown_minutes) {
            return Err(invalid(
                SUBMISSION_COOLDOWN_MINUTES,
                "must be between 0 and 52560000",
            ));
        }
        if !self.welcome_bonus_amount.is_positive() {
            return Err(invalid(WELCOME_BONUS_AMOUNT, "must be positive"));
        }
        if self.payment_exchange_rate <= Decimal::ZERO {
            return Err(invalid(PAYMENT_EXCHANGE_RATE, "must be positive"));
        }
        if self.payment_amount_tolerance < Decimal::ZERO {
            return Err(invalid(PAYMENT_AMOUNT_TOLERANCE, "must not be negative"));
        }
        if self.max_page_size == 0 {
            return Err(invalid(MAX_PAGE_SIZE, "must be at least 1"));
        }
        if self.notification_max_attempts == 0 {
            return Err(invalid(NOTIFICATION_MAX_ATTEMPTS, "must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(key: &'static str, reason: &'static str) -> ConfigError {
    ConfigError::Invalid { key, reason }
}
