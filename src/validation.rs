//! Rule checks for proposed earn and redeem requests.
//!
//! Every rule runs and every violation is collected, so the caller can show
//! all of them at once. Nothing here writes to the ledger.
use std::sync::Arc;

use chrono::Utc;

use crate::brand::{Brand, BrandDirectory};
use crate::config::LedgerConfig;
use crate::error::{LedgerError, ValidationError, ValidationErrors};
use crate::store::LedgerStore;
use crate::types::{Coins, TimeStamp};

/// A user's claim for coins against a purchase receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EarnRequest {
    pub user_id: String,
    pub brand_id: String,
    pub bill_amount: Coins,
    pub bill_date: TimeStamp,
    pub receipt_ref: Option<String>,
}

/// A user's request to spend coins against a bill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedeemRequest {
    pub user_id: String,
    pub brand_id: String,
    pub bill_amount: Coins,
    pub coins_to_redeem: Coins,
}

pub struct ValidationEngine {
    store: LedgerStore,
    config: Arc<LedgerConfig>,
    brands: Arc<dyn BrandDirectory>,
}

impl ValidationEngine {
    pub fn new(
        store: LedgerStore,
        config: Arc<LedgerConfig>,
        brands: Arc<dyn BrandDirectory>,
    ) -> Self {
        Self {
            store,
            config,
            brands,
        }
    }

    pub fn validate_earn(&self, request: &EarnRequest) -> Result<(), LedgerError> {
        let mut errors = ValidationErrors::new();
        let now = Utc::now();

        self.check_bill_minimum(request.bill_amount, &mut errors);

        let bill_date = request.bill_date.to_datetime_utc();
        if bill_date > now {
            errors.push(ValidationError::BillDateInFuture);
        } else {
            let age_days = (now - bill_date).num_days();
            if age_days > self.config.max_bill_age_days {
                errors.push(ValidationError::BillTooOld {
                    age_days,
                    max_days: self.config.max_bill_age_days,
                });
            }
        }

        if let Some(brand) = self.active_brand(&request.brand_id, &mut errors) {
            match brand.coins_for_bill(request.bill_amount) {
                None => errors.push(ValidationError::AmountTooLarge(request.bill_amount)),
                Some(coins) if request.bill_amount.is_positive() && !coins.is_positive() => {
                    errors.push(ValidationError::ZeroReward)
                }
                Some(_) => {}
            }
        }

        // Rechecked inside the unit that records the request.
        if let Some(since) = self.config.cooldown_start(now) {
            let counters = self.store.counters(&request.user_id)?;
            if counters
                .recent_pending_earn(&request.brand_id, since)
                .is_some()
            {
                errors.push(ValidationError::DuplicateSubmission {
                    brand_id: request.brand_id.clone(),
                    cooldown_minutes: self.config.submission_cooldown_minutes,
                });
            }
        }

        self.finish("earn", &request.user_id, errors)
    }

    pub fn validate_redeem(&self, request: &RedeemRequest) -> Result<(), LedgerError> {
        let mut errors = ValidationErrors::new();
        let coins = request.coins_to_redeem;

        if !coins.is_positive() {
            errors.push(ValidationError::NonPositiveCoins(coins));
        }

        let available = self
            .store
            .balance(&request.user_id)?
            .map(|b| b.balance)
            .unwrap_or(Coins::ZERO);
        if available < coins {
            errors.push(ValidationError::InsufficientBalance {
                available,
                requested: coins,
            });
        }

        let pending_earns = self.store.counters(&request.user_id)?.pending_earn;
        if pending_earns > 0 {
            errors.push(ValidationError::PendingEarnRequests(pending_earns));
        }

        self.check_bill_minimum(request.bill_amount, &mut errors);

        match coins.checked_mul(self.config.payment_exchange_rate) {
            None => errors.push(ValidationError::AmountTooLarge(coins)),
            Some(coin_value) if coins.is_positive() && coin_value > request.bill_amount => {
                errors.push(ValidationError::RedemptionExceedsBill {
                    bill_amount: request.bill_amount,
                    requested: coins,
                });
            }
            Some(_) => {}
        }

        if let Some(brand) = self.active_brand(&request.brand_id, &mut errors) {
            if coins < brand.min_redemption_amount {
                errors.push(ValidationError::BelowMinimumRedemption {
                    minimum: brand.min_redemption_amount,
                    requested: coins,
                });
            }
            if let Some(maximum) = brand.max_redemption_amount {
                if coins > maximum {
                    errors.push(ValidationError::AboveMaximumRedemption {
                        maximum,
                        requested: coins,
                    });
                }
            }
        }

        self.finish("redeem", &request.user_id, errors)
    }

    /// Snapshot of the brand, for computing rewards after validation passed.
    pub fn brand(&self, brand_id: &str) -> Option<Brand> {
        self.brands.brand(brand_id)
    }

    fn check_bill_minimum(&self, bill_amount: Coins, errors: &mut ValidationErrors) {
        if bill_amount < self.config.min_bill_amount {
            errors.push(ValidationError::BillBelowMinimum {
                minimum: self.config.min_bill_amount,
                actual: bill_amount,
            });
        }
    }

    fn active_brand(&self, brand_id: &str, errors: &mut ValidationErrors) -> Option<Brand> {
        match self.brands.brand(brand_id) {
            None => {
                errors.push(ValidationError::UnknownBrand(brand_id.to_string()));
                None
            }
            Some(brand) if !brand.is_active => {
                errors.push(ValidationError::InactiveBrand(brand_id.to_string()));
                None
            }
            Some(brand) => Some(brand),
        }
    }

    fn finish(
        &self,
        request: &str,
        user_id: &str,
        errors: ValidationErrors,
    ) -> Result<(), LedgerError> {
        if !errors.is_empty() {
            tracing::warn!(
                user_id = %user_id,
                request,
                violations = errors.len(),
                errors = %errors,
                "request failed validation"
            );
        }
        Ok(errors.into_result()?)
    }
}
