//! Read-only brand snapshots consulted at validation time
use std::collections::HashMap;

use rust_decimal::Decimal;

use crate::types::Coins;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Brand {
    pub id: String,
    pub name: String,
    pub is_active: bool,
    /// Percent of the bill credited as coins, e.g. `10` for 10%
    pub earning_percentage: Decimal,
    pub min_redemption_amount: Coins,
    pub max_redemption_amount: Option<Coins>,
}

impl Brand {
    pub fn new(id: &str, name: &str, earning_percentage: Decimal) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            is_active: true,
            earning_percentage,
            min_redemption_amount: Coins::ZERO,
            max_redemption_amount: None,
        }
    }
    pub fn set_active(mut self, active: bool) -> Self {
        self.is_active = active;
        self
    }
    pub fn set_redemption_range(mut self, min: Coins, max: Option<Coins>) -> Self {
        self.min_redemption_amount = min;
        self.max_redemption_amount = max;
        self
    }

    /// Coins credited for a bill of `bill_amount`, rounded to cents.
    /// `None` when the bill is too large to convert.
    pub fn coins_for_bill(&self, bill_amount: Coins) -> Option<Coins> {
        bill_amount
            .checked_mul(self.earning_percentage)?
            .checked_div(Decimal::ONE_HUNDRED)
            .map(|coins| coins.round_cents())
    }
}

/// Lookup of brands by id.
pub trait BrandDirectory: Send + Sync {
    fn brand(&self, brand_id: &str) -> Option<Brand>;
}

impl BrandDirectory for HashMap<String, Brand> {
    fn brand(&self, brand_id: &str) -> Option<Brand> {
        self.get(brand_id).cloned()
    }
}
