//! Core value types shared by the ledger: timestamps, coin amounts and balances
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;

use crate::error::LedgerError;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct TimeStamp(DateTime<Utc>);

impl TimeStamp {
    pub fn now() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        min: u32,
        sec: u32,
    ) -> Option<Self> {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .map(TimeStamp)
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    /// Nanoseconds since the epoch, clamped into the range sled keys can order.
    pub fn sort_key(&self) -> u64 {
        self.0.timestamp_nanos_opt().unwrap_or_default().max(0) as u64
    }
}

impl From<DateTime<Utc>> for TimeStamp {
    fn from(value: DateTime<Utc>) -> Self {
        TimeStamp(value)
    }
}

impl fmt::Display for TimeStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl<C> minicbor::Encode<C> for TimeStamp {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

/// A decimal coin quantity. Signed so a transaction can carry the direction
/// of its effect; balances keep theirs non-negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, serde::Deserialize)]
#[serde(transparent)]
pub struct Coins(Decimal);

impl Coins {
    pub const ZERO: Coins = Coins(Decimal::ZERO);

    pub fn new(value: Decimal) -> Self {
        Self(value)
    }
    pub fn value(&self) -> Decimal {
        self.0
    }
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }
    pub fn is_negative(&self) -> bool {
        self.0 < Decimal::ZERO
    }
    pub fn abs(&self) -> Self {
        Self(self.0.abs())
    }
    pub fn checked_add(self, rhs: Coins) -> Option<Coins> {
        self.0.checked_add(rhs.0).map(Coins)
    }
    /// `None` when the product does not fit a decimal.
    pub fn checked_mul(self, factor: Decimal) -> Option<Coins> {
        self.0.checked_mul(factor).map(Coins)
    }
    pub fn checked_div(self, divisor: Decimal) -> Option<Coins> {
        self.0.checked_div(divisor).map(Coins)
    }
    pub fn saturating_add(self, rhs: Coins) -> Coins {
        Coins(self.0.saturating_add(rhs.0))
    }
    /// Round to cents, midpoint away from zero.
    pub fn round_cents(&self) -> Self {
        Self(
            self.0
                .round_dp_with_strategy(2, rust_decimal::RoundingStrategy::MidpointAwayFromZero),
        )
    }
}

impl From<Decimal> for Coins {
    fn from(value: Decimal) -> Self {
        Coins(value)
    }
}

impl From<Coins> for Decimal {
    fn from(value: Coins) -> Self {
        value.0
    }
}

impl fmt::Display for Coins {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add for Coins {
    type Output = Coins;
    fn add(self, rhs: Coins) -> Coins {
        Coins(self.0 + rhs.0)
    }
}

impl Sub for Coins {
    type Output = Coins;
    fn sub(self, rhs: Coins) -> Coins {
        Coins(self.0 - rhs.0)
    }
}

impl Neg for Coins {
    type Output = Coins;
    fn neg(self) -> Coins {
        Coins(-self.0)
    }
}

impl AddAssign for Coins {
    fn add_assign(&mut self, rhs: Coins) {
        self.0 += rhs.0;
    }
}

impl SubAssign for Coins {
    fn sub_assign(&mut self, rhs: Coins) {
        self.0 -= rhs.0;
    }
}

impl Sum for Coins {
    fn sum<I: Iterator<Item = Coins>>(iter: I) -> Coins {
        iter.fold(Coins::ZERO, Add::add)
    }
}

// Stored as rust_decimal's fixed 16 byte representation.
impl<C> minicbor::Encode<C> for Coins {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.bytes(&self.0.serialize())?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for Coins {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let bytes = d.bytes()?;
        let raw: [u8; 16] = bytes
            .try_into()
            .map_err(|_| minicbor::decode::Error::message("decimal must be 16 bytes"))?;

        Ok(Coins(Decimal::deserialize(raw)))
    }
}

/// One user's coin position. `balance == total_earned - total_redeemed` and
/// `balance >= 0` hold after every committed mutation.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Balance {
    #[n(0)]
    pub user_id: String,
    #[n(1)]
    pub balance: Coins,
    #[n(2)]
    pub total_earned: Coins,
    #[n(3)]
    pub total_redeemed: Coins,
    #[n(4)]
    pub last_updated: TimeStamp,
}

impl Balance {
    pub fn zero(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            balance: Coins::ZERO,
            total_earned: Coins::ZERO,
            total_redeemed: Coins::ZERO,
            last_updated: TimeStamp::now(),
        }
    }

    /// Credit `amount`, leaving the balance untouched if either total would overflow.
    pub fn credit(&mut self, amount: Coins) -> Result<(), LedgerError> {
        let (Some(balance), Some(total_earned)) = (
            self.balance.checked_add(amount),
            self.total_earned.checked_add(amount),
        ) else {
            return Err(LedgerError::InvalidAmount(amount));
        };
        self.balance = balance;
        self.total_earned = total_earned;
        self.last_updated = TimeStamp::now();
        Ok(())
    }

    /// Debit the full amount or nothing.
    pub fn debit(&mut self, amount: Coins) -> Result<(), LedgerError> {
        if self.balance < amount {
            return Err(LedgerError::InsufficientBalance {
                available: self.balance,
                requested: amount,
            });
        }
        self.balance -= amount;
        self.total_redeemed += amount;
        self.last_updated = TimeStamp::now();
        Ok(())
    }

    /// Debit at most the current balance; returns what was taken.
    pub fn debit_capped(&mut self, amount: Coins) -> Coins {
        let applied = amount.min(self.balance);
        self.balance -= applied;
        self.total_redeemed += applied;
        self.last_updated = TimeStamp::now();
        applied
    }

    pub fn is_consistent(&self) -> bool {
        !self.balance.is_negative() && self.balance == self.total_earned - self.total_redeemed
    }
}

/// Per-user bookkeeping kept beside the balance so the ordering rule and the
/// welcome bonus guard can be read inside the same atomic unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct UserCounters {
    #[n(0)]
    pub pending_earn: u64,
    #[n(1)]
    pub pending_redeem: u64,
    #[n(2)]
    pub welcome_bonus: Option<String>, // id of the granting transaction
    #[n(3)]
    pub pending_earns: Vec<PendingEarn>,
}

impl UserCounters {
    /// A pending earn at `brand_id` submitted at or after `since`.
    pub fn recent_pending_earn(&self, brand_id: &str, since: TimeStamp) -> Option<&PendingEarn> {
        self.pending_earns
            .iter()
            .find(|p| p.brand_id == brand_id && p.created_at >= since)
    }

    pub fn forget_pending_earn(&mut self, transaction_id: &str) {
        self.pending_earns.retain(|p| p.transaction_id != transaction_id);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct PendingEarn {
    #[n(0)]
    pub transaction_id: String,
    #[n(1)]
    pub brand_id: String,
    #[n(2)]
    pub created_at: TimeStamp,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn timestamp_encoding() {
        let original = TimeStamp::now();

        let encoding = minicbor::to_vec(original).unwrap();
        let decode: TimeStamp = minicbor::decode(&encoding).unwrap();

        assert_eq!(original, decode);
    }

    #[test]
    fn coins_keep_scale_through_encoding() {
        let original = Coins::new(dec!(-12.340));

        let encoding = minicbor::to_vec(original).unwrap();
        let decode: Coins = minicbor::decode(&encoding).unwrap();

        assert_eq!(original, decode);
        assert_eq!(decode.to_string(), "-12.340");
    }

    #[test]
    fn round_cents_goes_away_from_zero() {
        assert_eq!(Coins::new(dec!(2.345)).round_cents(), Coins::new(dec!(2.35)));
        assert_eq!(Coins::new(dec!(-2.345)).round_cents(), Coins::new(dec!(-2.35)));
    }

    #[test]
    fn debit_refuses_overdraft() {
        let mut balance = Balance::zero("user_a");
        balance.credit(Coins::new(dec!(10))).unwrap();

        let err = balance.debit(Coins::new(dec!(10.01))).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
        assert_eq!(balance.balance, Coins::new(dec!(10)));

        balance.debit(Coins::new(dec!(4))).unwrap();
        assert_eq!(balance.balance, Coins::new(dec!(6)));
        assert!(balance.is_consistent());
    }

    #[test]
    fn capped_debit_stops_at_zero() {
        let mut balance = Balance::zero("user_b");
        balance.credit(Coins::new(dec!(30))).unwrap();

        let applied = balance.debit_capped(Coins::new(dec!(50)));
        assert_eq!(applied, Coins::new(dec!(30)));
        assert_eq!(balance.balance, Coins::ZERO);
        assert_eq!(balance.total_redeemed, Coins::new(dec!(30)));
        assert!(balance.is_consistent());
    }

    #[test]
    fn overflowing_credit_is_refused() {
        let mut balance = Balance::zero("user_c");
        balance.credit(Coins::new(Decimal::MAX)).unwrap();

        let err = balance.credit(Coins::new(dec!(1))).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount(_)));
        assert_eq!(balance.balance, Coins::new(Decimal::MAX));
        assert!(balance.is_consistent());
    }

    #[test]
    fn coin_arithmetic_reports_overflow() {
        let max = Coins::new(Decimal::MAX);
        assert_eq!(max.checked_mul(dec!(2)), None);
        assert_eq!(max.checked_add(Coins::new(dec!(1))), None);
        assert_eq!(max.saturating_add(Coins::new(dec!(1))), max);
        assert_eq!(Coins::new(dec!(3)).checked_div(Decimal::ZERO), None);
    }
}
