use std::fmt;

use crate::transaction::{Decision, TransactionStatus, TransactionType};
use crate::types::Coins;

#[derive(thiserror::Error, Debug)]
pub enum LedgerError {
    #[error("Validation failed: {0}")]
    ValidationFailed(ValidationErrors),
    #[error("Cannot {decision} {kind} transaction {id} in state {status}")]
    InvalidState {
        id: String,
        kind: TransactionType,
        status: TransactionStatus,
        decision: Decision,
    },
    #[error("User {user_id} has {pending_earns} pending earn request(s); redeem must wait")]
    OrderingViolation { user_id: String, pending_earns: u64 },
    #[error("Insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance { available: Coins, requested: Coins },
    #[error("Payment amount {actual} does not match expected {expected}")]
    AmountMismatch { expected: Coins, actual: Coins },
    #[error("Payment reference {0} is already used by another transaction")]
    DuplicatePaymentReference(String),
    #[error("Welcome bonus already granted to user {0}")]
    AlreadyGranted(String),
    #[error("Invalid amount: {0}")]
    InvalidAmount(Coins),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("Encoding error: {0}")]
    Codec(String),
}

impl LedgerError {
    /// Whether repeating the same call later may succeed without correcting its arguments.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::OrderingViolation { .. }
                | LedgerError::InsufficientBalance { .. }
                | LedgerError::Storage(_)
        )
    }
}

impl From<ValidationErrors> for LedgerError {
    fn from(errors: ValidationErrors) -> Self {
        LedgerError::ValidationFailed(errors)
    }
}

impl From<minicbor::decode::Error> for LedgerError {
    fn from(e: minicbor::decode::Error) -> Self {
        LedgerError::Codec(e.to_string())
    }
}

impl<E: fmt::Display> From<minicbor::encode::Error<E>> for LedgerError {
    fn from(e: minicbor::encode::Error<E>) -> Self {
        LedgerError::Codec(e.to_string())
    }
}

/// A single rule violation found while checking a request.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Bill amount {actual} is below the minimum of {minimum}")]
    BillBelowMinimum { minimum: Coins, actual: Coins },
    #[error("Bill date lies in the future")]
    BillDateInFuture,
    #[error("Bill is {age_days} days old; the limit is {max_days} days")]
    BillTooOld { age_days: i64, max_days: i64 },
    #[error("A pending request for brand {brand_id} was submitted less than {cooldown_minutes} minutes ago")]
    DuplicateSubmission {
        brand_id: String,
        cooldown_minutes: i64,
    },
    #[error("Brand {0} does not exist")]
    UnknownBrand(String),
    #[error("Brand {0} is not active")]
    InactiveBrand(String),
    #[error("Bill earns no coins at this brand")]
    ZeroReward,
    #[error("Coin amount must be positive, got {0}")]
    NonPositiveCoins(Coins),
    #[error("Amount {0} is too large to convert")]
    AmountTooLarge(Coins),
    #[error("Insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance { available: Coins, requested: Coins },
    #[error("{0} earn request(s) are still pending")]
    PendingEarnRequests(u64),
    #[error("Redemption of {requested} is below the brand minimum of {minimum}")]
    BelowMinimumRedemption { minimum: Coins, requested: Coins },
    #[error("Redemption of {requested} exceeds the brand maximum of {maximum}")]
    AboveMaximumRedemption { maximum: Coins, requested: Coins },
    #[error("Redemption of {requested} exceeds the bill amount {bill_amount}")]
    RedemptionExceedsBill {
        bill_amount: Coins,
        requested: Coins,
    },
    #[error("Rejection requires notes")]
    MissingRejectionNotes,
    #[error("Payment reference is empty")]
    EmptyPaymentReference,
    #[error("Payment method is empty")]
    EmptyPaymentMethod,
    #[error("Payment amount must be positive, got {0}")]
    NonPositivePayment(Coins),
}

/// Every violation found for one request, in the order the checks ran.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValidationErrors(Vec<ValidationError>);

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn push(&mut self, error: ValidationError) {
        self.0.push(error);
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn errors(&self) -> &[ValidationError] {
        &self.0
    }
    pub fn contains(&self, error: &ValidationError) -> bool {
        self.0.contains(error)
    }
    /// `Ok(())` when nothing was collected.
    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.0.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl From<ValidationError> for ValidationErrors {
    fn from(error: ValidationError) -> Self {
        Self(vec![error])
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{e}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Could not load settings: {0}")]
    Load(#[from] ::config::ConfigError),
    #[error("Setting {key} is invalid: {reason}")]
    Invalid { key: &'static str, reason: &'static str },
}
