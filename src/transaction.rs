//! Ledger transactions and the transition table that governs their status
use std::fmt;

use crate::types::{Coins, TimeStamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
pub enum TransactionType {
    #[n(0)]
    Earn,
    #[n(1)]
    Redeem,
    #[n(2)]
    WelcomeBonus,
    #[n(3)]
    Adjustment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
pub enum TransactionStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Approved,
    #[n(2)]
    Rejected,
    #[n(3)]
    Processed,
    #[n(4)]
    Paid,
}

/// An admin action that may move a transaction forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject,
    Settle,
}

impl TransactionType {
    /// Stable one-byte tag used in index keys.
    pub fn index_tag(self) -> u8 {
        match self {
            TransactionType::Earn => 0,
            TransactionType::Redeem => 1,
            TransactionType::WelcomeBonus => 2,
            TransactionType::Adjustment => 3,
        }
    }
}

impl TransactionStatus {
    pub fn index_tag(self) -> u8 {
        match self {
            TransactionStatus::Pending => 0,
            TransactionStatus::Approved => 1,
            TransactionStatus::Rejected => 2,
            TransactionStatus::Processed => 3,
            TransactionStatus::Paid => 4,
        }
    }

    /// The status reached by applying `decision`, or `None` when the move is illegal.
    pub fn next(self, kind: TransactionType, decision: Decision) -> Option<TransactionStatus> {
        use Decision::*;
        use TransactionStatus::*;
        use TransactionType::*;

        match (kind, self, decision) {
            (Earn, Pending, Approve) => Some(Approved),
            (Earn, Pending, Reject) => Some(Rejected),
            (Redeem, Pending, Approve) => Some(Processed),
            (Redeem, Pending, Reject) => Some(Rejected),
            (Redeem, Processed, Settle) => Some(Paid),
            // granted and adjusted transactions are born approved
            (WelcomeBonus | Adjustment, _, _) => None,
            (Earn, Pending, Settle) => None,
            (Earn, Approved | Rejected | Processed | Paid, _) => None,
            (Redeem, Pending | Processed, _) => None,
            (Redeem, Approved | Rejected | Paid, _) => None,
        }
    }

    /// No decision can move a transaction of `kind` out of this status.
    pub fn is_terminal(self, kind: TransactionType) -> bool {
        [Decision::Approve, Decision::Reject, Decision::Settle]
            .into_iter()
            .all(|d| self.next(kind, d).is_none())
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransactionType::Earn => "EARN",
            TransactionType::Redeem => "REDEEM",
            TransactionType::WelcomeBonus => "WELCOME_BONUS",
            TransactionType::Adjustment => "ADJUSTMENT",
        })
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Approved => "APPROVED",
            TransactionStatus::Rejected => "REJECTED",
            TransactionStatus::Processed => "PROCESSED",
            TransactionStatus::Paid => "PAID",
        })
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Decision::Approve => "approve",
            Decision::Reject => "reject",
            Decision::Settle => "settle",
        })
    }
}

/// One row of the append-only transaction log.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Transaction {
    #[n(0)]
    pub id: String, // bech32 "tx1..."
    #[n(1)]
    pub user_id: String,
    #[n(2)]
    pub brand_id: Option<String>,
    #[n(3)]
    pub kind: TransactionType,
    #[n(4)]
    pub amount: Coins, // signed: credits positive, debits negative
    #[n(5)]
    pub bill_amount: Option<Coins>,
    #[n(6)]
    pub bill_date: Option<TimeStamp>,
    #[n(7)]
    pub receipt_ref: Option<String>,
    #[n(8)]
    pub status: TransactionStatus,
    #[n(9)]
    pub admin_notes: Option<String>,
    #[n(10)]
    pub processed_by: Option<String>,
    #[n(11)]
    pub processed_at: Option<TimeStamp>,
    #[n(12)]
    pub payment_transaction_id: Option<String>,
    #[n(13)]
    pub payment_method: Option<String>,
    #[n(14)]
    pub payment_amount: Option<Coins>,
    #[n(15)]
    pub paid_by: Option<String>,
    #[n(16)]
    pub payment_processed_at: Option<TimeStamp>,
    #[n(17)]
    pub created_at: TimeStamp,
}

impl Transaction {
    fn base(id: String, user_id: &str, kind: TransactionType, amount: Coins) -> Self {
        Self {
            id,
            user_id: user_id.to_string(),
            brand_id: None,
            kind,
            amount,
            bill_amount: None,
            bill_date: None,
            receipt_ref: None,
            status: TransactionStatus::Pending,
            admin_notes: None,
            processed_by: None,
            processed_at: None,
            payment_transaction_id: None,
            payment_method: None,
            payment_amount: None,
            paid_by: None,
            payment_processed_at: None,
            created_at: TimeStamp::now(),
        }
    }

    /// A pending earn request crediting `coins`.
    pub fn earn(
        id: String,
        user_id: &str,
        brand_id: &str,
        coins: Coins,
        bill_amount: Coins,
        bill_date: TimeStamp,
        receipt_ref: Option<String>,
    ) -> Self {
        Self {
            brand_id: Some(brand_id.to_string()),
            bill_amount: Some(bill_amount),
            bill_date: Some(bill_date),
            receipt_ref,
            ..Self::base(id, user_id, TransactionType::Earn, coins.abs())
        }
    }

    /// A pending redeem request debiting `coins`.
    pub fn redeem(
        id: String,
        user_id: &str,
        brand_id: &str,
        coins: Coins,
        bill_amount: Coins,
    ) -> Self {
        Self {
            brand_id: Some(brand_id.to_string()),
            bill_amount: Some(bill_amount),
            ..Self::base(id, user_id, TransactionType::Redeem, -coins.abs())
        }
    }

    /// An already approved welcome bonus.
    pub fn welcome_bonus(id: String, user_id: &str, coins: Coins) -> Self {
        let now = TimeStamp::now();
        Self {
            status: TransactionStatus::Approved,
            processed_at: Some(now),
            processed_by: Some("system".to_string()),
            admin_notes: Some("Welcome bonus".to_string()),
            ..Self::base(id, user_id, TransactionType::WelcomeBonus, coins.abs())
        }
    }

    /// An already approved admin correction carrying the applied signed delta.
    pub fn adjustment(
        id: String,
        user_id: &str,
        approver_id: &str,
        applied: Coins,
        notes: Option<String>,
    ) -> Self {
        Self {
            status: TransactionStatus::Approved,
            processed_at: Some(TimeStamp::now()),
            processed_by: Some(approver_id.to_string()),
            admin_notes: notes,
            ..Self::base(id, user_id, TransactionType::Adjustment, applied)
        }
    }

    /// Magnitude of the coin effect.
    pub fn coins(&self) -> Coins {
        self.amount.abs()
    }

    pub fn is_pending(&self) -> bool {
        self.status == TransactionStatus::Pending
    }

    /// Append a line to the admin notes.
    pub fn append_note(&mut self, line: &str) {
        match &mut self.admin_notes {
            Some(notes) if !notes.is_empty() => {
                notes.push('\n');
                notes.push_str(line);
            }
            _ => self.admin_notes = Some(line.to_string()),
        }
    }
}
