//! Settlement of processed redeems against external payouts
use std::sync::Arc;

use crate::config::LedgerConfig;
use crate::error::{LedgerError, ValidationError, ValidationErrors};
use crate::notify::{EventKind, OutboxRelay};
use crate::page::{Page, PageRequest};
use crate::store::{LedgerStore, abort};
use crate::transaction::{Decision, Transaction, TransactionStatus, TransactionType};
use crate::types::{Coins, TimeStamp};

/// Inclusive time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub from: TimeStamp,
    pub to: TimeStamp,
}

impl DateRange {
    pub fn new(from: TimeStamp, to: TimeStamp) -> Self {
        Self { from, to }
    }
    pub fn contains(&self, at: TimeStamp) -> bool {
        self.from <= at && at <= self.to
    }
}

/// A redeem joined with its payout details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentSummary {
    pub transaction_id: String,
    pub user_id: String,
    pub brand_id: Option<String>,
    pub coins: Coins,
    pub expected_payout: Coins,
    pub status: TransactionStatus,
    pub approved_by: Option<String>,
    pub approved_at: Option<TimeStamp>,
    pub payment_reference: Option<String>,
    pub payment_method: Option<String>,
    pub payment_amount: Option<Coins>,
    pub paid_by: Option<String>,
    pub paid_at: Option<TimeStamp>,
    pub notes: Option<String>,
}

impl PaymentSummary {
    pub fn is_paid(&self) -> bool {
        self.status == TransactionStatus::Paid
    }
}

pub struct PaymentSettlement {
    store: LedgerStore,
    config: Arc<LedgerConfig>,
    relay: Arc<OutboxRelay>,
}

impl PaymentSettlement {
    pub fn new(store: LedgerStore, config: Arc<LedgerConfig>, relay: Arc<OutboxRelay>) -> Self {
        Self {
            store,
            config,
            relay,
        }
    }

    /// Payout owed for `coins` under the configured exchange rate.
    pub fn expected_payout(&self, coins: Coins) -> Result<Coins, LedgerError> {
        coins
            .checked_mul(self.config.payment_exchange_rate)
            .map(|payout| payout.round_cents())
            .ok_or(LedgerError::InvalidAmount(coins))
    }

    /// Record the external payout of a processed redeem and mark it paid.
    pub fn process_payment(
        &self,
        transaction_id: &str,
        approver_id: &str,
        payment_reference: &str,
        method: &str,
        amount: Coins,
        notes: Option<&str>,
    ) -> Result<Transaction, LedgerError> {
        let reference = payment_reference.trim();
        let method = method.trim();

        let mut errors = ValidationErrors::new();
        if reference.is_empty() {
            errors.push(ValidationError::EmptyPaymentReference);
        }
        if method.is_empty() {
            errors.push(ValidationError::EmptyPaymentMethod);
        }
        if !amount.is_positive() {
            errors.push(ValidationError::NonPositivePayment(amount));
        }
        errors.into_result()?;

        let tolerance = self.config.payment_amount_tolerance;
        let outcome = self.store.atomically(|ltx| {
            let mut tx = ltx.transaction(transaction_id)?;

            let next = match tx.kind {
                TransactionType::Redeem => tx.status.next(tx.kind, Decision::Settle),
                _ => None,
            };
            let Some(next) = next else {
                return abort(LedgerError::InvalidState {
                    id: tx.id.clone(),
                    kind: tx.kind,
                    status: tx.status,
                    decision: Decision::Settle,
                });
            };

            let expected = match self.expected_payout(tx.coins()) {
                Ok(expected) => expected,
                Err(e) => return abort(e),
            };
            if (amount - expected).abs().value() > tolerance {
                return abort(LedgerError::AmountMismatch {
                    expected,
                    actual: amount,
                });
            }

            ltx.claim_payment_reference(reference, &tx.id)?;

            let now = TimeStamp::now();
            tx.status = next;
            tx.payment_transaction_id = Some(reference.to_string());
            tx.payment_method = Some(method.to_string());
            tx.payment_amount = Some(amount);
            tx.paid_by = Some(approver_id.to_string());
            tx.payment_processed_at = Some(now);
            tx.append_note(&format!(
                "[payment] method={method} amount={amount} reference={reference}"
            ));
            if let Some(notes) = notes.map(str::trim).filter(|n| !n.is_empty()) {
                tx.append_note(notes);
            }
            ltx.put_transaction(&tx)?;
            ltx.queue_event_for(EventKind::PaymentSettled, &tx)?;
            Ok(tx)
        });

        let tx = match outcome {
            Ok(tx) => tx,
            Err(e) => {
                tracing::warn!(
                    transaction_id = %transaction_id,
                    approver_id = %approver_id,
                    reference = %reference,
                    error = %e,
                    "payment refused"
                );
                return Err(e);
            }
        };

        tracing::info!(
            transaction_id = %tx.id,
            user_id = %tx.user_id,
            approver_id = %approver_id,
            reference = %reference,
            method = %method,
            amount = %amount,
            "redeem paid"
        );
        self.relay.flush_after_commit(&tx.id);
        Ok(tx)
    }

    pub fn payment_summary(&self, transaction_id: &str) -> Result<PaymentSummary, LedgerError> {
        let tx = self.store.require_transaction(transaction_id)?;
        if tx.kind != TransactionType::Redeem {
            return Err(LedgerError::NotFound(format!(
                "redeem transaction {transaction_id}"
            )));
        }
        self.summarise(tx)
    }

    /// Paid redeems, most recently paid first, optionally within `range`.
    pub fn paid_transactions(
        &self,
        page: usize,
        limit: usize,
        range: Option<DateRange>,
    ) -> Result<Page<PaymentSummary>, LedgerError> {
        let request = PageRequest::new(page, limit, self.config.max_page_size);
        let paid: Vec<_> = self
            .store
            .status_entries(TransactionStatus::Paid, Some(TransactionType::Redeem))?
            .into_iter()
            .rev()
            .filter(|entry| range.is_none_or(|range| range.contains(entry.at)))
            .collect();
        let total = paid.len();
        let items = paid
            .iter()
            .skip(request.offset())
            .take(request.limit)
            .map(|entry| self.summarise(self.store.require_transaction(&entry.transaction_id)?))
            .collect::<Result<_, _>>()?;

        Ok(Page::from_window(items, request, total))
    }

    fn summarise(&self, tx: Transaction) -> Result<PaymentSummary, LedgerError> {
        Ok(PaymentSummary {
            expected_payout: self.expected_payout(tx.coins())?,
            coins: tx.coins(),
            transaction_id: tx.id,
            user_id: tx.user_id,
            brand_id: tx.brand_id,
            status: tx.status,
            approved_by: tx.processed_by,
            approved_at: tx.processed_at,
            payment_reference: tx.payment_transaction_id,
            payment_method: tx.payment_method,
            payment_amount: tx.payment_amount,
            paid_by: tx.paid_by,
            paid_at: tx.payment_processed_at,
            notes: tx.admin_notes,
        })
    }
}
