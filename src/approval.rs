//! Admin decisions on pending transactions, welcome bonuses and adjustments.
//!
//! Each operation runs as one atomic unit covering the status precondition,
//! the status change and the balance change. A transaction that has already
//! left `Pending` fails with `InvalidState`, so a repeated approval can never
//! apply its balance effect twice.
use std::sync::Arc;

use chrono::Utc;

use crate::config::LedgerConfig;
use crate::error::{LedgerError, ValidationError};
use crate::notify::{EventKind, OutboxRelay};
use crate::page::{Page, PageRequest};
use crate::store::{LedgerStore, LedgerTx, TxResult, abort};
use crate::transaction::{Decision, Transaction, TransactionStatus, TransactionType};
use crate::types::{Coins, PendingEarn, TimeStamp};
use crate::utils;

/// Aggregate counts and sums over the whole ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionStats {
    pub total_transactions: usize,
    pub pending_earn: usize,
    pub pending_redeem: usize,
    pub approved_earn: usize,
    pub rejected_earn: usize,
    pub processed_redeem: usize,
    pub paid_redeem: usize,
    pub rejected_redeem: usize,
    pub welcome_bonuses: usize,
    pub adjustments: usize,
    pub pending_earn_coins: Coins,
    pub pending_redeem_coins: Coins,
    pub earned_coins: Coins,
    pub bonus_coins: Coins,
    pub net_adjustment_coins: Coins,
    /// Redeems approved for payout, paid or not
    pub redeemed_coins: Coins,
    pub paid_coins: Coins,
}

pub struct ApprovalService {
    store: LedgerStore,
    config: Arc<LedgerConfig>,
    relay: Arc<OutboxRelay>,
}

impl ApprovalService {
    pub fn new(store: LedgerStore, config: Arc<LedgerConfig>, relay: Arc<OutboxRelay>) -> Self {
        Self {
            store,
            config,
            relay,
        }
    }

    /// Persist a validated earn or redeem request as `Pending`. The
    /// same-brand cooldown for earns is checked again inside the unit, so of
    /// two concurrent duplicate submissions only one is recorded.
    pub fn open_pending(&self, tx: Transaction) -> Result<Transaction, LedgerError> {
        if !tx.is_pending() || !matches!(tx.kind, TransactionType::Earn | TransactionType::Redeem)
        {
            return Err(LedgerError::InvalidState {
                id: tx.id.clone(),
                kind: tx.kind,
                status: tx.status,
                decision: Decision::Approve,
            });
        }

        let cooldown_start = self.config.cooldown_start(Utc::now());
        self.store.atomically(|ltx| {
            let mut counters = ltx.counters(&tx.user_id)?;
            match (tx.kind, tx.brand_id.as_deref()) {
                (TransactionType::Earn, Some(brand_id)) => {
                    if let Some(since) = cooldown_start {
                        if counters.recent_pending_earn(brand_id, since).is_some() {
                            return abort(LedgerError::ValidationFailed(
                                ValidationError::DuplicateSubmission {
                                    brand_id: brand_id.to_string(),
                                    cooldown_minutes: self.config.submission_cooldown_minutes,
                                }
                                .into(),
                            ));
                        }
                    }
                    counters.pending_earn += 1;
                    counters.pending_earns.push(PendingEarn {
                        transaction_id: tx.id.clone(),
                        brand_id: brand_id.to_string(),
                        created_at: tx.created_at,
                    });
                }
                (TransactionType::Earn, None) => counters.pending_earn += 1,
                _ => counters.pending_redeem += 1,
            }
            ltx.put_counters(&tx.user_id, &counters)?;
            ltx.append_transaction(&tx)
        })?;

        tracing::info!(
            transaction_id = %tx.id,
            user_id = %tx.user_id,
            kind = %tx.kind,
            amount = %tx.amount,
            "request submitted"
        );
        Ok(tx)
    }

    pub fn approve_earn(
        &self,
        transaction_id: &str,
        approver_id: &str,
        notes: Option<&str>,
    ) -> Result<Transaction, LedgerError> {
        self.resolve(
            transaction_id,
            TransactionType::Earn,
            Decision::Approve,
            approver_id,
            notes,
            EventKind::EarnApproved,
            |ltx, tx| {
                let mut balance = ltx.balance(&tx.user_id)?;
                if let Err(e) = balance.credit(tx.coins()) {
                    return abort(e);
                }
                ltx.put_balance(&balance)
            },
        )
    }

    pub fn reject_earn(
        &self,
        transaction_id: &str,
        approver_id: &str,
        notes: &str,
    ) -> Result<Transaction, LedgerError> {
        require_notes(notes)?;
        self.resolve(
            transaction_id,
            TransactionType::Earn,
            Decision::Reject,
            approver_id,
            Some(notes),
            EventKind::EarnRejected,
            |_, _| Ok(()),
        )
    }

    /// Stage a redeem for payout. Fails while the user still has pending earn
    /// requests, and re-checks the balance at the moment of the debit.
    pub fn approve_redeem(
        &self,
        transaction_id: &str,
        approver_id: &str,
        notes: Option<&str>,
    ) -> Result<Transaction, LedgerError> {
        self.resolve(
            transaction_id,
            TransactionType::Redeem,
            Decision::Approve,
            approver_id,
            notes,
            EventKind::RedeemProcessed,
            |ltx, tx| {
                let pending_earns = ltx.counters(&tx.user_id)?.pending_earn;
                if pending_earns > 0 {
                    return abort(LedgerError::OrderingViolation {
                        user_id: tx.user_id.clone(),
                        pending_earns,
                    });
                }
                let mut balance = ltx.balance(&tx.user_id)?;
                if let Err(e) = balance.debit(tx.coins()) {
                    return abort(e);
                }
                ltx.put_balance(&balance)
            },
        )
    }

    pub fn reject_redeem(
        &self,
        transaction_id: &str,
        approver_id: &str,
        notes: &str,
    ) -> Result<Transaction, LedgerError> {
        require_notes(notes)?;
        self.resolve(
            transaction_id,
            TransactionType::Redeem,
            Decision::Reject,
            approver_id,
            Some(notes),
            EventKind::RedeemRejected,
            |_, _| Ok(()),
        )
    }

    // Shared shape of the four decisions on a pending request.
    #[allow(clippy::too_many_arguments)]
    fn resolve<F>(
        &self,
        transaction_id: &str,
        kind: TransactionType,
        decision: Decision,
        approver_id: &str,
        notes: Option<&str>,
        event: EventKind,
        effect: F,
    ) -> Result<Transaction, LedgerError>
    where
        F: Fn(&LedgerTx<'_>, &Transaction) -> TxResult<()>,
    {
        let outcome = self.store.atomically(|ltx| {
            let mut tx = ltx.transaction(transaction_id)?;

            let next = if tx.kind == kind {
                tx.status.next(tx.kind, decision)
            } else {
                None
            };
            let Some(next) = next else {
                return abort(LedgerError::InvalidState {
                    id: tx.id.clone(),
                    kind: tx.kind,
                    status: tx.status,
                    decision,
                });
            };

            effect(ltx, &tx)?;

            let mut counters = ltx.counters(&tx.user_id)?;
            match tx.kind {
                TransactionType::Earn => {
                    counters.pending_earn = counters.pending_earn.saturating_sub(1);
                    counters.forget_pending_earn(&tx.id);
                }
                TransactionType::Redeem => {
                    counters.pending_redeem = counters.pending_redeem.saturating_sub(1)
                }
                TransactionType::WelcomeBonus | TransactionType::Adjustment => {}
            }
            ltx.put_counters(&tx.user_id, &counters)?;

            tx.status = next;
            tx.processed_at = Some(TimeStamp::now());
            tx.processed_by = Some(approver_id.to_string());
            if let Some(notes) = notes.map(str::trim).filter(|n| !n.is_empty()) {
                tx.append_note(notes);
            }
            ltx.put_transaction(&tx)?;
            ltx.queue_event_for(event, &tx)?;
            Ok(tx)
        });

        let tx = match outcome {
            Ok(tx) => tx,
            Err(e) => {
                tracing::warn!(
                    transaction_id = %transaction_id,
                    approver_id = %approver_id,
                    decision = %decision,
                    error = %e,
                    "decision refused"
                );
                return Err(e);
            }
        };

        tracing::info!(
            transaction_id = %tx.id,
            user_id = %tx.user_id,
            approver_id = %approver_id,
            kind = %tx.kind,
            status = %tx.status,
            amount = %tx.amount,
            "transaction resolved"
        );
        self.relay.flush_after_commit(&tx.id);
        Ok(tx)
    }

    /// Credit the one-time welcome bonus.
    pub fn grant_welcome_bonus(&self, user_id: &str) -> Result<Transaction, LedgerError> {
        let amount = self.config.welcome_bonus_amount;
        let tx = Transaction::welcome_bonus(utils::new_transaction_id()?, user_id, amount);

        self.store.atomically(|ltx| {
            let mut counters = ltx.counters(user_id)?;
            if counters.welcome_bonus.is_some() {
                return abort(LedgerError::AlreadyGranted(user_id.to_string()));
            }
            counters.welcome_bonus = Some(tx.id.clone());
            ltx.put_counters(user_id, &counters)?;

            let mut balance = ltx.balance(user_id)?;
            if let Err(e) = balance.credit(amount) {
                return abort(e);
            }
            ltx.put_balance(&balance)?;

            ltx.append_transaction(&tx)?;
            ltx.queue_event_for(EventKind::WelcomeBonusGranted, &tx)
        })?;

        tracing::info!(
            transaction_id = %tx.id,
            user_id = %user_id,
            amount = %amount,
            "welcome bonus granted"
        );
        self.relay.flush_after_commit(&tx.id);
        Ok(tx)
    }

    /// Apply an admin correction. Debits stop at a zero balance; the stored
    /// transaction carries the delta actually applied.
    pub fn apply_adjustment(
        &self,
        user_id: &str,
        approver_id: &str,
        delta: Coins,
        notes: Option<&str>,
    ) -> Result<Transaction, LedgerError> {
        if delta.is_zero() {
            return Err(LedgerError::InvalidAmount(delta));
        }
        let id = utils::new_transaction_id()?;

        let tx = self.store.atomically(|ltx| {
            let mut balance = ltx.balance(user_id)?;
            let applied = if delta.is_positive() {
                if let Err(e) = balance.credit(delta) {
                    return abort(e);
                }
                delta
            } else {
                -balance.debit_capped(delta.abs())
            };
            ltx.put_balance(&balance)?;

            let mut tx = Transaction::adjustment(
                id.clone(),
                user_id,
                approver_id,
                applied,
                notes.map(str::to_string),
            );
            if applied != delta {
                tx.append_note(&format!(
                    "[adjustment] requested {delta}, applied {applied}; capped at zero balance"
                ));
            }
            ltx.append_transaction(&tx)?;
            ltx.queue_event_for(EventKind::BalanceAdjusted, &tx)?;
            Ok(tx)
        })?;

        if tx.amount.is_negative() || tx.amount != delta {
            tracing::warn!(
                target: "coin_ledger::adjustment",
                transaction_id = %tx.id,
                user_id = %user_id,
                approver_id = %approver_id,
                requested = %delta,
                applied = %tx.amount,
                "administrative debit"
            );
        } else {
            tracing::info!(
                target: "coin_ledger::adjustment",
                transaction_id = %tx.id,
                user_id = %user_id,
                approver_id = %approver_id,
                applied = %tx.amount,
                "administrative credit"
            );
        }
        self.relay.flush_after_commit(&tx.id);
        Ok(tx)
    }

    /// Pending requests, oldest first, optionally of one kind. Only the
    /// requested page is read from the transaction tree.
    pub fn pending_transactions(
        &self,
        page: usize,
        limit: usize,
        kind: Option<TransactionType>,
    ) -> Result<Page<Transaction>, LedgerError> {
        let request = PageRequest::new(page, limit, self.config.max_page_size);
        let entries = self.store.status_entries(TransactionStatus::Pending, kind)?;
        let total = entries.len();
        let items = entries
            .iter()
            .skip(request.offset())
            .take(request.limit)
            .map(|entry| self.store.require_transaction(&entry.transaction_id))
            .collect::<Result<_, _>>()?;

        Ok(Page::from_window(items, request, total))
    }

    /// Counts and sums over the status index. Sums saturate rather than
    /// overflow.
    pub fn transaction_stats(&self) -> Result<TransactionStats, LedgerError> {
        use TransactionStatus::*;
        use TransactionType::*;

        let mut stats = TransactionStats::default();
        for entry in self.store.all_status_entries()? {
            stats.total_transactions += 1;
            let coins = entry.amount.abs();
            match (entry.kind, entry.status) {
                (Earn, Pending) => {
                    stats.pending_earn += 1;
                    stats.pending_earn_coins = stats.pending_earn_coins.saturating_add(coins);
                }
                (Earn, Approved) => {
                    stats.approved_earn += 1;
                    stats.earned_coins = stats.earned_coins.saturating_add(coins);
                }
                (Earn, Rejected) => stats.rejected_earn += 1,
                (Redeem, Pending) => {
                    stats.pending_redeem += 1;
                    stats.pending_redeem_coins = stats.pending_redeem_coins.saturating_add(coins);
                }
                (Redeem, Processed) => {
                    stats.processed_redeem += 1;
                    stats.redeemed_coins = stats.redeemed_coins.saturating_add(coins);
                }
                (Redeem, Paid) => {
                    stats.paid_redeem += 1;
                    stats.redeemed_coins = stats.redeemed_coins.saturating_add(coins);
                    stats.paid_coins = stats.paid_coins.saturating_add(coins);
                }
                (Redeem, Rejected) => stats.rejected_redeem += 1,
                (WelcomeBonus, _) => {
                    stats.welcome_bonuses += 1;
                    stats.bonus_coins = stats.bonus_coins.saturating_add(coins);
                }
                (Adjustment, _) => {
                    stats.adjustments += 1;
                    stats.net_adjustment_coins =
                        stats.net_adjustment_coins.saturating_add(entry.amount);
                }
                (Earn, Processed | Paid) | (Redeem, Approved) => {
                    tracing::warn!(
                        transaction_id = %entry.transaction_id,
                        kind = %entry.kind,
                        status = %entry.status,
                        "status outside the transition table"
                    );
                }
            }
        }
        Ok(stats)
    }
}

fn require_notes(notes: &str) -> Result<(), LedgerError> {
    if notes.trim().is_empty() {
        return Err(LedgerError::ValidationFailed(
            ValidationError::MissingRejectionNotes.into(),
        ));
    }
    Ok(())
}
