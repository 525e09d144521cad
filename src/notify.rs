//! Post-commit notifications.
//!
//! State changes queue a [`LedgerEvent`] into the outbox tree inside their
//! atomic unit. [`OutboxRelay::flush`] runs after the unit commits and hands
//! queued events to the [`NotificationDispatcher`]. Delivery failures are
//! logged and retried on a later flush, never reported to the caller that
//! changed the ledger.
//!
//! An event is claimed (removed from the outbox by compare-and-swap) before
//! it is dispatched, so concurrent flushes never deliver the same event
//! twice. A failed event is put back with its attempt count raised. An event
//! claimed by a process that dies before dispatching it is lost.
use std::fmt;
use std::sync::Arc;

use crate::error::LedgerError;
use crate::store::LedgerStore;
use crate::transaction::Transaction;
use crate::types::{Coins, TimeStamp};
use crate::utils;

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum EventKind {
    #[n(0)]
    EarnApproved,
    #[n(1)]
    EarnRejected,
    #[n(2)]
    RedeemProcessed,
    #[n(3)]
    RedeemRejected,
    #[n(4)]
    PaymentSettled,
    #[n(5)]
    WelcomeBonusGranted,
    #[n(6)]
    BalanceAdjusted,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventKind::EarnApproved => "earn_approved",
            EventKind::EarnRejected => "earn_rejected",
            EventKind::RedeemProcessed => "redeem_processed",
            EventKind::RedeemRejected => "redeem_rejected",
            EventKind::PaymentSettled => "payment_settled",
            EventKind::WelcomeBonusGranted => "welcome_bonus_granted",
            EventKind::BalanceAdjusted => "balance_adjusted",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct LedgerEvent {
    #[n(0)]
    pub id: String, // bech32 "evt1..."
    #[n(1)]
    pub user_id: String,
    #[n(2)]
    pub kind: EventKind,
    #[n(3)]
    pub transaction_id: String,
    #[n(4)]
    pub amount: Coins,
    #[n(5)]
    pub notes: Option<String>,
    #[n(6)]
    pub created_at: TimeStamp,
    #[n(7)]
    pub attempts: u32,
}

impl LedgerEvent {
    pub fn for_transaction(kind: EventKind, tx: &Transaction) -> Result<Self, LedgerError> {
        Ok(Self {
            id: utils::new_event_id()?,
            user_id: tx.user_id.clone(),
            kind,
            transaction_id: tx.id.clone(),
            amount: tx.amount,
            notes: tx.admin_notes.clone(),
            created_at: TimeStamp::now(),
            attempts: 0,
        })
    }
}

/// Best-effort delivery of ledger events to users.
pub trait NotificationDispatcher: Send + Sync {
    fn notify(&self, user_id: &str, kind: EventKind, event: &LedgerEvent) -> anyhow::Result<()>;
}

/// Writes each event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDispatcher;

impl NotificationDispatcher for TracingDispatcher {
    fn notify(&self, user_id: &str, kind: EventKind, event: &LedgerEvent) -> anyhow::Result<()> {
        tracing::info!(
            user_id = %user_id,
            event = %kind,
            transaction_id = %event.transaction_id,
            amount = %event.amount,
            "notification"
        );
        Ok(())
    }
}

/// Outcome of one outbox flush.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub delivered: usize,
    pub deferred: usize,
    pub dropped: usize,
}

pub struct OutboxRelay {
    store: LedgerStore,
    dispatcher: Arc<dyn NotificationDispatcher>,
    max_attempts: u32,
}

impl OutboxRelay {
    pub fn new(
        store: LedgerStore,
        dispatcher: Arc<dyn NotificationDispatcher>,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            dispatcher,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Attempt delivery of everything queued.
    pub fn flush(&self) -> Result<FlushReport, LedgerError> {
        self.deliver(|_| true)
    }

    /// Attempt delivery of the events queued for one transaction.
    pub fn flush_transaction(&self, transaction_id: &str) -> Result<FlushReport, LedgerError> {
        self.deliver(|event| event.transaction_id == transaction_id)
    }

    /// Flush the events of a just-committed transaction. Errors are logged
    /// and swallowed; anything left behind goes out with the next [`flush`].
    ///
    /// [`flush`]: OutboxRelay::flush
    pub fn flush_after_commit(&self, transaction_id: &str) {
        if let Err(e) = self.flush_transaction(transaction_id) {
            tracing::warn!(transaction_id = %transaction_id, error = %e, "outbox flush failed");
        }
    }

    fn deliver<F>(&self, wanted: F) -> Result<FlushReport, LedgerError>
    where
        F: Fn(&LedgerEvent) -> bool,
    {
        let mut report = FlushReport::default();

        for (raw, mut event) in self.store.outbox_entries()? {
            if !wanted(&event) || !self.store.claim_event(&event.id, &raw)? {
                continue;
            }
            match self.dispatcher.notify(&event.user_id, event.kind, &event) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    event.attempts += 1;
                    if event.attempts >= self.max_attempts {
                        tracing::error!(
                            event_id = %event.id,
                            user_id = %event.user_id,
                            event = %event.kind,
                            attempts = event.attempts,
                            error = %e,
                            "dropping undeliverable notification"
                        );
                        report.dropped += 1;
                    } else {
                        tracing::warn!(
                            event_id = %event.id,
                            user_id = %event.user_id,
                            event = %event.kind,
                            attempts = event.attempts,
                            error = %e,
                            "notification failed, will retry"
                        );
                        self.store.requeue_event(&event)?;
                        report.deferred += 1;
                    }
                }
            }
        }

        tracing::debug!(
            delivered = report.delivered,
            deferred = report.deferred,
            dropped = report.dropped,
            "outbox flushed"
        );
        Ok(report)
    }
}
