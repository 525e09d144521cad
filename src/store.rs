//! Sled-backed ledger storage.
//!
//! Every mutation of a transaction's status, a balance, the per-user counters,
//! the payment reference registry and the notification outbox happens inside
//! [`LedgerStore::atomically`], a serializable multi-tree sled transaction.
//! Sled detects conflicting concurrent units and re-runs the closure, so the
//! closure must only read and write through the [`LedgerTx`] it is given.
//!
//! Besides the per-user history index, every transaction has one entry in a
//! status index keyed `status kind time id`, so pending queues, payouts and
//! statistics never decode the full transaction tree.
use std::sync::Arc;

use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};
use sled::{IVec, Transactional, Tree};

use crate::error::LedgerError;
use crate::notify::{EventKind, LedgerEvent};
use crate::transaction::{Transaction, TransactionStatus, TransactionType};
use crate::types::{Balance, Coins, TimeStamp, UserCounters};

pub(crate) type TxResult<T> = ConflictableTransactionResult<T, LedgerError>;

/// Abort the surrounding atomic unit with `error`.
pub(crate) fn abort<T>(error: LedgerError) -> TxResult<T> {
    Err(ConflictableTransactionError::Abort(error))
}

pub(crate) fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>, LedgerError> {
    Ok(minicbor::to_vec(value)?)
}

pub(crate) fn decode<T>(bytes: &[u8]) -> Result<T, LedgerError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    Ok(minicbor::decode(bytes)?)
}

// user_id 0x00 created_at(be) transaction_id
fn index_key(user_id: &str, created_at: TimeStamp, transaction_id: &str) -> Vec<u8> {
    let mut key = index_prefix(user_id);
    key.extend_from_slice(&created_at.sort_key().to_be_bytes());
    key.extend_from_slice(transaction_id.as_bytes());
    key
}

fn index_prefix(user_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(user_id.len() + 1 + 8 + 32);
    key.extend_from_slice(user_id.as_bytes());
    key.push(0);
    key
}

// status kind time(be) transaction_id
fn status_key(entry: &StatusEntry) -> Vec<u8> {
    let mut key = status_prefix(entry.status, Some(entry.kind));
    key.extend_from_slice(&entry.at.sort_key().to_be_bytes());
    key.extend_from_slice(entry.transaction_id.as_bytes());
    key
}

fn status_prefix(status: TransactionStatus, kind: Option<TransactionType>) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + 8 + 32);
    key.push(status.index_tag());
    if let Some(kind) = kind {
        key.push(kind.index_tag());
    }
    key
}

/// What the status index knows about one transaction.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct StatusEntry {
    #[n(0)]
    pub transaction_id: String,
    #[n(1)]
    pub kind: TransactionType,
    #[n(2)]
    pub status: TransactionStatus,
    #[n(3)]
    pub amount: Coins,
    /// Payment time for paid redeems, creation time otherwise
    #[n(4)]
    pub at: TimeStamp,
}

impl StatusEntry {
    fn of(tx: &Transaction) -> Self {
        let at = match tx.status {
            TransactionStatus::Paid => tx.payment_processed_at.unwrap_or(tx.created_at),
            _ => tx.created_at,
        };
        Self {
            transaction_id: tx.id.clone(),
            kind: tx.kind,
            status: tx.status,
            amount: tx.amount,
            at,
        }
    }
}

#[derive(Clone)]
pub struct LedgerStore {
    instance: Arc<sled::Db>,
    transactions: Tree,
    balances: Tree,
    user_index: Tree,
    status_index: Tree,
    counters: Tree,
    payment_refs: Tree,
    outbox: Tree,
}

impl LedgerStore {
    pub fn new(instance: Arc<sled::Db>) -> Result<Self, LedgerError> {
        Ok(Self {
            transactions: instance.open_tree("transactions")?,
            balances: instance.open_tree("balances")?,
            user_index: instance.open_tree("user_index")?,
            status_index: instance.open_tree("status_index")?,
            counters: instance.open_tree("user_counters")?,
            payment_refs: instance.open_tree("payment_refs")?,
            outbox: instance.open_tree("outbox")?,
            instance,
        })
    }

    /// Run `unit` as one serializable transaction over every ledger tree.
    pub(crate) fn atomically<T, F>(&self, unit: F) -> Result<T, LedgerError>
    where
        F: Fn(&LedgerTx<'_>) -> TxResult<T>,
    {
        (
            &self.transactions,
            &self.balances,
            &self.user_index,
            &self.status_index,
            &self.counters,
            &self.payment_refs,
            &self.outbox,
        )
            .transaction(
                |(transactions, balances, user_index, status_index, counters, payment_refs, outbox)| {
                    unit(&LedgerTx {
                        transactions,
                        balances,
                        user_index,
                        status_index,
                        counters,
                        payment_refs,
                        outbox,
                    })
                },
            )
            .map_err(|e| match e {
                TransactionError::Abort(e) => e,
                TransactionError::Storage(e) => LedgerError::Storage(e),
            })
    }

    pub fn flush(&self) -> Result<usize, LedgerError> {
        Ok(self.instance.flush()?)
    }

    pub fn transaction(&self, id: &str) -> Result<Option<Transaction>, LedgerError> {
        self.transactions
            .get(id.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    pub fn require_transaction(&self, id: &str) -> Result<Transaction, LedgerError> {
        self.transaction(id)?
            .ok_or_else(|| LedgerError::NotFound(format!("transaction {id}")))
    }

    pub fn balance(&self, user_id: &str) -> Result<Option<Balance>, LedgerError> {
        self.balances
            .get(user_id.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Read a balance, creating the zero row if none exists. Creation runs as
    /// an atomic unit, so it serializes with concurrent credits and with other
    /// first readers.
    pub fn get_or_create_balance(&self, user_id: &str) -> Result<Balance, LedgerError> {
        if let Some(existing) = self.balance(user_id)? {
            return Ok(existing);
        }
        self.atomically(|ltx| ltx.ensure_balance(user_id))
    }

    pub fn all_balances(&self) -> Result<Vec<Balance>, LedgerError> {
        self.balances
            .iter()
            .values()
            .map(|value| decode(&value?))
            .collect()
    }

    pub fn counters(&self, user_id: &str) -> Result<UserCounters, LedgerError> {
        Ok(self
            .counters
            .get(user_id.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()?
            .unwrap_or_default())
    }

    /// Number of transactions recorded for `user_id`.
    pub fn user_transaction_count(&self, user_id: &str) -> Result<usize, LedgerError> {
        let mut count = 0;
        for entry in self.user_index.scan_prefix(index_prefix(user_id)).keys() {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    /// A window of a user's transactions, newest first.
    pub fn user_transactions(
        &self,
        user_id: &str,
        skip: usize,
        take: usize,
    ) -> Result<Vec<Transaction>, LedgerError> {
        self.user_index
            .scan_prefix(index_prefix(user_id))
            .values()
            .rev()
            .skip(skip)
            .take(take)
            .map(|id| self.require_transaction(&String::from_utf8_lossy(&id?)))
            .collect()
    }

    /// Index entries in `status`, optionally of one `kind`, oldest first.
    pub fn status_entries(
        &self,
        status: TransactionStatus,
        kind: Option<TransactionType>,
    ) -> Result<Vec<StatusEntry>, LedgerError> {
        let mut entries: Vec<StatusEntry> = self
            .status_index
            .scan_prefix(status_prefix(status, kind))
            .values()
            .map(|value| decode(&value?))
            .collect::<Result<_, _>>()?;
        if kind.is_none() {
            // one run per kind; merge them by time
            entries.sort_by(|a, b| {
                a.at.cmp(&b.at)
                    .then_with(|| a.transaction_id.cmp(&b.transaction_id))
            });
        }
        Ok(entries)
    }

    /// Every index entry, grouped by status then kind.
    pub fn all_status_entries(&self) -> Result<Vec<StatusEntry>, LedgerError> {
        self.status_index
            .iter()
            .values()
            .map(|value| decode(&value?))
            .collect()
    }

    /// The transaction that settled with `reference`, if any.
    pub fn payment_reference_owner(&self, reference: &str) -> Result<Option<String>, LedgerError> {
        Ok(self
            .payment_refs
            .get(reference.as_bytes())?
            .map(|id| String::from_utf8_lossy(&id).into_owned()))
    }

    /// Queued notification events in id (creation) order.
    pub fn outbox_events(&self) -> Result<Vec<LedgerEvent>, LedgerError> {
        Ok(self
            .outbox_entries()?
            .into_iter()
            .map(|(_, event)| event)
            .collect())
    }

    /// Queued events with the stored bytes each was decoded from.
    pub fn outbox_entries(&self) -> Result<Vec<(IVec, LedgerEvent)>, LedgerError> {
        self.outbox
            .iter()
            .values()
            .map(|value| -> Result<_, LedgerError> {
                let raw = value?;
                let event: LedgerEvent = decode(&raw)?;
                Ok((raw, event))
            })
            .collect()
    }

    /// Take `event_id` out of the outbox if it still holds `raw`. Exactly one
    /// of several concurrent claimers gets `true`.
    pub fn claim_event(&self, event_id: &str, raw: &IVec) -> Result<bool, LedgerError> {
        let swapped =
            self.outbox
                .compare_and_swap(event_id.as_bytes(), Some(raw), None::<Vec<u8>>)?;
        Ok(swapped.is_ok())
    }

    /// Put a claimed event back for a later attempt.
    pub fn requeue_event(&self, event: &LedgerEvent) -> Result<(), LedgerError> {
        let swapped = self.outbox.compare_and_swap(
            event.id.as_bytes(),
            None::<&[u8]>,
            Some(encode(event)?),
        )?;
        if swapped.is_err() {
            tracing::warn!(event_id = %event.id, "event requeued twice; keeping the first copy");
        }
        Ok(())
    }
}

/// The view of the ledger inside one atomic unit.
pub(crate) struct LedgerTx<'a> {
    transactions: &'a TransactionalTree,
    balances: &'a TransactionalTree,
    user_index: &'a TransactionalTree,
    status_index: &'a TransactionalTree,
    counters: &'a TransactionalTree,
    payment_refs: &'a TransactionalTree,
    outbox: &'a TransactionalTree,
}

impl LedgerTx<'_> {
    pub fn transaction(&self, id: &str) -> TxResult<Transaction> {
        match self.transactions.get(id.as_bytes())? {
            Some(bytes) => decode(&bytes).map_err(ConflictableTransactionError::Abort),
            None => abort(LedgerError::NotFound(format!("transaction {id}"))),
        }
    }

    /// Store `tx` and move its status index entry along with it.
    pub fn put_transaction(&self, tx: &Transaction) -> TxResult<()> {
        let bytes = encode(tx).map_err(ConflictableTransactionError::Abort)?;
        if let Some(previous) = self.transactions.insert(tx.id.as_bytes(), bytes)? {
            let previous: Transaction =
                decode(&previous).map_err(ConflictableTransactionError::Abort)?;
            self.status_index
                .remove(status_key(&StatusEntry::of(&previous)))?;
        }

        let entry = StatusEntry::of(tx);
        let value = encode(&entry).map_err(ConflictableTransactionError::Abort)?;
        self.status_index.insert(status_key(&entry), value)?;
        Ok(())
    }

    /// Store a new transaction and index it under its user.
    pub fn append_transaction(&self, tx: &Transaction) -> TxResult<()> {
        self.put_transaction(tx)?;
        self.user_index.insert(
            index_key(&tx.user_id, tx.created_at, &tx.id),
            tx.id.as_bytes(),
        )?;
        Ok(())
    }

    /// The user's balance, zero-initialised when absent.
    pub fn balance(&self, user_id: &str) -> TxResult<Balance> {
        match self.balances.get(user_id.as_bytes())? {
            Some(bytes) => decode(&bytes).map_err(ConflictableTransactionError::Abort),
            None => Ok(Balance::zero(user_id)),
        }
    }

    /// The stored balance, inserting the zero row when absent.
    pub fn ensure_balance(&self, user_id: &str) -> TxResult<Balance> {
        if let Some(bytes) = self.balances.get(user_id.as_bytes())? {
            return decode(&bytes).map_err(ConflictableTransactionError::Abort);
        }
        let zero = Balance::zero(user_id);
        self.put_balance(&zero)?;
        tracing::debug!(user_id = %user_id, "created zero balance");
        Ok(zero)
    }

    pub fn put_balance(&self, balance: &Balance) -> TxResult<()> {
        debug_assert!(balance.is_consistent(), "inconsistent balance {balance:?}");
        let bytes = encode(balance).map_err(ConflictableTransactionError::Abort)?;
        self.balances.insert(balance.user_id.as_bytes(), bytes)?;
        Ok(())
    }

    pub fn counters(&self, user_id: &str) -> TxResult<UserCounters> {
        match self.counters.get(user_id.as_bytes())? {
            Some(bytes) => decode(&bytes).map_err(ConflictableTransactionError::Abort),
            None => Ok(UserCounters::default()),
        }
    }

    pub fn put_counters(&self, user_id: &str, counters: &UserCounters) -> TxResult<()> {
        let bytes = encode(counters).map_err(ConflictableTransactionError::Abort)?;
        self.counters.insert(user_id.as_bytes(), bytes)?;
        Ok(())
    }

    /// Bind `reference` to `transaction_id`; fails if another transaction holds it.
    pub fn claim_payment_reference(&self, reference: &str, transaction_id: &str) -> TxResult<()> {
        if self.payment_refs.get(reference.as_bytes())?.is_some() {
            return abort(LedgerError::DuplicatePaymentReference(
                reference.to_string(),
            ));
        }
        self.payment_refs
            .insert(reference.as_bytes(), transaction_id.as_bytes())?;
        Ok(())
    }

    /// Queue a notification; it is delivered only if this unit commits.
    pub fn queue_event(&self, event: &LedgerEvent) -> TxResult<()> {
        let bytes = encode(event).map_err(ConflictableTransactionError::Abort)?;
        self.outbox.insert(event.id.as_bytes(), bytes)?;
        Ok(())
    }

    pub fn queue_event_for(&self, kind: EventKind, tx: &Transaction) -> TxResult<()> {
        let event =
            LedgerEvent::for_transaction(kind, tx).map_err(ConflictableTransactionError::Abort)?;
        self.queue_event(&event)
    }
}
