//! Service layer API for the coin ledger
use std::sync::Arc;

use crate::approval::{ApprovalService, TransactionStats};
use crate::brand::BrandDirectory;
use crate::config::LedgerConfig;
use crate::error::{LedgerError, ValidationError};
use crate::notify::{FlushReport, NotificationDispatcher, OutboxRelay, TracingDispatcher};
use crate::page::Page;
use crate::payment::{DateRange, PaymentSettlement, PaymentSummary};
use crate::projection::{BalanceProjector, BalanceSummary};
use crate::store::LedgerStore;
use crate::transaction::{Transaction, TransactionType};
use crate::types::{Balance, Coins, TimeStamp};
use crate::utils;
use crate::validation::{EarnRequest, RedeemRequest, ValidationEngine};

pub struct CoinLedger {
    store: LedgerStore,
    validation: ValidationEngine,
    approvals: ApprovalService,
    payments: PaymentSettlement,
    projector: BalanceProjector,
    relay: Arc<OutboxRelay>,
}

impl CoinLedger {
    pub fn new(
        instance: Arc<sled::Db>,
        config: LedgerConfig,
        brands: Arc<dyn BrandDirectory>,
        dispatcher: Arc<dyn NotificationDispatcher>,
    ) -> Result<Self, LedgerError> {
        config.validate()?;
        let store = LedgerStore::new(instance)?;
        let config = Arc::new(config);
        let relay = Arc::new(OutboxRelay::new(
            store.clone(),
            dispatcher,
            config.notification_max_attempts,
        ));

        Ok(Self {
            validation: ValidationEngine::new(store.clone(), config.clone(), brands),
            approvals: ApprovalService::new(store.clone(), config.clone(), relay.clone()),
            payments: PaymentSettlement::new(store.clone(), config.clone(), relay.clone()),
            projector: BalanceProjector::new(store.clone(), config),
            relay,
            store,
        })
    }

    /// Default configuration, notifications written to the log.
    pub fn with_defaults(
        instance: Arc<sled::Db>,
        brands: Arc<dyn BrandDirectory>,
    ) -> Result<Self, LedgerError> {
        Self::new(
            instance,
            LedgerConfig::default(),
            brands,
            Arc::new(TracingDispatcher),
        )
    }

    /// Submit a receipt for coins; stored as a pending earn request.
    pub fn submit_earn(
        &self,
        user_id: &str,
        brand_id: &str,
        bill_amount: Coins,
        bill_date: TimeStamp,
        receipt_ref: Option<String>,
    ) -> Result<Transaction, LedgerError> {
        let request = EarnRequest {
            user_id: user_id.to_string(),
            brand_id: brand_id.to_string(),
            bill_amount,
            bill_date,
            receipt_ref,
        };
        self.validation.validate_earn(&request)?;

        let brand = self
            .validation
            .brand(brand_id)
            .ok_or_else(|| LedgerError::NotFound(format!("brand {brand_id}")))?;
        let coins = brand.coins_for_bill(bill_amount).ok_or_else(|| {
            LedgerError::ValidationFailed(ValidationError::AmountTooLarge(bill_amount).into())
        })?;

        let tx = Transaction::earn(
            utils::new_transaction_id()?,
            user_id,
            brand_id,
            coins,
            bill_amount,
            bill_date,
            request.receipt_ref,
        );
        self.approvals.open_pending(tx)
    }

    /// Ask to spend coins against a bill; stored as a pending redeem request.
    pub fn submit_redeem(
        &self,
        user_id: &str,
        brand_id: &str,
        bill_amount: Coins,
        coins_to_redeem: Coins,
    ) -> Result<Transaction, LedgerError> {
        let request = RedeemRequest {
            user_id: user_id.to_string(),
            brand_id: brand_id.to_string(),
            bill_amount,
            coins_to_redeem,
        };
        self.validation.validate_redeem(&request)?;

        let tx = Transaction::redeem(
            utils::new_transaction_id()?,
            user_id,
            brand_id,
            coins_to_redeem,
            bill_amount,
        );
        self.approvals.open_pending(tx)
    }

    pub fn approve_earn(
        &self,
        transaction_id: &str,
        approver_id: &str,
        notes: Option<&str>,
    ) -> Result<Transaction, LedgerError> {
        self.approvals.approve_earn(transaction_id, approver_id, notes)
    }

    pub fn reject_earn(
        &self,
        transaction_id: &str,
        approver_id: &str,
        notes: &str,
    ) -> Result<Transaction, LedgerError> {
        self.approvals.reject_earn(transaction_id, approver_id, notes)
    }

    pub fn approve_redeem(
        &self,
        transaction_id: &str,
        approver_id: &str,
        notes: Option<&str>,
    ) -> Result<Transaction, LedgerError> {
        self.approvals.approve_redeem(transaction_id, approver_id, notes)
    }

    pub fn reject_redeem(
        &self,
        transaction_id: &str,
        approver_id: &str,
        notes: &str,
    ) -> Result<Transaction, LedgerError> {
        self.approvals.reject_redeem(transaction_id, approver_id, notes)
    }

    pub fn process_payment(
        &self,
        transaction_id: &str,
        approver_id: &str,
        payment_reference: &str,
        method: &str,
        amount: Coins,
        notes: Option<&str>,
    ) -> Result<Transaction, LedgerError> {
        self.payments.process_payment(
            transaction_id,
            approver_id,
            payment_reference,
            method,
            amount,
            notes,
        )
    }

    pub fn grant_welcome_bonus(&self, user_id: &str) -> Result<Transaction, LedgerError> {
        self.approvals.grant_welcome_bonus(user_id)
    }

    pub fn apply_adjustment(
        &self,
        user_id: &str,
        approver_id: &str,
        delta: Coins,
        notes: Option<&str>,
    ) -> Result<Transaction, LedgerError> {
        self.approvals
            .apply_adjustment(user_id, approver_id, delta, notes)
    }

    pub fn transaction(&self, transaction_id: &str) -> Result<Transaction, LedgerError> {
        self.store.require_transaction(transaction_id)
    }

    pub fn balance(&self, user_id: &str) -> Result<Balance, LedgerError> {
        self.projector.balance(user_id)
    }

    pub fn balance_summary(&self, user_id: &str) -> Result<BalanceSummary, LedgerError> {
        self.projector.balance_summary(user_id)
    }

    pub fn transaction_history(
        &self,
        user_id: &str,
        page: usize,
        limit: usize,
    ) -> Result<Page<Transaction>, LedgerError> {
        self.projector.transaction_history(user_id, page, limit)
    }

    pub fn pending_transactions(
        &self,
        page: usize,
        limit: usize,
        kind: Option<TransactionType>,
    ) -> Result<Page<Transaction>, LedgerError> {
        self.approvals.pending_transactions(page, limit, kind)
    }

    pub fn transaction_stats(&self) -> Result<TransactionStats, LedgerError> {
        self.approvals.transaction_stats()
    }

    pub fn payment_summary(&self, transaction_id: &str) -> Result<PaymentSummary, LedgerError> {
        self.payments.payment_summary(transaction_id)
    }

    pub fn paid_transactions(
        &self,
        page: usize,
        limit: usize,
        range: Option<DateRange>,
    ) -> Result<Page<PaymentSummary>, LedgerError> {
        self.payments.paid_transactions(page, limit, range)
    }

    /// Retry delivery of notifications still sitting in the outbox.
    pub fn flush_notifications(&self) -> Result<FlushReport, LedgerError> {
        self.relay.flush()
    }

    /// Every balance row; used for audits of the ledger invariant.
    pub fn balances(&self) -> Result<Vec<Balance>, LedgerError> {
        self.store.all_balances()
    }
}
