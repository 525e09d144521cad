//! Read-side views of balances and history
use std::sync::Arc;

use crate::config::LedgerConfig;
use crate::error::LedgerError;
use crate::page::{Page, PageRequest};
use crate::store::LedgerStore;
use crate::transaction::Transaction;
use crate::types::{Balance, Coins, TimeStamp};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceSummary {
    pub user_id: String,
    pub balance: Coins,
    pub total_earned: Coins,
    pub total_redeemed: Coins,
    pub pending_earn_count: u64,
    pub pending_redeem_count: u64,
    pub welcome_bonus_granted: bool,
    pub last_updated: TimeStamp,
}

pub struct BalanceProjector {
    store: LedgerStore,
    config: Arc<LedgerConfig>,
}

impl BalanceProjector {
    pub fn new(store: LedgerStore, config: Arc<LedgerConfig>) -> Self {
        Self { store, config }
    }

    /// The user's balance; the zero row is created on first access.
    pub fn balance(&self, user_id: &str) -> Result<Balance, LedgerError> {
        self.store.get_or_create_balance(user_id)
    }

    pub fn balance_summary(&self, user_id: &str) -> Result<BalanceSummary, LedgerError> {
        let balance = self.balance(user_id)?;
        let counters = self.store.counters(user_id)?;

        Ok(BalanceSummary {
            user_id: balance.user_id,
            balance: balance.balance,
            total_earned: balance.total_earned,
            total_redeemed: balance.total_redeemed,
            pending_earn_count: counters.pending_earn,
            pending_redeem_count: counters.pending_redeem,
            welcome_bonus_granted: counters.welcome_bonus.is_some(),
            last_updated: balance.last_updated,
        })
    }

    /// The user's transactions, newest first.
    pub fn transaction_history(
        &self,
        user_id: &str,
        page: usize,
        limit: usize,
    ) -> Result<Page<Transaction>, LedgerError> {
        let request = PageRequest::new(page, limit, self.config.max_page_size);
        let total = self.store.user_transaction_count(user_id)?;
        let items = self
            .store
            .user_transactions(user_id, request.offset(), request.limit)?;

        tracing::debug!(user_id = %user_id, page = request.page, total, "history read");
        Ok(Page::from_window(items, request, total))
    }
}
