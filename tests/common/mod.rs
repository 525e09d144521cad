//! Shared setup for the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use coin_ledger::{
    CoinLedger,
    brand::Brand,
    config::LedgerConfig,
    notify::{EventKind, LedgerEvent, NotificationDispatcher},
    types::Coins,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tempfile::TempDir;

pub const COFFEE: &str = "brand_coffee"; // 10% back, no redemption limits
pub const CLOSED: &str = "brand_closed"; // inactive
pub const CAPPED: &str = "brand_capped"; // 5% back, redeem 10..=200
pub const ADMIN: &str = "admin_1";

pub fn coins(value: Decimal) -> Coins {
    Coins::new(value)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn brands() -> HashMap<String, Brand> {
    let mut brands = HashMap::new();
    brands.insert(COFFEE.to_string(), Brand::new(COFFEE, "Coffee House", dec!(10)));
    brands.insert(
        CLOSED.to_string(),
        Brand::new(CLOSED, "Closed Store", dec!(10)).set_active(false),
    );
    brands.insert(
        CAPPED.to_string(),
        Brand::new(CAPPED, "Capped Mart", dec!(5))
            .set_redemption_range(coins(dec!(10)), Some(coins(dec!(200)))),
    );
    brands
}

/// Records every delivered event; optionally fails every delivery.
#[derive(Default)]
pub struct RecordingDispatcher {
    pub events: Mutex<Vec<(String, EventKind)>>,
    pub fail: Mutex<bool>,
}

impl RecordingDispatcher {
    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().unwrap().iter().map(|(_, k)| *k).collect()
    }
}

impl NotificationDispatcher for RecordingDispatcher {
    fn notify(&self, user_id: &str, kind: EventKind, _: &LedgerEvent) -> anyhow::Result<()> {
        if *self.fail.lock().unwrap() {
            anyhow::bail!("notification channel unavailable");
        }
        self.events.lock().unwrap().push((user_id.to_string(), kind));
        Ok(())
    }
}

pub struct Harness {
    // keeps the database directory alive for the test
    _dir: TempDir,
    pub ledger: CoinLedger,
    pub dispatcher: Arc<RecordingDispatcher>,
}

impl Harness {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_config(LedgerConfig::default())
    }

    pub fn with_config(config: LedgerConfig) -> anyhow::Result<Self> {
        init_tracing();
        // Sled locks its directory, so every test gets its own database.
        let dir = tempfile::tempdir()?;
        let db = Arc::new(sled::open(dir.path().join("ledger.db"))?);
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let ledger = CoinLedger::new(db, config, Arc::new(brands()), dispatcher.clone())?;

        Ok(Self {
            _dir: dir,
            ledger,
            dispatcher,
        })
    }

    /// Credit `amount` through an admin adjustment.
    pub fn fund(&self, user_id: &str, amount: Decimal) -> anyhow::Result<()> {
        self.ledger
            .apply_adjustment(user_id, ADMIN, coins(amount), Some("test funding"))?;
        Ok(())
    }

    /// Every balance satisfies `balance == earned - redeemed >= 0`.
    pub fn assert_invariant(&self) {
        for balance in self.ledger.balances().unwrap() {
            assert!(
                balance.is_consistent(),
                "ledger invariant broken for {balance:?}"
            );
        }
    }
}
