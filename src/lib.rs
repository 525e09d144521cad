//! Coin ledger and transaction approval engine.
//!
//! Users submit earn requests (coins for purchase receipts) and redeem
//! requests (coins for payouts). Admins approve or reject them; approved
//! redeems are later settled against an external payment. Balances change only
//! inside atomic units that also move the transaction's status, and never go
//! below zero.

pub mod approval;
pub mod brand;
pub mod config;
pub mod error;
pub mod notify;
pub mod page;
pub mod payment;
pub mod projection;
pub mod service;
pub mod store;
pub mod transaction;
pub mod types;
pub mod utils;
pub mod validation;

pub use error::{LedgerError, ValidationError, ValidationErrors};
pub use service::CoinLedger;
