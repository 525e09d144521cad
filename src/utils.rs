//! Identifier helpers

use bech32::Bech32m;
use uuid7::uuid7;

/// Human readable prefix for transaction ids.
pub const TRANSACTION_HRP: &str = "tx";
/// Human readable prefix for outbox event ids.
pub const EVENT_HRP: &str = "evt";

// construct a unique time-ordered id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// A fresh transaction id (`tx1...`).
pub fn new_transaction_id() -> Result<String, crate::error::LedgerError> {
    new_uuid_to_bech32(TRANSACTION_HRP).map_err(|e| crate::error::LedgerError::Codec(e.to_string()))
}

/// A fresh outbox event id (`evt1...`).
pub fn new_event_id() -> Result<String, crate::error::LedgerError> {
    new_uuid_to_bech32(EVENT_HRP).map_err(|e| crate::error::LedgerError::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_their_prefix() {
        let tx = new_transaction_id().unwrap();
        let evt = new_event_id().unwrap();

        assert!(tx.starts_with("tx1"));
        assert!(evt.starts_with("evt1"));
    }

    #[test]
    fn ids_are_unique() {
        let a = new_transaction_id().unwrap();
        let b = new_transaction_id().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn empty_hrp_is_rejected() {
        assert!(new_uuid_to_bech32("").is_err());
    }
}
