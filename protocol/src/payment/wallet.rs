//! # Wallet
//!
//! A minimal in-memory balance ledger, one balance per currency. Exists
//! so the transfer record can state the sender's balance before and after
//! the debit, and so an overdrawn payment dies at the source instead of
//! on the receiver's screen. Real bookkeeping (history, sync, restore)
//! belongs to the host application behind the persistence boundary.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::error::PaymentError;
use super::messages::Currency;

/// Per-currency balances.
#[derive(Default)]
pub struct Wallet {
    balances: Mutex<HashMap<Currency, u64>>,
}

impl Wallet {
    /// An empty wallet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current balance in `currency`, in smallest units.
    pub fn balance(&self, currency: &Currency) -> u64 {
        self.balances.lock().get(currency).copied().unwrap_or(0)
    }

    /// Add funds.
    pub fn credit(&self, currency: &Currency, amount: u64) {
        let mut balances = self.balances.lock();
        let entry = balances.entry(currency.clone()).or_insert(0);
        *entry = entry.saturating_add(amount);
    }

    /// Remove funds. Returns `(balance_before, balance_after)` for the
    /// transfer record, or [`PaymentError::InsufficientFunds`].
    pub fn debit(&self, currency: &Currency, amount: u64) -> Result<(u64, u64), PaymentError> {
        let mut balances = self.balances.lock();
        let entry = balances.entry(currency.clone()).or_insert(0);
        if *entry < amount {
            return Err(PaymentError::InsufficientFunds {
                required: amount,
                available: *entry,
            });
        }
        let before = *entry;
        *entry -= amount;
        Ok((before, *entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credit_and_debit() {
        let wallet = Wallet::new();
        wallet.credit(&Currency::BRL, 5_000);
        assert_eq!(wallet.balance(&Currency::BRL), 5_000);

        let (before, after) = wallet.debit(&Currency::BRL, 1_200).unwrap();
        assert_eq!((before, after), (5_000, 3_800));
        assert_eq!(wallet.balance(&Currency::BRL), 3_800);
    }

    #[test]
    fn overdraft_is_refused() {
        let wallet = Wallet::new();
        wallet.credit(&Currency::USD, 100);
        let err = wallet.debit(&Currency::USD, 101).unwrap_err();
        assert!(matches!(
            err,
            PaymentError::InsufficientFunds {
                required: 101,
                available: 100
            }
        ));
        // The failed debit touched nothing.
        assert_eq!(wallet.balance(&Currency::USD), 100);
    }

    #[test]
    fn currencies_are_independent() {
        let wallet = Wallet::new();
        wallet.credit(&Currency::BRL, 10);
        assert_eq!(wallet.balance(&Currency::USD), 0);
        assert!(wallet.debit(&Currency::USD, 1).is_err());
    }
}
