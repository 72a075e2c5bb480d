//! Wallet account types
//!
//! A `WalletAccount` is the balance record owned by one user. The methods here
//! are pure balance arithmetic on an in-memory copy; persistence and version
//! checks happen when the copy is committed through the ledger store.

use super::error::FundingError;
use super::money::Amount;
use serde::{Deserialize, Serialize};

/// User identifier
pub type UserId = u64;

/// One user's wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletAccount {
    /// The owning user (one wallet per user)
    pub owner: UserId,

    /// Current balance in minor units, never negative
    pub balance: Amount,

    /// Version of the stored record this copy was read at
    ///
    /// `0` means the wallet has never been persisted. The ledger store bumps
    /// the version on every committed write.
    pub version: u64,
}

impl WalletAccount {
    /// Create an unpersisted wallet with a zero balance
    pub fn new(owner: UserId) -> Self {
        WalletAccount {
            owner,
            balance: Amount::ZERO,
            version: 0,
        }
    }

    /// Create an unpersisted wallet with an opening balance
    pub fn with_balance(owner: UserId, balance: Amount) -> Self {
        WalletAccount {
            owner,
            balance,
            version: 0,
        }
    }

    /// Decrease the balance by `amount` and return the new balance
    ///
    /// # Errors
    ///
    /// - `InvalidAmount` if `amount` is zero
    /// - `InsufficientFunds` if the balance is lower than `amount`
    pub fn debit(&mut self, amount: Amount) -> Result<Amount, FundingError> {
        if amount.is_zero() {
            return Err(FundingError::invalid_amount(amount));
        }

        let new_balance = self.balance.checked_sub(amount).ok_or_else(|| {
            FundingError::insufficient_funds(self.owner, self.balance, amount)
        })?;

        self.balance = new_balance;
        Ok(new_balance)
    }

    /// Increase the balance by `amount` and return the new balance
    ///
    /// # Errors
    ///
    /// - `InvalidAmount` if `amount` is zero
    /// - `ArithmeticOverflow` if the balance would exceed `u64`
    pub fn credit(&mut self, amount: Amount) -> Result<Amount, FundingError> {
        if amount.is_zero() {
            return Err(FundingError::invalid_amount(amount));
        }

        let new_balance = self
            .balance
            .checked_add(amount)
            .ok_or_else(|| FundingError::arithmetic_overflow("credit", self.owner))?;

        self.balance = new_balance;
        Ok(new_balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_wallet_is_empty_and_unpersisted() {
        let wallet = WalletAccount::new(1);

        assert_eq!(wallet.owner, 1);
        assert_eq!(wallet.balance, Amount::ZERO);
        assert_eq!(wallet.version, 0);
    }

    #[test]
    fn test_debit_reduces_balance() {
        let mut wallet = WalletAccount::with_balance(1, Amount::new(150_000));

        assert_eq!(wallet.debit(Amount::new(100_000)), Ok(Amount::new(50_000)));
        assert_eq!(wallet.balance, Amount::new(50_000));
    }

    #[test]
    fn test_debit_entire_balance() {
        let mut wallet = WalletAccount::with_balance(1, Amount::new(10));

        assert_eq!(wallet.debit(Amount::new(10)), Ok(Amount::ZERO));
    }

    #[test]
    fn test_debit_insufficient_funds_leaves_balance() {
        let mut wallet = WalletAccount::with_balance(1, Amount::new(50));

        let result = wallet.debit(Amount::new(51));

        assert_eq!(
            result,
            Err(FundingError::insufficient_funds(1, Amount::new(50), Amount::new(51)))
        );
        assert_eq!(wallet.balance, Amount::new(50));
    }

    #[test]
    fn test_zero_amounts_rejected() {
        let mut wallet = WalletAccount::with_balance(1, Amount::new(50));

        assert_eq!(
            wallet.debit(Amount::ZERO),
            Err(FundingError::invalid_amount(Amount::ZERO))
        );
        assert_eq!(
            wallet.credit(Amount::ZERO),
            Err(FundingError::invalid_amount(Amount::ZERO))
        );
    }

    #[test]
    fn test_credit_overflow() {
        let mut wallet = WalletAccount::with_balance(1, Amount::new(u64::MAX));

        assert_eq!(
            wallet.credit(Amount::new(1)),
            Err(FundingError::arithmetic_overflow("credit", 1))
        );
        assert_eq!(wallet.balance, Amount::new(u64::MAX));
    }
}
