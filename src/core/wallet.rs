//! Wallet management module
//!
//! This module provides [`WalletManager`], the entry point for wallet
//! provisioning and stand-alone balance mutations. Each mutation reads the
//! wallet, applies the change to a copy, and commits the copy together with a
//! [`WalletEntry`] so the ledger records the delta and the resulting balance.
//!
//! The WalletManager is responsible for:
//! - Provisioning wallets explicitly (`open`) or lazily (`get_or_create`)
//! - Versioned debits and credits that fail on a stale read
//! - Top-up deposits that retry on version conflicts
//!
//! Cross-wallet transfers are not done here; the funding coordinator stages
//! both wallets and the loan in a single ledger transaction.

use crate::core::ledger_store::{LedgerTransaction, RecordKey};
use crate::core::traits::LedgerStore;
use crate::types::{
    Amount, FundingError, LedgerEntry, UserId, WalletAccount, WalletEntry, WalletEntryKind,
};
use std::sync::Arc;
use tracing::{debug, info};

/// Provisions wallets and applies single-wallet mutations
pub struct WalletManager {
    /// Shared ledger store
    store: Arc<dyn LedgerStore>,
    /// Attempts `deposit` makes before giving up on version conflicts
    max_attempts: u32,
}

impl WalletManager {
    /// Create a WalletManager over `store`
    ///
    /// # Arguments
    ///
    /// * `store` - The ledger store holding the wallets
    /// * `max_attempts` - Attempts `deposit` makes on version conflicts
    pub fn new(store: Arc<dyn LedgerStore>, max_attempts: u32) -> Self {
        WalletManager {
            store,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Provision a wallet with an opening balance
    ///
    /// A non-zero opening balance is recorded as a credit entry in the ledger.
    ///
    /// # Arguments
    ///
    /// * `owner` - The user the wallet belongs to
    /// * `initial` - The opening balance in minor units (may be zero)
    ///
    /// # Returns
    ///
    /// The stored wallet
    ///
    /// # Errors
    ///
    /// Returns `AccountAlreadyExists` if the user already has a wallet.
    pub fn open(&self, owner: UserId, initial: Amount) -> Result<WalletAccount, FundingError> {
        let wallet = WalletAccount::with_balance(owner, initial);

        let mut tx = LedgerTransaction::new();
        tx.put_account(wallet.clone());
        if !initial.is_zero() {
            tx.append(LedgerEntry::Wallet(WalletEntry::new(
                owner,
                WalletEntryKind::Credit,
                initial,
                initial,
            )));
        }

        match self.store.commit(tx) {
            Ok(()) => {}
            Err(FundingError::ConcurrentModification { .. }) => {
                return Err(FundingError::account_already_exists(owner));
            }
            Err(e) => return Err(e),
        }

        info!(owner, balance = %initial, "Wallet opened");
        Ok(WalletAccount {
            version: 1,
            ..wallet
        })
    }

    /// Get the current state of a wallet
    ///
    /// # Errors
    ///
    /// Returns `AccountNotFound` if the user has no wallet.
    pub fn get(&self, owner: UserId) -> Result<WalletAccount, FundingError> {
        self.store
            .get_account(owner)
            .ok_or_else(|| FundingError::account_not_found(owner))
    }

    /// Get a wallet, provisioning an empty one if the user has none
    ///
    /// Safe to call concurrently for the same user: exactly one call inserts
    /// the wallet and the others read it back.
    pub fn get_or_create(&self, owner: UserId) -> Result<WalletAccount, FundingError> {
        if let Some(wallet) = self.store.get_account(owner) {
            return Ok(wallet);
        }

        let mut tx = LedgerTransaction::new();
        tx.put_account(WalletAccount::new(owner));
        match self.store.commit(tx) {
            Ok(()) => debug!(owner, "Wallet created lazily"),
            Err(FundingError::ConcurrentModification { .. }) => {}
            Err(e) => return Err(e),
        }

        self.get(owner)
    }

    /// Debit a wallet read at `expected_version`
    ///
    /// # Arguments
    ///
    /// * `owner` - The wallet to debit
    /// * `amount` - The amount to remove, in minor units
    /// * `expected_version` - The version the caller read the wallet at
    ///
    /// # Returns
    ///
    /// The balance after the debit
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The wallet does not exist (`AccountNotFound`)
    /// - `amount` is zero (`InvalidAmount`)
    /// - The balance is lower than `amount` (`InsufficientFunds`)
    /// - The wallet changed since `expected_version` (`ConcurrentModification`)
    pub fn debit(
        &self,
        owner: UserId,
        amount: Amount,
        expected_version: u64,
    ) -> Result<Amount, FundingError> {
        self.mutate(owner, amount, expected_version, WalletEntryKind::Debit)
    }

    /// Credit a wallet read at `expected_version`
    ///
    /// # Returns
    ///
    /// The balance after the credit
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The wallet does not exist (`AccountNotFound`)
    /// - `amount` is zero (`InvalidAmount`)
    /// - The balance would overflow (`ArithmeticOverflow`)
    /// - The wallet changed since `expected_version` (`ConcurrentModification`)
    pub fn credit(
        &self,
        owner: UserId,
        amount: Amount,
        expected_version: u64,
    ) -> Result<Amount, FundingError> {
        self.mutate(owner, amount, expected_version, WalletEntryKind::Credit)
    }

    /// Top up a wallet, creating it if needed
    ///
    /// Reads the current version itself and retries on version conflicts up
    /// to the configured number of attempts.
    ///
    /// # Returns
    ///
    /// The balance after the deposit
    pub fn deposit(&self, owner: UserId, amount: Amount) -> Result<Amount, FundingError> {
        if amount.is_zero() {
            return Err(FundingError::invalid_amount(amount));
        }

        let mut last_conflict = None;
        for attempt in 1..=self.max_attempts {
            let mut wallet = self
                .store
                .get_account(owner)
                .unwrap_or_else(|| WalletAccount::new(owner));
            let balance = wallet.credit(amount)?;

            let mut tx = LedgerTransaction::new();
            tx.put_account(wallet).append(LedgerEntry::Wallet(WalletEntry::new(
                owner,
                WalletEntryKind::Credit,
                amount,
                balance,
            )));

            match self.store.commit(tx) {
                Ok(()) => {
                    info!(owner, amount = %amount, balance = %balance, "Deposit committed");
                    return Ok(balance);
                }
                Err(e @ FundingError::ConcurrentModification { .. }) => {
                    debug!(owner, attempt, "Deposit hit a version conflict");
                    last_conflict = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_conflict
            .unwrap_or_else(|| FundingError::concurrent_modification(RecordKey::Account(owner))))
    }

    fn mutate(
        &self,
        owner: UserId,
        amount: Amount,
        expected_version: u64,
        kind: WalletEntryKind,
    ) -> Result<Amount, FundingError> {
        let mut wallet = self.get(owner)?;
        if wallet.version != expected_version {
            return Err(FundingError::concurrent_modification(RecordKey::Account(
                owner,
            )));
        }

        let balance = match kind {
            WalletEntryKind::Debit => wallet.debit(amount)?,
            WalletEntryKind::Credit => wallet.credit(amount)?,
        };

        let mut tx = LedgerTransaction::new();
        tx.put_account(wallet)
            .append(LedgerEntry::Wallet(WalletEntry::new(
                owner, kind, amount, balance,
            )));
        self.store.commit(tx)?;

        debug!(owner, ?kind, amount = %amount, balance = %balance, "Wallet mutated");
        Ok(balance)
    }
}
