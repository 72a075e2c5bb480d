//! Core traits for ledger storage and side-effect dispatch
//!
//! These are the two seams of the engine: the coordinator, wallet manager and
//! loan registry talk to storage only through [`LedgerStore`], and hand
//! post-commit notifications to a [`Dispatcher`].

use async_trait::async_trait;

use super::dispatcher::{DispatchError, FundingEvent};
use super::ledger_store::LedgerTransaction;
use crate::types::{
    FundingError, FundingTransaction, IdempotencyKey, LedgerEntry, Loan, LoanId, TransactionId,
    UserId, WalletAccount,
};

/// Durable storage for wallets, loans and the append-only ledger
///
/// Reads return owned snapshots of single records; a reader sees either the
/// state before or after any commit, never a partial one. All mutation goes
/// through [`LedgerStore::commit`], which applies a whole
/// [`LedgerTransaction`] or nothing.
pub trait LedgerStore: Send + Sync {
    /// Current snapshot of a wallet
    fn get_account(&self, owner: UserId) -> Option<WalletAccount>;

    /// Current snapshot of a loan
    fn get_loan(&self, loan: LoanId) -> Option<Loan>;

    /// Atomically apply every write and append in `transaction`
    ///
    /// Each staged record carries the version it was read at (`0` for a
    /// record that must not exist yet). If any stored version differs, nothing
    /// is applied and `ConcurrentModification` is returned.
    fn commit(&self, transaction: LedgerTransaction) -> Result<(), FundingError>;

    /// Look up one ledger entry
    fn get_entry(&self, id: TransactionId) -> Option<LedgerEntry>;

    /// All ledger entries for a loan, in append order
    fn entries_for_loan(&self, loan: LoanId) -> Vec<LedgerEntry>;

    /// The most recent funding entry recorded under an idempotency key
    fn entry_for_key(&self, key: &IdempotencyKey) -> Option<FundingTransaction>;

    /// All wallets, sorted by owner
    fn get_all_accounts(&self) -> Vec<WalletAccount>;

    /// All loans, sorted by id
    fn get_all_loans(&self) -> Vec<Loan>;

    /// The whole ledger, in append order
    fn get_all_entries(&self) -> Vec<LedgerEntry>;
}

/// Receiver of post-commit funding notifications
///
/// Called at most once per committed funding transaction, outside any lock.
/// Delivery retries, if any, are the implementation's concern.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn notify(&self, event: FundingEvent) -> Result<(), DispatchError>;
}
