//! Types module
//!
//! Contains core data structures used throughout the application.
//! This module organizes types into logical submodules:
//! - `money`: Integer minor-unit amounts
//! - `account`: Wallet accounts
//! - `loan`: Loans and the loan lifecycle state machine
//! - `transaction`: Ledger entries, idempotency keys and funding receipts
//! - `command`: Replay commands read by the CLI
//! - `error`: Error types for the funding engine

pub mod account;
pub mod command;
pub mod error;
pub mod loan;
pub mod money;
pub mod transaction;

pub use account::{UserId, WalletAccount};
pub use command::Command;
pub use error::FundingError;
pub use loan::{Loan, LoanId, LoanStatus};
pub use money::Amount;
pub use transaction::{
    FundingReceipt, FundingTransaction, IdempotencyKey, LedgerEntry, Outcome, TransactionId,
    WalletEntry, WalletEntryKind,
};
