//! Error types for the loan funding engine
//!
//! Every failure a caller can observe from the wallet, loan registry or funding
//! coordinator is a variant of [`FundingError`]. Variants carry the ids and the
//! state (balances, loan status) that triggered them so a request layer can
//! relay a structured response.
//!
//! # Error Categories
//!
//! - **Validation errors**: `InvalidAmount`, `AccountNotFound`, `LoanNotFound`,
//!   `InsufficientFunds`, `InvalidTransition`, `AccountAlreadyExists`,
//!   `LoanAlreadyExists`, `ArithmeticOverflow`. Deterministic; never retried.
//! - **Transient errors**: `ConcurrentModification` (retried internally),
//!   `Conflict` (retry budget exhausted), `Cancelled`, `Storage`.
//!
//! The type is `Clone + PartialEq` and serializable because funding outcomes,
//! including failures, are stored by the idempotency guard and in the ledger.

use super::loan::{LoanId, LoanStatus};
use super::money::Amount;
use super::account::UserId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the funding engine
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum FundingError {
    /// Amount is not a positive number of minor units
    #[error("Invalid amount {amount}: must be a positive number of minor units")]
    InvalidAmount {
        /// The rejected amount
        amount: Amount,
    },

    /// No wallet exists for the user
    #[error("Account {owner} not found")]
    AccountNotFound {
        /// Wallet owner
        owner: UserId,
    },

    /// Explicit provisioning of a wallet that already exists
    #[error("Account {owner} already exists")]
    AccountAlreadyExists {
        /// Wallet owner
        owner: UserId,
    },

    /// No loan exists with the given id
    #[error("Loan {loan} not found")]
    LoanNotFound {
        /// Loan id
        loan: LoanId,
    },

    /// A loan with the given id was already requested
    #[error("Loan {loan} already exists")]
    LoanAlreadyExists {
        /// Loan id
        loan: LoanId,
    },

    /// Debit would take the balance below zero
    #[error("Insufficient funds for account {owner}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        /// Wallet owner
        owner: UserId,
        /// Balance at the time of the check
        balance: Amount,
        /// Requested debit
        requested: Amount,
    },

    /// The loan is not in a state that permits the operation, or the
    /// operation would over-fund it
    #[error("Invalid transition for loan {loan} in status {status}: {reason}")]
    InvalidTransition {
        /// Loan id
        loan: LoanId,
        /// Status at the time of the attempt
        status: LoanStatus,
        /// What was attempted and why it is not allowed
        reason: String,
    },

    /// A balance or funded amount would exceed `u64`
    #[error("Arithmetic overflow in {operation} for account {owner}")]
    ArithmeticOverflow {
        /// Operation that would overflow
        operation: String,
        /// Wallet owner
        owner: UserId,
    },

    /// A record changed between read and commit
    ///
    /// Transient: the funding coordinator retries against fresh state.
    #[error("Concurrent modification of {record}")]
    ConcurrentModification {
        /// The contended record, e.g. `account 7` or `loan 3`
        record: String,
    },

    /// Concurrent modifications persisted past the retry budget
    #[error("Conflict funding loan {loan}: gave up after {attempts} attempts")]
    Conflict {
        /// Loan id
        loan: LoanId,
        /// Attempts made
        attempts: u32,
    },

    /// The caller cancelled before the transaction committed
    #[error("Funding of loan {loan} cancelled before commit")]
    Cancelled {
        /// Loan id
        loan: LoanId,
    },

    /// The durable journal could not be read or written
    #[error("Storage error: {message}")]
    Storage {
        /// Description of the storage failure
        message: String,
    },
}

impl From<std::io::Error> for FundingError {
    fn from(error: std::io::Error) -> Self {
        FundingError::Storage {
            message: error.to_string(),
        }
    }
}

impl From<serde_json::Error> for FundingError {
    fn from(error: serde_json::Error) -> Self {
        FundingError::Storage {
            message: error.to_string(),
        }
    }
}

// Helper functions for creating common errors

impl FundingError {
    /// Create an InvalidAmount error
    pub fn invalid_amount(amount: Amount) -> Self {
        FundingError::InvalidAmount { amount }
    }

    /// Create an AccountNotFound error
    pub fn account_not_found(owner: UserId) -> Self {
        FundingError::AccountNotFound { owner }
    }

    /// Create an AccountAlreadyExists error
    pub fn account_already_exists(owner: UserId) -> Self {
        FundingError::AccountAlreadyExists { owner }
    }

    /// Create a LoanNotFound error
    pub fn loan_not_found(loan: LoanId) -> Self {
        FundingError::LoanNotFound { loan }
    }

    /// Create a LoanAlreadyExists error
    pub fn loan_already_exists(loan: LoanId) -> Self {
        FundingError::LoanAlreadyExists { loan }
    }

    /// Create an InsufficientFunds error
    pub fn insufficient_funds(owner: UserId, balance: Amount, requested: Amount) -> Self {
        FundingError::InsufficientFunds {
            owner,
            balance,
            requested,
        }
    }

    /// Create an InvalidTransition error
    pub fn invalid_transition(loan: LoanId, status: LoanStatus, reason: impl Into<String>) -> Self {
        FundingError::InvalidTransition {
            loan,
            status,
            reason: reason.into(),
        }
    }

    /// Create an ArithmeticOverflow error
    pub fn arithmetic_overflow(operation: &str, owner: UserId) -> Self {
        FundingError::ArithmeticOverflow {
            operation: operation.to_string(),
            owner,
        }
    }

    /// Create a ConcurrentModification error
    pub fn concurrent_modification(record: impl ToString) -> Self {
        FundingError::ConcurrentModification {
            record: record.to_string(),
        }
    }

    /// Create a Conflict error
    pub fn conflict(loan: LoanId, attempts: u32) -> Self {
        FundingError::Conflict { loan, attempts }
    }

    /// Create a Cancelled error
    pub fn cancelled(loan: LoanId) -> Self {
        FundingError::Cancelled { loan }
    }

    /// Whether a later attempt with the same inputs could succeed
    ///
    /// Transient failures release their idempotency key instead of consuming it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FundingError::ConcurrentModification { .. }
                | FundingError::Conflict { .. }
                | FundingError::Cancelled { .. }
                | FundingError::Storage { .. }
        )
    }
}
