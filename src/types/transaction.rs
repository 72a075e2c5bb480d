//! Ledger entry types
//!
//! The ledger is an append-only log of [`LedgerEntry`] records. Funding
//! attempts are logged as [`FundingTransaction`]s (one per attempt, whatever
//! its outcome) and stand-alone wallet credits/debits as [`WalletEntry`]s, so
//! every balance a wallet ever had can be reconstructed from the log.

use super::account::UserId;
use super::error::FundingError;
use super::loan::{LoanId, LoanStatus};
use super::money::Amount;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Ledger entry identifier
pub type TransactionId = Uuid;

/// Deduplication key for a funding request
///
/// Derived from the loan, lender, amount and the caller's request token, so a
/// client retrying after a network failure maps onto the same key while a
/// different amount under the same token does not.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn derive(loan: LoanId, lender: UserId, amount: Amount, request_token: &str) -> Self {
        // The numeric fields cannot contain '/', so the token may hold anything.
        IdempotencyKey(format!("{}/{}/{}/{}", loan, lender, amount, request_token))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Final outcome of a funding attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Funds moved and the loan was updated
    Committed,
    /// A validation or state check refused the request
    Rejected,
    /// A transient failure (conflict, storage) prevented the commit
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Committed => "committed",
            Outcome::Rejected => "rejected",
            Outcome::Failed => "failed",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit record of one funding attempt
///
/// For committed attempts the balances are the post-transfer balances of both
/// wallets. For rejected or failed attempts they are the balances observed
/// during the attempt (zero for a wallet that does not exist).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingTransaction {
    pub id: TransactionId,
    pub idempotency_key: IdempotencyKey,
    pub loan: LoanId,
    pub lender: UserId,
    /// `None` when the loan could not be found
    pub borrower: Option<UserId>,
    pub amount: Amount,
    pub timestamp: DateTime<Utc>,
    pub lender_balance: Amount,
    pub borrower_balance: Amount,
    /// Loan status after the attempt (`None` when the loan could not be found)
    pub loan_status: Option<LoanStatus>,
    /// Loan funded amount after the attempt
    pub funded_amount: Amount,
    pub outcome: Outcome,
    /// The error that stopped a rejected or failed attempt
    pub error: Option<FundingError>,
}

impl FundingTransaction {
    /// The caller-facing result this entry records
    ///
    /// Used to replay the outcome of an already-processed idempotency key.
    pub fn stored_outcome(&self) -> Result<FundingReceipt, FundingError> {
        if let Some(error) = &self.error {
            return Err(error.clone());
        }

        let (Some(borrower), Some(loan_status)) = (self.borrower, self.loan_status) else {
            return Err(FundingError::Storage {
                message: format!("ledger entry {} is missing loan details", self.id),
            });
        };

        Ok(FundingReceipt {
            transaction_id: self.id,
            loan: self.loan,
            lender: self.lender,
            borrower,
            amount: self.amount,
            lender_balance: self.lender_balance,
            borrower_balance: self.borrower_balance,
            loan_status,
            funded_amount: self.funded_amount,
            replayed: false,
        })
    }
}

/// Direction of a stand-alone wallet mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalletEntryKind {
    Credit,
    Debit,
}

/// Audit record of a wallet credit or debit outside a funding transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletEntry {
    pub id: TransactionId,
    pub owner: UserId,
    pub kind: WalletEntryKind,
    pub amount: Amount,
    /// Balance after the mutation
    pub balance: Amount,
    pub timestamp: DateTime<Utc>,
}

impl WalletEntry {
    pub fn new(owner: UserId, kind: WalletEntryKind, amount: Amount, balance: Amount) -> Self {
        WalletEntry {
            id: Uuid::new_v4(),
            owner,
            kind,
            amount,
            balance,
            timestamp: Utc::now(),
        }
    }
}

/// One immutable record in the append-only ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "lowercase")]
pub enum LedgerEntry {
    Funding(FundingTransaction),
    Wallet(WalletEntry),
}

impl LedgerEntry {
    pub fn id(&self) -> TransactionId {
        match self {
            LedgerEntry::Funding(tx) => tx.id,
            LedgerEntry::Wallet(entry) => entry.id,
        }
    }

    pub fn loan(&self) -> Option<LoanId> {
        match self {
            LedgerEntry::Funding(tx) => Some(tx.loan),
            LedgerEntry::Wallet(_) => None,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            LedgerEntry::Funding(tx) => tx.timestamp,
            LedgerEntry::Wallet(entry) => entry.timestamp,
        }
    }

    pub fn as_funding(&self) -> Option<&FundingTransaction> {
        match self {
            LedgerEntry::Funding(tx) => Some(tx),
            LedgerEntry::Wallet(_) => None,
        }
    }
}

/// Result of a committed funding transaction, returned to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingReceipt {
    /// Ledger entry of the committed transaction
    pub transaction_id: TransactionId,
    pub loan: LoanId,
    pub lender: UserId,
    pub borrower: UserId,
    pub amount: Amount,
    /// Lender balance right after the commit
    pub lender_balance: Amount,
    /// Borrower balance right after the commit
    pub borrower_balance: Amount,
    pub loan_status: LoanStatus,
    pub funded_amount: Amount,
    /// `true` when this receipt was replayed for a duplicate request
    pub replayed: bool,
}
