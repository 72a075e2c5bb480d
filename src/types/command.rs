//! Replay commands
//!
//! A `Command` is one row of a replay file after parsing: a wallet, admin or
//! funding operation to run against the engine.

use super::account::UserId;
use super::loan::LoanId;
use super::money::Amount;

/// One engine operation read from a replay file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Provision a wallet with an opening balance
    Open { owner: UserId, initial: Amount },
    /// Top up an existing (or lazily created) wallet
    Deposit { owner: UserId, amount: Amount },
    /// Borrower requests a loan (created `pending`)
    Request {
        loan: LoanId,
        borrower: UserId,
        amount: Amount,
    },
    /// Admin approves a pending loan
    Approve { loan: LoanId },
    /// Admin rejects a pending loan
    Reject { loan: LoanId },
    /// Mark an approved loan as defaulted
    Default { loan: LoanId },
    /// Lender funds (part of) an approved loan
    Fund {
        loan: LoanId,
        lender: UserId,
        amount: Amount,
        token: String,
    },
}

impl Command {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Command::Open { .. } => "open",
            Command::Deposit { .. } => "deposit",
            Command::Request { .. } => "request",
            Command::Approve { .. } => "approve",
            Command::Reject { .. } => "reject",
            Command::Default { .. } => "default",
            Command::Fund { .. } => "fund",
        }
    }

    pub fn is_fund(&self) -> bool {
        matches!(self, Command::Fund { .. })
    }
}
