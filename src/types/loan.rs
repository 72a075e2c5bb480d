//! Loan record and lifecycle state machine
//!
//! ```text
//! pending ──approve──▶ approved ──fund (fully)──▶ funded
//!    │                    │
//!    └──reject──▶ rejected └──mark_defaulted──▶ defaulted
//! ```
//!
//! Every status change goes through [`Loan::transition`], which checks the
//! table in [`LoanStatus::can_transition_to`]. Callers never assign `status`
//! directly; a disallowed change returns `InvalidTransition` and leaves the
//! loan untouched, which aborts whatever ledger transaction it was part of.

use super::account::UserId;
use super::error::FundingError;
use super::money::Amount;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Loan identifier
pub type LoanId = u64;

/// Lifecycle status of a loan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoanStatus {
    /// Requested by the borrower, awaiting admin review
    Pending,
    /// Approved by an admin and open for funding
    Approved,
    /// Fully funded. Terminal.
    Funded,
    /// Rejected by an admin. Terminal.
    Rejected,
    /// Borrower defaulted. Terminal.
    Defaulted,
}

impl LoanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoanStatus::Pending => "pending",
            LoanStatus::Approved => "approved",
            LoanStatus::Funded => "funded",
            LoanStatus::Rejected => "rejected",
            LoanStatus::Defaulted => "defaulted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LoanStatus::Funded | LoanStatus::Rejected | LoanStatus::Defaulted
        )
    }

    /// The complete set of legal status changes
    pub fn can_transition_to(&self, next: LoanStatus) -> bool {
        matches!(
            (self, next),
            (LoanStatus::Pending, LoanStatus::Approved)
                | (LoanStatus::Pending, LoanStatus::Rejected)
                | (LoanStatus::Approved, LoanStatus::Funded)
                | (LoanStatus::Approved, LoanStatus::Defaulted)
        )
    }
}

impl fmt::Display for LoanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A borrower's loan request and its funding progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loan {
    pub id: LoanId,
    pub borrower: UserId,
    /// Amount the borrower asked for, always positive
    pub requested: Amount,
    /// Sum of committed funding so far, never above `requested`
    pub funded: Amount,
    /// ISO currency code the amounts are denominated in
    pub currency: String,
    pub status: LoanStatus,
    /// Version of the stored record this copy was read at (`0` = unpersisted)
    pub version: u64,
}

impl Loan {
    /// Create a pending loan
    ///
    /// # Errors
    ///
    /// `InvalidAmount` if `requested` is zero.
    pub fn new(
        id: LoanId,
        borrower: UserId,
        requested: Amount,
        currency: impl Into<String>,
    ) -> Result<Self, FundingError> {
        if requested.is_zero() {
            return Err(FundingError::invalid_amount(requested));
        }

        Ok(Loan {
            id,
            borrower,
            requested,
            funded: Amount::ZERO,
            currency: currency.into(),
            status: LoanStatus::Pending,
            version: 0,
        })
    }

    /// Amount still needed before the loan is fully funded
    pub fn remaining(&self) -> Amount {
        self.requested.saturating_sub(self.funded)
    }

    fn transition(&mut self, next: LoanStatus) -> Result<(), FundingError> {
        if !self.status.can_transition_to(next) {
            return Err(FundingError::invalid_transition(
                self.id,
                self.status,
                format!("cannot move from {} to {}", self.status, next),
            ));
        }
        self.status = next;
        Ok(())
    }

    /// Admin approval: `pending → approved`
    pub fn approve(&mut self) -> Result<(), FundingError> {
        if self.requested.is_zero() {
            return Err(FundingError::invalid_transition(
                self.id,
                self.status,
                "requested amount must be positive to approve",
            ));
        }
        self.transition(LoanStatus::Approved)
    }

    /// Admin rejection: `pending → rejected`
    pub fn reject(&mut self) -> Result<(), FundingError> {
        self.transition(LoanStatus::Rejected)
    }

    /// `approved → defaulted`
    pub fn mark_defaulted(&mut self) -> Result<(), FundingError> {
        self.transition(LoanStatus::Defaulted)
    }

    /// Record `amount` of committed funding and return the resulting status
    ///
    /// The loan must be `approved` and `amount` must fit in what remains. The
    /// loan moves to `funded` exactly when the funded total reaches the
    /// requested amount; partial funding leaves it `approved`. On error the
    /// loan is unchanged.
    pub fn apply_funding(&mut self, amount: Amount) -> Result<LoanStatus, FundingError> {
        if self.status != LoanStatus::Approved {
            return Err(FundingError::invalid_transition(
                self.id,
                self.status,
                "loan is not open for funding",
            ));
        }

        if amount.is_zero() {
            return Err(FundingError::invalid_amount(amount));
        }

        let remaining = self.remaining();
        if amount > remaining {
            return Err(FundingError::invalid_transition(
                self.id,
                self.status,
                format!("funding {} exceeds remaining {}", amount, remaining),
            ));
        }

        let funded = self.funded.checked_add(amount).ok_or_else(|| {
            FundingError::invalid_transition(self.id, self.status, "funded amount overflow")
        })?;

        if funded == self.requested {
            self.transition(LoanStatus::Funded)?;
        }
        self.funded = funded;

        Ok(self.status)
    }
}
