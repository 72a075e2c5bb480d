//! Loan registry: the admin-facing side of the loan lifecycle
//!
//! Creates pending loans and applies the admin transitions (approve, reject,
//! mark defaulted). Funding transitions are owned by the coordinator and are
//! not exposed here.

use crate::core::ledger_store::LedgerTransaction;
use crate::core::traits::LedgerStore;
use crate::types::{Amount, FundingError, Loan, LoanId, LoanStatus, UserId};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct LoanRegistry {
    store: Arc<dyn LedgerStore>,
    currency: String,
    max_attempts: u32,
}

impl LoanRegistry {
    /// Create a registry whose new loans are denominated in `currency`
    pub fn new(store: Arc<dyn LedgerStore>, currency: impl Into<String>, max_attempts: u32) -> Self {
        LoanRegistry {
            store,
            currency: currency.into(),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Record a borrower's loan request in `pending` status
    ///
    /// # Errors
    ///
    /// - `InvalidAmount` if `amount` is zero
    /// - `LoanAlreadyExists` if `loan` is taken
    pub fn request(
        &self,
        loan: LoanId,
        borrower: UserId,
        amount: Amount,
    ) -> Result<Loan, FundingError> {
        let record = Loan::new(loan, borrower, amount, self.currency.clone())?;

        let mut tx = LedgerTransaction::new();
        tx.put_loan(record.clone());
        match self.store.commit(tx) {
            Ok(()) => {}
            Err(FundingError::ConcurrentModification { .. }) => {
                return Err(FundingError::loan_already_exists(loan));
            }
            Err(e) => return Err(e),
        }

        info!(loan, borrower, requested = %amount, "Loan requested");
        Ok(Loan {
            version: 1,
            ..record
        })
    }

    /// `pending → approved`
    pub fn approve(&self, loan: LoanId) -> Result<Loan, FundingError> {
        self.transition(loan, LoanStatus::Approved, Loan::approve)
    }

    /// `pending → rejected`
    pub fn reject(&self, loan: LoanId) -> Result<Loan, FundingError> {
        self.transition(loan, LoanStatus::Rejected, Loan::reject)
    }

    /// `approved → defaulted`
    pub fn mark_defaulted(&self, loan: LoanId) -> Result<Loan, FundingError> {
        self.transition(loan, LoanStatus::Defaulted, Loan::mark_defaulted)
    }

    pub fn get(&self, loan: LoanId) -> Result<Loan, FundingError> {
        self.store
            .get_loan(loan)
            .ok_or_else(|| FundingError::loan_not_found(loan))
    }

    /// All loans, sorted by id
    pub fn list(&self) -> Vec<Loan> {
        self.store.get_all_loans()
    }

    // Admin transitions race only with funding commits on the same loan, so a
    // version conflict is retried against the fresh record.
    fn transition(
        &self,
        loan: LoanId,
        target: LoanStatus,
        apply: fn(&mut Loan) -> Result<(), FundingError>,
    ) -> Result<Loan, FundingError> {
        for attempt in 1..=self.max_attempts {
            let mut record = self.get(loan)?;
            apply(&mut record)?;

            let mut tx = LedgerTransaction::new();
            tx.put_loan(record.clone());
            match self.store.commit(tx) {
                Ok(()) => {
                    info!(loan, status = %target, "Loan status changed");
                    return Ok(Loan {
                        version: record.version + 1,
                        ..record
                    });
                }
                Err(FundingError::ConcurrentModification { .. }) => {
                    debug!(loan, attempt, "Loan transition hit a version conflict");
                }
                Err(e) => return Err(e),
            }
        }

        warn!(loan, status = %target, "Loan transition gave up after conflicts");
        Err(FundingError::conflict(loan, self.max_attempts))
    }
}
