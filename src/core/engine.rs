//! Funding engine
//!
//! This module provides the FundingEngine that wires the ledger store, wallet
//! manager, loan registry and funding coordinator together and routes replay
//! commands to them.
//!
//! The engine enforces no rules of its own; every check lives in the
//! component that owns the record being changed.

use crate::config::EngineConfig;
use crate::core::coordinator::FundingCoordinator;
use crate::core::ledger_store::MemoryLedgerStore;
use crate::core::loan_registry::LoanRegistry;
use crate::core::traits::{Dispatcher, LedgerStore};
use crate::core::wallet::WalletManager;
use crate::types::{Command, FundingError, LedgerEntry, Loan, WalletAccount};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// The assembled funding engine
pub struct FundingEngine {
    store: Arc<dyn LedgerStore>,
    wallets: WalletManager,
    loans: LoanRegistry,
    coordinator: FundingCoordinator,
}

impl FundingEngine {
    /// Create an engine over an existing ledger store
    ///
    /// # Arguments
    ///
    /// * `store` - The ledger store holding wallets, loans and the ledger
    /// * `dispatcher` - Receiver of post-commit funding notifications
    /// * `config` - Retry, retention and currency settings
    pub fn new(
        store: Arc<dyn LedgerStore>,
        dispatcher: Arc<dyn Dispatcher>,
        config: EngineConfig,
    ) -> Self {
        FundingEngine {
            wallets: WalletManager::new(Arc::clone(&store), config.max_attempts),
            loans: LoanRegistry::new(
                Arc::clone(&store),
                config.currency.clone(),
                config.max_attempts,
            ),
            coordinator: FundingCoordinator::new(Arc::clone(&store), dispatcher, config),
            store,
        }
    }

    /// Create an engine on a fresh, non-durable store
    pub fn in_memory(dispatcher: Arc<dyn Dispatcher>, config: EngineConfig) -> Self {
        Self::new(Arc::new(MemoryLedgerStore::new()), dispatcher, config)
    }

    /// Create an engine on a journal-backed store, recovering existing state
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the journal cannot be opened or is corrupt.
    pub fn open(
        journal: &Path,
        sync_on_commit: bool,
        dispatcher: Arc<dyn Dispatcher>,
        config: EngineConfig,
    ) -> Result<Self, FundingError> {
        let store = MemoryLedgerStore::open(journal, sync_on_commit)?;
        Ok(Self::new(Arc::new(store), dispatcher, config))
    }

    /// Run one command against the engine
    ///
    /// # Errors
    ///
    /// Returns whatever error the owning component reports; the engine state
    /// is unchanged by a failed command apart from the ledger entry a rejected
    /// funding attempt leaves behind.
    pub async fn process(&self, command: Command) -> Result<(), FundingError> {
        debug!(command = command.name(), "Processing command");

        match command {
            Command::Open { owner, initial } => self.wallets.open(owner, initial).map(|_| ()),
            Command::Deposit { owner, amount } => self.wallets.deposit(owner, amount).map(|_| ()),
            Command::Request {
                loan,
                borrower,
                amount,
            } => self.loans.request(loan, borrower, amount).map(|_| ()),
            Command::Approve { loan } => self.loans.approve(loan).map(|_| ()),
            Command::Reject { loan } => self.loans.reject(loan).map(|_| ()),
            Command::Default { loan } => self.loans.mark_defaulted(loan).map(|_| ()),
            Command::Fund {
                loan,
                lender,
                amount,
                token,
            } => self
                .coordinator
                .fund_loan(loan, lender, amount, &token)
                .await
                .map(|_| ()),
        }
    }

    pub fn wallets(&self) -> &WalletManager {
        &self.wallets
    }

    pub fn loans(&self) -> &LoanRegistry {
        &self.loans
    }

    pub fn coordinator(&self) -> &FundingCoordinator {
        &self.coordinator
    }

    /// All wallets, sorted by owner
    pub fn accounts(&self) -> Vec<WalletAccount> {
        self.store.get_all_accounts()
    }

    /// All loans, sorted by id
    pub fn all_loans(&self) -> Vec<Loan> {
        self.store.get_all_loans()
    }

    /// The whole ledger, in append order
    pub fn ledger(&self) -> Vec<LedgerEntry> {
        self.store.get_all_entries()
    }
}
