//! Loan Funding Engine Library
//! # Overview
//!
//! This library moves money from lender wallets into approved peer-to-peer
//! loans. Every funding call runs as one atomic, optimistic transaction over
//! the lender wallet, the borrower wallet and the loan, guarded by a request
//! token so retries are applied exactly once.
//!
//! # Architecture
//!
//! The system is organized into several key components:
//!
//! - [`types`] - Core data types (amounts, wallets, loans, ledger entries, errors)
//! - [`config`] - Engine tunables
//! - [`cli`] - CLI arguments parsing
//! - [`core`] - Business logic components:
//!   - [`core::ledger_store`] - Versioned records with atomic multi-record commits
//!   - [`core::journal`] - Append-only journal used to recover the store
//!   - [`core::wallet`] - Wallet creation, deposits, debits and credits
//!   - [`core::loan_registry`] - Loan requests and lifecycle transitions
//!   - [`core::idempotency`] - Request token reservations and replay
//!   - [`core::coordinator`] - The funding transaction
//!   - [`core::dispatcher`] - Post-commit funding notifications
//!   - [`core::engine`] - Wiring and command dispatch
//! - [`io`] - CSV command input and report output
//! - [`strategy`] - Sequential and concurrent replay pipelines
//! - [`logging`] - Tracing subscriber setup
//!
//! # Loan Lifecycle
//!
//! ```text
//! pending ──approve──▶ approved ──fully funded──▶ funded
//!    │                    │
//!    └──reject──▶ rejected └──default──▶ defaulted
//! ```
//!
//! Only approved loans accept funding, and a loan is never funded beyond the
//! amount requested.

// Module declarations
pub mod cli;
pub mod config;
pub mod core;
pub mod io;
pub mod logging;
pub mod strategy;
pub mod types;

pub use crate::config::EngineConfig;
pub use crate::core::{FundingCoordinator, FundingEngine, LoanRegistry, MemoryLedgerStore, WalletManager};
pub use io::write_accounts_csv;
pub use types::{
    Amount, Command, FundingError, FundingReceipt, FundingTransaction, LedgerEntry, Loan, LoanId,
    LoanStatus, UserId, WalletAccount,
};
