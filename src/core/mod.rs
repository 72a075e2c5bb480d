//! Core business logic module
//!
//! This module contains the funding engine components:
//! - `traits` - The storage and dispatch seams
//! - `ledger_store` - Versioned records with an all-or-nothing commit
//! - `journal` - Append-only durability for the ledger store
//! - `wallet` - Wallet provisioning and single-wallet mutations
//! - `loan_registry` - Loan requests and admin transitions
//! - `idempotency` - Deduplication of funding requests
//! - `coordinator` - The funding transaction itself
//! - `dispatcher` - Post-commit notification hooks
//! - `engine` - Wiring and command routing

pub mod coordinator;
pub mod dispatcher;
pub mod engine;
pub mod idempotency;
pub mod journal;
pub mod ledger_store;
pub mod loan_registry;
pub mod traits;
pub mod wallet;

pub use coordinator::FundingCoordinator;
pub use dispatcher::{ChannelDispatcher, DispatchError, FundingEvent, LogDispatcher, NoopDispatcher};
pub use engine::FundingEngine;
pub use idempotency::{IdempotencyGuard, KeyLease, Reservation};
pub use ledger_store::{LedgerTransaction, MemoryLedgerStore};
pub use loan_registry::LoanRegistry;
pub use traits::{Dispatcher, LedgerStore};
pub use wallet::WalletManager;
