//! Ledger store: versioned records with an all-or-nothing commit boundary
//!
//! This module provides [`MemoryLedgerStore`], the [`LedgerStore`]
//! implementation the engine runs on, and [`LedgerTransaction`], the unit of
//! work callers stage writes into.
//!
//! # Design
//!
//! Each wallet and loan lives in its own cell (`Arc<RwLock<Option<T>>>`)
//! inside a `DashMap` keyed by id. A commit:
//!
//! 1. resolves the cells of every staged record (creating empty cells for
//!    records that do not exist yet),
//! 2. write-locks the cells in [`RecordKey`] order, so two commits touching
//!    overlapping records can never deadlock,
//! 3. compares each stored version with the version the caller read,
//! 4. writes the journal line (if journaling is enabled),
//! 5. installs the new records with bumped versions and appends the ledger
//!    entries, then releases the locks.
//!
//! A version mismatch at step 3 aborts before anything is written. Cells are
//! never locked across an await point, and commits on disjoint records share
//! no lock. The optional journal serializes its own file appends.
//!
//! The ledger log itself is a `DashMap` of entries stamped with a global
//! sequence number, plus secondary indexes by loan id and idempotency key.

use crate::core::journal::{Journal, JournalRecord};
use crate::core::traits::LedgerStore;
use crate::types::{
    FundingError, FundingTransaction, IdempotencyKey, LedgerEntry, Loan, LoanId, TransactionId,
    UserId, WalletAccount,
};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};
use tracing::{debug, info};

type Cell<T> = Arc<RwLock<Option<T>>>;

/// Identity of a lockable record, ordered to give a global lock order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecordKey {
    Account(UserId),
    Loan(LoanId),
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Account(owner) => write!(f, "account {}", owner),
            RecordKey::Loan(loan) => write!(f, "loan {}", loan),
        }
    }
}

/// A group of record writes and ledger appends committed together
///
/// Records are staged with the version they were read at. A record with
/// version `0` is an insert and requires that no record with its key exists.
#[derive(Debug, Default)]
pub struct LedgerTransaction {
    accounts: Vec<WalletAccount>,
    loans: Vec<Loan>,
    entries: Vec<LedgerEntry>,
}

impl LedgerTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a wallet write
    pub fn put_account(&mut self, account: WalletAccount) -> &mut Self {
        self.accounts.push(account);
        self
    }

    /// Stage a loan write
    pub fn put_loan(&mut self, loan: Loan) -> &mut Self {
        self.loans.push(loan);
        self
    }

    /// Stage a ledger append
    pub fn append(&mut self, entry: LedgerEntry) -> &mut Self {
        self.entries.push(entry);
        self
    }

    /// Number of staged wallet and loan writes
    pub fn record_count(&self) -> usize {
        self.accounts.len() + self.loans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.record_count() == 0 && self.entries.is_empty()
    }
}

enum StagedWrite {
    Account(Cell<WalletAccount>, WalletAccount),
    Loan(Cell<Loan>, Loan),
}

impl StagedWrite {
    fn lock(&self) -> LockedWrite<'_> {
        match self {
            StagedWrite::Account(cell, account) => LockedWrite::Account(write_lock(cell), account),
            StagedWrite::Loan(cell, loan) => LockedWrite::Loan(write_lock(cell), loan),
        }
    }
}

enum LockedWrite<'a> {
    Account(RwLockWriteGuard<'a, Option<WalletAccount>>, &'a WalletAccount),
    Loan(RwLockWriteGuard<'a, Option<Loan>>, &'a Loan),
}

impl LockedWrite<'_> {
    fn check_version(&self) -> Result<(), FundingError> {
        let (key, stored, expected) = match self {
            LockedWrite::Account(current, staged) => (
                RecordKey::Account(staged.owner),
                current.as_ref().map_or(0, |a| a.version),
                staged.version,
            ),
            LockedWrite::Loan(current, staged) => (
                RecordKey::Loan(staged.id),
                current.as_ref().map_or(0, |l| l.version),
                staged.version,
            ),
        };

        if stored != expected {
            debug!(record = %key, stored, expected, "Version check failed");
            return Err(FundingError::concurrent_modification(key));
        }
        Ok(())
    }

    fn stage_into(&self, record: &mut JournalRecord) {
        match self {
            LockedWrite::Account(_, staged) => record.accounts.push(WalletAccount {
                version: staged.version + 1,
                ..(*staged).clone()
            }),
            LockedWrite::Loan(_, staged) => record.loans.push(Loan {
                version: staged.version + 1,
                ..(*staged).clone()
            }),
        }
    }

    fn apply(&mut self) {
        match self {
            LockedWrite::Account(current, staged) => {
                **current = Some(WalletAccount {
                    version: staged.version + 1,
                    ..(*staged).clone()
                });
            }
            LockedWrite::Loan(current, staged) => {
                **current = Some(Loan {
                    version: staged.version + 1,
                    ..(*staged).clone()
                });
            }
        }
    }
}

fn write_lock<T>(cell: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    cell.write().unwrap_or_else(PoisonError::into_inner)
}

fn read_cell<T: Clone>(cell: &RwLock<Option<T>>) -> Option<T> {
    cell.read().unwrap_or_else(PoisonError::into_inner).clone()
}

#[derive(Debug)]
struct SequencedEntry {
    seq: u64,
    entry: LedgerEntry,
}

/// In-memory ledger store with optional journal-backed durability
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    accounts: DashMap<UserId, Cell<WalletAccount>>,
    loans: DashMap<LoanId, Cell<Loan>>,
    log: DashMap<TransactionId, SequencedEntry>,
    by_loan: DashMap<LoanId, Vec<TransactionId>>,
    by_key: DashMap<IdempotencyKey, TransactionId>,
    next_seq: AtomicU64,
    journal: Option<Journal>,
}

impl MemoryLedgerStore {
    /// Create an empty, non-durable store
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a durable store backed by the journal at `path`
    ///
    /// Existing journal records are replayed to rebuild wallets, loans and the
    /// ledger before the store is returned.
    pub fn open(path: &Path, sync_on_commit: bool) -> Result<Self, FundingError> {
        let (journal, records) = Journal::open(path, sync_on_commit)?;
        let replayed = records.len();

        let mut store = Self::new();
        for record in records {
            store.replay(record);
        }
        store.journal = Some(journal);

        info!(
            path = %path.display(),
            commits = replayed,
            accounts = store.accounts.len(),
            loans = store.loans.len(),
            entries = store.log.len(),
            "Ledger store recovered from journal"
        );

        Ok(store)
    }

    fn replay(&self, record: JournalRecord) {
        for account in record.accounts {
            let cell = self.account_cell(account.owner);
            *write_lock(&cell) = Some(account);
        }
        for loan in record.loans {
            let cell = self.loan_cell(loan.id);
            *write_lock(&cell) = Some(loan);
        }
        for entry in record.entries {
            self.index_entry(entry);
        }
    }

    fn account_cell(&self, owner: UserId) -> Cell<WalletAccount> {
        Arc::clone(
            self.accounts
                .entry(owner)
                .or_insert_with(|| Arc::new(RwLock::new(None)))
                .value(),
        )
    }

    fn loan_cell(&self, loan: LoanId) -> Cell<Loan> {
        Arc::clone(
            self.loans
                .entry(loan)
                .or_insert_with(|| Arc::new(RwLock::new(None)))
                .value(),
        )
    }

    fn index_entry(&self, entry: LedgerEntry) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let id = entry.id();

        if let Some(loan) = entry.loan() {
            self.by_loan.entry(loan).or_insert_with(Vec::new).push(id);
        }
        if let LedgerEntry::Funding(tx) = &entry {
            self.by_key.insert(tx.idempotency_key.clone(), id);
        }

        self.log.insert(id, SequencedEntry { seq, entry });
    }

    fn sorted_entries(&self, ids: &[TransactionId]) -> Vec<LedgerEntry> {
        let mut entries: Vec<(u64, LedgerEntry)> = ids
            .iter()
            .filter_map(|id| self.log.get(id).map(|e| (e.seq, e.entry.clone())))
            .collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, entry)| entry).collect()
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn get_account(&self, owner: UserId) -> Option<WalletAccount> {
        let cell = Arc::clone(self.accounts.get(&owner)?.value());
        read_cell(&cell)
    }

    fn get_loan(&self, loan: LoanId) -> Option<Loan> {
        let cell = Arc::clone(self.loans.get(&loan)?.value());
        read_cell(&cell)
    }

    fn commit(&self, transaction: LedgerTransaction) -> Result<(), FundingError> {
        let LedgerTransaction {
            accounts,
            loans,
            entries,
        } = transaction;

        // BTreeMap iteration order is the lock order.
        let mut staged: BTreeMap<RecordKey, StagedWrite> = BTreeMap::new();
        for account in accounts {
            let key = RecordKey::Account(account.owner);
            let cell = self.account_cell(account.owner);
            if staged
                .insert(key, StagedWrite::Account(cell, account))
                .is_some()
            {
                return Err(FundingError::Storage {
                    message: format!("{} staged twice in one transaction", key),
                });
            }
        }
        for loan in loans {
            let key = RecordKey::Loan(loan.id);
            let cell = self.loan_cell(loan.id);
            if staged.insert(key, StagedWrite::Loan(cell, loan)).is_some() {
                return Err(FundingError::Storage {
                    message: format!("{} staged twice in one transaction", key),
                });
            }
        }

        let mut locked: Vec<LockedWrite<'_>> = staged.values().map(StagedWrite::lock).collect();

        let mut record = JournalRecord::default();
        for write in &locked {
            write.check_version()?;
            write.stage_into(&mut record);
        }
        record.entries = entries;

        if let Some(journal) = &self.journal {
            journal.append(&record)?;
        }

        for write in &mut locked {
            write.apply();
        }
        for entry in record.entries {
            self.index_entry(entry);
        }

        Ok(())
    }

    fn get_entry(&self, id: TransactionId) -> Option<LedgerEntry> {
        self.log.get(&id).map(|e| e.entry.clone())
    }

    fn entries_for_loan(&self, loan: LoanId) -> Vec<LedgerEntry> {
        let ids = match self.by_loan.get(&loan) {
            Some(ids) => ids.value().clone(),
            None => return Vec::new(),
        };
        self.sorted_entries(&ids)
    }

    fn entry_for_key(&self, key: &IdempotencyKey) -> Option<FundingTransaction> {
        let id = *self.by_key.get(key)?.value();
        match self.log.get(&id)?.entry {
            LedgerEntry::Funding(ref tx) => Some(tx.clone()),
            LedgerEntry::Wallet(_) => None,
        }
    }

    fn get_all_accounts(&self) -> Vec<WalletAccount> {
        let cells: Vec<Cell<WalletAccount>> =
            self.accounts.iter().map(|e| Arc::clone(e.value())).collect();
        let mut accounts: Vec<WalletAccount> =
            cells.iter().filter_map(|cell| read_cell(cell)).collect();
        accounts.sort_by_key(|a| a.owner);
        accounts
    }

    fn get_all_loans(&self) -> Vec<Loan> {
        let cells: Vec<Cell<Loan>> = self.loans.iter().map(|e| Arc::clone(e.value())).collect();
        let mut loans: Vec<Loan> = cells.iter().filter_map(|cell| read_cell(cell)).collect();
        loans.sort_by_key(|l| l.id);
        loans
    }

    fn get_all_entries(&self) -> Vec<LedgerEntry> {
        let ids: Vec<TransactionId> = self.log.iter().map(|e| *e.key()).collect();
        self.sorted_entries(&ids)
    }
}
