//! Funding transaction coordinator
//!
//! The coordinator owns the single mutation path that moves money from a
//! lender to a borrower and advances the loan: one [`LedgerTransaction`]
//! stages the loan, both wallets and the committed ledger entry, and the
//! ledger store applies all of it or none of it.
//!
//! # Flow
//!
//! ```text
//! fund_loan(loan, lender, amount, token)
//!     ├── IdempotencyGuard::reserve     (duplicates wait or replay)
//!     ├── attempt 1..=max_attempts
//!     │     ├── snapshot loan + wallets
//!     │     ├── validate and stage      (rejections are logged and stored)
//!     │     └── LedgerStore::commit     (version conflict → jittered backoff, retry)
//!     ├── complete / release the key
//!     └── Dispatcher::notify            (spawned, after commit, best-effort)
//! ```
//!
//! # Idempotency on failure
//!
//! Deterministic rejections (bad amount, wrong loan status, missing account,
//! insufficient funds) complete the key with the error, so a retry with the
//! same token returns the same error without re-executing. Transient failures
//! (`Conflict`, `Storage`, `Cancelled`) release the key so the client can
//! retry with the same token. Dropping the `fund_loan` future before it
//! settles releases the key as well.

use crate::config::EngineConfig;
use crate::core::dispatcher::FundingEvent;
use crate::core::idempotency::{IdempotencyGuard, Reservation, StoredOutcome};
use crate::core::ledger_store::LedgerTransaction;
use crate::core::traits::{Dispatcher, LedgerStore};
use crate::types::{
    Amount, FundingError, FundingReceipt, FundingTransaction, IdempotencyKey, LedgerEntry, Loan,
    LoanId, Outcome, UserId, WalletAccount,
};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Loan and wallet state read at the start of one attempt
#[derive(Debug, Default)]
struct Snapshot {
    loan: Option<Loan>,
    lender: Option<WalletAccount>,
    borrower: Option<WalletAccount>,
}

impl Snapshot {
    fn read(store: &dyn LedgerStore, loan: LoanId, lender: UserId) -> Self {
        let loan = store.get_loan(loan);
        let borrower = loan.as_ref().and_then(|l| store.get_account(l.borrower));
        Snapshot {
            loan,
            lender: store.get_account(lender),
            borrower,
        }
    }

    /// Ledger entry for an attempt that did not commit
    fn audit_entry(
        &self,
        request: &FundingRequest<'_>,
        outcome: Outcome,
        error: FundingError,
    ) -> FundingTransaction {
        let balance = |wallet: &Option<WalletAccount>| {
            wallet.as_ref().map_or(Amount::ZERO, |w| w.balance)
        };

        FundingTransaction {
            id: Uuid::new_v4(),
            idempotency_key: request.key.clone(),
            loan: request.loan,
            lender: request.lender,
            borrower: self.loan.as_ref().map(|l| l.borrower),
            amount: request.amount,
            timestamp: Utc::now(),
            lender_balance: balance(&self.lender),
            borrower_balance: balance(&self.borrower),
            loan_status: self.loan.as_ref().map(|l| l.status),
            funded_amount: self.loan.as_ref().map_or(Amount::ZERO, |l| l.funded),
            outcome,
            error: Some(error),
        }
    }
}

struct FundingRequest<'a> {
    key: &'a IdempotencyKey,
    loan: LoanId,
    lender: UserId,
    amount: Amount,
}

/// Executes funding requests against a ledger store
pub struct FundingCoordinator {
    store: Arc<dyn LedgerStore>,
    guard: IdempotencyGuard,
    dispatcher: Arc<dyn Dispatcher>,
    config: EngineConfig,
}

impl FundingCoordinator {
    /// Create a coordinator over `store`
    ///
    /// Idempotency keys of funding attempts still inside the retention period
    /// are restored from the ledger, so duplicates keep replaying across a
    /// restart on a journaled store.
    pub fn new(
        store: Arc<dyn LedgerStore>,
        dispatcher: Arc<dyn Dispatcher>,
        config: EngineConfig,
    ) -> Self {
        let guard = IdempotencyGuard::new();
        let since = Utc::now()
            .checked_sub_signed(config.idempotency_ttl_chrono())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let entries = store.get_all_entries();
        let restored = guard.hydrate(entries.iter().filter_map(LedgerEntry::as_funding), since);
        if restored > 0 {
            info!(restored, "Idempotency keys restored from ledger");
        }

        FundingCoordinator {
            store,
            guard,
            dispatcher,
            config,
        }
    }

    /// Fund `amount` of `loan` from `lender`'s wallet
    ///
    /// `request_token` identifies the client's request: calls that repeat the
    /// same loan, lender, amount and token are executed once, and duplicates
    /// receive the stored outcome (receipts flagged `replayed`).
    ///
    /// # Errors
    ///
    /// - `LoanNotFound`, `AccountNotFound`: unknown loan or lender
    /// - `InvalidAmount`: zero amount
    /// - `InvalidTransition`: loan not approved, amount above what remains,
    ///   or the lender is the borrower
    /// - `InsufficientFunds`: lender balance below `amount`
    /// - `Conflict`: version conflicts outlasted the retry budget
    /// - `Storage`: the journal write failed
    pub async fn fund_loan(
        &self,
        loan: LoanId,
        lender: UserId,
        amount: Amount,
        request_token: &str,
    ) -> Result<FundingReceipt, FundingError> {
        self.fund_loan_with_cancel(loan, lender, amount, request_token, &CancellationToken::new())
            .await
    }

    /// [`fund_loan`](Self::fund_loan) with cooperative cancellation
    ///
    /// Cancellation observed before the commit returns `Cancelled`, leaves no
    /// trace in the ledger and releases the idempotency key. Once committed the
    /// funding stands; cancellation then only suppresses the notification if
    /// it has not started yet.
    pub async fn fund_loan_with_cancel(
        &self,
        loan: LoanId,
        lender: UserId,
        amount: Amount,
        request_token: &str,
        cancel: &CancellationToken,
    ) -> Result<FundingReceipt, FundingError> {
        let key = IdempotencyKey::derive(loan, lender, amount, request_token);

        let lease = loop {
            match self.guard.reserve(&key) {
                Reservation::Fresh(lease) => break lease,
                Reservation::Completed(outcome) => {
                    debug!(key = %key, "Replaying stored funding outcome");
                    return replayed(outcome);
                }
                Reservation::InFlight(waiter) => {
                    debug!(key = %key, "Waiting for in-flight duplicate");
                    let resolved = tokio::select! {
                        _ = cancel.cancelled() => return Err(FundingError::cancelled(loan)),
                        resolved = waiter.wait() => resolved,
                    };
                    if let Some(outcome) = resolved {
                        return replayed(outcome);
                    }
                }
            }
        };

        let request = FundingRequest {
            key: &key,
            loan,
            lender,
            amount,
        };

        match self.execute(&request, cancel).await {
            Ok(receipt) => {
                lease.complete(Ok(receipt.clone()));
                self.dispatch(&receipt, cancel);
                Ok(receipt)
            }
            Err(e) if e.is_transient() => {
                lease.release();
                Err(e)
            }
            Err(e) => {
                lease.complete(Err(e.clone()));
                Err(e)
            }
        }
    }

    /// Funding ledger entries of `loan`, in append order
    pub fn history(&self, loan: LoanId) -> Vec<FundingTransaction> {
        self.store
            .entries_for_loan(loan)
            .iter()
            .filter_map(LedgerEntry::as_funding)
            .cloned()
            .collect()
    }

    /// Forget completed idempotency keys older than the retention period
    pub fn purge_expired_keys(&self) -> usize {
        let purged = self
            .guard
            .purge_expired(Utc::now(), self.config.idempotency_ttl_chrono());
        if purged > 0 {
            debug!(purged, "Expired idempotency keys purged");
        }
        purged
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn execute(
        &self,
        request: &FundingRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<FundingReceipt, FundingError> {
        let mut last_snapshot = Snapshot::default();

        for attempt in 1..=self.config.max_attempts {
            if cancel.is_cancelled() {
                info!(loan = request.loan, key = %request.key, "Funding cancelled before commit");
                return Err(FundingError::cancelled(request.loan));
            }

            let snapshot = Snapshot::read(self.store.as_ref(), request.loan, request.lender);
            let (tx, receipt) = match stage(&snapshot, request) {
                Ok(staged) => staged,
                Err(e) => {
                    info!(
                        loan = request.loan,
                        lender = request.lender,
                        amount = %request.amount,
                        reason = %e,
                        "Funding rejected"
                    );
                    self.record(snapshot.audit_entry(request, Outcome::Rejected, e.clone()));
                    return Err(e);
                }
            };

            if cancel.is_cancelled() {
                info!(loan = request.loan, key = %request.key, "Funding cancelled before commit");
                return Err(FundingError::cancelled(request.loan));
            }

            match self.store.commit(tx) {
                Ok(()) => {
                    info!(
                        loan = request.loan,
                        lender = request.lender,
                        borrower = receipt.borrower,
                        amount = %request.amount,
                        status = %receipt.loan_status,
                        attempt,
                        "Funding committed"
                    );
                    return Ok(receipt);
                }
                Err(FundingError::ConcurrentModification { record }) => {
                    debug!(loan = request.loan, attempt, %record, "Funding hit a version conflict");
                    last_snapshot = snapshot;
                    if attempt < self.config.max_attempts {
                        tokio::time::sleep(retry_backoff(attempt)).await;
                    }
                }
                Err(e) => {
                    error!(loan = request.loan, error = %e, "Funding commit failed");
                    self.record(snapshot.audit_entry(request, Outcome::Failed, e.clone()));
                    return Err(e);
                }
            }
        }

        let conflict = FundingError::conflict(request.loan, self.config.max_attempts);
        warn!(loan = request.loan, key = %request.key, "{}", conflict);
        self.record(last_snapshot.audit_entry(request, Outcome::Failed, conflict.clone()));
        Err(conflict)
    }

    /// Append an audit entry for an attempt that did not commit
    fn record(&self, entry: FundingTransaction) {
        let mut tx = LedgerTransaction::new();
        tx.append(LedgerEntry::Funding(entry));
        if let Err(e) = self.store.commit(tx) {
            error!(error = %e, "Failed to record funding attempt in ledger");
        }
    }

    fn dispatch(&self, receipt: &FundingReceipt, cancel: &CancellationToken) {
        let event = FundingEvent::from(receipt);
        let dispatcher = Arc::clone(&self.dispatcher);
        let cancel = cancel.clone();

        tokio::spawn(async move {
            if cancel.is_cancelled() {
                debug!(loan = event.loan, "Dispatch suppressed by cancellation");
                return;
            }
            if let Err(e) = dispatcher.notify(event).await {
                warn!(loan = e.loan, error = %e, "Funding notification failed");
            }
        });
    }
}

/// Upper bound of the first retry delay, doubled per attempt
const BACKOFF_BASE: Duration = Duration::from_micros(100);
/// Upper bound of any single retry delay
const BACKOFF_CAP: Duration = Duration::from_millis(5);

/// Random delay before retrying after `attempt` lost a version race
///
/// Uniform over the upper half of an exponentially growing window, so
/// writers that collided on the same loan spread out instead of colliding
/// again.
fn retry_backoff(attempt: u32) -> Duration {
    let window = BACKOFF_BASE
        .saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
        .min(BACKOFF_CAP);
    let micros = u64::try_from(window.as_micros()).unwrap_or(u64::MAX);
    Duration::from_micros(rand::thread_rng().gen_range(micros / 2..=micros))
}

fn replayed(outcome: StoredOutcome) -> Result<FundingReceipt, FundingError> {
    outcome.map(|receipt| FundingReceipt {
        replayed: true,
        ..receipt
    })
}

/// Validate the request against `snapshot` and stage the funding commit
fn stage(
    snapshot: &Snapshot,
    request: &FundingRequest<'_>,
) -> Result<(LedgerTransaction, FundingReceipt), FundingError> {
    let mut loan = snapshot
        .loan
        .clone()
        .ok_or_else(|| FundingError::loan_not_found(request.loan))?;

    if loan.borrower == request.lender {
        return Err(FundingError::invalid_transition(
            loan.id,
            loan.status,
            "lender cannot fund their own loan",
        ));
    }

    let loan_status = loan.apply_funding(request.amount)?;

    let mut lender = snapshot
        .lender
        .clone()
        .ok_or_else(|| FundingError::account_not_found(request.lender))?;
    let mut borrower = snapshot
        .borrower
        .clone()
        .unwrap_or_else(|| WalletAccount::new(loan.borrower));

    let lender_balance = lender.debit(request.amount)?;
    let borrower_balance = borrower.credit(request.amount)?;

    let entry = FundingTransaction {
        id: Uuid::new_v4(),
        idempotency_key: request.key.clone(),
        loan: loan.id,
        lender: request.lender,
        borrower: Some(loan.borrower),
        amount: request.amount,
        timestamp: Utc::now(),
        lender_balance,
        borrower_balance,
        loan_status: Some(loan_status),
        funded_amount: loan.funded,
        outcome: Outcome::Committed,
        error: None,
    };

    let receipt = FundingReceipt {
        transaction_id: entry.id,
        loan: loan.id,
        lender: request.lender,
        borrower: loan.borrower,
        amount: request.amount,
        lender_balance,
        borrower_balance,
        loan_status,
        funded_amount: loan.funded,
        replayed: false,
    };

    let mut tx = LedgerTransaction::new();
    tx.put_loan(loan)
        .put_account(lender)
        .put_account(borrower)
        .append(LedgerEntry::Funding(entry));

    Ok((tx, receipt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dispatcher::{ChannelDispatcher, DispatchError, NoopDispatcher};
    use crate::core::ledger_store::MemoryLedgerStore;
    use crate::core::loan_registry::LoanRegistry;
    use crate::core::wallet::WalletManager;
    use crate::types::{LoanStatus, TransactionId};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::time::Duration;

    const BORROWER: UserId = 1;
    const LENDER: UserId = 2;

    struct Fixture {
        store: Arc<MemoryLedgerStore>,
        wallets: WalletManager,
        loans: LoanRegistry,
        coordinator: Arc<FundingCoordinator>,
    }

    fn fixture_with(dispatcher: Arc<dyn Dispatcher>, config: EngineConfig) -> Fixture {
        let store = Arc::new(MemoryLedgerStore::new());
        Fixture {
            wallets: WalletManager::new(store.clone(), config.max_attempts),
            loans: LoanRegistry::new(store.clone(), "USD", config.max_attempts),
            coordinator: Arc::new(FundingCoordinator::new(store.clone(), dispatcher, config)),
            store,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(NoopDispatcher), EngineConfig::default())
    }

    /// Loan 1 for 100,000 approved; lender 150,000; borrower 0
    fn scenario(f: &Fixture) {
        f.wallets.open(BORROWER, Amount::ZERO).unwrap();
        f.wallets.open(LENDER, Amount::new(150_000)).unwrap();
        f.loans.request(1, BORROWER, Amount::new(100_000)).unwrap();
        f.loans.approve(1).unwrap();
    }

    fn balance(f: &Fixture, owner: UserId) -> Amount {
        f.wallets.get(owner).map_or(Amount::ZERO, |w| w.balance)
    }

    fn total_balance(f: &Fixture) -> u64 {
        f.store
            .get_all_accounts()
            .iter()
            .map(|a| a.balance.minor_units())
            .sum()
    }

    #[tokio::test]
    async fn test_full_funding_scenario() {
        let f = fixture();
        scenario(&f);

        let receipt = f
            .coordinator
            .fund_loan(1, LENDER, Amount::new(100_000), "tok-1")
            .await
            .unwrap();

        assert_eq!(receipt.lender_balance, Amount::new(50_000));
        assert_eq!(receipt.borrower_balance, Amount::new(100_000));
        assert_eq!(receipt.loan_status, LoanStatus::Funded);
        assert_eq!(receipt.funded_amount, Amount::new(100_000));
        assert!(!receipt.replayed);
        assert_eq!(balance(&f, LENDER), Amount::new(50_000));
        assert_eq!(balance(&f, BORROWER), Amount::new(100_000));
        assert_eq!(f.loans.get(1).unwrap().status, LoanStatus::Funded);

        let retry = f
            .coordinator
            .fund_loan(1, LENDER, Amount::new(100_000), "tok-1")
            .await
            .unwrap();
        assert!(retry.replayed);
        assert_eq!(
            retry,
            FundingReceipt {
                replayed: true,
                ..receipt
            }
        );
        assert_eq!(balance(&f, LENDER), Amount::new(50_000));

        let over = f
            .coordinator
            .fund_loan(1, LENDER, Amount::new(150_000), "tok-2")
            .await;
        assert!(matches!(
            over,
            Err(FundingError::InvalidTransition {
                loan: 1,
                status: LoanStatus::Funded,
                ..
            })
        ));
        assert_eq!(balance(&f, LENDER), Amount::new(50_000));
        assert_eq!(balance(&f, BORROWER), Amount::new(100_000));

        let history = f.coordinator.history(1);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].outcome, Outcome::Committed);
        assert_eq!(history[0].id, receipt.transaction_id);
        assert_eq!(history[1].outcome, Outcome::Rejected);
    }

    #[tokio::test]
    async fn test_over_funding_an_open_loan_is_rejected() {
        let f = fixture();
        scenario(&f);

        let result = f
            .coordinator
            .fund_loan(1, LENDER, Amount::new(150_000), "tok-1")
            .await;

        assert_eq!(
            result,
            Err(FundingError::invalid_transition(
                1,
                LoanStatus::Approved,
                "funding 150000 exceeds remaining 100000"
            ))
        );
        assert_eq!(balance(&f, LENDER), Amount::new(150_000));
        assert_eq!(f.loans.get(1).unwrap().funded, Amount::ZERO);
    }

    #[tokio::test]
    async fn test_partial_funding_keeps_loan_approved() {
        let f = fixture();
        scenario(&f);
        f.wallets.open(3, Amount::new(60_000)).unwrap();

        let first = f
            .coordinator
            .fund_loan(1, LENDER, Amount::new(40_000), "a")
            .await
            .unwrap();
        assert_eq!(first.loan_status, LoanStatus::Approved);
        assert_eq!(first.funded_amount, Amount::new(40_000));

        let second = f
            .coordinator
            .fund_loan(1, 3, Amount::new(60_000), "b")
            .await
            .unwrap();
        assert_eq!(second.loan_status, LoanStatus::Funded);
        assert_eq!(second.borrower_balance, Amount::new(100_000));
        assert_eq!(balance(&f, 3), Amount::ZERO);
    }

    #[tokio::test]
    async fn test_rejections_are_recorded_and_replayed() {
        let f = fixture();
        scenario(&f);
        f.wallets.open(3, Amount::new(10)).unwrap();

        let first = f
            .coordinator
            .fund_loan(1, 3, Amount::new(500), "tok")
            .await;
        let expected = Err(FundingError::insufficient_funds(
            3,
            Amount::new(10),
            Amount::new(500),
        ));
        assert_eq!(first, expected);

        // Topping up does not change the stored outcome of the same request.
        f.wallets.deposit(3, Amount::new(1_000)).unwrap();
        let retry = f
            .coordinator
            .fund_loan(1, 3, Amount::new(500), "tok")
            .await;
        assert_eq!(retry, expected);

        let history = f.coordinator.history(1);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, Outcome::Rejected);
        assert_eq!(history[0].lender_balance, Amount::new(10));
        assert_eq!(history[0].error, expected.clone().err());

        // A fresh token executes again.
        let receipt = f
            .coordinator
            .fund_loan(1, 3, Amount::new(500), "tok-2")
            .await
            .unwrap();
        assert_eq!(receipt.lender_balance, Amount::new(510));
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let f = fixture();
        scenario(&f);
        f.loans.request(2, BORROWER, Amount::new(100)).unwrap();

        assert_eq!(
            f.coordinator.fund_loan(9, LENDER, Amount::new(1), "t").await,
            Err(FundingError::loan_not_found(9))
        );
        assert_eq!(
            f.coordinator.fund_loan(1, 42, Amount::new(1), "t").await,
            Err(FundingError::account_not_found(42))
        );
        assert_eq!(
            f.coordinator.fund_loan(1, LENDER, Amount::ZERO, "t").await,
            Err(FundingError::invalid_amount(Amount::ZERO))
        );
        assert!(matches!(
            f.coordinator.fund_loan(2, LENDER, Amount::new(1), "t").await,
            Err(FundingError::InvalidTransition {
                status: LoanStatus::Pending,
                ..
            })
        ));
        assert!(matches!(
            f.coordinator.fund_loan(1, BORROWER, Amount::new(1), "t").await,
            Err(FundingError::InvalidTransition { .. })
        ));

        assert_eq!(balance(&f, LENDER), Amount::new(150_000));
        assert_eq!(f.loans.get(1).unwrap().funded, Amount::ZERO);
    }

    #[tokio::test]
    async fn test_borrower_wallet_created_on_first_funding() {
        let f = fixture();
        f.wallets.open(LENDER, Amount::new(500)).unwrap();
        f.loans.request(1, 7, Amount::new(200)).unwrap();
        f.loans.approve(1).unwrap();

        let receipt = f
            .coordinator
            .fund_loan(1, LENDER, Amount::new(200), "t")
            .await
            .unwrap();

        assert_eq!(receipt.borrower, 7);
        assert_eq!(balance(&f, 7), Amount::new(200));
        assert_eq!(f.wallets.get(7).unwrap().version, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_duplicates_execute_once() {
        let f = fixture();
        scenario(&f);

        let mut handles = vec![];
        for _ in 0..16 {
            let coordinator = Arc::clone(&f.coordinator);
            handles.push(tokio::spawn(async move {
                coordinator
                    .fund_loan(1, LENDER, Amount::new(30_000), "same")
                    .await
            }));
        }

        let mut receipts = vec![];
        for handle in handles {
            receipts.push(handle.await.unwrap().unwrap());
        }

        let ids: HashSet<TransactionId> = receipts.iter().map(|r| r.transaction_id).collect();
        assert_eq!(ids.len(), 1);
        assert_eq!(receipts.iter().filter(|r| !r.replayed).count(), 1);
        assert_eq!(balance(&f, LENDER), Amount::new(120_000));
        assert_eq!(f.coordinator.history(1).len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_lenders_never_over_fund() {
        let config = EngineConfig {
            max_attempts: 1_000,
            ..EngineConfig::default()
        };
        let f = fixture_with(Arc::new(NoopDispatcher), config);
        f.loans.request(1, BORROWER, Amount::new(100)).unwrap();
        f.loans.approve(1).unwrap();
        for lender in 10..20 {
            f.wallets.open(lender, Amount::new(100)).unwrap();
        }
        let before = total_balance(&f);

        let mut handles = vec![];
        for lender in 10..20 {
            let coordinator = Arc::clone(&f.coordinator);
            handles.push(tokio::spawn(async move {
                coordinator
                    .fund_loan(1, lender, Amount::new(30), "t")
                    .await
            }));
        }

        let mut committed = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => committed += 1,
                Err(FundingError::InvalidTransition { .. }) => {}
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        let loan = f.loans.get(1).unwrap();
        assert_eq!(committed, 3);
        assert_eq!(loan.funded, Amount::new(90));
        assert_eq!(loan.status, LoanStatus::Approved);
        assert_eq!(balance(&f, BORROWER), Amount::new(90));
        assert_eq!(total_balance(&f), before);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_partial_funding_transitions_exactly_once() {
        let config = EngineConfig {
            max_attempts: 1_000,
            ..EngineConfig::default()
        };
        let f = fixture_with(Arc::new(NoopDispatcher), config);
        f.loans.request(1, BORROWER, Amount::new(1_000)).unwrap();
        f.loans.approve(1).unwrap();
        for lender in 10..20 {
            f.wallets.open(lender, Amount::new(100)).unwrap();
        }

        let mut handles = vec![];
        for lender in 10..20 {
            let coordinator = Arc::clone(&f.coordinator);
            handles.push(tokio::spawn(async move {
                coordinator
                    .fund_loan(1, lender, Amount::new(100), "t")
                    .await
            }));
        }

        let mut funded_receipts = 0;
        for handle in handles {
            let receipt = handle.await.unwrap().unwrap();
            if receipt.loan_status == LoanStatus::Funded {
                funded_receipts += 1;
            }
        }

        assert_eq!(funded_receipts, 1);
        assert_eq!(f.loans.get(1).unwrap().status, LoanStatus::Funded);
        assert_eq!(f.loans.get(1).unwrap().funded, Amount::new(1_000));
        assert_eq!(balance(&f, BORROWER), Amount::new(1_000));
        let committed = f
            .coordinator
            .history(1)
            .iter()
            .filter(|e| e.outcome == Outcome::Committed)
            .count();
        assert_eq!(committed, 10);
    }

    #[tokio::test]
    async fn test_cancelled_before_commit_has_no_effect() {
        let f = fixture();
        scenario(&f);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = f
            .coordinator
            .fund_loan_with_cancel(1, LENDER, Amount::new(100_000), "tok-1", &cancel)
            .await;

        assert_eq!(result, Err(FundingError::cancelled(1)));
        assert_eq!(balance(&f, LENDER), Amount::new(150_000));
        assert!(f.coordinator.history(1).is_empty());

        // The key was released, so the same request can run again.
        let receipt = f
            .coordinator
            .fund_loan(1, LENDER, Amount::new(100_000), "tok-1")
            .await
            .unwrap();
        assert!(!receipt.replayed);
    }

    #[tokio::test]
    async fn test_dispatcher_receives_event_after_commit() {
        let (dispatcher, mut events) = ChannelDispatcher::new();
        let f = fixture_with(Arc::new(dispatcher), EngineConfig::default());
        scenario(&f);

        f.coordinator
            .fund_loan(1, LENDER, Amount::new(100_000), "tok-1")
            .await
            .unwrap();
        f.coordinator
            .fund_loan(1, LENDER, Amount::new(100_000), "tok-1")
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            FundingEvent {
                loan: 1,
                borrower: BORROWER,
                lender: LENDER,
                amount: Amount::new(100_000),
                borrower_balance: Amount::new(100_000),
                lender_balance: Amount::new(50_000),
            }
        );
        // The replayed duplicate is not dispatched again.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err());
    }

    struct FailingDispatcher;

    #[async_trait]
    impl Dispatcher for FailingDispatcher {
        async fn notify(&self, event: FundingEvent) -> Result<(), DispatchError> {
            Err(DispatchError {
                loan: event.loan,
                message: "smtp unavailable".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_dispatcher_failure_does_not_roll_back() {
        let f = fixture_with(Arc::new(FailingDispatcher), EngineConfig::default());
        scenario(&f);

        let receipt = f
            .coordinator
            .fund_loan(1, LENDER, Amount::new(100_000), "tok-1")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(receipt.loan_status, LoanStatus::Funded);
        assert_eq!(balance(&f, LENDER), Amount::new(50_000));
        assert_eq!(f.loans.get(1).unwrap().status, LoanStatus::Funded);
    }

    /// Store whose record commits always lose the version race
    struct ContendedStore {
        inner: MemoryLedgerStore,
    }

    impl LedgerStore for ContendedStore {
        fn get_account(&self, owner: UserId) -> Option<WalletAccount> {
            self.inner.get_account(owner)
        }
        fn get_loan(&self, loan: LoanId) -> Option<Loan> {
            self.inner.get_loan(loan)
        }
        fn commit(&self, transaction: LedgerTransaction) -> Result<(), FundingError> {
            if transaction.record_count() > 0 {
                return Err(FundingError::concurrent_modification("loan 1"));
            }
            self.inner.commit(transaction)
        }
        fn get_entry(&self, id: TransactionId) -> Option<LedgerEntry> {
            self.inner.get_entry(id)
        }
        fn entries_for_loan(&self, loan: LoanId) -> Vec<LedgerEntry> {
            self.inner.entries_for_loan(loan)
        }
        fn entry_for_key(&self, key: &IdempotencyKey) -> Option<FundingTransaction> {
            self.inner.entry_for_key(key)
        }
        fn get_all_accounts(&self) -> Vec<WalletAccount> {
            self.inner.get_all_accounts()
        }
        fn get_all_loans(&self) -> Vec<Loan> {
            self.inner.get_all_loans()
        }
        fn get_all_entries(&self) -> Vec<LedgerEntry> {
            self.inner.get_all_entries()
        }
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_conflict_and_release_key() {
        let inner = MemoryLedgerStore::new();
        let mut seed = LedgerTransaction::new();
        let mut loan = Loan::new(1, BORROWER, Amount::new(100), "USD").unwrap();
        loan.approve().unwrap();
        seed.put_loan(loan)
            .put_account(WalletAccount::with_balance(LENDER, Amount::new(100)));
        inner.commit(seed).unwrap();

        let store = Arc::new(ContendedStore { inner });
        let coordinator =
            FundingCoordinator::new(store.clone(), Arc::new(NoopDispatcher), EngineConfig::default());

        let first = coordinator.fund_loan(1, LENDER, Amount::new(100), "t").await;
        assert_eq!(first, Err(FundingError::conflict(1, 3)));

        let second = coordinator.fund_loan(1, LENDER, Amount::new(100), "t").await;
        assert_eq!(second, Err(FundingError::conflict(1, 3)));

        let history = coordinator.history(1);
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|e| e.outcome == Outcome::Failed));
        assert_eq!(history[0].lender_balance, Amount::new(100));
        assert_eq!(store.get_account(LENDER).unwrap().balance, Amount::new(100));
        assert_eq!(store.get_loan(1).unwrap().funded, Amount::ZERO);
    }

    fn contended_store() -> Arc<ContendedStore> {
        let inner = MemoryLedgerStore::new();
        let mut seed = LedgerTransaction::new();
        let mut loan = Loan::new(1, BORROWER, Amount::new(100), "USD").unwrap();
        loan.approve().unwrap();
        seed.put_loan(loan)
            .put_account(WalletAccount::with_balance(LENDER, Amount::new(100)));
        inner.commit(seed).unwrap();
        Arc::new(ContendedStore { inner })
    }

    #[tokio::test]
    async fn test_dropped_call_releases_its_key() {
        let store = contended_store();
        let coordinator =
            FundingCoordinator::new(store.clone(), Arc::new(NoopDispatcher), EngineConfig::default());

        // The first attempt loses the version race and parks in its backoff.
        let mut abandoned = Box::pin(coordinator.fund_loan(1, LENDER, Amount::new(100), "t"));
        assert!(futures::poll!(&mut abandoned).is_pending());
        drop(abandoned);

        let retry = tokio::time::timeout(
            Duration::from_secs(5),
            coordinator.fund_loan(1, LENDER, Amount::new(100), "t"),
        )
        .await
        .expect("retry with the same token must not wait on the dropped call");

        assert_eq!(retry, Err(FundingError::conflict(1, 3)));
        assert_eq!(coordinator.history(1).len(), 1);
        assert_eq!(store.get_account(LENDER).unwrap().balance, Amount::new(100));
    }

    #[rstest::rstest]
    #[case(1, 100)]
    #[case(2, 200)]
    #[case(3, 400)]
    #[case(10, 5_000)]
    #[case(u32::MAX, 5_000)]
    fn test_retry_backoff_stays_within_window(#[case] attempt: u32, #[case] max_micros: u64) {
        for _ in 0..100 {
            let delay = retry_backoff(attempt);
            assert!(delay >= Duration::from_micros(max_micros / 2));
            assert!(delay <= Duration::from_micros(max_micros));
        }
    }

    #[tokio::test]
    async fn test_keys_restored_and_purged() {
        let f = fixture();
        scenario(&f);
        f.coordinator
            .fund_loan(1, LENDER, Amount::new(100_000), "tok-1")
            .await
            .unwrap();

        let restarted = FundingCoordinator::new(
            f.store.clone(),
            Arc::new(NoopDispatcher),
            EngineConfig::default(),
        );
        let replay = restarted
            .fund_loan(1, LENDER, Amount::new(100_000), "tok-1")
            .await
            .unwrap();
        assert!(replay.replayed);
        assert_eq!(restarted.purge_expired_keys(), 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let short = FundingCoordinator::new(
            f.store.clone(),
            Arc::new(NoopDispatcher),
            EngineConfig {
                idempotency_ttl: Duration::from_millis(1),
                ..EngineConfig::default()
            },
        );
        assert!(matches!(
            short.fund_loan(1, LENDER, Amount::new(100_000), "tok-1").await,
            Err(FundingError::InvalidTransition { .. })
        ));
    }
}
