//! Idempotency guard for funding requests
//!
//! Deduplicates retried and concurrent duplicate `fund_loan` calls. Each key
//! is in one of two states:
//!
//! - **in flight**: a call owns the key and is executing. Duplicates get an
//!   [`InFlightWaiter`] and wait for that call to finish instead of racing it.
//! - **completed**: the call reached a terminal outcome. Duplicates get the
//!   stored outcome without re-executing.
//!
//! Only completed keys expire, after the configured retention period, via
//! [`IdempotencyGuard::purge_expired`]. A call that ends in a transient
//! failure releases its key instead of completing it, and waiting duplicates
//! go back to reserving it themselves. The owner holds its key through a
//! [`KeyLease`], so a call that is dropped before settling releases it too.

use crate::types::{FundingError, FundingReceipt, FundingTransaction, IdempotencyKey, Outcome};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::debug;

/// The caller-facing result stored for a processed key
pub type StoredOutcome = Result<FundingReceipt, FundingError>;

#[derive(Debug, Clone)]
enum Resolution {
    Pending,
    Completed(StoredOutcome),
    Released,
}

#[derive(Debug)]
enum Slot {
    InFlight(watch::Sender<Resolution>),
    Completed {
        outcome: StoredOutcome,
        completed_at: DateTime<Utc>,
    },
}

/// Result of [`IdempotencyGuard::reserve`]
#[derive(Debug)]
pub enum Reservation<'a> {
    /// The key was unseen and is now in flight for the caller
    Fresh(KeyLease<'a>),
    /// The key was already processed
    Completed(StoredOutcome),
    /// Another call owns the key right now
    InFlight(InFlightWaiter),
}

/// Ownership of an in-flight key
///
/// Settle it with [`complete`](Self::complete) or
/// [`release`](Self::release). Dropping an unsettled lease releases the key,
/// so a funding call whose future is dropped mid-flight never leaves its
/// duplicates waiting.
#[derive(Debug)]
pub struct KeyLease<'a> {
    guard: &'a IdempotencyGuard,
    key: IdempotencyKey,
    settled: bool,
}

impl KeyLease<'_> {
    pub fn key(&self) -> &IdempotencyKey {
        &self.key
    }

    /// Store the terminal outcome and wake waiting duplicates
    pub fn complete(mut self, outcome: StoredOutcome) {
        self.settled = true;
        self.guard.complete(&self.key, outcome);
    }

    /// Give the key back so it can be reserved again
    pub fn release(mut self) {
        self.settled = true;
        self.guard.release(&self.key);
    }
}

impl Drop for KeyLease<'_> {
    fn drop(&mut self) {
        if !self.settled {
            debug!(key = %self.key, "Idempotency lease dropped unsettled");
            self.guard.release(&self.key);
        }
    }
}

/// Waits for the call that owns an in-flight key
#[derive(Debug)]
pub struct InFlightWaiter {
    receiver: watch::Receiver<Resolution>,
}

impl InFlightWaiter {
    /// Wait for the owning call to finish
    ///
    /// Returns the stored outcome, or `None` if the owner released the key.
    pub async fn wait(mut self) -> Option<StoredOutcome> {
        loop {
            let resolution = self.receiver.borrow_and_update().clone();
            match resolution {
                Resolution::Completed(outcome) => return Some(outcome),
                Resolution::Released => return None,
                Resolution::Pending => {}
            }
            if self.receiver.changed().await.is_err() {
                return None;
            }
        }
    }
}

/// Concurrent map of idempotency keys to their processing state
#[derive(Debug, Default)]
pub struct IdempotencyGuard {
    slots: DashMap<IdempotencyKey, Slot>,
}

impl IdempotencyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild completed keys from ledger entries
    ///
    /// Committed and rejected entries newer than `since` become completed
    /// keys. Failed entries are skipped because their keys were released.
    pub fn hydrate<'a, I>(&self, entries: I, since: DateTime<Utc>) -> usize
    where
        I: IntoIterator<Item = &'a FundingTransaction>,
    {
        let mut restored = 0;
        for entry in entries {
            if entry.outcome == Outcome::Failed || entry.timestamp < since {
                continue;
            }
            self.slots.insert(
                entry.idempotency_key.clone(),
                Slot::Completed {
                    outcome: entry.stored_outcome(),
                    completed_at: entry.timestamp,
                },
            );
            restored += 1;
        }
        restored
    }

    /// Claim `key`, or report who already has it
    pub fn reserve(&self, key: &IdempotencyKey) -> Reservation<'_> {
        let mut fresh = false;
        let slot = self.slots.entry(key.clone()).or_insert_with(|| {
            fresh = true;
            let (sender, _) = watch::channel(Resolution::Pending);
            Slot::InFlight(sender)
        });

        if fresh {
            drop(slot);
            debug!(key = %key, "Idempotency key reserved");
            return Reservation::Fresh(KeyLease {
                guard: self,
                key: key.clone(),
                settled: false,
            });
        }

        match slot.value() {
            Slot::InFlight(sender) => Reservation::InFlight(InFlightWaiter {
                receiver: sender.subscribe(),
            }),
            Slot::Completed { outcome, .. } => Reservation::Completed(outcome.clone()),
        }
    }

    fn complete(&self, key: &IdempotencyKey, outcome: StoredOutcome) {
        let slot = Slot::Completed {
            outcome: outcome.clone(),
            completed_at: Utc::now(),
        };

        if let Some(Slot::InFlight(sender)) = self.slots.insert(key.clone(), slot) {
            sender.send_replace(Resolution::Completed(outcome));
        }
    }

    fn release(&self, key: &IdempotencyKey) {
        let removed = self
            .slots
            .remove_if(key, |_, slot| matches!(slot, Slot::InFlight(_)));
        if let Some((_, Slot::InFlight(sender))) = removed {
            sender.send_replace(Resolution::Released);
        }
        debug!(key = %key, "Idempotency key released");
    }

    /// Forget completed keys older than `now - ttl`; returns how many
    pub fn purge_expired(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| match slot {
            Slot::InFlight(_) => true,
            Slot::Completed { completed_at, .. } => *completed_at + ttl > now,
        });
        before.saturating_sub(self.slots.len())
    }

    /// Number of tracked keys, in flight or completed
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
