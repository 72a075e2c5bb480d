//! Side-effect dispatch for committed funding transactions
//!
//! The coordinator emits one [`FundingEvent`] per committed transaction and
//! hands it to a [`Dispatcher`] after the commit, outside every lock. Delivery
//! is best-effort: a failed `notify` is logged by the coordinator and never
//! touches the committed financial state.
//!
//! Provided implementations:
//! - [`LogDispatcher`]: writes the event to the tracing log
//! - [`ChannelDispatcher`]: forwards events into a tokio channel for an
//!   in-process consumer (notification workers, tests)
//! - [`NoopDispatcher`]: drops events

use crate::core::traits::Dispatcher;
use crate::types::{Amount, FundingReceipt, LoanId, UserId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

/// Notification payload for a committed funding transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingEvent {
    pub loan: LoanId,
    pub borrower: UserId,
    pub lender: UserId,
    pub amount: Amount,
    pub borrower_balance: Amount,
    pub lender_balance: Amount,
}

impl From<&FundingReceipt> for FundingEvent {
    fn from(receipt: &FundingReceipt) -> Self {
        FundingEvent {
            loan: receipt.loan,
            borrower: receipt.borrower,
            lender: receipt.lender,
            amount: receipt.amount,
            borrower_balance: receipt.borrower_balance,
            lender_balance: receipt.lender_balance,
        }
    }
}

/// Delivery failure reported by a dispatcher
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Dispatch failed for loan {loan}: {message}")]
pub struct DispatchError {
    pub loan: LoanId,
    pub message: String,
}

/// Drops every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDispatcher;

#[async_trait]
impl Dispatcher for NoopDispatcher {
    async fn notify(&self, _event: FundingEvent) -> Result<(), DispatchError> {
        Ok(())
    }
}

/// Logs every event at info level
#[derive(Debug, Clone, Copy, Default)]
pub struct LogDispatcher;

#[async_trait]
impl Dispatcher for LogDispatcher {
    async fn notify(&self, event: FundingEvent) -> Result<(), DispatchError> {
        info!(
            loan = event.loan,
            borrower = event.borrower,
            lender = event.lender,
            amount = %event.amount,
            borrower_balance = %event.borrower_balance,
            lender_balance = %event.lender_balance,
            "Loan funded"
        );
        Ok(())
    }
}

/// Forwards events into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    sender: mpsc::UnboundedSender<FundingEvent>,
}

impl ChannelDispatcher {
    /// Create a dispatcher and the receiving end of its channel
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FundingEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl Dispatcher for ChannelDispatcher {
    async fn notify(&self, event: FundingEvent) -> Result<(), DispatchError> {
        let loan = event.loan;
        self.sender.send(event).map_err(|_| DispatchError {
            loan,
            message: "event receiver dropped".to_string(),
        })
    }
}
