//! CSV format handling for replay commands and engine reports
//!
//! This module centralizes all CSV format concerns, providing:
//! - CsvRecord structure for deserialization
//! - Conversion from CSV records to engine commands
//! - Report serialization for wallets, loans and the ledger
//!
//! Amounts are major-unit decimals in CSV (`1000.50`) and minor units
//! everywhere else; the currency exponent converts between the two.
//!
//! All functions are pure (no I/O beyond the writer they are given) for easy
//! testing.

use crate::types::{
    Amount, Command, LedgerEntry, Loan, LoanId, UserId, WalletAccount, WalletEntryKind,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Write;
use std::str::FromStr;

/// CSV record structure for deserialization
///
/// Matches the input CSV format with columns: type, loan, user, amount, token.
/// Which columns are required depends on the command type; unused ones may be
/// left empty or omitted.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct CsvRecord {
    #[serde(rename = "type")]
    pub command: String,
    #[serde(default)]
    pub loan: Option<LoanId>,
    #[serde(default)]
    pub user: Option<UserId>,
    #[serde(default)]
    pub amount: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

impl CsvRecord {
    fn loan(&self) -> Result<LoanId, String> {
        self.loan
            .ok_or_else(|| format!("'{}' command requires a loan id", self.command))
    }

    fn user(&self) -> Result<UserId, String> {
        self.user
            .ok_or_else(|| format!("'{}' command requires a user id", self.command))
    }

    fn amount(&self, exponent: u32) -> Result<Option<Amount>, String> {
        let raw = match self.amount.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => raw,
            _ => return Ok(None),
        };

        let decimal =
            Decimal::from_str(raw).map_err(|_| format!("Invalid amount '{}'", raw))?;
        Amount::from_major(decimal, exponent)
            .map(Some)
            .ok_or_else(|| {
                format!(
                    "Invalid amount '{}': must be non-negative with at most {} decimal places",
                    raw, exponent
                )
            })
    }

    fn required_amount(&self, exponent: u32) -> Result<Amount, String> {
        self.amount(exponent)?
            .ok_or_else(|| format!("'{}' command requires an amount", self.command))
    }
}

/// Convert a CsvRecord to a Command
///
/// # Arguments
///
/// * `csv_record` - The deserialized CSV record
/// * `exponent` - Decimal places between major and minor currency units
///
/// # Returns
///
/// Result containing either:
/// - Ok(Command) - Successfully converted record
/// - Err(String) - Error message describing the conversion failure
pub fn convert_csv_record(csv_record: CsvRecord, exponent: u32) -> Result<Command, String> {
    let command = match csv_record.command.to_lowercase().as_str() {
        "open" => Command::Open {
            owner: csv_record.user()?,
            initial: csv_record.amount(exponent)?.unwrap_or(Amount::ZERO),
        },
        "deposit" => Command::Deposit {
            owner: csv_record.user()?,
            amount: csv_record.required_amount(exponent)?,
        },
        "request" => Command::Request {
            loan: csv_record.loan()?,
            borrower: csv_record.user()?,
            amount: csv_record.required_amount(exponent)?,
        },
        "approve" => Command::Approve {
            loan: csv_record.loan()?,
        },
        "reject" => Command::Reject {
            loan: csv_record.loan()?,
        },
        "default" => Command::Default {
            loan: csv_record.loan()?,
        },
        "fund" => {
            let token = match csv_record.token.as_deref().map(str::trim) {
                Some(token) if !token.is_empty() => token.to_string(),
                _ => return Err("'fund' command requires a request token".to_string()),
            };
            Command::Fund {
                loan: csv_record.loan()?,
                lender: csv_record.user()?,
                amount: csv_record.required_amount(exponent)?,
                token,
            }
        }
        _ => {
            return Err(format!(
                "Invalid command type: '{}'",
                csv_record.command
            ))
        }
    };

    Ok(command)
}

/// Write wallet states to CSV format
///
/// Writes wallets with columns: user, balance, version. Wallets are sorted by
/// owner for deterministic output and balances are rendered in major units.
///
/// # Returns
///
/// * `Ok(())` if writing succeeded
/// * `Err(String)` if a write error occurred
pub fn write_accounts_csv(
    accounts: &[WalletAccount],
    exponent: u32,
    output: &mut dyn Write,
) -> Result<(), String> {
    let mut writer = csv::Writer::from_writer(output);

    writer
        .write_record(["user", "balance", "version"])
        .map_err(|e| format!("Failed to write CSV header: {}", e))?;

    let mut sorted = accounts.to_vec();
    sorted.sort_by_key(|account| account.owner);

    for account in sorted {
        writer
            .write_record(&[
                account.owner.to_string(),
                account.balance.to_major(exponent).to_string(),
                account.version.to_string(),
            ])
            .map_err(|e| format!("Failed to write account record: {}", e))?;
    }

    writer
        .flush()
        .map_err(|e| format!("Failed to flush output: {}", e))
}

/// Write loan states to CSV format
///
/// Columns: loan, borrower, requested, funded, currency, status. Sorted by
/// loan id.
pub fn write_loans_csv(loans: &[Loan], exponent: u32, output: &mut dyn Write) -> Result<(), String> {
    let mut writer = csv::Writer::from_writer(output);

    writer
        .write_record(["loan", "borrower", "requested", "funded", "currency", "status"])
        .map_err(|e| format!("Failed to write CSV header: {}", e))?;

    let mut sorted = loans.to_vec();
    sorted.sort_by_key(|loan| loan.id);

    for loan in sorted {
        writer
            .write_record(&[
                loan.id.to_string(),
                loan.borrower.to_string(),
                loan.requested.to_major(exponent).to_string(),
                loan.funded.to_major(exponent).to_string(),
                loan.currency.clone(),
                loan.status.to_string(),
            ])
            .map_err(|e| format!("Failed to write loan record: {}", e))?;
    }

    writer
        .flush()
        .map_err(|e| format!("Failed to flush output: {}", e))
}

/// Write ledger entries to CSV format, in the order given
///
/// Columns: kind, loan, from, to, amount, outcome, reason. Funding entries
/// move money from the lender to the borrower; wallet credits have only a
/// `to` side and debits only a `from` side.
pub fn write_ledger_csv(
    entries: &[LedgerEntry],
    exponent: u32,
    output: &mut dyn Write,
) -> Result<(), String> {
    let mut writer = csv::Writer::from_writer(output);

    writer
        .write_record(["kind", "loan", "from", "to", "amount", "outcome", "reason"])
        .map_err(|e| format!("Failed to write CSV header: {}", e))?;

    for entry in entries {
        let row = match entry {
            LedgerEntry::Funding(tx) => [
                "funding".to_string(),
                tx.loan.to_string(),
                tx.lender.to_string(),
                tx.borrower.map(|b| b.to_string()).unwrap_or_default(),
                tx.amount.to_major(exponent).to_string(),
                tx.outcome.to_string(),
                tx.error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
            ],
            LedgerEntry::Wallet(wallet) => {
                let (kind, from, to) = match wallet.kind {
                    WalletEntryKind::Credit => ("credit", String::new(), wallet.owner.to_string()),
                    WalletEntryKind::Debit => ("debit", wallet.owner.to_string(), String::new()),
                };
                [
                    kind.to_string(),
                    String::new(),
                    from,
                    to,
                    wallet.amount.to_major(exponent).to_string(),
                    "committed".to_string(),
                    String::new(),
                ]
            }
        };

        writer
            .write_record(&row)
            .map_err(|e| format!("Failed to write ledger record: {}", e))?;
    }

    writer
        .flush()
        .map_err(|e| format!("Failed to flush output: {}", e))
}
