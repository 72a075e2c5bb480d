//! Append-only commit journal
//!
//! Gives the in-memory ledger store durability. Every commit is written as one
//! JSON line holding the post-commit records and the appended ledger entries,
//! and flushed before the commit becomes visible. Opening a store on an
//! existing journal replays the lines in order.
//!
//! A crash in the middle of a write leaves a line without its trailing
//! newline. That commit never returned to its caller, so on open the torn tail
//! is truncated away and replay ignores it.
//!
//! A write that fails while the process keeps running is cut back to the last
//! complete line before the error is returned, so a commit reported as failed
//! is never replayed. If that rollback fails too, the journal refuses every
//! later append.

use crate::types::{FundingError, LedgerEntry, Loan, WalletAccount};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, error, warn};

/// One committed ledger transaction as written to the journal
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalRecord {
    /// Wallets as stored after the commit (versions already bumped)
    pub accounts: Vec<WalletAccount>,
    /// Loans as stored after the commit (versions already bumped)
    pub loans: Vec<Loan>,
    /// Ledger entries appended by the commit
    pub entries: Vec<LedgerEntry>,
}

/// Byte sink a journal appends to
trait JournalSink: Write + Send + fmt::Debug {
    /// Cut the sink back to `len` bytes
    fn truncate(&mut self, len: u64) -> io::Result<()>;
    /// Make written bytes durable
    fn sync(&mut self) -> io::Result<()>;
}

impl JournalSink for File {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

#[derive(Debug)]
struct JournalWriter {
    sink: Box<dyn JournalSink>,
    /// Length of the journal up to and including the last complete line
    len: u64,
    poisoned: bool,
}

impl JournalWriter {
    fn write_line(&mut self, line: &[u8], sync: bool) -> io::Result<()> {
        self.sink.write_all(line)?;
        self.sink.flush()?;
        if sync {
            self.sink.sync()?;
        }
        Ok(())
    }
}

/// Journal file handle
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    writer: Mutex<JournalWriter>,
    sync_on_commit: bool,
}

impl Journal {
    /// Open (or create) a journal and return the records already in it
    ///
    /// Creates the parent directory if it doesn't exist.
    pub fn open(
        path: &Path,
        sync_on_commit: bool,
    ) -> Result<(Self, Vec<JournalRecord>), FundingError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        let complete_len = contents.rfind('\n').map(|i| i + 1).unwrap_or(0);
        if complete_len < contents.len() {
            warn!(
                path = %path.display(),
                torn_bytes = contents.len() - complete_len,
                "Truncating torn journal tail"
            );
            file.set_len(complete_len as u64)?;
        }

        let mut records = Vec::new();
        for (index, line) in contents[..complete_len].lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: JournalRecord =
                serde_json::from_str(line).map_err(|e| FundingError::Storage {
                    message: format!(
                        "corrupt journal line {} in '{}': {}",
                        index + 1,
                        path.display(),
                        e
                    ),
                })?;
            records.push(record);
        }

        debug!(path = %path.display(), records = records.len(), "Journal opened");

        let journal = Journal::with_sink(path, Box::new(file), complete_len as u64, sync_on_commit);

        Ok((journal, records))
    }

    fn with_sink(path: &Path, sink: Box<dyn JournalSink>, len: u64, sync_on_commit: bool) -> Self {
        Journal {
            path: path.to_path_buf(),
            writer: Mutex::new(JournalWriter {
                sink,
                len,
                poisoned: false,
            }),
            sync_on_commit,
        }
    }

    /// Durably append one commit
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the line could not be written, flushed or synced.
    /// The journal is then rolled back to its previous length. If the rollback
    /// fails as well, this and every later append returns `Storage`.
    pub fn append(&self, record: &JournalRecord) -> Result<(), FundingError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if writer.poisoned {
            return Err(FundingError::Storage {
                message: format!(
                    "journal '{}' is unusable after a failed rollback",
                    self.path.display()
                ),
            });
        }

        match writer.write_line(&line, self.sync_on_commit) {
            Ok(()) => {
                writer.len += line.len() as u64;
                Ok(())
            }
            Err(e) => {
                let len = writer.len;
                match writer.sink.truncate(len) {
                    Ok(()) => warn!(
                        path = %self.path.display(),
                        error = %e,
                        "Journal append failed, rolled back"
                    ),
                    Err(rollback) => {
                        error!(
                            path = %self.path.display(),
                            error = %e,
                            rollback_error = %rollback,
                            "Journal rollback failed, refusing further appends"
                        );
                        writer.poisoned = true;
                    }
                }
                Err(e.into())
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
