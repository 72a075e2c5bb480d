//! Replay strategy module
//!
//! This module defines the Strategy pattern for complete replay pipelines:
//! reading commands from CSV, running them through a [`FundingEngine`], and
//! writing the selected report. Different execution models (sequential,
//! concurrent) can be selected at runtime.

use crate::cli::{ReportKind, StrategyType};
use crate::config::EngineConfig;
use crate::core::{FundingEngine, LogDispatcher};
use crate::io::csv_format::{write_accounts_csv, write_ledger_csv, write_loans_csv};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod concurrent;
pub mod sequential;

pub use concurrent::ConcurrentStrategy;
pub use sequential::SequentialStrategy;

/// Settings shared by every replay strategy
#[derive(Clone, Debug)]
pub struct ReplayConfig {
    /// Engine tunables
    pub engine: EngineConfig,
    /// Journal to recover from and append to; in-memory only when `None`
    pub journal: Option<PathBuf>,
    /// Which report to write once the replay finishes
    pub report: ReportKind,
    /// Maximum funding commands in flight at once (concurrent strategy only)
    pub max_in_flight: usize,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            journal: None,
            report: ReportKind::Accounts,
            max_in_flight: num_cpus::get(),
        }
    }
}

impl ReplayConfig {
    /// Build the engine this replay runs against
    ///
    /// Funding notifications go to the tracing log.
    pub fn build_engine(&self) -> Result<FundingEngine, String> {
        let dispatcher = Arc::new(LogDispatcher);
        match &self.journal {
            Some(path) => FundingEngine::open(path, true, dispatcher, self.engine.clone())
                .map_err(|e| format!("Failed to open journal '{}': {}", path.display(), e)),
            None => Ok(FundingEngine::in_memory(dispatcher, self.engine.clone())),
        }
    }

    /// Write the configured report for `engine` to `output`
    pub fn write_report(&self, engine: &FundingEngine, output: &mut dyn Write) -> Result<(), String> {
        let exponent = self.engine.currency_exponent;
        match self.report {
            ReportKind::Accounts => write_accounts_csv(&engine.accounts(), exponent, output),
            ReportKind::Loans => write_loans_csv(&engine.all_loans(), exponent, output),
            ReportKind::Ledger => write_ledger_csv(&engine.ledger(), exponent, output),
        }
    }
}

/// Replay strategy trait for complete command processing pipelines
pub trait ReplayStrategy: Send + Sync {
    /// Replay commands from `input_path` and write the report to `output`
    ///
    /// # Returns
    ///
    /// * `Ok(())` if the replay completed (individual commands may have failed)
    /// * `Err(String)` if a fatal error occurred
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The input file cannot be opened
    /// - The journal cannot be opened or is corrupt
    /// - The async runtime cannot be created
    /// - Output cannot be written
    ///
    /// Individual command errors are logged and processing continues with the
    /// next command.
    fn process(&self, input_path: &Path, output: &mut dyn Write) -> Result<(), String>;
}

/// Create a replay strategy based on the specified strategy type
pub fn create_strategy(strategy_type: StrategyType, config: ReplayConfig) -> Box<dyn ReplayStrategy> {
    match strategy_type {
        StrategyType::Sequential => Box::new(SequentialStrategy::new(config)),
        StrategyType::Concurrent => Box::new(ConcurrentStrategy::new(config)),
    }
}
