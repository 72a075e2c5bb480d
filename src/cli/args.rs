use crate::config::EngineConfig;
use crate::strategy::ReplayConfig;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

/// Replay loan funding commands and report the resulting state
#[derive(Parser, Debug)]
#[command(name = "loan-funding-engine")]
#[command(about = "Replay loan funding commands and report the resulting state", long_about = None)]
pub struct CliArgs {
    /// Input CSV file path containing command records
    #[arg(value_name = "INPUT", help = "Path to the input CSV file")]
    pub input_file: PathBuf,

    /// Execution strategy to use for replaying commands
    #[arg(
        long = "strategy",
        value_name = "STRATEGY",
        default_value = "sequential",
        help = "Replay strategy: 'sequential' or 'concurrent'"
    )]
    pub strategy: StrategyType,

    #[arg(
        long = "max-attempts",
        value_name = "COUNT",
        help = "Optimistic commit attempts per funding call (default: 3)"
    )]
    pub max_attempts: Option<u32>,

    #[arg(
        long = "idempotency-ttl-secs",
        value_name = "SECS",
        help = "How long completed request tokens are remembered (default: 86400)"
    )]
    pub idempotency_ttl_secs: Option<u64>,

    #[arg(
        long = "currency",
        value_name = "CODE",
        help = "Currency code for new loans (default: USD)"
    )]
    pub currency: Option<String>,

    #[arg(
        long = "exponent",
        value_name = "DIGITS",
        help = "Decimal places in the input and reports (default: 2)"
    )]
    pub exponent: Option<u32>,

    /// Journal file; state is recovered from it and every commit is appended
    #[arg(long = "journal", value_name = "PATH")]
    pub journal: Option<PathBuf>,

    /// Maximum concurrent funding calls (concurrent mode only)
    #[arg(
        long = "max-in-flight",
        value_name = "COUNT",
        help = "Maximum funding calls in flight at once (default: CPU cores)"
    )]
    pub max_in_flight: Option<usize>,

    #[arg(
        long = "report",
        value_name = "REPORT",
        default_value = "accounts",
        help = "Report written to stdout: 'accounts', 'loans' or 'ledger'"
    )]
    pub report: ReportKind,

    /// Log filter, overridden by RUST_LOG
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long = "log-json")]
    pub log_json: bool,
}

/// Available replay strategies
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StrategyType {
    Sequential,
    Concurrent,
}

/// Reports the replay can write
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ReportKind {
    /// One row per wallet
    Accounts,
    /// One row per loan
    Loans,
    /// Every ledger entry in commit order
    Ledger,
}

impl CliArgs {
    /// Create a ReplayConfig from CLI arguments
    ///
    /// Options that are not given fall back to their defaults. Invalid values
    /// (zero attempts, zero TTL, blank currency, oversized exponent) are
    /// replaced with defaults and logged by [`EngineConfig::new`].
    pub fn to_replay_config(&self) -> ReplayConfig {
        let default = ReplayConfig::default();

        let engine = EngineConfig::new(
            self.max_attempts.unwrap_or(default.engine.max_attempts),
            self.idempotency_ttl_secs
                .map(Duration::from_secs)
                .unwrap_or(default.engine.idempotency_ttl),
            self.currency
                .clone()
                .unwrap_or_else(|| default.engine.currency.clone()),
            self.exponent.unwrap_or(default.engine.currency_exponent),
        );

        ReplayConfig {
            engine,
            journal: self.journal.clone(),
            report: self.report,
            max_in_flight: self.max_in_flight.unwrap_or(default.max_in_flight),
        }
    }
}
