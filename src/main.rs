//! Loan Funding Engine CLI
//!
//! Command-line interface for replaying loan funding commands from CSV files.
//!
//! # Usage
//!
//! ```bash
//! cargo run -- commands.csv > accounts.csv
//! cargo run -- --report loans commands.csv > loans.csv
//! cargo run -- --strategy concurrent --max-in-flight 8 commands.csv > accounts.csv
//! cargo run -- --journal funding.journal --report ledger commands.csv > ledger.csv
//! ```
//!
//! The program reads command records from the input CSV file, runs them through
//! the funding engine using the selected strategy, and writes the selected
//! report to stdout. Logs go to stderr.
//!
//! # Exit Codes
//!
//! - 0: Success (individual commands may still have been rejected)
//! - 1: Error (file not found, corrupt journal, output not writable, etc.)

use loan_funding_engine::{cli, logging, strategy};
use std::process;
use tracing::error;

fn main() {
    // Parse command-line arguments using clap
    let args = cli::parse_args();
    logging::init_logging(&args.log_level, args.log_json);

    let strategy = strategy::create_strategy(args.strategy, args.to_replay_config());

    // Output goes to stdout
    let mut output = std::io::stdout();
    if let Err(e) = strategy.process(&args.input_file, &mut output) {
        error!(error = %e, "Replay failed");
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
