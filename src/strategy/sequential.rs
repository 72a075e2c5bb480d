//! Sequential replay strategy
//!
//! Runs one command at a time, in file order, on a single-threaded tokio
//! runtime. The report is identical on every run for the same input.

use crate::io::sync_reader::SyncReader;
use crate::strategy::{ReplayConfig, ReplayStrategy};
use std::io::Write;
use std::path::Path;
use tracing::{info, warn};

/// Sequential replay strategy
///
/// # Examples
///
/// ```no_run
/// use loan_funding_engine::strategy::{ReplayConfig, ReplayStrategy, SequentialStrategy};
/// use std::path::Path;
///
/// let strategy = SequentialStrategy::new(ReplayConfig::default());
/// strategy
///     .process(Path::new("commands.csv"), &mut std::io::stdout())
///     .expect("Replay failed");
/// ```
#[derive(Debug, Clone)]
pub struct SequentialStrategy {
    config: ReplayConfig,
}

impl SequentialStrategy {
    pub fn new(config: ReplayConfig) -> Self {
        Self { config }
    }
}

impl ReplayStrategy for SequentialStrategy {
    fn process(&self, input_path: &Path, output: &mut dyn Write) -> Result<(), String> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| format!("Failed to create tokio runtime: {}", e))?;

        runtime.block_on(async {
            let engine = self.config.build_engine()?;
            let reader = SyncReader::new(input_path, self.config.engine.currency_exponent)?;

            let mut processed = 0usize;
            let mut failed = 0usize;
            for result in reader {
                let command = match result {
                    Ok(command) => command,
                    Err(e) => {
                        warn!(error = %e, "Skipping unreadable row");
                        failed += 1;
                        continue;
                    }
                };

                let name = command.name();
                if let Err(e) = engine.process(command).await {
                    warn!(command = name, error = %e, "Command failed");
                    failed += 1;
                }
                processed += 1;
            }

            info!(processed, failed, "Replay finished");
            self.config.write_report(&engine, output)
        })
    }
}
