//! Concurrent replay strategy
//!
//! Runs runs of consecutive `fund` commands concurrently on a multi-threaded
//! tokio runtime, up to `max_in_flight` at a time. Every other command is a
//! barrier: in-flight funding finishes before it runs, and it finishes before
//! the next funding run starts.
//!
//! ```text
//! open, open, request, approve │ fund fund fund fund │ deposit │ fund fund
//!        (one at a time)       │  (buffer_unordered) │ barrier │   (...)
//! ```
//!
//! Within a funding run the commit order is up to the scheduler, so the
//! ledger order can differ between runs. The wallet and loan reports only
//! differ when funding in the same run competes for the same balance or the
//! same loan remainder.

use crate::core::FundingEngine;
use crate::io::sync_reader::SyncReader;
use crate::strategy::{ReplayConfig, ReplayStrategy};
use crate::types::Command;
use futures::stream::{self, StreamExt};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Funding commands buffered before a run is flushed even without a barrier
const MAX_FUNDING_RUN: usize = 1000;

#[derive(Debug, Default)]
struct Tally {
    processed: usize,
    failed: usize,
}

/// Concurrent replay strategy
#[derive(Debug, Clone)]
pub struct ConcurrentStrategy {
    config: ReplayConfig,
}

impl ConcurrentStrategy {
    pub fn new(config: ReplayConfig) -> Self {
        let max_in_flight = if config.max_in_flight == 0 {
            let default = ReplayConfig::default().max_in_flight;
            warn!(default, "Invalid max_in_flight (0), using default");
            default
        } else {
            config.max_in_flight
        };

        Self {
            config: ReplayConfig {
                max_in_flight,
                ..config
            },
        }
    }

    async fn run_funding(
        &self,
        engine: &Arc<FundingEngine>,
        run: Vec<Command>,
        tally: &mut Tally,
    ) {
        let mut results = stream::iter(run)
            .map(|command| {
                let engine = Arc::clone(engine);
                tokio::spawn(async move { engine.process(command).await })
            })
            .buffer_unordered(self.config.max_in_flight);

        while let Some(joined) = results.next().await {
            tally.processed += 1;
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(command = "fund", error = %e, "Command failed");
                    tally.failed += 1;
                }
                Err(e) => {
                    error!(error = %e, "Funding task panicked");
                    tally.failed += 1;
                }
            }
        }
    }
}

impl ReplayStrategy for ConcurrentStrategy {
    fn process(&self, input_path: &Path, output: &mut dyn Write) -> Result<(), String> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.config.max_in_flight.min(num_cpus::get()).max(1))
            .enable_time()
            .build()
            .map_err(|e| format!("Failed to create tokio runtime: {}", e))?;

        runtime.block_on(async {
            let engine = Arc::new(self.config.build_engine()?);
            let reader = SyncReader::new(input_path, self.config.engine.currency_exponent)?;

            let mut tally = Tally::default();
            let mut run: Vec<Command> = Vec::new();

            for result in reader {
                let command = match result {
                    Ok(command) => command,
                    Err(e) => {
                        warn!(error = %e, "Skipping unreadable row");
                        tally.failed += 1;
                        continue;
                    }
                };

                if command.is_fund() {
                    run.push(command);
                    if run.len() >= MAX_FUNDING_RUN {
                        self.run_funding(&engine, std::mem::take(&mut run), &mut tally)
                            .await;
                    }
                    continue;
                }

                if !run.is_empty() {
                    self.run_funding(&engine, std::mem::take(&mut run), &mut tally)
                        .await;
                }

                let name = command.name();
                if let Err(e) = engine.process(command).await {
                    warn!(command = name, error = %e, "Command failed");
                    tally.failed += 1;
                }
                tally.processed += 1;
            }

            if !run.is_empty() {
                self.run_funding(&engine, run, &mut tally).await;
            }

            info!(
                processed = tally.processed,
                failed = tally.failed,
                "Replay finished"
            );
            self.config.write_report(&engine, output)
        })
    }
}
