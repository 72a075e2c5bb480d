//! Benchmark suite for comparing replay strategies
//!
//! This benchmark compares the sequential and concurrent replay strategies
//! using the divan benchmarking framework.
//!
//! # Running Benchmarks
//!
//! ```bash
//! cargo bench
//! ```
//!
//! # Benchmark Inputs
//!
//! Inputs are generated into a temporary file before each benchmark. Every
//! input opens `lenders` funded wallets, requests and approves one loan per
//! ten lenders, and then has every lender fund its loan. A tenth of the
//! funding rows are retries of an earlier request token.

use loan_funding_engine::cli::StrategyType;
use loan_funding_engine::config::EngineConfig;
use loan_funding_engine::strategy::{create_strategy, ReplayConfig};
use std::fmt::Write as _;
use std::io::Write;
use tempfile::NamedTempFile;

const LENDERS: &[usize] = &[100, 1_000, 10_000];

fn main() {
    divan::main();
}

fn generate_input(lenders: usize) -> NamedTempFile {
    let loans = lenders.div_ceil(10);
    let mut csv = String::from("type,loan,user,amount,token\n");

    for lender in 0..lenders {
        let _ = writeln!(csv, "open,,{},100.00,", 1_000_000 + lender);
    }
    for loan in 0..loans {
        let _ = writeln!(csv, "request,{},{},500.00,", loan, loan);
        let _ = writeln!(csv, "approve,{},,,", loan);
    }
    for lender in 0..lenders {
        let loan = lender / 10;
        let _ = writeln!(csv, "fund,{},{},50.00,bench-{}", loan, 1_000_000 + lender, lender);
        if lender % 10 == 0 {
            let _ = writeln!(csv, "fund,{},{},50.00,bench-{}", loan, 1_000_000 + lender, lender);
        }
    }

    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(csv.as_bytes())
        .expect("Failed to write benchmark input");
    file.flush().expect("Failed to flush benchmark input");
    file
}

fn bench_config() -> ReplayConfig {
    ReplayConfig {
        engine: EngineConfig {
            max_attempts: 1_000,
            ..EngineConfig::default()
        },
        ..ReplayConfig::default()
    }
}

/// Benchmark the sequential replay strategy
#[divan::bench(args = LENDERS)]
fn sequential_strategy(bencher: divan::Bencher, lenders: usize) {
    let input = generate_input(lenders);

    bencher.bench_local(|| {
        let strategy = create_strategy(StrategyType::Sequential, bench_config());
        let mut output = Vec::new();
        strategy
            .process(input.path(), &mut output)
            .expect("Processing failed");
    });
}

/// Benchmark the concurrent replay strategy
#[divan::bench(args = LENDERS)]
fn concurrent_strategy(bencher: divan::Bencher, lenders: usize) {
    let input = generate_input(lenders);

    bencher.bench_local(|| {
        let strategy = create_strategy(StrategyType::Concurrent, bench_config());
        let mut output = Vec::new();
        strategy
            .process(input.path(), &mut output)
            .expect("Processing failed");
    });
}
