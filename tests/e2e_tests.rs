//! End-to-end integration tests
//!
//! These tests validate the complete replay pipeline using predefined CSV
//! test fixtures. Each test:
//! 1. Reads input.csv from a fixture directory
//! 2. Replays all commands through the engine
//! 3. Writes the fixture's report
//! 4. Compares actual output with expected.csv
//!
//! Test fixtures are located in tests/fixtures/ and cover:
//! - Happy path funding
//! - Retried requests with the same token
//! - The loan lifecycle (approve, reject, default, terminal states)
//! - Funding rejections (insufficient funds, unknown wallets, self-funding)
//! - Malformed rows
//!
//! Each test is run twice: once with the sequential strategy and once with the
//! concurrent strategy.

#[cfg(test)]
mod tests {
    use loan_funding_engine::cli::{ReportKind, StrategyType};
    use loan_funding_engine::config::EngineConfig;
    use loan_funding_engine::strategy::{create_strategy, ReplayConfig};
    use rstest::rstest;
    use std::fs;
    use std::io::Write;
    use std::path::Path;
    use tempfile::{NamedTempFile, TempDir};

    /// Replay settings for fixtures
    ///
    /// Concurrent funding of one loan contends on the loan record, so the
    /// attempt budget is raised well above what a fixture can exhaust.
    fn fixture_config(report: ReportKind) -> ReplayConfig {
        ReplayConfig {
            engine: EngineConfig {
                max_attempts: 1_000,
                ..EngineConfig::default()
            },
            report,
            max_in_flight: 4,
            ..ReplayConfig::default()
        }
    }

    fn replay(strategy_type: StrategyType, config: ReplayConfig, input_path: &Path) -> String {
        let strategy = create_strategy(strategy_type, config);

        let mut temp_output = NamedTempFile::new().expect("Failed to create temp file");
        strategy
            .process(input_path, &mut temp_output)
            .unwrap_or_else(|e| panic!("Failed to replay commands: {}", e));
        temp_output.flush().expect("Failed to flush temp file");

        fs::read_to_string(temp_output.path())
            .unwrap_or_else(|e| panic!("Failed to read temp output file: {}", e))
    }

    /// Run a test fixture by replaying input.csv and comparing with expected.csv
    ///
    /// # Panics
    ///
    /// Panics if:
    /// - Input or expected files cannot be read
    /// - Output doesn't match expected
    fn run_test_fixture(fixture_name: &str, report: ReportKind, strategy_type: StrategyType) {
        let fixture_dir = format!("tests/fixtures/{}", fixture_name);
        let input_path = format!("{}/input.csv", fixture_dir);
        let expected_path = format!("{}/expected.csv", fixture_dir);

        assert!(
            Path::new(&input_path).exists(),
            "Input file not found: {}",
            input_path
        );
        assert!(
            Path::new(&expected_path).exists(),
            "Expected file not found: {}",
            expected_path
        );

        let actual_output = replay(strategy_type, fixture_config(report), Path::new(&input_path));

        let expected_output = fs::read_to_string(&expected_path)
            .unwrap_or_else(|e| panic!("Failed to read expected file {}: {}", expected_path, e));

        assert_eq!(
            actual_output, expected_output,
            "\n\nOutput mismatch for fixture: {} (strategy: {:?})\n\nActual output:\n{}\n\nExpected output:\n{}\n",
            fixture_name, strategy_type, actual_output, expected_output
        );
    }

    /// End-to-end test for all fixtures with both replay strategies
    #[rstest]
    #[case("happy_path", ReportKind::Accounts)]
    #[case("idempotent_retries", ReportKind::Accounts)]
    #[case("loan_lifecycle", ReportKind::Loans)]
    #[case("funding_rejections", ReportKind::Accounts)]
    #[case("malformed_data", ReportKind::Accounts)]
    fn test_fixtures(
        #[case] fixture: &str,
        #[case] report: ReportKind,
        #[values(StrategyType::Sequential, StrategyType::Concurrent)] strategy: StrategyType,
    ) {
        run_test_fixture(fixture, report, strategy);
    }

    /// A second replay against the same journal recovers the first run's
    /// state and idempotency keys, so re-sent funding is not applied twice.
    #[rstest]
    fn test_journal_survives_restart(
        #[values(StrategyType::Sequential, StrategyType::Concurrent)] strategy: StrategyType,
    ) {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let journal = dir.path().join("funding.journal");
        let config = ReplayConfig {
            journal: Some(journal.clone()),
            ..fixture_config(ReportKind::Accounts)
        };

        let first = dir.path().join("first.csv");
        fs::write(
            &first,
            "type,loan,user,amount,token\n\
             open,,2,500.00,\n\
             request,1,1,300.00,\n\
             approve,1,,,\n\
             fund,1,2,100.00,tok-1\n",
        )
        .unwrap();
        assert_eq!(
            replay(strategy, config.clone(), &first),
            "user,balance,version\n1,100.00,1\n2,400.00,2\n"
        );
        assert!(journal.exists());

        let second = dir.path().join("second.csv");
        fs::write(
            &second,
            "type,loan,user,amount,token\n\
             fund,1,2,100.00,tok-1\n\
             fund,1,2,100.00,tok-2\n",
        )
        .unwrap();
        assert_eq!(
            replay(strategy, config.clone(), &second),
            "user,balance,version\n1,200.00,2\n2,300.00,3\n"
        );

        let header_only = dir.path().join("header_only.csv");
        fs::write(&header_only, "type,loan,user,amount,token\n").unwrap();
        let loans = replay(
            strategy,
            ReplayConfig {
                report: ReportKind::Loans,
                ..config
            },
            &header_only,
        );
        assert_eq!(
            loans,
            "loan,borrower,requested,funded,currency,status\n1,1,300.00,200.00,USD,approved\n"
        );
    }
}
