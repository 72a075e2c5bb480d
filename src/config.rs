//! Engine configuration

use std::time::Duration;
use tracing::warn;

/// Tunables shared by the coordinator, wallet manager and loan registry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// Attempts a funding call makes before surfacing `Conflict`
    pub max_attempts: u32,
    /// How long a completed idempotency key is remembered
    pub idempotency_ttl: Duration,
    /// ISO code new loans are denominated in
    pub currency: String,
    /// Decimal places between major and minor units (2 for cents)
    pub currency_exponent: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            idempotency_ttl: Duration::from_secs(24 * 60 * 60),
            currency: "USD".to_string(),
            currency_exponent: 2,
        }
    }
}

impl EngineConfig {
    /// Largest exponent whose scale factor `10^exponent` fits in a `u64`
    pub const MAX_EXPONENT: u32 = 19;

    /// Create an EngineConfig, replacing invalid values with defaults
    pub fn new(
        max_attempts: u32,
        idempotency_ttl: Duration,
        currency: impl Into<String>,
        currency_exponent: u32,
    ) -> Self {
        let default = Self::default();

        let max_attempts = if max_attempts == 0 {
            warn!(
                max_attempts,
                default = default.max_attempts,
                "Invalid max_attempts, using default"
            );
            default.max_attempts
        } else {
            max_attempts
        };

        let idempotency_ttl = if idempotency_ttl.is_zero() {
            warn!(
                default_secs = default.idempotency_ttl.as_secs(),
                "Invalid idempotency_ttl, using default"
            );
            default.idempotency_ttl
        } else {
            idempotency_ttl
        };

        let currency = currency.into();
        let currency = if currency.trim().is_empty() {
            warn!(default = %default.currency, "Empty currency code, using default");
            default.currency
        } else {
            currency.trim().to_uppercase()
        };

        let currency_exponent = if currency_exponent > Self::MAX_EXPONENT {
            warn!(
                currency_exponent,
                default = default.currency_exponent,
                "Invalid currency_exponent, using default"
            );
            default.currency_exponent
        } else {
            currency_exponent
        };

        Self {
            max_attempts,
            idempotency_ttl,
            currency,
            currency_exponent,
        }
    }

    /// Retention period as a `chrono` duration, saturating on overflow
    pub fn idempotency_ttl_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.idempotency_ttl).unwrap_or(chrono::Duration::MAX)
    }
}
