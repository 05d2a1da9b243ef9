//! Engine configuration, built once at the edge and injected into the engines.

use super::types::{SignerId, WalletAddress};
use std::env;
use std::time::Duration;

pub const DEFAULT_ESCROW_WALLET: &str = "0x00000000000000000000000000000000000e5c40";

#[derive(Debug, Clone)]
pub struct MarketConfig {
    /// Credential the ledger uses to mint/transfer issued credits to developers
    pub regulator_signer: SignerId,
    /// Credential controlling the escrow wallet. It pulls listed credits from
    /// sellers and pays them out to buyers or back to the seller.
    pub settlement_signer: SignerId,
    /// Wallet holding listed credits until they are sold or the listing ends
    pub escrow_wallet: WalletAddress,
    /// Upper bound on every token ledger call
    pub ledger_timeout: Duration,
    /// Upper bound on evidence uploads
    pub file_store_timeout: Duration,
    /// Upper bound on a single notification attempt
    pub notify_timeout: Duration,
    /// Refuse purchases that carry no external payment reference
    pub require_payment_ref: bool,
    /// Age after which a reservation or issuance marker is treated as
    /// abandoned. Must exceed two ledger timeouts.
    pub in_flight_ttl: Duration,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            regulator_signer: SignerId("regulator".to_string()),
            settlement_signer: SignerId("settlement".to_string()),
            escrow_wallet: WalletAddress::from_canonical(DEFAULT_ESCROW_WALLET),
            ledger_timeout: Duration::from_secs(30),
            file_store_timeout: Duration::from_secs(60),
            notify_timeout: Duration::from_secs(5),
            require_payment_ref: false,
            in_flight_ttl: Duration::from_secs(90),
        }
    }
}

impl MarketConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `GREENBLOCKS_REGULATOR_SIGNER`: issuance signer (default: regulator)
    /// - `GREENBLOCKS_SETTLEMENT_SIGNER`: escrow signer (default: settlement)
    /// - `GREENBLOCKS_ESCROW_WALLET`: escrow address, ignored when malformed
    /// - `GREENBLOCKS_LEDGER_TIMEOUT_MS`: ledger call cap (default: 30000)
    /// - `GREENBLOCKS_FILE_STORE_TIMEOUT_MS`: upload cap (default: 60000)
    /// - `GREENBLOCKS_NOTIFY_TIMEOUT_MS`: notification cap (default: 5000)
    /// - `GREENBLOCKS_REQUIRE_PAYMENT_REF`: require payment refs (default: false)
    /// - `GREENBLOCKS_IN_FLIGHT_TTL_MS`: abandoned hold cutoff (default: 90000)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            regulator_signer: env::var("GREENBLOCKS_REGULATOR_SIGNER")
                .map(SignerId)
                .unwrap_or(defaults.regulator_signer),

            settlement_signer: env::var("GREENBLOCKS_SETTLEMENT_SIGNER")
                .map(SignerId)
                .unwrap_or(defaults.settlement_signer),

            escrow_wallet: env::var("GREENBLOCKS_ESCROW_WALLET")
                .ok()
                .and_then(|v| WalletAddress::parse(&v).ok())
                .unwrap_or(defaults.escrow_wallet),

            ledger_timeout: millis_var("GREENBLOCKS_LEDGER_TIMEOUT_MS")
                .unwrap_or(defaults.ledger_timeout),

            file_store_timeout: millis_var("GREENBLOCKS_FILE_STORE_TIMEOUT_MS")
                .unwrap_or(defaults.file_store_timeout),

            notify_timeout: millis_var("GREENBLOCKS_NOTIFY_TIMEOUT_MS")
                .unwrap_or(defaults.notify_timeout),

            require_payment_ref: env::var("GREENBLOCKS_REQUIRE_PAYMENT_REF")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(defaults.require_payment_ref),

            in_flight_ttl: millis_var("GREENBLOCKS_IN_FLIGHT_TTL_MS")
                .unwrap_or(defaults.in_flight_ttl),
        }
    }

    pub fn with_ledger_timeout(mut self, timeout: Duration) -> Self {
        self.ledger_timeout = timeout;
        self
    }
    pub fn with_required_payment_ref(mut self, required: bool) -> Self {
        self.require_payment_ref = required;
        self
    }
    pub fn with_in_flight_ttl(mut self, ttl: Duration) -> Self {
        self.in_flight_ttl = ttl;
        self
    }
}

fn millis_var(name: &str) -> Option<Duration> {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
}
