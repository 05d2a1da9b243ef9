//! Outbound ports: the external systems the engines orchestrate.
//!
//! None of these are implemented here. Production wires real clients in,
//! tests use the in-memory versions from [`crate::adapters`].

use crate::error::MarketError;
use crate::types::{Credits, SignerId, WalletAddress};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Reference to a confirmed on-chain transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: String,
    pub block_number: u64,
}

/// What the ledger knows about an externally submitted payment transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentReceipt {
    pub tx_hash: String,
    pub payer: WalletAddress,
    pub recipient: WalletAddress,
    pub amount: u64,
    pub confirmed: bool,
}

/// ERC-20 style token ledger.
#[async_trait]
pub trait TokenLedger: Send + Sync {
    /// Current token balance of a wallet.
    async fn balance_of(&self, address: &WalletAddress) -> Result<Credits, MarketError>;

    /// Move `amount` tokens from the account behind `signer` to `to`. An
    /// issuing signer mints instead.
    ///
    /// # Returns
    /// - `Ok(receipt)`: the transfer is confirmed on chain
    /// - `Err(ExternalFailure)`: network error, revert or insufficient signer balance
    async fn transfer(
        &self,
        signer: &SignerId,
        to: &WalletAddress,
        amount: Credits,
    ) -> Result<TxReceipt, MarketError>;

    /// Move `amount` tokens out of `from` on the strength of the allowance
    /// `from` granted to `signer`.
    ///
    /// # Returns
    /// - `Ok(receipt)`: the transfer is confirmed on chain
    /// - `Err(ExternalFailure)`: network error, revert, missing allowance or balance
    async fn transfer_from(
        &self,
        signer: &SignerId,
        from: &WalletAddress,
        to: &WalletAddress,
        amount: Credits,
    ) -> Result<TxReceipt, MarketError>;

    /// Look up a payment transaction by hash. `Ok(None)` when unknown.
    async fn payment_receipt(&self, tx_hash: &str) -> Result<Option<PaymentReceipt>, MarketError>;
}

/// Content addressed blob store for evidence documents.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Store a blob and return its content identifier.
    async fn put(&self, bytes: &[u8], filename: &str) -> Result<String, MarketError>;
}

/// Fire-and-forget messaging.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), MarketError>;
}

/// Run an external call under a deadline, mapping expiry to `ExternalFailure`.
pub(crate) async fn with_timeout<T, F>(limit: Duration, what: &str, call: F) -> Result<T, MarketError>
where
    F: Future<Output = Result<T, MarketError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(|err| match err {
            MarketError::ExternalFailure(_) => err,
            other => MarketError::ExternalFailure(format!("{what}: {other}")),
        }),
        Err(_) => Err(MarketError::ExternalFailure(format!(
            "{what} timed out after {}ms",
            limit.as_millis()
        ))),
    }
}

/// Deliver a notification, logging and swallowing any failure.
pub(crate) async fn notify_best_effort(
    notifier: &dyn Notifier,
    limit: Duration,
    recipient: &str,
    subject: &str,
    body: &str,
) {
    match tokio::time::timeout(limit, notifier.send(recipient, subject, body)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(recipient, subject, %err, "notification failed"),
        Err(_) => warn!(recipient, subject, "notification timed out"),
    }
}
