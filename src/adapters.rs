//! In-memory implementations of the outbound ports.
//!
//! Used by the test-suite and the demo. They behave like the real services
//! closely enough to exercise the failure paths: transfers can be made to
//! fail or stall, uploads can be refused, notifications can error.

use crate::error::MarketError;
use crate::ports::{FileStore, Notifier, PaymentReceipt, TokenLedger, TxReceipt};
use crate::types::{Credits, SignerId, WalletAddress};
use crate::utils::content_digest;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRecord {
    pub signer: SignerId,
    pub from: Option<WalletAddress>, // None when minted
    pub to: WalletAddress,
    pub amount: Credits,
    pub receipt: TxReceipt,
}

#[derive(Default)]
struct LedgerState {
    balances: HashMap<WalletAddress, Credits>,
    // signers without an account mint new tokens
    signer_accounts: HashMap<SignerId, WalletAddress>,
    payments: HashMap<String, PaymentReceipt>,
    transfers: Vec<TransferRecord>,
    failures_pending: usize,
    block_number: u64,
}

impl LedgerState {
    fn take_failure(&mut self) -> Result<(), MarketError> {
        if self.failures_pending > 0 {
            self.failures_pending -= 1;
            return Err(MarketError::ExternalFailure(
                "transfer reverted: execution reverted".to_string(),
            ));
        }
        Ok(())
    }

    fn move_tokens(
        &mut self,
        signer: &SignerId,
        from: Option<&WalletAddress>,
        to: &WalletAddress,
        amount: Credits,
    ) -> Result<TxReceipt, MarketError> {
        if let Some(from) = from {
            let held = self.balances.get(from).copied().unwrap_or(0);
            if held < amount {
                return Err(MarketError::ExternalFailure(format!(
                    "transfer reverted: {from} holds {held}, needs {amount}"
                )));
            }
            self.balances.insert(from.clone(), held - amount);
        }
        let held = self.balances.get(to).copied().unwrap_or(0);
        let Some(credited) = held.checked_add(amount) else {
            if let Some(from) = from {
                *self.balances.entry(from.clone()).or_default() += amount;
            }
            return Err(MarketError::ExternalFailure(format!(
                "transfer reverted: balance of {to} overflows"
            )));
        };
        self.balances.insert(to.clone(), credited);
        self.block_number += 1;

        let receipt = TxReceipt {
            tx_hash: format!(
                "0x{}",
                content_digest(format!("{signer}:{to}:{amount}:{}", self.block_number).as_bytes())
            ),
            block_number: self.block_number,
        };
        self.transfers.push(TransferRecord {
            signer: signer.clone(),
            from: from.cloned(),
            to: to.clone(),
            amount,
            receipt: receipt.clone(),
        });
        Ok(receipt)
    }
}

#[derive(Default)]
pub struct InMemoryTokenLedger {
    state: Mutex<LedgerState>,
    delay: Mutex<Option<Duration>>,
}

impl InMemoryTokenLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transfers signed by `signer` are paid out of `account`.
    pub fn with_signer_account(mut self, signer: SignerId, account: WalletAddress) -> Self {
        self.state.get_mut().signer_accounts.insert(signer, account);
        self
    }

    pub async fn mint(&self, to: &WalletAddress, amount: Credits) {
        let mut state = self.state.lock().await;
        *state.balances.entry(to.clone()).or_default() += amount;
    }

    /// The next `count` transfers fail with a revert.
    pub async fn fail_next_transfers(&self, count: usize) {
        self.state.lock().await.failures_pending = count;
    }

    /// Every call sleeps this long before answering.
    pub async fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().await = delay;
    }

    pub async fn transfers(&self) -> Vec<TransferRecord> {
        self.state.lock().await.transfers.clone()
    }

    /// Sum of every balance, minting is the only way it grows.
    pub async fn total_supply(&self) -> Credits {
        self.state.lock().await.balances.values().sum()
    }

    /// Register a payment as an external wallet would have submitted it.
    pub async fn record_payment(
        &self,
        payer: &WalletAddress,
        recipient: &WalletAddress,
        amount: u64,
        confirmed: bool,
    ) -> String {
        let mut state = self.state.lock().await;
        state.block_number += 1;
        let tx_hash = format!(
            "0x{}",
            content_digest(format!("pay:{payer}:{recipient}:{amount}:{}", state.block_number).as_bytes())
        );
        state.payments.insert(
            tx_hash.clone(),
            PaymentReceipt {
                tx_hash: tx_hash.clone(),
                payer: payer.clone(),
                recipient: recipient.clone(),
                amount,
                confirmed,
            },
        );
        tx_hash
    }

    async fn stall(&self) {
        let delay = *self.delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl TokenLedger for InMemoryTokenLedger {
    async fn balance_of(&self, address: &WalletAddress) -> Result<Credits, MarketError> {
        self.stall().await;
        Ok(self
            .state
            .lock()
            .await
            .balances
            .get(address)
            .copied()
            .unwrap_or(0))
    }

    async fn transfer(
        &self,
        signer: &SignerId,
        to: &WalletAddress,
        amount: Credits,
    ) -> Result<TxReceipt, MarketError> {
        self.stall().await;
        let mut state = self.state.lock().await;
        state.take_failure()?;

        let from = state.signer_accounts.get(signer).cloned();
        state.move_tokens(signer, from.as_ref(), to, amount)
    }

    async fn transfer_from(
        &self,
        signer: &SignerId,
        from: &WalletAddress,
        to: &WalletAddress,
        amount: Credits,
    ) -> Result<TxReceipt, MarketError> {
        self.stall().await;
        let mut state = self.state.lock().await;
        state.take_failure()?;
        state.move_tokens(signer, Some(from), to, amount)
    }

    async fn payment_receipt(&self, tx_hash: &str) -> Result<Option<PaymentReceipt>, MarketError> {
        self.stall().await;
        Ok(self.state.lock().await.payments.get(tx_hash).cloned())
    }
}

/// Content addressed store keyed by the sha256 of the blob
#[derive(Default)]
pub struct InMemoryFileStore {
    blobs: Mutex<HashMap<String, (String, Vec<u8>)>>,
    refuse: AtomicBool,
}

impl InMemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn refuse_uploads(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
    pub async fn get(&self, content_id: &str) -> Option<Vec<u8>> {
        self.blobs
            .lock()
            .await
            .get(content_id)
            .map(|(_, bytes)| bytes.clone())
    }
}

#[async_trait]
impl FileStore for InMemoryFileStore {
    async fn put(&self, bytes: &[u8], filename: &str) -> Result<String, MarketError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(MarketError::ExternalFailure(format!(
                "upload of '{filename}' rejected by store"
            )));
        }
        let content_id = content_digest(bytes);
        self.blobs
            .lock()
            .await
            .insert(content_id.clone(), (filename.to_string(), bytes.to_vec()));
        Ok(content_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentNotification {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentNotification>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
    pub async fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), MarketError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(MarketError::ExternalFailure("smtp unavailable".to_string()));
        }
        self.sent.lock().await.push(SentNotification {
            recipient: recipient.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}

/// Writes notifications to the log instead of delivering them
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), MarketError> {
        info!(recipient, subject, body, "notification");
        Ok(())
    }
}
