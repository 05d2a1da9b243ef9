//! User accounts and their linked wallets
use super::error::MarketError;
use super::store::Store;
use super::types::{Actor, Role, TimeStamp, WalletAddress};
use super::utils;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Account {
    #[n(0)]
    pub user_id: String, // bech32 over uuid7
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub email: String, // notification address
    #[n(3)]
    pub role: Role,
    #[n(4)]
    pub wallet: Option<WalletAddress>,
    #[n(5)]
    pub created_at: TimeStamp<Utc>,
}

impl Account {
    pub fn actor(&self) -> Actor {
        Actor::new(self.user_id.clone(), self.role)
    }

    /// Wallet that tokens can be sent to, or `ExternalFailure` if none is linked
    pub fn require_wallet(&self) -> Result<&WalletAddress, MarketError> {
        self.wallet.as_ref().ok_or_else(|| {
            MarketError::ExternalFailure(format!("user '{}' has no linked wallet", self.user_id))
        })
    }
}

pub struct AccountRegistry {
    store: Arc<Store>,
}

impl AccountRegistry {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn register(&self, name: &str, email: &str, role: Role) -> Result<Account, MarketError> {
        if name.trim().is_empty() || !email.contains('@') {
            return Err(MarketError::InvalidArgument(
                "accounts need a name and a valid email".to_string(),
            ));
        }
        let user_id = utils::new_uuid_to_bech32("user_")
            .map_err(|e| MarketError::Storage(format!("failed to mint user id: {e}")))?;

        let account = Account {
            user_id,
            name: name.trim().to_string(),
            email: email.trim().to_string(),
            role,
            wallet: None,
            created_at: TimeStamp::new(),
        };
        Store::save(&self.store.accounts, &account.user_id, &account)?;

        info!(user_id = %account.user_id, role = ?role, "account registered");
        Ok(account)
    }

    /// Link or replace the caller's own wallet.
    pub fn link_wallet(&self, actor: &Actor, wallet: &str) -> Result<Account, MarketError> {
        let wallet = WalletAddress::parse(wallet)?;

        let account = Store::update(&self.store.accounts, &actor.user_id, "account", |mut acc: Account| {
            acc.wallet = Some(wallet.clone());
            Ok(acc)
        })?;

        info!(user_id = %account.user_id, wallet = %wallet, "wallet linked");
        Ok(account)
    }

    pub fn get(&self, user_id: &str) -> Result<Account, MarketError> {
        Store::require(&self.store.accounts, user_id, "account")
    }
}
