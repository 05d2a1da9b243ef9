//! Wiring for the whole credit lifecycle on top of one sled database
use super::account::AccountRegistry;
use super::claim_engine::ClaimEngine;
use super::config::MarketConfig;
use super::error::MarketError;
use super::marketplace::MarketplaceEngine;
use super::mrv::MrvStore;
use super::ownership::OwnershipLedger;
use super::ports::{FileStore, Notifier, TokenLedger};
use super::project::ProjectRegistry;
use super::store::Store;
use std::sync::Arc;

pub struct GreenBlocksService {
    pub accounts: AccountRegistry,
    pub projects: ProjectRegistry,
    pub mrv: MrvStore,
    pub claims: ClaimEngine,
    pub marketplace: MarketplaceEngine,
    pub ownership: OwnershipLedger,
    store: Arc<Store>,
}

impl GreenBlocksService {
    pub fn new(
        instance: Arc<sled::Db>,
        ledger: Arc<dyn TokenLedger>,
        files: Arc<dyn FileStore>,
        notifier: Arc<dyn Notifier>,
        config: MarketConfig,
    ) -> Result<Self, MarketError> {
        let store = Arc::new(Store::open(instance)?);

        Ok(Self {
            accounts: AccountRegistry::new(store.clone()),
            projects: ProjectRegistry::new(store.clone()),
            mrv: MrvStore::new(store.clone(), files, config.file_store_timeout),
            claims: ClaimEngine::new(
                store.clone(),
                ledger.clone(),
                notifier.clone(),
                config.clone(),
            ),
            marketplace: MarketplaceEngine::new(store.clone(), ledger, notifier, config),
            ownership: OwnershipLedger::new(store.clone()),
            store,
        })
    }

    /// Persist everything written so far
    pub fn flush(&self) -> Result<(), MarketError> {
        self.store.flush()
    }
}
