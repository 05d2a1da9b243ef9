//! Buyer holdings derived from settled purchases
use super::error::MarketError;
use super::listing::{Listing, Sale};
use super::store::{Store, tx_load, tx_save};
use super::types::{Credits, Price, TimeStamp};
use chrono::Utc;
use sled::transaction::{ConflictableTransactionResult, TransactionalTree, abort};
use std::sync::Arc;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipStatus {
    #[n(0)]
    Active,
    #[n(1)]
    Transferred, // reserved for secondary transfers
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct BlockchainRefs {
    #[n(0)]
    pub payment_tx_hash: Option<String>,
    #[n(1)]
    pub token_transfer_tx_hash: String,
    #[n(2)]
    pub block_number: u64,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct CreditOwnership {
    #[n(0)]
    pub buyer: String,
    #[n(1)]
    pub seller: String,
    #[n(2)]
    pub listing_id: String,
    #[n(3)]
    pub project_id: String,
    #[n(4)]
    pub claim_id: String,
    #[n(5)]
    pub credits_owned: Credits, // cumulative
    #[n(6)]
    pub purchase_price: Price, // per credit, from the first purchase
    #[n(7)]
    pub total_cost: Price, // cumulative
    #[n(8)]
    pub blockchain: BlockchainRefs, // latest purchase
    #[n(9)]
    pub status: OwnershipStatus,
    #[n(10)]
    pub acquired_at: TimeStamp<Utc>,
    #[n(11)]
    pub updated_at: TimeStamp<Utc>,
}

impl CreditOwnership {
    fn first_purchase(listing: &Listing, sale: &Sale, block_number: u64) -> Self {
        Self {
            buyer: sale.buyer.clone(),
            seller: listing.seller.clone(),
            listing_id: listing.listing_id.clone(),
            project_id: listing.project_id.clone(),
            claim_id: listing.claim_id.clone(),
            credits_owned: sale.amount,
            purchase_price: sale.price_per_credit,
            total_cost: sale.total_price,
            blockchain: BlockchainRefs {
                payment_tx_hash: sale.payment_tx_hash.clone(),
                token_transfer_tx_hash: sale.tx_hash.clone(),
                block_number,
            },
            status: OwnershipStatus::Active,
            acquired_at: sale.sold_at.clone(),
            updated_at: sale.sold_at.clone(),
        }
    }

    fn accumulate(&mut self, sale: &Sale, block_number: u64) -> Result<(), MarketError> {
        let overflow = |what: &str| {
            MarketError::InvalidArgument(format!(
                "{what} of '{}' on listing '{}' overflows",
                self.buyer, self.listing_id
            ))
        };
        let credits_owned = self
            .credits_owned
            .checked_add(sale.amount)
            .ok_or_else(|| overflow("credits owned"))?;
        let total_cost = self
            .total_cost
            .checked_add(sale.total_price)
            .ok_or_else(|| overflow("total cost"))?;

        self.credits_owned = credits_owned;
        self.total_cost = total_cost;
        self.blockchain = BlockchainRefs {
            payment_tx_hash: sale.payment_tx_hash.clone(),
            token_transfer_tx_hash: sale.tx_hash.clone(),
            block_number,
        };
        self.updated_at = sale.sold_at.clone();
        Ok(())
    }
}

pub(crate) fn ownership_key(listing_id: &str, buyer: &str) -> String {
    format!("{listing_id}/{buyer}")
}

/// Upsert the buyer's holding for a settled sale, inside the purchase
/// transaction.
pub(crate) fn record_purchase(
    ownership: &TransactionalTree,
    listing: &Listing,
    sale: &Sale,
    block_number: u64,
) -> ConflictableTransactionResult<CreditOwnership, MarketError> {
    let key = ownership_key(&listing.listing_id, &sale.buyer);

    let record = match tx_load::<CreditOwnership>(ownership, &key)? {
        Some(mut existing) if existing.status == OwnershipStatus::Active => {
            if let Err(err) = existing.accumulate(sale, block_number) {
                return abort(err);
            }
            existing
        }
        _ => CreditOwnership::first_purchase(listing, sale, block_number),
    };
    tx_save(ownership, &key, &record)?;
    Ok(record)
}

/// Totals checked by [`OwnershipLedger::audit_conservation`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConservationReport {
    pub credits_listed: Credits,
    pub credits_available: Credits,
    pub credits_sold: Credits,
    pub credits_owned: Credits,
}

pub struct OwnershipLedger {
    store: Arc<Store>,
}

impl OwnershipLedger {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn get(&self, listing_id: &str, buyer: &str) -> Result<Option<CreditOwnership>, MarketError> {
        Store::load(&self.store.ownership, &ownership_key(listing_id, buyer))
    }

    pub fn for_listing(&self, listing_id: &str) -> Result<Vec<CreditOwnership>, MarketError> {
        Store::scan(&self.store.ownership, &format!("{listing_id}/"))
    }

    pub fn holdings(&self, buyer: &str) -> Result<Vec<CreditOwnership>, MarketError> {
        let all: Vec<CreditOwnership> = Store::scan(&self.store.ownership, "")?;
        Ok(all
            .into_iter()
            .filter(|o| o.buyer == buyer && o.status == OwnershipStatus::Active)
            .collect())
    }

    /// Verify that nothing was created or lost on a listing: available plus
    /// sold equals listed, and active holdings equal what was sold.
    pub fn audit_conservation(&self, listing_id: &str) -> Result<ConservationReport, MarketError> {
        let listing: Listing = Store::require(&self.store.listings, listing_id, "listing")?;
        let credits_owned: Credits = self
            .for_listing(listing_id)?
            .iter()
            .filter(|o| o.status == OwnershipStatus::Active)
            .map(|o| o.credits_owned)
            .sum();

        let report = ConservationReport {
            credits_listed: listing.credits_listed,
            credits_available: listing.credits_available,
            credits_sold: listing.sold_credits(),
            credits_owned,
        };
        if !listing.is_conserved()
            || report.credits_owned != report.credits_sold
            || report.credits_owned > report.credits_listed
        {
            return Err(MarketError::InvalidState(format!(
                "credit conservation violated on listing '{listing_id}': {report:?}"
            )));
        }
        Ok(report)
    }
}
