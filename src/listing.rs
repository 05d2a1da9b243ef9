//! Marketplace listings.
//!
//! A listing's status is derived from `credits_available` against
//! `credits_listed`, except `Cancelled` which freezes the listing. Credits a
//! purchase is paying for are first moved into `credits_reserved` and only
//! leave `credits_available` once the token transfer has been confirmed.
//! `reserved_at` stamps the newest reservation so holds left behind by a
//! crashed process can be expired once no live purchase could still own them.
use super::error::MarketError;
use super::types::{Credits, Price, TimeStamp, WalletAddress};
use chrono::Utc;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingStatus {
    #[n(0)]
    Active,
    #[n(1)]
    Partial,
    #[n(2)]
    Sold,
    #[n(3)]
    Cancelled,
}

impl ListingStatus {
    pub fn is_purchasable(self) -> bool {
        matches!(self, ListingStatus::Active | ListingStatus::Partial)
    }
}

/// Status as a pure function of the remaining credits
pub fn derive_status(credits_available: Credits, credits_listed: Credits) -> ListingStatus {
    if credits_available == 0 {
        ListingStatus::Sold
    } else if credits_available < credits_listed {
        ListingStatus::Partial
    } else {
        ListingStatus::Active
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Sale {
    #[n(0)]
    pub buyer: String,
    #[n(1)]
    pub amount: Credits,
    #[n(2)]
    pub price_per_credit: Price,
    #[n(3)]
    pub total_price: Price,
    #[n(4)]
    pub tx_hash: String, // token transfer to the buyer
    #[n(5)]
    pub payment_tx_hash: Option<String>,
    #[n(6)]
    pub sold_at: TimeStamp<Utc>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    #[n(0)]
    pub listing_id: String,
    #[n(1)]
    pub seller: String,
    #[n(2)]
    pub seller_wallet: WalletAddress,
    #[n(3)]
    pub project_id: String,
    #[n(4)]
    pub claim_id: String,
    #[n(5)]
    pub credits_listed: Credits, // snapshot at creation
    #[n(6)]
    pub credits_available: Credits,
    #[n(7)]
    pub credits_reserved: Credits, // held by purchases awaiting their transfer
    #[n(8)]
    pub price_per_credit: Price,
    #[n(9)]
    pub status: ListingStatus,
    #[n(10)]
    pub sales: Vec<Sale>,
    #[n(11)]
    pub created_at: TimeStamp<Utc>,
    #[n(12)]
    pub updated_at: TimeStamp<Utc>,
    #[n(13)]
    pub reserved_at: Option<TimeStamp<Utc>>, // None whenever nothing is reserved
}

impl Listing {
    /// Credits a new purchase could still take.
    pub fn unreserved(&self) -> Credits {
        self.credits_available.saturating_sub(self.credits_reserved)
    }

    pub fn sold_credits(&self) -> Credits {
        self.sales.iter().map(|s| s.amount).sum()
    }

    /// `credits_available + sum(sales) == credits_listed`
    pub fn is_conserved(&self) -> bool {
        self.credits_available.checked_add(self.sold_credits()) == Some(self.credits_listed)
    }

    pub fn refresh_status(&mut self) {
        if self.status != ListingStatus::Cancelled {
            self.status = derive_status(self.credits_available, self.credits_listed);
        }
    }

    /// Hold `amount` credits for a purchase in flight.
    pub fn reserve(&mut self, amount: Credits) -> Result<(), MarketError> {
        if !self.status.is_purchasable() {
            return Err(MarketError::InvalidState(format!(
                "listing '{}' is {:?} and cannot be purchased",
                self.listing_id, self.status
            )));
        }
        if amount == 0 || amount > self.credits_available {
            return Err(MarketError::InvalidArgument(format!(
                "credits to buy must be within 1..={}, got {amount}",
                self.credits_available
            )));
        }
        if amount > self.unreserved() {
            return Err(MarketError::InvalidState(format!(
                "only {} credits of listing '{}' are free, the rest are held by purchases in flight",
                self.unreserved(),
                self.listing_id
            )));
        }
        self.credits_reserved = self.credits_reserved.checked_add(amount).ok_or_else(|| {
            MarketError::InvalidArgument(format!(
                "reserving {amount} credits overflows listing '{}'",
                self.listing_id
            ))
        })?;
        self.reserved_at = Some(TimeStamp::new());
        Ok(())
    }

    /// Give back a reservation after its transfer failed.
    pub fn release(&mut self, amount: Credits) {
        self.credits_reserved = self.credits_reserved.saturating_sub(amount);
        self.clear_idle_stamp();
    }

    /// Drop every hold when the newest one is older than `ttl`. Returns the
    /// credits handed back.
    pub fn expire_stale_reservations(&mut self, ttl: std::time::Duration) -> Credits {
        match &self.reserved_at {
            Some(at) if self.credits_reserved > 0 && at.older_than(ttl) => {
                let freed = self.credits_reserved;
                self.credits_reserved = 0;
                self.reserved_at = None;
                freed
            }
            _ => 0,
        }
    }

    fn clear_idle_stamp(&mut self) {
        if self.credits_reserved == 0 {
            self.reserved_at = None;
        }
    }

    /// Turn a reservation into a recorded sale.
    pub fn settle(&mut self, sale: Sale) -> Result<(), MarketError> {
        if sale.amount > self.credits_reserved || sale.amount > self.credits_available {
            return Err(MarketError::InvalidState(format!(
                "listing '{}' holds no reservation for {} credits",
                self.listing_id, sale.amount
            )));
        }
        self.credits_reserved -= sale.amount;
        self.credits_available -= sale.amount;
        self.clear_idle_stamp();
        self.sales.push(sale);
        self.refresh_status();
        self.updated_at = TimeStamp::new();
        Ok(())
    }
}
