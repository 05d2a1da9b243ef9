//! Service layer for listing issued credits and settling purchases.
//!
//! Listing pulls the offered credits from the seller's wallet into the
//! escrow wallet, so every token a buyer receives was debited from the seller
//! and never minted. Cancelling pays the unsold remainder back.
//!
//! A purchase runs in three steps:
//!
//! 1. reserve the credits on the listing (compare-and-swap), which is what
//!    stops two buyers from taking the same credits;
//! 2. verify the optional payment reference and move the tokens out of
//!    escrow on the ledger;
//! 3. commit the sale and the buyer's ownership in one transaction.
//!
//! The reservation is held by a [`Reservation`] guard that hands the credits
//! back on every exit short of a commit, including the caller dropping the
//! future. Holds left behind by a dead process expire after
//! `in_flight_ttl`. Nothing a buyer can observe (`credits_available`,
//! `sales`, ownership) changes unless the ledger confirmed the transfer.
use super::account::Account;
use super::auth;
use super::claim::{ClaimStatus, CreditClaim};
use super::config::MarketConfig;
use super::error::MarketError;
use super::listing::{Listing, ListingStatus, Sale};
use super::ownership::{CreditOwnership, record_purchase};
use super::ports::{Notifier, TokenLedger, TxReceipt, notify_best_effort, with_timeout};
use super::store::{Store, tx_require, tx_save};
use super::types::{Actor, Credits, Price, Role, TimeStamp, WalletAddress};
use super::utils;
use sled::transaction::abort;
use sled::{Transactional, Tree};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// Everything a completed purchase produced
#[derive(Debug, Clone)]
pub struct Purchase {
    pub listing: Listing,
    pub ownership: CreditOwnership,
    pub sale: Sale,
    pub receipt: TxReceipt,
}

pub struct MarketplaceEngine {
    store: Arc<Store>,
    ledger: Arc<dyn TokenLedger>,
    notifier: Arc<dyn Notifier>,
    config: MarketConfig,
}

impl MarketplaceEngine {
    pub fn new(
        store: Arc<Store>,
        ledger: Arc<dyn TokenLedger>,
        notifier: Arc<dyn Notifier>,
        config: MarketConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            notifier,
            config,
        }
    }

    /// Offer credits from an issued claim for sale.
    #[instrument(skip(self), fields(seller = %actor.user_id))]
    pub async fn list_credits(
        &self,
        actor: &Actor,
        claim_id: &str,
        credits_to_sell: Credits,
        price_per_credit: Price,
    ) -> Result<Listing, MarketError> {
        let claim: CreditClaim = Store::require(&self.store.claims, claim_id, "claim")?;
        auth::require_owner(actor, &claim.developer, "claim")?;

        if claim.status != ClaimStatus::Approved || !claim.issuance.credits_issued {
            return Err(MarketError::InvalidState(format!(
                "claim '{claim_id}' has no issued credits"
            )));
        }
        let approved = claim.approved_credits();
        if credits_to_sell == 0 || credits_to_sell > approved {
            return Err(MarketError::InvalidArgument(format!(
                "credits to sell must be within 1..={approved}, got {credits_to_sell}"
            )));
        }
        if price_per_credit == 0 {
            return Err(MarketError::InvalidArgument("price per credit must be positive".into()));
        }

        let previous = self.listings_for_claim(claim_id)?;
        if let Some(live) = previous.iter().find(|l| l.status.is_purchasable()) {
            return Err(MarketError::InvalidState(format!(
                "claim '{claim_id}' is already listed as '{}'",
                live.listing_id
            )));
        }
        let already_sold = previous
            .iter()
            .try_fold(0, |sum: Credits, l| sum.checked_add(l.sold_credits()))
            .ok_or_else(|| MarketError::InvalidArgument("sold credits overflow".into()))?;
        let total = already_sold
            .checked_add(credits_to_sell)
            .ok_or_else(|| MarketError::InvalidArgument("listed credits overflow".into()))?;
        if total > approved {
            return Err(MarketError::InvalidArgument(format!(
                "{already_sold} of {approved} issued credits were already sold, cannot list {credits_to_sell} more"
            )));
        }

        let seller: Account = Store::require(&self.store.accounts, &actor.user_id, "account")?;
        let seller_wallet = seller.require_wallet()?.clone();
        let balance = with_timeout(
            self.config.ledger_timeout,
            "seller balance lookup",
            self.ledger.balance_of(&seller_wallet),
        )
        .await?;
        if balance < credits_to_sell {
            return Err(MarketError::ExternalFailure(format!(
                "wallet {seller_wallet} holds {balance} credits on chain, cannot list {credits_to_sell}"
            )));
        }

        let listing_id = utils::new_uuid_to_bech32("listing_")
            .map_err(|e| MarketError::Storage(format!("failed to mint listing id: {e}")))?;
        let deposit = with_timeout(
            self.config.ledger_timeout,
            "escrow deposit",
            self.ledger.transfer_from(
                &self.config.settlement_signer,
                &seller_wallet,
                &self.config.escrow_wallet,
                credits_to_sell,
            ),
        )
        .await?;

        let now = TimeStamp::new();
        let listing = Listing {
            listing_id,
            seller: actor.user_id.clone(),
            seller_wallet,
            project_id: claim.project_id.clone(),
            claim_id: claim_id.to_string(),
            credits_listed: credits_to_sell,
            credits_available: credits_to_sell,
            credits_reserved: 0,
            price_per_credit,
            status: ListingStatus::Active,
            sales: vec![],
            created_at: now.clone(),
            updated_at: now,
            reserved_at: None,
        };

        let committed = (&self.store.listings, &self.store.live_listings)
            .transaction(|(listings, live_listings)| {
                if let Some(existing) = live_listings.get(claim_id.as_bytes())? {
                    return abort(MarketError::InvalidState(format!(
                        "claim '{claim_id}' is already listed as '{}'",
                        String::from_utf8_lossy(&existing)
                    )));
                }
                tx_save(listings, &listing.listing_id, &listing)?;
                live_listings.insert(claim_id.as_bytes(), listing.listing_id.as_bytes())?;
                Ok(())
            })
            .map_err(MarketError::from);
        if let Err(err) = committed {
            warn!(claim_id, %err, "listing not recorded, returning escrowed credits");
            self.refund_escrow(&listing.seller_wallet, credits_to_sell).await;
            return Err(err);
        }

        info!(
            listing_id = %listing.listing_id,
            claim_id,
            credits_to_sell,
            price_per_credit,
            escrow_tx = %deposit.tx_hash,
            "credits listed"
        );
        self.notify_user(
            &listing.seller,
            "Listing created",
            &format!(
                "{credits_to_sell} credits are now listed at {price_per_credit} per credit ({}).",
                listing.listing_id
            ),
        )
        .await;

        Ok(listing)
    }

    #[instrument(skip(self), fields(buyer = %actor.user_id))]
    pub async fn buy_credits(
        &self,
        actor: &Actor,
        listing_id: &str,
        credits_to_buy: Credits,
        payment_ref: Option<&str>,
    ) -> Result<Purchase, MarketError> {
        auth::require_role(actor, Role::Buyer)?;
        if credits_to_buy == 0 {
            return Err(MarketError::InvalidArgument("credits to buy must be positive".into()));
        }
        if self.config.require_payment_ref && payment_ref.is_none() {
            return Err(MarketError::InvalidArgument(
                "purchases require an external payment reference".into(),
            ));
        }

        let buyer: Account = Store::require(&self.store.accounts, &actor.user_id, "account")?;
        let buyer_wallet = buyer.wallet.clone().ok_or_else(|| {
            MarketError::InvalidArgument(format!("buyer '{}' has no linked wallet", actor.user_id))
        })?;
        let listing: Listing = Store::require(&self.store.listings, listing_id, "listing")?;
        if listing.seller == actor.user_id {
            return Err(MarketError::Forbidden("sellers cannot buy their own listing".into()));
        }

        // price is locked in together with the reservation
        let mut quote: (Price, Price) = (0, 0);
        let mut expired: Credits = 0;
        let ttl = self.config.in_flight_ttl;
        let listing = Store::update(&self.store.listings, listing_id, "listing", |mut l: Listing| {
            expired = l.expire_stale_reservations(ttl);
            let total = credits_to_buy.checked_mul(l.price_per_credit).ok_or_else(|| {
                MarketError::InvalidArgument("purchase total overflows".into())
            })?;
            l.reserve(credits_to_buy)?;
            quote = (l.price_per_credit, total);
            Ok(l)
        })?;
        let reservation = Reservation::held(&self.store.listings, listing_id, credits_to_buy);
        if expired > 0 {
            warn!(listing_id, expired, "expired reservations of abandoned purchases");
        }
        let (price_per_credit, total_price) = quote;

        let receipt = self
            .pay_and_transfer(&listing, &buyer_wallet, credits_to_buy, total_price, payment_ref)
            .await
            .inspect_err(|err| {
                warn!(listing_id, credits_to_buy, %err, "purchase failed, releasing reservation")
            })?;

        let sale = Sale {
            buyer: actor.user_id.clone(),
            amount: credits_to_buy,
            price_per_credit,
            total_price,
            tx_hash: receipt.tx_hash.clone(),
            payment_tx_hash: payment_ref.map(str::to_string),
            sold_at: TimeStamp::new(),
        };

        let committed = (&self.store.listings, &self.store.live_listings, &self.store.ownership)
            .transaction(|(listings, live_listings, ownership)| {
                let mut listing: Listing = tx_require(listings, listing_id, "listing")?;
                if let Err(err) = listing.settle(sale.clone()) {
                    return abort(err);
                }
                tx_save(listings, listing_id, &listing)?;
                if listing.status == ListingStatus::Sold {
                    live_listings.remove(listing.claim_id.as_bytes())?;
                }
                let holding = record_purchase(ownership, &listing, &sale, receipt.block_number)?;
                Ok((listing, holding))
            })
            .map_err(MarketError::from);

        let (listing, ownership) = match committed {
            Ok(done) => {
                reservation.disarm();
                done
            }
            Err(err) => {
                error!(
                    listing_id,
                    buyer = %actor.user_id,
                    tx_hash = %receipt.tx_hash,
                    %err,
                    "tokens transferred but the sale could not be recorded"
                );
                return Err(err);
            }
        };

        info!(
            listing_id,
            credits_to_buy,
            total_price,
            remaining = listing.credits_available,
            status = ?listing.status,
            tx_hash = %receipt.tx_hash,
            "credits purchased"
        );
        self.notify_user(
            &actor.user_id,
            "Purchase complete",
            &format!(
                "You bought {credits_to_buy} credits for {total_price} (tx {}).",
                receipt.tx_hash
            ),
        )
        .await;
        self.notify_user(
            &listing.seller,
            "Credits sold",
            &format!(
                "{credits_to_buy} credits from listing {listing_id} were sold, {} remain.",
                listing.credits_available
            ),
        )
        .await;

        Ok(Purchase {
            listing,
            ownership,
            sale,
            receipt,
        })
    }

    /// Withdraw the unsold credits and pay them back out of escrow.
    ///
    /// The remainder is reserved first so no purchase can start while the
    /// refund is on its way. A failed refund leaves the listing as it was.
    #[instrument(skip(self), fields(seller = %actor.user_id))]
    pub async fn cancel_listing(&self, actor: &Actor, listing_id: &str) -> Result<Listing, MarketError> {
        let mut remaining: Credits = 0;
        let ttl = self.config.in_flight_ttl;
        let listing = Store::update(&self.store.listings, listing_id, "listing", |mut l: Listing| {
            auth::require_owner(actor, &l.seller, "listing")?;
            if !l.status.is_purchasable() {
                return Err(MarketError::InvalidState(format!(
                    "listing '{listing_id}' is {:?}",
                    l.status
                )));
            }
            l.expire_stale_reservations(ttl);
            if l.credits_reserved > 0 {
                return Err(MarketError::InvalidState(format!(
                    "listing '{listing_id}' has purchases in flight"
                )));
            }
            remaining = l.credits_available;
            l.reserve(remaining)?;
            Ok(l)
        })?;
        let reservation = Reservation::held(&self.store.listings, listing_id, remaining);

        let refund = with_timeout(
            self.config.ledger_timeout,
            "escrow refund",
            self.ledger
                .transfer(&self.config.settlement_signer, &listing.seller_wallet, remaining),
        )
        .await
        .inspect_err(|err| warn!(listing_id, %err, "escrow refund failed, listing unchanged"))?;

        let listing = (&self.store.listings, &self.store.live_listings)
            .transaction(|(listings, live_listings)| {
                let mut listing: Listing = tx_require(listings, listing_id, "listing")?;
                listing.release(remaining);
                listing.status = ListingStatus::Cancelled;
                listing.updated_at = TimeStamp::new();
                tx_save(listings, listing_id, &listing)?;
                live_listings.remove(listing.claim_id.as_bytes())?;
                Ok(listing)
            })
            .map_err(MarketError::from)
            .inspect_err(|err| {
                error!(
                    listing_id,
                    refund_tx = %refund.tx_hash,
                    %err,
                    "escrow refunded but the listing could not be cancelled"
                )
            })?;
        reservation.disarm();

        info!(listing_id, refunded = remaining, refund_tx = %refund.tx_hash, "listing cancelled");
        Ok(listing)
    }

    /// New price applies to purchases reserved from now on.
    #[instrument(skip(self), fields(seller = %actor.user_id))]
    pub fn update_listing_price(
        &self,
        actor: &Actor,
        listing_id: &str,
        new_price: Price,
    ) -> Result<Listing, MarketError> {
        if new_price == 0 {
            return Err(MarketError::InvalidArgument("price per credit must be positive".into()));
        }

        let listing = Store::update(&self.store.listings, listing_id, "listing", |mut l: Listing| {
            auth::require_owner(actor, &l.seller, "listing")?;
            if !l.status.is_purchasable() {
                return Err(MarketError::InvalidState(format!(
                    "listing '{listing_id}' is {:?}",
                    l.status
                )));
            }
            l.price_per_credit = new_price;
            l.updated_at = TimeStamp::new();
            Ok(l)
        })?;

        info!(listing_id, new_price, "listing price updated");
        Ok(listing)
    }

    pub fn get_listing(&self, listing_id: &str) -> Result<Listing, MarketError> {
        Store::require(&self.store.listings, listing_id, "listing")
    }

    /// Listings that can currently be bought from
    pub fn active_listings(&self) -> Result<Vec<Listing>, MarketError> {
        let all: Vec<Listing> = Store::scan(&self.store.listings, "")?;
        Ok(all.into_iter().filter(|l| l.status.is_purchasable()).collect())
    }

    pub fn listings_for_claim(&self, claim_id: &str) -> Result<Vec<Listing>, MarketError> {
        let all: Vec<Listing> = Store::scan(&self.store.listings, "")?;
        Ok(all.into_iter().filter(|l| l.claim_id == claim_id).collect())
    }

    async fn pay_and_transfer(
        &self,
        listing: &Listing,
        buyer_wallet: &WalletAddress,
        credits: Credits,
        total_price: Price,
        payment_ref: Option<&str>,
    ) -> Result<TxReceipt, MarketError> {
        if let Some(tx_hash) = payment_ref {
            self.verify_payment(listing, buyer_wallet, total_price, tx_hash)
                .await?;
            self.consume_payment(tx_hash, &listing.listing_id)?;
        }

        let transfer = with_timeout(
            self.config.ledger_timeout,
            "credit purchase transfer",
            self.ledger
                .transfer(&self.config.settlement_signer, buyer_wallet, credits),
        )
        .await;

        if transfer.is_err() {
            if let Some(tx_hash) = payment_ref {
                // the payment was not used, let the buyer retry with it
                if let Err(err) = self.store.payments.remove(tx_hash.as_bytes()) {
                    error!(tx_hash, %err, "failed to release payment reference");
                }
            }
        }
        transfer
    }

    /// A payment must be confirmed and bind payer, recipient and amount.
    async fn verify_payment(
        &self,
        listing: &Listing,
        buyer_wallet: &WalletAddress,
        total_price: Price,
        tx_hash: &str,
    ) -> Result<(), MarketError> {
        let payment = with_timeout(
            self.config.ledger_timeout,
            "payment lookup",
            self.ledger.payment_receipt(tx_hash),
        )
        .await?
        .ok_or_else(|| MarketError::InvalidArgument(format!("unknown payment '{tx_hash}'")))?;

        if !payment.confirmed {
            return Err(MarketError::InvalidArgument(format!(
                "payment '{tx_hash}' is not confirmed"
            )));
        }
        if &payment.payer != buyer_wallet {
            return Err(MarketError::InvalidArgument(format!(
                "payment '{tx_hash}' was not sent from the buyer's wallet"
            )));
        }
        if payment.recipient != listing.seller_wallet {
            return Err(MarketError::InvalidArgument(format!(
                "payment '{tx_hash}' was not sent to the seller"
            )));
        }
        if payment.amount < total_price {
            return Err(MarketError::InvalidArgument(format!(
                "payment '{tx_hash}' covers {} of {total_price}",
                payment.amount
            )));
        }
        Ok(())
    }

    fn consume_payment(&self, tx_hash: &str, listing_id: &str) -> Result<(), MarketError> {
        self.store
            .payments
            .compare_and_swap(
                tx_hash.as_bytes(),
                None as Option<&[u8]>,
                Some(listing_id.as_bytes()),
            )?
            .map_err(|_| MarketError::InvalidState(format!("payment '{tx_hash}' was already used")))
    }

    async fn refund_escrow(&self, seller_wallet: &WalletAddress, credits: Credits) {
        let refund = with_timeout(
            self.config.ledger_timeout,
            "escrow refund",
            self.ledger
                .transfer(&self.config.settlement_signer, seller_wallet, credits),
        )
        .await;
        if let Err(err) = refund {
            error!(%seller_wallet, credits, %err, "escrowed credits could not be returned");
        }
    }

    async fn notify_user(&self, user_id: &str, subject: &str, body: &str) {
        match Store::load::<Account>(&self.store.accounts, user_id) {
            Ok(Some(account)) => {
                notify_best_effort(
                    self.notifier.as_ref(),
                    self.config.notify_timeout,
                    &account.email,
                    subject,
                    body,
                )
                .await
            }
            Ok(None) => warn!(user_id, "no account to notify"),
            Err(err) => warn!(user_id, %err, "failed to load account for notification"),
        }
    }
}

/// Credits held on a listing by an operation in flight. Dropping the guard
/// before [`Reservation::disarm`] hands them back.
struct Reservation {
    listings: Tree,
    listing_id: String,
    credits: Credits,
    armed: bool,
}

impl Reservation {
    fn held(listings: &Tree, listing_id: &str, credits: Credits) -> Self {
        Self {
            listings: listings.clone(),
            listing_id: listing_id.to_string(),
            credits,
            armed: true,
        }
    }

    /// The credits were settled or withdrawn, keep what was committed.
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let credits = self.credits;
        let released = Store::update(&self.listings, &self.listing_id, "listing", |mut l: Listing| {
            l.release(credits);
            Ok(l)
        });
        if let Err(err) = released {
            error!(listing_id = %self.listing_id, credits, %err, "failed to release reservation");
        }
    }
}
