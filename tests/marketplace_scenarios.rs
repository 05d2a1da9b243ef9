//! Integration tests for listing, purchase and ownership settlement
mod common;

use common::{Harness, wallet_for};
use greenblocks::config::MarketConfig;
use greenblocks::listing::ListingStatus;
use greenblocks::ports::TokenLedger;
use greenblocks::types::{Credits, Role, WalletAddress};
use greenblocks::{ErrorKind, MarketError};
use std::sync::Arc;
use std::time::Duration;

/// Scenario B: a claim cannot be listed beyond what was approved
#[tokio::test]
async fn listing_more_than_approved_is_invalid_argument() -> anyhow::Result<()> {
    let h = Harness::new()?;
    let developer = h.developer()?;
    let regulator = h.regulator("regulator")?;
    let claim = h.issued_claim(&developer, &regulator, 500).await?;
    let market = &h.service.marketplace;

    let err = market
        .list_credits(&developer.actor(), &claim.claim_id, 600, 25)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let err = market
        .list_credits(&developer.actor(), &claim.claim_id, 100, 0)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    assert!(market.listings_for_claim(&claim.claim_id)?.is_empty());
    Ok(())
}

#[tokio::test]
async fn only_issued_claims_of_the_caller_can_be_listed() -> anyhow::Result<()> {
    let h = Harness::new()?;
    let developer = h.developer()?;
    let other = h.account("other developer", Role::Developer)?;
    let regulator = h.regulator("regulator")?;
    let market = &h.service.marketplace;

    let project = h.approved_project(&developer, &regulator, 100).await?;
    let pending = h.pending_claim(&developer, &project, 100).await?;
    let err = market
        .list_credits(&developer.actor(), &pending.claim_id, 10, 5)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    let issued = h.issued_claim(&developer, &regulator, 100).await?;
    let err = market
        .list_credits(&other.actor(), &issued.claim_id, 10, 5)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    Ok(())
}

/// Scenario C: partial then full sale, after which nothing is purchasable
#[tokio::test]
async fn listing_sells_out_in_two_purchases() -> anyhow::Result<()> {
    let h = Harness::new()?;
    let (_developer, listing) = h.listing(100, 100, 20).await?;
    let market = &h.service.marketplace;
    let (a, b, c) = (h.buyer("a")?, h.buyer("b")?, h.buyer("c")?);

    let first = market.buy_credits(&a.actor(), &listing.listing_id, 40, None).await?;
    assert_eq!(first.listing.status, ListingStatus::Partial);
    assert_eq!(first.listing.credits_available, 60);
    assert_eq!(first.sale.total_price, 800);

    let second = market.buy_credits(&b.actor(), &listing.listing_id, 60, None).await?;
    assert_eq!(second.listing.status, ListingStatus::Sold);
    assert_eq!(second.listing.credits_available, 0);

    let err = market
        .buy_credits(&c.actor(), &listing.listing_id, 1, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    assert!(market.active_listings()?.is_empty());
    let report = h.service.ownership.audit_conservation(&listing.listing_id)?;
    assert_eq!(report.credits_sold, 100);
    assert_eq!(report.credits_owned, 100);

    let b_wallet = WalletAddress::parse(&wallet_for(&b.user_id))?;
    assert_eq!(h.ledger.balance_of(&b_wallet).await?, 60);

    Ok(())
}

/// Scenario D: repeat purchases accumulate into one holding
#[tokio::test]
async fn repeat_purchases_accumulate_ownership() -> anyhow::Result<()> {
    let h = Harness::new()?;
    let (developer, listing) = h.listing(100, 100, 12).await?;
    let buyer = h.buyer("buyer")?;
    let market = &h.service.marketplace;

    market.buy_credits(&buyer.actor(), &listing.listing_id, 10, None).await?;
    market.update_listing_price(&developer.actor(), &listing.listing_id, 15)?;
    let second = market.buy_credits(&buyer.actor(), &listing.listing_id, 15, None).await?;

    let holdings = h.service.ownership.holdings(&buyer.user_id)?;
    assert_eq!(holdings.len(), 1);
    let holding = &holdings[0];
    assert_eq!(holding.credits_owned, 25);
    assert_eq!(holding.total_cost, 10 * 12 + 15 * 15);
    assert_eq!(holding.purchase_price, 12);
    assert_eq!(holding.blockchain.token_transfer_tx_hash, second.receipt.tx_hash);
    assert_eq!(holding.seller, developer.user_id);
    assert_eq!(holding, &second.ownership);

    Ok(())
}

#[tokio::test]
async fn failed_transfer_leaves_listing_untouched() -> anyhow::Result<()> {
    let h = Harness::new()?;
    let (_developer, listing) = h.listing(100, 100, 10).await?;
    let buyer = h.buyer("buyer")?;
    let market = &h.service.marketplace;
    let before = market.get_listing(&listing.listing_id)?;

    h.ledger.fail_next_transfers(1).await;
    let err = market
        .buy_credits(&buyer.actor(), &listing.listing_id, 30, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExternalFailure);

    assert_eq!(market.get_listing(&listing.listing_id)?, before);
    assert!(h.service.ownership.get(&listing.listing_id, &buyer.user_id)?.is_none());

    let retried = market.buy_credits(&buyer.actor(), &listing.listing_id, 30, None).await?;
    assert_eq!(retried.listing.credits_available, 70);
    assert_eq!(retried.listing.credits_reserved, 0);

    Ok(())
}

#[tokio::test]
async fn purchase_bounds_and_roles() -> anyhow::Result<()> {
    let h = Harness::new()?;
    let (developer, listing) = h.listing(50, 50, 10).await?;
    let buyer = h.buyer("buyer")?;
    let market = &h.service.marketplace;

    for credits in [0, 51] {
        let err = market
            .buy_credits(&buyer.actor(), &listing.listing_id, credits, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    let err = market
        .buy_credits(&developer.actor(), &listing.listing_id, 5, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    let walletless = h.service.accounts.register("walletless", "w@greenblocks.test", Role::Buyer)?;
    let err = market
        .buy_credits(&walletless.actor(), &listing.listing_id, 5, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let err = market
        .buy_credits(&buyer.actor(), "listing_missing", 5, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    assert_eq!(market.get_listing(&listing.listing_id)?, listing);
    Ok(())
}

#[tokio::test]
async fn a_claim_has_one_live_listing() -> anyhow::Result<()> {
    let h = Harness::new()?;
    let developer = h.developer()?;
    let regulator = h.regulator("regulator")?;
    let claim = h.issued_claim(&developer, &regulator, 100).await?;
    let market = &h.service.marketplace;

    let first = market.list_credits(&developer.actor(), &claim.claim_id, 60, 10).await?;
    let err = market
        .list_credits(&developer.actor(), &claim.claim_id, 40, 10)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    market.cancel_listing(&developer.actor(), &first.listing_id).await?;
    let relisted = market.list_credits(&developer.actor(), &claim.claim_id, 40, 11).await?;
    assert_eq!(relisted.status, ListingStatus::Active);
    assert_eq!(market.listings_for_claim(&claim.claim_id)?.len(), 2);
    assert_eq!(market.active_listings()?, vec![relisted]);

    Ok(())
}

#[tokio::test]
async fn relisting_never_exceeds_approved_credits() -> anyhow::Result<()> {
    let h = Harness::new()?;
    let (developer, listing) = h.listing(100, 100, 10).await?;
    let buyer = h.buyer("buyer")?;
    let market = &h.service.marketplace;

    market.buy_credits(&buyer.actor(), &listing.listing_id, 60, None).await?;
    let cancelled = market.cancel_listing(&developer.actor(), &listing.listing_id).await?;
    assert_eq!(cancelled.status, ListingStatus::Cancelled);
    assert_eq!(cancelled.credits_available, 40);

    let err = market
        .list_credits(&developer.actor(), &listing.claim_id, 50, 10)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    market.list_credits(&developer.actor(), &listing.claim_id, 40, 10).await?;
    Ok(())
}

#[tokio::test]
async fn relisting_at_the_credit_ceiling_is_invalid_argument() -> anyhow::Result<()> {
    let h = Harness::new()?;
    let developer = h.developer()?;
    let regulator = h.regulator("regulator")?;
    let buyer = h.buyer("buyer")?;
    let claim = h.issued_claim(&developer, &regulator, Credits::MAX).await?;
    let market = &h.service.marketplace;

    let listing = market.list_credits(&developer.actor(), &claim.claim_id, 10, 1).await?;
    market.buy_credits(&buyer.actor(), &listing.listing_id, 10, None).await?;

    let err = market
        .list_credits(&developer.actor(), &claim.claim_id, Credits::MAX, 1)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(market.listings_for_claim(&claim.claim_id)?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn seller_needs_the_credits_on_chain() -> anyhow::Result<()> {
    let h = Harness::new()?;
    let developer = h.developer()?;
    let regulator = h.regulator("regulator")?;
    let claim = h.issued_claim(&developer, &regulator, 100).await?;

    // a fresh wallet holds nothing
    h.service
        .accounts
        .link_wallet(&developer.actor(), "0x1111111111111111111111111111111111111111")?;
    let err = h
        .service
        .marketplace
        .list_credits(&developer.actor(), &claim.claim_id, 10, 10)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExternalFailure);

    Ok(())
}

#[tokio::test]
async fn cancel_rules() -> anyhow::Result<()> {
    let h = Harness::new()?;
    let (developer, listing) = h.listing(100, 100, 10).await?;
    let stranger = h.account("stranger", Role::Developer)?;
    let buyer = h.buyer("buyer")?;
    let market = &h.service.marketplace;

    let err = market
        .cancel_listing(&stranger.actor(), &listing.listing_id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    market.cancel_listing(&developer.actor(), &listing.listing_id).await?;
    let err = market
        .cancel_listing(&developer.actor(), &listing.listing_id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    let err = market
        .buy_credits(&buyer.actor(), &listing.listing_id, 1, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    let err = market
        .update_listing_price(&developer.actor(), &listing.listing_id, 20)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    Ok(())
}

#[tokio::test]
async fn failed_refund_keeps_the_listing_live() -> anyhow::Result<()> {
    let h = Harness::new()?;
    let (developer, listing) = h.listing(100, 100, 10).await?;
    let market = &h.service.marketplace;
    let before = market.get_listing(&listing.listing_id)?;

    h.ledger.fail_next_transfers(1).await;
    let err = market
        .cancel_listing(&developer.actor(), &listing.listing_id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExternalFailure);
    assert_eq!(market.get_listing(&listing.listing_id)?, before);

    let cancelled = market.cancel_listing(&developer.actor(), &listing.listing_id).await?;
    assert_eq!(cancelled.status, ListingStatus::Cancelled);
    assert_eq!(cancelled.credits_reserved, 0);
    Ok(())
}

/// Buyers are paid out of the seller's escrowed credits, nothing is minted
#[tokio::test]
async fn purchases_move_the_sellers_tokens() -> anyhow::Result<()> {
    let h = Harness::new()?;
    let (developer, listing) = h.listing(100, 100, 10).await?;
    let (a, b) = (h.buyer("a")?, h.buyer("b")?);
    let market = &h.service.marketplace;

    let seller_wallet = WalletAddress::parse(&wallet_for(&developer.user_id))?;
    let a_wallet = WalletAddress::parse(&wallet_for(&a.user_id))?;
    let b_wallet = WalletAddress::parse(&wallet_for(&b.user_id))?;
    let escrow = MarketConfig::default().escrow_wallet;
    assert_eq!(h.ledger.balance_of(&seller_wallet).await?, 0);
    assert_eq!(h.ledger.balance_of(&escrow).await?, 100);

    market.buy_credits(&a.actor(), &listing.listing_id, 30, None).await?;
    market.buy_credits(&b.actor(), &listing.listing_id, 20, None).await?;
    market.cancel_listing(&developer.actor(), &listing.listing_id).await?;

    let seller = h.ledger.balance_of(&seller_wallet).await?;
    let bought = h.ledger.balance_of(&a_wallet).await? + h.ledger.balance_of(&b_wallet).await?;
    assert_eq!((seller, bought), (50, 50));
    assert_eq!(seller + bought, 100);
    assert_eq!(h.ledger.balance_of(&escrow).await?, 0);
    assert_eq!(h.ledger.total_supply().await, 100);
    Ok(())
}

#[tokio::test]
async fn cancelling_during_a_purchase_is_refused() -> anyhow::Result<()> {
    let h = Harness::new()?;
    let (developer, listing) = h.listing(100, 100, 10).await?;
    let buyer = h.buyer("buyer")?;
    let market = &h.service.marketplace;

    h.ledger.set_delay(Some(Duration::from_millis(200))).await;
    let buyer_actor = buyer.actor();
    let (purchase, cancelled) = tokio::join!(
        market.buy_credits(&buyer_actor, &listing.listing_id, 30, None),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            market.cancel_listing(&developer.actor(), &listing.listing_id).await
        }
    );
    assert_eq!(cancelled.unwrap_err().kind(), ErrorKind::InvalidState);
    let purchase = purchase?;
    assert_eq!(purchase.listing.credits_available, 70);
    assert_eq!(purchase.listing.credits_reserved, 0);

    h.ledger.set_delay(None).await;
    let cancelled = market.cancel_listing(&developer.actor(), &listing.listing_id).await?;
    assert_eq!(cancelled.credits_available, 70);
    Ok(())
}

#[tokio::test]
async fn abandoned_purchase_releases_its_reservation() -> anyhow::Result<()> {
    let h = Harness::new()?;
    let (_developer, listing) = h.listing(100, 100, 10).await?;
    let buyer = h.buyer("buyer")?;
    let market = &h.service.marketplace;
    let before = market.get_listing(&listing.listing_id)?;

    h.ledger.set_delay(Some(Duration::from_millis(500))).await;
    let outcome = tokio::time::timeout(
        Duration::from_millis(50),
        market.buy_credits(&buyer.actor(), &listing.listing_id, 30, None),
    )
    .await;
    assert!(outcome.is_err(), "purchase should still be waiting on the ledger");

    let after = market.get_listing(&listing.listing_id)?;
    assert_eq!(after.credits_reserved, 0);
    assert_eq!(after, before);

    h.ledger.set_delay(None).await;
    let purchase = market.buy_credits(&buyer.actor(), &listing.listing_id, 100, None).await?;
    assert_eq!(purchase.listing.status, ListingStatus::Sold);
    Ok(())
}

/// A hold whose owner vanished without unwinding expires after the TTL
#[tokio::test]
async fn orphaned_reservation_expires() -> anyhow::Result<()> {
    let config = MarketConfig::default()
        .with_ledger_timeout(Duration::from_millis(80))
        .with_in_flight_ttl(Duration::from_millis(200));
    let h = Harness::with_config(config)?;
    let (developer, listing) = h.listing(100, 100, 10).await?;
    let (first, second) = (h.buyer("first")?, h.buyer("second")?);
    let market = &h.service.marketplace;

    h.ledger.set_delay(Some(Duration::from_secs(5))).await;
    let first_actor = first.actor();
    let mut stuck = Box::pin(market.buy_credits(&first_actor, &listing.listing_id, 30, None));
    assert!(tokio::time::timeout(Duration::from_millis(20), &mut stuck).await.is_err());
    // never polled again and never dropped, like a process that died mid-call
    std::mem::forget(stuck);
    h.ledger.set_delay(None).await;

    assert_eq!(market.get_listing(&listing.listing_id)?.credits_reserved, 30);
    let err = market
        .buy_credits(&second.actor(), &listing.listing_id, 100, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    let err = market
        .cancel_listing(&developer.actor(), &listing.listing_id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let purchase = market.buy_credits(&second.actor(), &listing.listing_id, 100, None).await?;
    assert_eq!(purchase.listing.status, ListingStatus::Sold);
    assert_eq!(purchase.listing.credits_reserved, 0);
    assert!(purchase.listing.is_conserved());
    Ok(())
}

#[tokio::test]
async fn price_updates_apply_to_later_purchases() -> anyhow::Result<()> {
    let h = Harness::new()?;
    let (developer, listing) = h.listing(100, 100, 10).await?;
    let stranger = h.account("stranger", Role::Developer)?;
    let buyer = h.buyer("buyer")?;
    let market = &h.service.marketplace;

    let err = market
        .update_listing_price(&stranger.actor(), &listing.listing_id, 20)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    let err = market
        .update_listing_price(&developer.actor(), &listing.listing_id, 0)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let updated = market.update_listing_price(&developer.actor(), &listing.listing_id, 20)?;
    assert_eq!(updated.price_per_credit, 20);

    let purchase = market.buy_credits(&buyer.actor(), &listing.listing_id, 5, None).await?;
    assert_eq!(purchase.sale.price_per_credit, 20);
    assert_eq!(purchase.sale.total_price, 100);

    Ok(())
}

#[tokio::test]
async fn payment_reference_must_match_the_purchase() -> anyhow::Result<()> {
    let h = Harness::new()?;
    let (developer, listing) = h.listing(100, 100, 10).await?;
    let buyer = h.buyer("buyer")?;
    let market = &h.service.marketplace;
    let buyer_wallet = WalletAddress::parse(&wallet_for(&buyer.user_id))?;
    let seller_wallet = WalletAddress::parse(&wallet_for(&developer.user_id))?;

    let short = h.ledger.record_payment(&buyer_wallet, &seller_wallet, 99, true).await;
    let unconfirmed = h.ledger.record_payment(&buyer_wallet, &seller_wallet, 100, false).await;
    let wrong_payee = h.ledger.record_payment(&buyer_wallet, &buyer_wallet, 100, true).await;
    for payment in [short.as_str(), unconfirmed.as_str(), wrong_payee.as_str(), "0xdeadbeef"] {
        let err = market
            .buy_credits(&buyer.actor(), &listing.listing_id, 10, Some(payment))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{payment}");
    }
    assert_eq!(market.get_listing(&listing.listing_id)?, listing);

    let paid = h.ledger.record_payment(&buyer_wallet, &seller_wallet, 100, true).await;
    let purchase = market
        .buy_credits(&buyer.actor(), &listing.listing_id, 10, Some(&paid))
        .await?;
    assert_eq!(purchase.sale.payment_tx_hash.as_deref(), Some(paid.as_str()));
    assert_eq!(purchase.ownership.blockchain.payment_tx_hash, Some(paid.clone()));

    // a payment settles exactly one purchase
    let err = market
        .buy_credits(&buyer.actor(), &listing.listing_id, 10, Some(&paid))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(market.get_listing(&listing.listing_id)?.credits_available, 90);

    Ok(())
}

#[tokio::test]
async fn failed_transfer_frees_the_payment_reference() -> anyhow::Result<()> {
    let h = Harness::new()?;
    let (developer, listing) = h.listing(100, 100, 10).await?;
    let buyer = h.buyer("buyer")?;
    let market = &h.service.marketplace;
    let buyer_wallet = WalletAddress::parse(&wallet_for(&buyer.user_id))?;
    let seller_wallet = WalletAddress::parse(&wallet_for(&developer.user_id))?;
    let paid = h.ledger.record_payment(&buyer_wallet, &seller_wallet, 200, true).await;

    h.ledger.fail_next_transfers(1).await;
    let err = market
        .buy_credits(&buyer.actor(), &listing.listing_id, 20, Some(&paid))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExternalFailure);

    let purchase = market
        .buy_credits(&buyer.actor(), &listing.listing_id, 20, Some(&paid))
        .await?;
    assert_eq!(purchase.listing.credits_available, 80);

    Ok(())
}

#[tokio::test]
async fn payment_reference_can_be_mandatory() -> anyhow::Result<()> {
    let h = Harness::with_config(MarketConfig::default().with_required_payment_ref(true))?;
    let (_developer, listing) = h.listing(100, 100, 10).await?;
    let buyer = h.buyer("buyer")?;

    let err = h
        .service
        .marketplace
        .buy_credits(&buyer.actor(), &listing.listing_id, 10, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    Ok(())
}

#[tokio::test]
async fn purchases_notify_buyer_and_seller() -> anyhow::Result<()> {
    let h = Harness::new()?;
    let (developer, listing) = h.listing(100, 100, 10).await?;
    let buyer = h.buyer("buyer")?;

    h.service
        .marketplace
        .buy_credits(&buyer.actor(), &listing.listing_id, 10, None)
        .await?;

    let sent = h.notifier.sent().await;
    assert!(sent.iter().any(|n| n.recipient == buyer.email && n.subject == "Purchase complete"));
    assert!(sent.iter().any(|n| n.recipient == developer.email && n.subject == "Credits sold"));

    Ok(())
}

/// Ten buyers race for a listing that can satisfy five of them.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_buyers_never_oversell() -> anyhow::Result<()> {
    let h = Arc::new(Harness::new()?);
    let (_developer, listing) = h.listing(100, 100, 3).await?;

    let mut handles = Vec::new();
    for i in 0..10 {
        let buyer = h.buyer(&format!("buyer{i}"))?;
        let h = h.clone();
        let listing_id = listing.listing_id.clone();
        handles.push(tokio::spawn(async move {
            h.service
                .marketplace
                .buy_credits(&buyer.actor(), &listing_id, 20, None)
                .await
        }));
    }

    let mut succeeded = 0;
    for handle in handles {
        match handle.await? {
            Ok(_) => succeeded += 1,
            Err(err) => assert_eq!(err.kind(), ErrorKind::InvalidState, "{err}"),
        }
    }
    assert_eq!(succeeded, 5);

    let listing = h.service.marketplace.get_listing(&listing.listing_id)?;
    assert_eq!(listing.status, ListingStatus::Sold);
    assert_eq!(listing.credits_reserved, 0);
    assert_eq!(listing.sales.len(), 5);

    let report = h.service.ownership.audit_conservation(&listing.listing_id)?;
    assert_eq!(report.credits_owned, 100);
    Ok(())
}

#[tokio::test]
async fn errors_surface_as_market_errors() -> anyhow::Result<()> {
    let h = Harness::new()?;
    let buyer = h.buyer("buyer")?;

    let err: anyhow::Error = h
        .service
        .marketplace
        .buy_credits(&buyer.actor(), "listing_missing", 1, None)
        .await
        .unwrap_err()
        .into();
    let err = err.downcast::<MarketError>()?;
    assert!(!err.is_retryable());
    Ok(())
}
