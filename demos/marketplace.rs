//! Walks one project from registration through a credit sale.
//!
//! Run with `RUST_LOG=info cargo run --example marketplace`.
use greenblocks::GreenBlocksService;
use greenblocks::adapters::{InMemoryFileStore, InMemoryTokenLedger, LogNotifier};
use greenblocks::claim::{InspectionResult, ReportingPeriod};
use greenblocks::config::MarketConfig;
use greenblocks::mrv::MrvSubmission;
use greenblocks::project::{NewProject, ProjectType};
use greenblocks::types::{Role, TimeStamp, WalletAddress};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "greenblocks=info,marketplace=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let dir = tempfile::tempdir()?;
    let db = Arc::new(sled::open(dir.path().join("greenblocks-demo"))?);
    let config = MarketConfig::from_env();
    // the escrow wallet pays buyers, issuance mints
    let ledger = Arc::new(
        InMemoryTokenLedger::new()
            .with_signer_account(config.settlement_signer.clone(), config.escrow_wallet.clone()),
    );

    let service = GreenBlocksService::new(
        db,
        ledger.clone(),
        Arc::new(InMemoryFileStore::new()),
        Arc::new(LogNotifier),
        config,
    )?;

    let developer = service
        .accounts
        .register("Mangrove Co", "ops@mangrove.example", Role::Developer)?;
    let developer = service
        .accounts
        .link_wallet(&developer.actor(), "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed")?;
    let regulator = service
        .accounts
        .register("Registry Office", "review@registry.example", Role::Regulator)?;
    let buyer = service
        .accounts
        .register("Airline Ltd", "esg@airline.example", Role::Buyer)?;
    let buyer = service
        .accounts
        .link_wallet(&buyer.actor(), "0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359")?;

    let project = service.projects.register(
        &developer.actor(),
        NewProject::new("Sundarbans mangroves")
            .set_type(ProjectType::BlueCarbon)
            .set_location("Khulna, Bangladesh")
            .set_expected_credits(5_000)
            .set_methodology("VM0033")
            .set_description("Replanting 1,200 ha of degraded mangrove"),
    )?;
    service.projects.submit_for_review(&developer.actor(), &project.project_id)?;
    service.projects.begin_review(&regulator.actor(), &project.project_id)?;
    service
        .projects
        .approve(&regulator.actor(), &project.project_id, "baseline accepted")?;

    service
        .mrv
        .submit(
            &developer.actor(),
            &project.project_id,
            MrvSubmission::new("2024 monitoring report")
                .set_description("Plot survey and satellite canopy analysis")
                .add_file("plots.csv", b"plot,tCO2e\n1,812\n2,944\n".to_vec()),
        )
        .await?;

    let claim = service
        .claims
        .create_claim(
            &developer.actor(),
            &project.project_id,
            4_000,
            ReportingPeriod::new(
                TimeStamp::new_with(2024, 1, 1, 0, 0, 0),
                TimeStamp::new_with(2024, 12, 31, 0, 0, 0),
            )?,
            vec!["plots.csv".to_string()],
        )
        .await?;
    service
        .claims
        .schedule_inspection(&regulator.actor(), &claim.claim_id, TimeStamp::days_from_now(14))
        .await?;
    service
        .claims
        .complete_inspection(
            &regulator.actor(),
            &claim.claim_id,
            "two plots below survey density",
            InspectionResult::Partial,
        )
        .await?;
    let claim = service
        .claims
        .issue_credits(&regulator.actor(), &claim.claim_id, 3_500, "partial approval")
        .await?;
    info!(claim_id = %claim.claim_id, tx = ?claim.issuance.tx_hash, "claim approved");

    let listing = service
        .marketplace
        .list_credits(&developer.actor(), &claim.claim_id, 3_000, 18)
        .await?;

    let buyer_wallet = WalletAddress::parse("0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359")?;
    let payment = ledger
        .record_payment(&buyer_wallet, &listing.seller_wallet, 1_200 * 18, true)
        .await;
    let purchase = service
        .marketplace
        .buy_credits(&buyer.actor(), &listing.listing_id, 1_200, Some(&payment))
        .await?;
    info!(
        remaining = purchase.listing.credits_available,
        status = ?purchase.listing.status,
        owned = purchase.ownership.credits_owned,
        "purchase settled"
    );

    let report = service.ownership.audit_conservation(&listing.listing_id)?;
    info!(?report, "conservation holds");

    service.flush()?;
    Ok(())
}
