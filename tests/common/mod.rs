//! Shared fixtures for the integration tests.
//!
//! Every harness gets its own sled database inside a temp directory, sled
//! holds a file lock so tests must never share one.
#![allow(dead_code)]

use greenblocks::GreenBlocksService;
use greenblocks::account::Account;
use greenblocks::adapters::{InMemoryFileStore, InMemoryTokenLedger, RecordingNotifier};
use greenblocks::claim::{CreditClaim, InspectionResult, ReportingPeriod};
use greenblocks::config::MarketConfig;
use greenblocks::listing::Listing;
use greenblocks::mrv::MrvSubmission;
use greenblocks::project::{NewProject, Project, ProjectType};
use greenblocks::types::{Credits, Price, Role, TimeStamp};
use greenblocks::utils::content_digest;
use std::sync::Arc;
use tempfile::{TempDir, tempdir};

pub struct Harness {
    pub service: GreenBlocksService,
    pub ledger: Arc<InMemoryTokenLedger>,
    pub files: Arc<InMemoryFileStore>,
    pub notifier: Arc<RecordingNotifier>,
    _temp_dir: TempDir,
}

impl Harness {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_config(MarketConfig::default())
    }

    pub fn with_config(config: MarketConfig) -> anyhow::Result<Self> {
        let temp_dir = tempdir()?;
        let db = Arc::new(sled::open(temp_dir.path().join("greenblocks.db"))?);

        let ledger = Arc::new(
            InMemoryTokenLedger::new()
                .with_signer_account(config.settlement_signer.clone(), config.escrow_wallet.clone()),
        );
        let files = Arc::new(InMemoryFileStore::new());
        let notifier = Arc::new(RecordingNotifier::new());

        let service = GreenBlocksService::new(
            db,
            ledger.clone(),
            files.clone(),
            notifier.clone(),
            config,
        )?;

        Ok(Self {
            service,
            ledger,
            files,
            notifier,
            _temp_dir: temp_dir,
        })
    }

    /// Register an account and link a wallet derived from its id
    pub fn account(&self, name: &str, role: Role) -> anyhow::Result<Account> {
        let account = self
            .service
            .accounts
            .register(name, &format!("{name}@greenblocks.test"), role)?;
        let wallet = wallet_for(&account.user_id);
        Ok(self.service.accounts.link_wallet(&account.actor(), &wallet)?)
    }

    pub fn developer(&self) -> anyhow::Result<Account> {
        self.account("developer", Role::Developer)
    }

    pub fn regulator(&self, name: &str) -> anyhow::Result<Account> {
        self.account(name, Role::Regulator)
    }

    pub fn buyer(&self, name: &str) -> anyhow::Result<Account> {
        self.account(name, Role::Buyer)
    }

    pub fn draft_project(&self, developer: &Account, expected_credits: Credits) -> anyhow::Result<Project> {
        let draft = NewProject::new("Mangrove restoration")
            .set_type(ProjectType::BlueCarbon)
            .set_location("Sundarbans")
            .set_expected_credits(expected_credits)
            .set_methodology("VM0033")
            .set_description("Restoring 1,200 ha of degraded mangroves");

        Ok(self.service.projects.register(&developer.actor(), draft)?)
    }

    /// A project that passed verification but has no MRV data yet
    pub fn approved_project_without_mrv(
        &self,
        developer: &Account,
        regulator: &Account,
        expected_credits: Credits,
    ) -> anyhow::Result<Project> {
        let project = self.draft_project(developer, expected_credits)?;
        let projects = &self.service.projects;

        projects.submit_for_review(&developer.actor(), &project.project_id)?;
        projects.begin_review(&regulator.actor(), &project.project_id)?;
        Ok(projects.approve(&regulator.actor(), &project.project_id, "methodology sound")?)
    }

    pub async fn approved_project(
        &self,
        developer: &Account,
        regulator: &Account,
        expected_credits: Credits,
    ) -> anyhow::Result<Project> {
        let project = self.approved_project_without_mrv(developer, regulator, expected_credits)?;

        self.service
            .mrv
            .submit(
                &developer.actor(),
                &project.project_id,
                MrvSubmission::new("Q1 monitoring report")
                    .set_description("Biomass survey")
                    .add_file("survey.csv", b"plot,biomass\n1,42\n".to_vec()),
            )
            .await?;

        Ok(project)
    }

    pub async fn pending_claim(
        &self,
        developer: &Account,
        project: &Project,
        credits_requested: Credits,
    ) -> anyhow::Result<CreditClaim> {
        Ok(self
            .service
            .claims
            .create_claim(
                &developer.actor(),
                &project.project_id,
                credits_requested,
                reporting_period(),
                vec![],
            )
            .await?)
    }

    /// Drive a claim up to `inspection_completed`
    pub async fn inspected_claim(
        &self,
        developer: &Account,
        inspector: &Account,
        credits_requested: Credits,
        result: InspectionResult,
    ) -> anyhow::Result<CreditClaim> {
        let project = self
            .approved_project(developer, inspector, credits_requested)
            .await?;
        let claim = self.pending_claim(developer, &project, credits_requested).await?;
        let claims = &self.service.claims;

        claims.begin_review(&inspector.actor(), &claim.claim_id)?;
        claims
            .schedule_inspection(&inspector.actor(), &claim.claim_id, TimeStamp::days_from_now(7))
            .await?;
        Ok(claims
            .complete_inspection(&inspector.actor(), &claim.claim_id, "site visit ok", result)
            .await?)
    }

    pub async fn issued_claim(
        &self,
        developer: &Account,
        regulator: &Account,
        approved_credits: Credits,
    ) -> anyhow::Result<CreditClaim> {
        let claim = self
            .inspected_claim(developer, regulator, approved_credits, InspectionResult::Passed)
            .await?;

        Ok(self
            .service
            .claims
            .issue_credits(&regulator.actor(), &claim.claim_id, approved_credits, "verified")
            .await?)
    }

    /// Issue `approved_credits` and list `listed` of them at `price`
    pub async fn listing(&self, approved_credits: Credits, listed: Credits, price: Price) -> anyhow::Result<(Account, Listing)> {
        let developer = self.developer()?;
        let regulator = self.regulator("regulator")?;
        let claim = self.issued_claim(&developer, &regulator, approved_credits).await?;

        let listing = self
            .service
            .marketplace
            .list_credits(&developer.actor(), &claim.claim_id, listed, price)
            .await?;
        Ok((developer, listing))
    }
}

pub fn wallet_for(user_id: &str) -> String {
    format!("0x{}", &content_digest(user_id.as_bytes())[..40])
}

pub fn reporting_period() -> ReportingPeriod {
    ReportingPeriod::new(
        TimeStamp::new_with(2024, 1, 1, 0, 0, 0),
        TimeStamp::new_with(2024, 12, 31, 0, 0, 0),
    )
    .unwrap()
}
