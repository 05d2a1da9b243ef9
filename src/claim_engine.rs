//! Service layer for the credit claim lifecycle.
//!
//! `pending -> under_review -> inspection_scheduled -> inspection_completed -> approved`,
//! with `rejected` reachable from every non-terminal state. Issuance moves
//! tokens on the ledger before anything is committed locally, so a failed
//! transfer leaves the claim in `inspection_completed` and the call can be
//! repeated.
use super::account::Account;
use super::auth;
use super::claim::{
    ClaimDetails, ClaimReview, ClaimStatus, CreditClaim, CreditIssuance, Inspection,
    InspectionResult, ReportingPeriod,
};
use super::config::MarketConfig;
use super::error::MarketError;
use super::mrv;
use super::ports::{Notifier, TokenLedger, notify_best_effort, with_timeout};
use super::project::{Project, ProjectStatus};
use super::store::{
    InflightGuard, InflightMarker, Store, encode, tx_live_marker, tx_load, tx_require, tx_save,
};
use super::types::{Actor, Credits, Role, TimeStamp};
use super::utils;
use chrono::Utc;
use sled::Transactional;
use sled::transaction::abort;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

pub struct ClaimEngine {
    store: Arc<Store>,
    ledger: Arc<dyn TokenLedger>,
    notifier: Arc<dyn Notifier>,
    config: MarketConfig,
}

impl ClaimEngine {
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

    /// Open a new claim against an approved project with MRV evidence.
    #[instrument(skip(self, reporting_period, mrv_refs), fields(developer = %actor.user_id))]
    pub async fn create_claim(
        &self,
        actor: &Actor,
        project_id: &str,
        credits_requested: Credits,
        reporting_period: ReportingPeriod,
        mrv_refs: Vec<String>,
    ) -> Result<CreditClaim, MarketError> {
        let project: Project = Store::require(&self.store.projects, project_id, "project")?;
        auth::require_owner(actor, &project.developer, "project")?;

        if project.status != ProjectStatus::Approved {
            return Err(MarketError::InvalidState(format!(
                "project '{project_id}' is {:?}, claims need an approved project",
                project.status
            )));
        }
        if !mrv::has_evidence(&self.store, project_id)? {
            return Err(MarketError::InvalidState(format!(
                "project '{project_id}' has no MRV data"
            )));
        }
        let ceiling = project.details.expected_credits;
        if credits_requested == 0 || credits_requested > ceiling {
            return Err(MarketError::InvalidArgument(format!(
                "credits requested must be within 1..={ceiling}, got {credits_requested}"
            )));
        }

        let now = TimeStamp::new();
        let claim = CreditClaim {
            claim_id: utils::new_uuid_to_bech32("claim_")
                .map_err(|e| MarketError::Storage(format!("failed to mint claim id: {e}")))?,
            project_id: project_id.to_string(),
            developer: actor.user_id.clone(),
            details: ClaimDetails {
                credits_requested,
                reporting_period,
                mrv_data_refs: mrv_refs,
            },
            status: ClaimStatus::Pending,
            inspection: Inspection::default(),
            issuance: CreditIssuance::default(),
            review: None,
            created_at: now.clone(),
            updated_at: now,
        };

        // the index entry is what makes "one live claim per project" race free
        (&self.store.claims, &self.store.open_claims)
            .transaction(|(claims, open_claims)| {
                if let Some(existing) = open_claims.get(project_id.as_bytes())? {
                    return abort(MarketError::InvalidState(format!(
                        "project '{project_id}' already has an open claim '{}'",
                        String::from_utf8_lossy(&existing)
                    )));
                }
                tx_save(claims, &claim.claim_id, &claim)?;
                open_claims.insert(project_id.as_bytes(), claim.claim_id.as_bytes())?;
                Ok(())
            })
            .map_err(MarketError::from)?;

        info!(claim_id = %claim.claim_id, project_id, credits_requested, "claim created");
        self.notify_user(
            &claim.developer,
            "Credit claim submitted",
            &format!(
                "Your claim {} for {credits_requested} credits is pending review.",
                claim.claim_id
            ),
        )
        .await;

        Ok(claim)
    }

    /// Regulator picks up a pending claim.
    #[instrument(skip(self), fields(regulator = %actor.user_id))]
    pub fn begin_review(&self, actor: &Actor, claim_id: &str) -> Result<CreditClaim, MarketError> {
        auth::require_role(actor, Role::Regulator)?;
        let claim = Store::update(&self.store.claims, claim_id, "claim", |mut claim: CreditClaim| {
            claim.transition(ClaimStatus::UnderReview)?;
            Ok(claim)
        })?;

        info!(claim_id, "claim under review");
        Ok(claim)
    }

    #[instrument(skip(self), fields(inspector = %actor.user_id))]
    pub async fn schedule_inspection(
        &self,
        actor: &Actor,
        claim_id: &str,
        inspection_date: TimeStamp<Utc>,
    ) -> Result<CreditClaim, MarketError> {
        auth::require_role(actor, Role::Regulator)?;
        if !inspection_date.is_future() {
            return Err(MarketError::InvalidArgument(
                "inspection date must be in the future".into(),
            ));
        }

        let claim = Store::update(&self.store.claims, claim_id, "claim", |mut claim: CreditClaim| {
            if !matches!(claim.status, ClaimStatus::Pending | ClaimStatus::UnderReview) {
                return Err(MarketError::InvalidState(format!(
                    "claim '{claim_id}' is {:?}, inspections are scheduled from pending or under review",
                    claim.status
                )));
            }
            claim.transition(ClaimStatus::InspectionScheduled)?;
            claim.inspection.inspector = Some(actor.user_id.clone());
            claim.inspection.scheduled_date = Some(inspection_date.clone());
            Ok(claim)
        })?;

        info!(claim_id, "inspection scheduled");
        self.notify_user(
            &claim.developer,
            "Inspection scheduled",
            &format!(
                "An inspection for claim {claim_id} is scheduled for {}.",
                inspection_date.to_datetime_utc().format("%Y-%m-%d")
            ),
        )
        .await;

        Ok(claim)
    }

    /// Only the inspector assigned at scheduling time may record the outcome.
    #[instrument(skip(self, findings), fields(inspector = %actor.user_id))]
    pub async fn complete_inspection(
        &self,
        actor: &Actor,
        claim_id: &str,
        findings: &str,
        result: InspectionResult,
    ) -> Result<CreditClaim, MarketError> {
        auth::require_role(actor, Role::Regulator)?;
        if result == InspectionResult::NotStarted {
            return Err(MarketError::InvalidArgument(
                "inspection result must be passed, failed or partial".into(),
            ));
        }

        let claim = Store::update(&self.store.claims, claim_id, "claim", |mut claim: CreditClaim| {
            if claim.status != ClaimStatus::InspectionScheduled {
                return Err(MarketError::InvalidState(format!(
                    "claim '{claim_id}' is {:?}, no inspection is scheduled",
                    claim.status
                )));
            }
            if claim.inspection.inspector.as_deref() != Some(actor.user_id.as_str()) {
                return Err(MarketError::Forbidden(format!(
                    "user '{}' is not the assigned inspector",
                    actor.user_id
                )));
            }
            claim.transition(ClaimStatus::InspectionCompleted)?;
            claim.inspection.findings = findings.to_string();
            claim.inspection.result = result;
            claim.inspection.completed_date = Some(TimeStamp::new());
            Ok(claim)
        })?;

        info!(claim_id, result = ?result, "inspection completed");
        self.notify_user(
            &claim.developer,
            "Inspection completed",
            &format!("The inspection for claim {claim_id} finished with result {result:?}."),
        )
        .await;

        Ok(claim)
    }

    /// Transfer the approved credits to the developer, then approve the claim
    /// and complete its project in one transaction.
    #[instrument(skip(self, comments), fields(regulator = %actor.user_id))]
    pub async fn issue_credits(
        &self,
        actor: &Actor,
        claim_id: &str,
        approved_credits: Credits,
        comments: &str,
    ) -> Result<CreditClaim, MarketError> {
        auth::require_role(actor, Role::Regulator)?;

        let ttl = self.config.in_flight_ttl;
        let marker = encode(&InflightMarker::new(&actor.user_id))?;
        let claim: CreditClaim = (&self.store.claims, &self.store.inflight)
            .transaction(|(claims, inflight)| {
                let claim: CreditClaim = tx_require(claims, claim_id, "claim")?;
                if tx_live_marker(inflight, claim_id, ttl)?.is_some() {
                    return abort(MarketError::InvalidState(format!(
                        "claim '{claim_id}' has an issuance in progress"
                    )));
                }
                if let Err(err) = claim.check_issuable(approved_credits) {
                    return abort(err);
                }
                inflight.insert(claim_id.as_bytes(), marker.as_slice())?;
                Ok(claim)
            })
            .map_err(MarketError::from)?;
        let _guard = InflightGuard::held(&self.store.inflight, claim_id, marker);

        let developer: Account = Store::require(&self.store.accounts, &claim.developer, "account")?;
        let wallet = developer.require_wallet()?.clone();

        let receipt = with_timeout(
            self.config.ledger_timeout,
            "credit issuance transfer",
            self.ledger
                .transfer(&self.config.regulator_signer, &wallet, approved_credits),
        )
        .await
        .inspect_err(|err| warn!(claim_id, %err, "issuance transfer failed, claim unchanged"))?;

        let committed = (&self.store.claims, &self.store.open_claims, &self.store.projects)
            .transaction(|(claims, open_claims, projects)| {
                let mut claim: CreditClaim = tx_require(claims, claim_id, "claim")?;
                if let Err(err) = claim.transition(ClaimStatus::Approved) {
                    return abort(err);
                }
                let now = TimeStamp::new();
                claim.issuance = CreditIssuance {
                    approved_credits: Some(approved_credits),
                    issued_at: Some(now.clone()),
                    credits_issued: true,
                    tx_hash: Some(receipt.tx_hash.clone()),
                    block_number: Some(receipt.block_number),
                };
                claim.review = Some(ClaimReview {
                    reviewed_by: actor.user_id.clone(),
                    reviewed_at: now,
                    comments: comments.to_string(),
                });
                tx_save(claims, claim_id, &claim)?;
                open_claims.remove(claim.project_id.as_bytes())?;

                if let Some(mut project) = tx_load::<Project>(projects, &claim.project_id)? {
                    if project.status.can_transition_to(ProjectStatus::Completed) {
                        project.status = ProjectStatus::Completed;
                        project.updated_at = TimeStamp::new();
                        tx_save(projects, &project.project_id, &project)?;
                    }
                }
                Ok(claim)
            })
            .map_err(MarketError::from);

        let claim = match committed {
            Ok(claim) => claim,
            Err(err) => {
                error!(
                    claim_id,
                    tx_hash = %receipt.tx_hash,
                    %err,
                    "credits transferred on chain but the claim could not be approved"
                );
                return Err(err);
            }
        };

        info!(claim_id, approved_credits, tx_hash = %receipt.tx_hash, "credits issued");
        self.notify_user(
            &claim.developer,
            "Credits issued",
            &format!(
                "{approved_credits} credits for claim {claim_id} were sent to {wallet} (tx {}).",
                receipt.tx_hash
            ),
        )
        .await;

        Ok(claim)
    }

    #[instrument(skip(self, reason), fields(regulator = %actor.user_id))]
    pub async fn reject_claim(
        &self,
        actor: &Actor,
        claim_id: &str,
        reason: &str,
    ) -> Result<CreditClaim, MarketError> {
        auth::require_role(actor, Role::Regulator)?;
        if reason.trim().is_empty() {
            return Err(MarketError::InvalidArgument("rejection needs a reason".into()));
        }

        let ttl = self.config.in_flight_ttl;
        let claim: CreditClaim = (&self.store.claims, &self.store.open_claims, &self.store.inflight)
            .transaction(|(claims, open_claims, inflight)| {
                let mut claim: CreditClaim = tx_require(claims, claim_id, "claim")?;
                if claim.status == ClaimStatus::Approved {
                    return abort(MarketError::InvalidState(format!(
                        "claim '{claim_id}' is approved and final"
                    )));
                }
                if tx_live_marker(inflight, claim_id, ttl)?.is_some() {
                    return abort(MarketError::InvalidState(format!(
                        "claim '{claim_id}' has an issuance in progress"
                    )));
                }
                inflight.remove(claim_id.as_bytes())?;
                if let Err(err) = claim.transition(ClaimStatus::Rejected) {
                    return abort(err);
                }
                claim.review = Some(ClaimReview {
                    reviewed_by: actor.user_id.clone(),
                    reviewed_at: TimeStamp::new(),
                    comments: reason.to_string(),
                });
                tx_save(claims, claim_id, &claim)?;
                open_claims.remove(claim.project_id.as_bytes())?;
                Ok(claim)
            })
            .map_err(MarketError::from)?;

        info!(claim_id, "claim rejected");
        self.notify_user(
            &claim.developer,
            "Credit claim rejected",
            &format!("Claim {claim_id} was rejected: {reason}"),
        )
        .await;

        Ok(claim)
    }

    pub fn get_claim(&self, actor: &Actor, claim_id: &str) -> Result<CreditClaim, MarketError> {
        let claim: CreditClaim = Store::require(&self.store.claims, claim_id, "claim")?;
        auth::require_owner_or_regulator(actor, &claim.developer, "claim")?;
        Ok(claim)
    }

    pub fn claims_for_project(
        &self,
        actor: &Actor,
        project_id: &str,
    ) -> Result<Vec<CreditClaim>, MarketError> {
        let project: Project = Store::require(&self.store.projects, project_id, "project")?;
        auth::require_owner_or_regulator(actor, &project.developer, "project")?;

        let claims: Vec<CreditClaim> = Store::scan(&self.store.claims, "")?;
        Ok(claims
            .into_iter()
            .filter(|c| c.project_id == project_id)
            .collect())
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
