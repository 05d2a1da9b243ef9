//! Monitoring, reporting and verification evidence attached to projects.
//!
//! Records are append-only: once written they are never updated or removed,
//! the claim engine only asks whether a project has any.
use super::auth;
use super::error::MarketError;
use super::ports::{FileStore, with_timeout};
use super::project::{Project, ProjectStatus};
use super::store::Store;
use super::types::{Actor, TimeStamp};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct EvidenceRef {
    #[n(0)]
    pub filename: String,
    #[n(1)]
    pub content_id: String, // returned by the file store
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct MrvRecord {
    #[n(0)]
    pub project_id: String,
    #[n(1)]
    pub report_name: String,
    #[n(2)]
    pub description: String,
    #[n(3)]
    pub evidence: Vec<EvidenceRef>,
    #[n(4)]
    pub uploaded_by: String,
    #[n(5)]
    pub uploaded_at: TimeStamp<Utc>,
}

#[derive(Debug, Default)]
pub struct MrvSubmission {
    pub report_name: String,
    pub description: String,
    pub files: Vec<(String, Vec<u8>)>,
}

impl MrvSubmission {
    pub fn new(report_name: &str) -> Self {
        Self {
            report_name: report_name.to_string(),
            ..Self::default()
        }
    }
    pub fn set_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }
    pub fn add_file(mut self, filename: &str, bytes: Vec<u8>) -> Self {
        self.files.push((filename.to_string(), bytes));
        self
    }
}

pub struct MrvStore {
    store: Arc<Store>,
    files: Arc<dyn FileStore>,
    upload_timeout: Duration,
}

impl MrvStore {
    pub fn new(store: Arc<Store>, files: Arc<dyn FileStore>, upload_timeout: Duration) -> Self {
        Self {
            store,
            files,
            upload_timeout,
        }
    }

    /// Upload the evidence files then append one record for the report.
    #[instrument(skip(self, submission), fields(developer = %actor.user_id))]
    pub async fn submit(
        &self,
        actor: &Actor,
        project_id: &str,
        submission: MrvSubmission,
    ) -> Result<MrvRecord, MarketError> {
        let project: Project = Store::require(&self.store.projects, project_id, "project")?;
        auth::require_owner(actor, &project.developer, "project")?;

        if project.status == ProjectStatus::Rejected {
            return Err(MarketError::InvalidState(format!(
                "project '{project_id}' was rejected"
            )));
        }
        if submission.report_name.trim().is_empty() {
            return Err(MarketError::InvalidArgument("report name is empty".into()));
        }
        if submission.files.is_empty() {
            return Err(MarketError::InvalidArgument(
                "an MRV report needs at least one evidence file".into(),
            ));
        }

        let mut evidence = Vec::with_capacity(submission.files.len());
        for (filename, bytes) in &submission.files {
            let content_id = with_timeout(
                self.upload_timeout,
                "evidence upload",
                self.files.put(bytes, filename),
            )
            .await?;
            evidence.push(EvidenceRef {
                filename: filename.clone(),
                content_id,
            });
        }

        let record = MrvRecord {
            project_id: project_id.to_string(),
            report_name: submission.report_name.trim().to_string(),
            description: submission.description,
            evidence,
            uploaded_by: actor.user_id.clone(),
            uploaded_at: TimeStamp::new(),
        };
        let key = format!("{project_id}/{:020}", self.store.next_id()?);
        Store::save(&self.store.mrv, &key, &record)?;

        info!(project_id, files = record.evidence.len(), "mrv report recorded");
        Ok(record)
    }

    /// All reports for a project in submission order
    pub fn records(&self, project_id: &str) -> Result<Vec<MrvRecord>, MarketError> {
        Store::scan(&self.store.mrv, &format!("{project_id}/"))
    }

    pub fn has_evidence(&self, project_id: &str) -> Result<bool, MarketError> {
        has_evidence(&self.store, project_id)
    }
}

pub(crate) fn has_evidence(store: &Store, project_id: &str) -> Result<bool, MarketError> {
    match store.mrv.scan_prefix(format!("{project_id}/").as_bytes()).next() {
        Some(entry) => {
            entry?;
            Ok(true)
        }
        None => Ok(false),
    }
}
