//! Offset projects and their verification pipeline
use super::auth;
use super::error::MarketError;
use super::store::{Store, decode};
use super::types::{Actor, Credits, Role, TimeStamp};
use super::utils;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, instrument};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectType {
    #[n(0)]
    Reforestation,
    #[n(1)]
    RenewableEnergy,
    #[n(2)]
    EnergyEfficiency,
    #[n(3)]
    MethaneCapture,
    #[n(4)]
    BlueCarbon,
    #[n(5)]
    SoilCarbon,
    #[n(6)]
    Other,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectStatus {
    #[n(0)]
    Draft,
    #[n(1)]
    Submitted,
    #[n(2)]
    UnderReview,
    #[n(3)]
    Approved,
    #[n(4)]
    Rejected,
    #[n(5)]
    Completed,
}

impl ProjectStatus {
    /// One-directional verification pipeline, rejection is final.
    pub fn can_transition_to(self, next: ProjectStatus) -> bool {
        use ProjectStatus::*;
        matches!(
            (self, next),
            (Draft, Submitted)
                | (Submitted, UnderReview)
                | (Submitted, Rejected)
                | (UnderReview, Approved)
                | (UnderReview, Rejected)
                | (Approved, Completed)
        )
    }
    pub fn is_deletable(self) -> bool {
        matches!(self, ProjectStatus::Draft | ProjectStatus::Rejected)
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ProjectDetails {
    #[n(0)]
    pub expected_credits: Credits, // ceiling for any single claim
    #[n(1)]
    pub methodology: String,
    #[n(2)]
    pub description: String,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ProjectReview {
    #[n(0)]
    pub reviewed_by: String,
    #[n(1)]
    pub reviewed_at: TimeStamp<Utc>,
    #[n(2)]
    pub comments: String,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Project {
    #[n(0)]
    pub project_id: String,
    #[n(1)]
    pub developer: String, // user id of the owner
    #[n(2)]
    pub name: String,
    #[n(3)]
    pub project_type: ProjectType,
    #[n(4)]
    pub location: String,
    #[n(5)]
    pub details: ProjectDetails,
    #[n(6)]
    pub status: ProjectStatus,
    #[n(7)]
    pub review: Option<ProjectReview>,
    #[n(8)]
    pub created_at: TimeStamp<Utc>,
    #[n(9)]
    pub updated_at: TimeStamp<Utc>,
}

impl Project {
    /// Apply a status change if the pipeline allows it.
    pub fn transition(&mut self, next: ProjectStatus) -> Result<(), MarketError> {
        if !self.status.can_transition_to(next) {
            return Err(MarketError::InvalidState(format!(
                "project '{}' cannot move from {:?} to {:?}",
                self.project_id, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = TimeStamp::new();
        Ok(())
    }
}

// used for constructing registrations
#[derive(Debug, Default)]
pub struct NewProject {
    pub name: String,
    pub project_type: Option<ProjectType>,
    pub location: String,
    pub expected_credits: Credits,
    pub methodology: String,
    pub description: String,
}

impl NewProject {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
    pub fn set_type(mut self, project_type: ProjectType) -> Self {
        self.project_type = Some(project_type);
        self
    }
    pub fn set_location(mut self, location: &str) -> Self {
        self.location = location.to_string();
        self
    }
    pub fn set_expected_credits(mut self, credits: Credits) -> Self {
        self.expected_credits = credits;
        self
    }
    pub fn set_methodology(mut self, methodology: &str) -> Self {
        self.methodology = methodology.to_string();
        self
    }
    pub fn set_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }
    fn validate(&self) -> Result<ProjectType, MarketError> {
        if self.name.trim().is_empty() {
            return Err(MarketError::InvalidArgument("project name is empty".into()));
        }
        if self.location.trim().is_empty() {
            return Err(MarketError::InvalidArgument("project location is empty".into()));
        }
        if self.expected_credits == 0 {
            return Err(MarketError::InvalidArgument(
                "expected credits is set to zero".into(),
            ));
        }
        self.project_type
            .ok_or_else(|| MarketError::InvalidArgument("project type is not set".into()))
    }
}

pub struct ProjectRegistry {
    store: Arc<Store>,
}

impl ProjectRegistry {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Register a new project in `Draft`
    #[instrument(skip(self, draft), fields(developer = %actor.user_id))]
    pub fn register(&self, actor: &Actor, draft: NewProject) -> Result<Project, MarketError> {
        auth::require_role(actor, Role::Developer)?;
        let project_type = draft.validate()?;

        let now = TimeStamp::new();
        let project = Project {
            project_id: utils::new_project_id(self.store.next_id()?),
            developer: actor.user_id.clone(),
            name: draft.name.trim().to_string(),
            project_type,
            location: draft.location.trim().to_string(),
            details: ProjectDetails {
                expected_credits: draft.expected_credits,
                methodology: draft.methodology,
                description: draft.description,
            },
            status: ProjectStatus::Draft,
            review: None,
            created_at: now.clone(),
            updated_at: now,
        };
        Store::save(&self.store.projects, &project.project_id, &project)?;

        info!(project_id = %project.project_id, "project registered");
        Ok(project)
    }

    pub fn submit_for_review(&self, actor: &Actor, project_id: &str) -> Result<Project, MarketError> {
        self.mutate(project_id, |project| {
            auth::require_owner(actor, &project.developer, "project")?;
            project.transition(ProjectStatus::Submitted)
        })
    }

    pub fn begin_review(&self, actor: &Actor, project_id: &str) -> Result<Project, MarketError> {
        auth::require_role(actor, Role::Regulator)?;
        self.mutate(project_id, |project| project.transition(ProjectStatus::UnderReview))
    }

    #[instrument(skip(self, comments), fields(regulator = %actor.user_id))]
    pub fn approve(&self, actor: &Actor, project_id: &str, comments: &str) -> Result<Project, MarketError> {
        auth::require_role(actor, Role::Regulator)?;
        self.mutate(project_id, |project| {
            project.transition(ProjectStatus::Approved)?;
            project.review = Some(ProjectReview {
                reviewed_by: actor.user_id.clone(),
                reviewed_at: TimeStamp::new(),
                comments: comments.to_string(),
            });
            Ok(())
        })
    }

    #[instrument(skip(self, reason), fields(regulator = %actor.user_id))]
    pub fn reject(&self, actor: &Actor, project_id: &str, reason: &str) -> Result<Project, MarketError> {
        auth::require_role(actor, Role::Regulator)?;
        if reason.trim().is_empty() {
            return Err(MarketError::InvalidArgument("rejection needs a reason".into()));
        }
        self.mutate(project_id, |project| {
            project.transition(ProjectStatus::Rejected)?;
            project.review = Some(ProjectReview {
                reviewed_by: actor.user_id.clone(),
                reviewed_at: TimeStamp::new(),
                comments: reason.to_string(),
            });
            Ok(())
        })
    }

    /// Hard delete, only before the project has been approved.
    pub fn delete(&self, actor: &Actor, project_id: &str) -> Result<(), MarketError> {
        let current = self
            .store
            .projects
            .get(project_id.as_bytes())?
            .ok_or_else(|| MarketError::not_found("project", project_id))?;
        let project: Project = decode(&current)?;

        auth::require_owner(actor, &project.developer, "project")?;
        if !project.status.is_deletable() {
            return Err(MarketError::InvalidState(format!(
                "project '{project_id}' is {:?} and can no longer be deleted",
                project.status
            )));
        }

        // only remove the record we inspected, a concurrent submit wins
        self.store
            .projects
            .compare_and_swap(project_id.as_bytes(), Some(&current), None as Option<Vec<u8>>)?
            .map_err(|_| {
                MarketError::InvalidState(format!("project '{project_id}' changed while deleting"))
            })?;

        info!(project_id, "project deleted");
        Ok(())
    }

    pub fn get(&self, project_id: &str) -> Result<Project, MarketError> {
        Store::require(&self.store.projects, project_id, "project")
    }

    pub fn list_by_developer(&self, developer: &str) -> Result<Vec<Project>, MarketError> {
        let projects: Vec<Project> = Store::scan(&self.store.projects, "")?;
        Ok(projects
            .into_iter()
            .filter(|p| p.developer == developer)
            .collect())
    }

    fn mutate<F>(&self, project_id: &str, mut f: F) -> Result<Project, MarketError>
    where
        F: FnMut(&mut Project) -> Result<(), MarketError>,
    {
        let project = Store::update(&self.store.projects, project_id, "project", |mut project| {
            f(&mut project)?;
            Ok(project)
        })?;
        info!(project_id, status = ?project.status, "project status changed");
        Ok(project)
    }
}
