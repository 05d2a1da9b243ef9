//! Credit claims and the allowed transitions between their states
use super::error::MarketError;
use super::types::{Credits, TimeStamp};
use chrono::Utc;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    UnderReview,
    #[n(2)]
    InspectionScheduled,
    #[n(3)]
    InspectionCompleted,
    #[n(4)]
    Approved,
    #[n(5)]
    Rejected,
}

impl ClaimStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ClaimStatus::Approved | ClaimStatus::Rejected)
    }

    pub fn can_transition_to(self, next: ClaimStatus) -> bool {
        use ClaimStatus::*;
        match (self, next) {
            (from, Rejected) => !from.is_terminal(),
            (Pending, UnderReview)
            | (Pending, InspectionScheduled)
            | (UnderReview, InspectionScheduled)
            | (InspectionScheduled, InspectionCompleted)
            | (InspectionCompleted, Approved) => true,
            _ => false,
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InspectionResult {
    #[n(0)]
    NotStarted,
    #[n(1)]
    Passed,
    #[n(2)]
    Failed,
    #[n(3)]
    Partial,
}

impl InspectionResult {
    /// Credits may only be issued after a passed or partially passed inspection
    pub fn permits_issuance(self) -> bool {
        matches!(self, InspectionResult::Passed | InspectionResult::Partial)
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ReportingPeriod {
    #[n(0)]
    pub start: TimeStamp<Utc>,
    #[n(1)]
    pub end: TimeStamp<Utc>,
}

impl ReportingPeriod {
    pub fn new(start: TimeStamp<Utc>, end: TimeStamp<Utc>) -> Result<Self, MarketError> {
        if start >= end {
            return Err(MarketError::InvalidArgument(
                "reporting period must end after it starts".into(),
            ));
        }
        Ok(Self { start, end })
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ClaimDetails {
    #[n(0)]
    pub credits_requested: Credits,
    #[n(1)]
    pub reporting_period: ReportingPeriod,
    #[n(2)]
    pub mrv_data_refs: Vec<String>, // informational only
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Inspection {
    #[n(0)]
    pub scheduled_date: Option<TimeStamp<Utc>>,
    #[n(1)]
    pub inspector: Option<String>, // regulator assigned when scheduling
    #[n(2)]
    pub completed_date: Option<TimeStamp<Utc>>,
    #[n(3)]
    pub findings: String,
    #[n(4)]
    pub result: InspectionResult,
}

impl Default for Inspection {
    fn default() -> Self {
        Self {
            scheduled_date: None,
            inspector: None,
            completed_date: None,
            findings: String::new(),
            result: InspectionResult::NotStarted,
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Default, PartialEq, Eq)]
pub struct CreditIssuance {
    #[n(0)]
    pub approved_credits: Option<Credits>, // written once
    #[n(1)]
    pub issued_at: Option<TimeStamp<Utc>>,
    #[n(2)]
    pub credits_issued: bool,
    #[n(3)]
    pub tx_hash: Option<String>,
    #[n(4)]
    pub block_number: Option<u64>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ClaimReview {
    #[n(0)]
    pub reviewed_by: String,
    #[n(1)]
    pub reviewed_at: TimeStamp<Utc>,
    #[n(2)]
    pub comments: String,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct CreditClaim {
    #[n(0)]
    pub claim_id: String,
    #[n(1)]
    pub project_id: String,
    #[n(2)]
    pub developer: String,
    #[n(3)]
    pub details: ClaimDetails,
    #[n(4)]
    pub status: ClaimStatus,
    #[n(5)]
    pub inspection: Inspection,
    #[n(6)]
    pub issuance: CreditIssuance,
    #[n(7)]
    pub review: Option<ClaimReview>,
    #[n(8)]
    pub created_at: TimeStamp<Utc>,
    #[n(9)]
    pub updated_at: TimeStamp<Utc>,
}

impl CreditClaim {
    pub fn transition(&mut self, next: ClaimStatus) -> Result<(), MarketError> {
        if !self.status.can_transition_to(next) {
            return Err(MarketError::InvalidState(format!(
                "claim '{}' cannot move from {:?} to {:?}",
                self.claim_id, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = TimeStamp::new();
        Ok(())
    }

    /// Checks that issuing `approved_credits` is allowed right now.
    pub fn check_issuable(&self, approved_credits: Credits) -> Result<(), MarketError> {
        if self.status != ClaimStatus::InspectionCompleted {
            return Err(MarketError::InvalidState(format!(
                "claim '{}' is {:?}, issuance needs a completed inspection",
                self.claim_id, self.status
            )));
        }
        if self.issuance.approved_credits.is_some() {
            return Err(MarketError::InvalidState(format!(
                "claim '{}' already has approved credits",
                self.claim_id
            )));
        }
        if !self.inspection.result.permits_issuance() {
            return Err(MarketError::InvalidArgument(format!(
                "inspection result {:?} does not permit issuance",
                self.inspection.result
            )));
        }
        if approved_credits == 0 || approved_credits > self.details.credits_requested {
            return Err(MarketError::InvalidArgument(format!(
                "approved credits must be within 1..={}, got {approved_credits}",
                self.details.credits_requested
            )));
        }
        Ok(())
    }

    pub fn approved_credits(&self) -> Credits {
        self.issuance.approved_credits.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ClaimStatus::*;

    const ALL: [ClaimStatus; 6] = [
        Pending,
        UnderReview,
        InspectionScheduled,
        InspectionCompleted,
        Approved,
        Rejected,
    ];

    #[test]
    fn terminal_states_have_no_exits() {
        for next in ALL {
            assert!(!Approved.can_transition_to(next));
            assert!(!Rejected.can_transition_to(next));
        }
    }

    #[test]
    fn every_live_state_can_be_rejected() {
        for from in ALL.into_iter().filter(|s| !s.is_terminal()) {
            assert!(from.can_transition_to(Rejected), "{from:?}");
        }
    }

    #[test]
    fn approval_only_after_inspection() {
        for from in ALL {
            assert_eq!(from.can_transition_to(Approved), from == InspectionCompleted);
        }
    }

    #[test]
    fn scheduling_allowed_from_pending_or_review() {
        assert!(Pending.can_transition_to(InspectionScheduled));
        assert!(UnderReview.can_transition_to(InspectionScheduled));
        assert!(!InspectionCompleted.can_transition_to(InspectionScheduled));
        assert!(!InspectionScheduled.can_transition_to(UnderReview));
    }

    #[test]
    fn reporting_period_must_be_ordered() {
        let start = TimeStamp::new_with(2024, 1, 1, 0, 0, 0);
        let end = TimeStamp::new_with(2024, 12, 31, 0, 0, 0);
        assert!(ReportingPeriod::new(start.clone(), end.clone()).is_ok());
        assert!(ReportingPeriod::new(end, start).is_err());
    }

    #[test]
    fn empty_reporting_period_is_refused() {
        let instant = TimeStamp::new_with(2024, 6, 30, 12, 0, 0);
        let err = ReportingPeriod::new(instant.clone(), instant).unwrap_err();
        assert!(matches!(err, MarketError::InvalidArgument(_)));
    }
}
