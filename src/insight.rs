//! Insights: the mutable, user-facing unit of action.
//!
//! An insight summarizes one or more predictions for one `(entity, type)`
//! slot. It references (never owns) the predictions that justify it and
//! moves through the annotation lifecycle until it is applied to the
//! catalog, rejected, superseded or closed by entity deletion.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::EntityId;
use crate::prediction::{PredictionId, PredictionType};
use crate::value::Value;
use crate::vote::VoteTally;

/// Unique identifier for an insight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InsightId(Uuid);

impl InsightId {
    /// Creates a new random insight ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for InsightId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InsightId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of an insight.
///
/// ```text
/// PENDING -> ANNOTATED_ACCEPTED -> APPLIED | APPLY_FAILED
/// PENDING -> ANNOTATED_REJECTED
/// PENDING -> VOTE_ACCUMULATING -> VOTE_ACCEPTED -> APPLIED | APPLY_FAILED
///                             \-> VOTE_REJECTED
/// PENDING -> AUTO_APPLIED (-> APPLY_FAILED)
/// APPLY_FAILED -> APPLIED (retry)
/// any non-terminal -> SUPERSEDED | ENTITY_DELETED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightStatus {
    Pending,
    VoteAccumulating,
    AnnotatedAccepted,
    AnnotatedRejected,
    VoteAccepted,
    VoteRejected,
    AutoApplied,
    Applied,
    ApplyFailed,
    Superseded,
    EntityDeleted,
}

impl Default for InsightStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl InsightStatus {
    /// Terminal states never transition again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::AnnotatedRejected
                | Self::VoteRejected
                | Self::AutoApplied
                | Self::Applied
                | Self::Superseded
                | Self::EntityDeleted
        )
    }

    /// Open insights occupy their slot.
    #[must_use]
    pub const fn is_open(self) -> bool {
        !self.is_terminal()
    }

    /// States a newer, different value may replace.
    #[must_use]
    pub const fn is_supersedable(self) -> bool {
        matches!(self, Self::Pending | Self::VoteAccumulating | Self::ApplyFailed)
    }

    /// States that still accept anonymous votes.
    #[must_use]
    pub const fn accepts_votes(self) -> bool {
        matches!(self, Self::Pending | Self::VoteAccumulating)
    }

    /// A human or vote rejected the value.
    #[must_use]
    pub const fn is_rejected(self) -> bool {
        matches!(self, Self::AnnotatedRejected | Self::VoteRejected)
    }

    /// The value reached the catalog.
    #[must_use]
    pub const fn is_applied(self) -> bool {
        matches!(self, Self::Applied | Self::AutoApplied)
    }

    /// Returns the stable snake_case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::VoteAccumulating => "vote_accumulating",
            Self::AnnotatedAccepted => "annotated_accepted",
            Self::AnnotatedRejected => "annotated_rejected",
            Self::VoteAccepted => "vote_accepted",
            Self::VoteRejected => "vote_rejected",
            Self::AutoApplied => "auto_applied",
            Self::Applied => "applied",
            Self::ApplyFailed => "apply_failed",
            Self::Superseded => "superseded",
            Self::EntityDeleted => "entity_deleted",
        }
    }
}

impl fmt::Display for InsightStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A human or anonymous verdict on an insight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationValue {
    Accept,
    Reject,
    /// "I don't know": recorded, never decisive.
    Unknown,
}

impl fmt::Display for AnnotationValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accept => f.write_str("accept"),
            Self::Reject => f.write_str("reject"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// A user-actionable record for one `(entity, type)` slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub id: InsightId,
    pub entity_id: EntityId,
    #[serde(rename = "type")]
    pub insight_type: PredictionType,
    pub value: Value,
    pub status: InsightStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,

    pub source_prediction_ids: Vec<PredictionId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_asset_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign: Option<String>,

    pub automatic_processing_eligible: bool,
    pub created_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotated_at: Option<DateTime<Utc>>,

    /// `None` on the anonymous vote and automatic paths.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotator_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotation_value: Option<AnnotationValue>,

    #[serde(default)]
    pub vote_tally: VoteTally,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<InsightId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub apply_attempts: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_apply_error: Option<String>,

    /// Set while an `APPLY_FAILED` insight awaits an automatic retry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl Insight {
    /// Creates a `PENDING` insight for a slot value.
    #[must_use]
    pub fn pending(
        entity_id: EntityId,
        insight_type: PredictionType,
        value: Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: InsightId::new(),
            entity_id,
            insight_type,
            value,
            status: InsightStatus::Pending,
            confidence: None,
            source_prediction_ids: Vec::new(),
            source_asset_id: None,
            campaign: None,
            automatic_processing_eligible: false,
            created_at,
            annotated_at: None,
            annotator_id: None,
            annotation_value: None,
            vote_tally: VoteTally::default(),
            superseded_by: None,
            applied_at: None,
            apply_attempts: 0,
            last_apply_error: None,
            next_retry_at: None,
        }
    }

    /// Returns true if this insight holds `value` (and, for image-scoped
    /// types, comes from `asset`).
    #[must_use]
    pub fn holds(&self, value: &Value, asset: Option<&str>) -> bool {
        self.value == *value
            && (!self.insight_type.is_image_scoped() || self.source_asset_id.as_deref() == asset)
    }

    /// Returns true if this insight is waiting for an automatic apply retry.
    #[must_use]
    pub fn awaits_retry(&self) -> bool {
        self.status == InsightStatus::ApplyFailed && self.next_retry_at.is_some()
    }
}

/// Read-side filter over insights.
#[derive(Debug, Clone, Default)]
pub struct InsightQuery {
    pub entity_id: Option<EntityId>,
    pub insight_type: Option<PredictionType>,
    pub statuses: Vec<InsightStatus>,
    pub campaign: Option<String>,
    pub limit: Option<usize>,
}

impl InsightQuery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pending insights awaiting a human or vote.
    #[must_use]
    pub fn pending() -> Self {
        Self::new().statuses([InsightStatus::Pending, InsightStatus::VoteAccumulating])
    }

    #[must_use]
    pub fn entity(mut self, entity_id: EntityId) -> Self {
        self.entity_id = Some(entity_id);
        self
    }

    #[must_use]
    pub fn insight_type(mut self, insight_type: PredictionType) -> Self {
        self.insight_type = Some(insight_type);
        self
    }

    #[must_use]
    pub fn statuses(mut self, statuses: impl IntoIterator<Item = InsightStatus>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    #[must_use]
    pub fn campaign(mut self, campaign: impl Into<String>) -> Self {
        self.campaign = Some(campaign.into());
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns true if `insight` passes every set filter.
    #[must_use]
    pub fn matches(&self, insight: &Insight) -> bool {
        self.entity_id.as_ref().map_or(true, |e| *e == insight.entity_id)
            && self.insight_type.map_or(true, |t| t == insight.insight_type)
            && (self.statuses.is_empty() || self.statuses.contains(&insight.status))
            && self
                .campaign
                .as_deref()
                .map_or(true, |c| insight.campaign.as_deref() == Some(c))
    }
}
