//! Anonymous votes and their aggregation.
//!
//! Votes are stored one row per `(insight, fingerprint)`: casting again
//! replaces the earlier vote. The tally is always recomputed from the rows,
//! so it survives restarts and never double-counts.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::insight::{AnnotationValue, InsightId};

/// One anonymous vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub insight_id: InsightId,
    pub voter_fingerprint: String,
    pub value: AnnotationValue,
    pub cast_at: DateTime<Utc>,
}

impl Vote {
    #[must_use]
    pub fn new(insight_id: InsightId, voter_fingerprint: impl Into<String>, value: AnnotationValue) -> Self {
        Self {
            insight_id,
            voter_fingerprint: voter_fingerprint.into(),
            value,
            cast_at: Utc::now(),
        }
    }
}

/// Vote counts per value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VoteTally(BTreeMap<AnnotationValue, u32>);

impl VoteTally {
    /// Aggregates a set of votes (one per fingerprint).
    pub fn from_votes<'a>(votes: impl IntoIterator<Item = &'a Vote>) -> Self {
        let mut counts = BTreeMap::new();
        for vote in votes {
            *counts.entry(vote.value).or_insert(0) += 1;
        }
        Self(counts)
    }

    /// Number of votes for `value`.
    #[must_use]
    pub fn count(&self, value: AnnotationValue) -> u32 {
        self.0.get(&value).copied().unwrap_or(0)
    }

    /// Total votes counted.
    #[must_use]
    pub fn total(&self) -> u32 {
        self.0.values().sum()
    }

    /// Returns the decisive value once accept or reject reaches `threshold`.
    ///
    /// `Unknown` votes never decide. There is no majority shortcut below the
    /// threshold.
    #[must_use]
    pub fn consensus(&self, threshold: u32) -> Option<AnnotationValue> {
        [AnnotationValue::Accept, AnnotationValue::Reject]
            .into_iter()
            .find(|v| self.count(*v) >= threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn votes(values: &[AnnotationValue]) -> Vec<Vote> {
        let id = InsightId::new();
        values
            .iter()
            .enumerate()
            .map(|(i, v)| Vote::new(id, format!("fp-{i}"), *v))
            .collect()
    }

    #[test]
    fn tally_counts_per_value() {
        use AnnotationValue::{Accept, Reject, Unknown};
        let tally = VoteTally::from_votes(&votes(&[Accept, Reject, Accept, Unknown]));
        assert_eq!(tally.count(Accept), 2);
        assert_eq!(tally.count(Reject), 1);
        assert_eq!(tally.count(Unknown), 1);
        assert_eq!(tally.total(), 4);
    }

    #[test]
    fn consensus_needs_threshold() {
        use AnnotationValue::{Accept, Reject, Unknown};
        let tally = VoteTally::from_votes(&votes(&[Accept, Accept, Reject, Reject]));
        assert_eq!(tally.consensus(3), None);

        let tally = VoteTally::from_votes(&votes(&[Reject, Reject, Reject]));
        assert_eq!(tally.consensus(3), Some(Reject));

        let tally = VoteTally::from_votes(&votes(&[Unknown, Unknown, Unknown]));
        assert_eq!(tally.consensus(3), None);
    }

    #[test]
    fn tally_serializes_as_map() {
        use AnnotationValue::Accept;
        let tally = VoteTally::from_votes(&votes(&[Accept]));
        assert_eq!(serde_json::to_string(&tally).unwrap(), r#"{"accept":1}"#);
    }
}
