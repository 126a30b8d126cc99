//! Confidence-based review routing.
//!
//! After aggregation, an ordered list of predicates decides whether
//! the automated verdict is trusted. First matching reason wins; the
//! priority ladder is evaluated independently so a bad score in a
//! partial evaluation still surfaces urgently.

use crate::domain::{AggregatedEvaluation, AggregatedStatus};

/// Confidence at or above which an evaluation can ship unreviewed.
const AUTO_ACCEPT_THRESHOLD: f64 = 0.85;
/// Confidence below which human review is mandatory.
const REVIEW_THRESHOLD: f64 = 0.60;
/// Overall score below which quality review fires.
const LOW_QUALITY_THRESHOLD: f64 = 0.5;
/// Overall score below which the review is urgent.
const CRITICAL_QUALITY_THRESHOLD: f64 = 0.3;

/// Confidence band thresholds shared by routing decisions.
#[derive(Default)]
pub struct ConfidenceRouter;

impl ConfidenceRouter {
    pub fn new() -> Self {
        Self
    }

    /// High-confidence verdicts are auto-accepted.
    pub fn auto_accepts(&self, confidence: f64) -> bool {
        confidence >= AUTO_ACCEPT_THRESHOLD
    }

    /// Low-confidence verdicts must be reviewed by a human.
    pub fn needs_human_review(&self, confidence: f64) -> bool {
        confidence < REVIEW_THRESHOLD
    }
}

/// Why and how urgently a conversation goes to human review.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewDecision {
    pub reason: String,
    /// 1 is most urgent, 3 least.
    pub priority: i32,
    /// Mean confidence of the successful evaluations.
    pub routing_confidence: f64,
}

/// Decides which aggregated verdicts are trusted and which are
/// enqueued for human review.
#[derive(Default)]
pub struct ReviewRouter {
    confidence: ConfidenceRouter,
}

impl ReviewRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate the routing predicates. `disagreement` is the
    /// annotator-agreement flag computed by the worker; it forces
    /// review even when the automated verdict looks fine.
    pub fn route(
        &self,
        result: &AggregatedEvaluation,
        disagreement: bool,
    ) -> Option<ReviewDecision> {
        let mean_confidence = result.mean_confidence();

        let fires = result.status != AggregatedStatus::Success
            || self.confidence.needs_human_review(mean_confidence)
            || result.scores.overall < LOW_QUALITY_THRESHOLD
            || disagreement;

        if !fires {
            return None;
        }

        Some(ReviewDecision {
            reason: self.classify_reason(result, mean_confidence, disagreement),
            priority: self.classify_priority(result, disagreement),
            routing_confidence: mean_confidence,
        })
    }

    /// First matching reason wins, top-down.
    fn classify_reason(
        &self,
        result: &AggregatedEvaluation,
        mean_confidence: f64,
        disagreement: bool,
    ) -> String {
        match result.status {
            AggregatedStatus::Failed => "evaluation_failed".to_string(),
            AggregatedStatus::Partial => format!(
                "partial_evaluation_{}_{}",
                result.successful_count, result.expected_count
            ),
            AggregatedStatus::Success => {
                if result.scores.overall < LOW_QUALITY_THRESHOLD {
                    "low_quality_score".to_string()
                } else if self.confidence.needs_human_review(mean_confidence) {
                    "low_confidence".to_string()
                } else if disagreement {
                    "annotator_disagreement".to_string()
                } else {
                    "quality_review".to_string()
                }
            }
        }
    }

    fn classify_priority(&self, result: &AggregatedEvaluation, disagreement: bool) -> i32 {
        if result.status == AggregatedStatus::Failed {
            return 1;
        }
        if result.scores.overall < CRITICAL_QUALITY_THRESHOLD {
            return 1;
        }
        if result.status == AggregatedStatus::Partial {
            return 2;
        }
        if result.scores.overall < LOW_QUALITY_THRESHOLD {
            return 2;
        }
        if disagreement {
            // A clean verdict humans disagree about is worth a look
            // before the backlog tail.
            return 2;
        }
        3
    }
}
