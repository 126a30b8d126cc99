//! Human feedback: ratings, ops reviews, and per-turn annotations
//! from which inter-annotator agreement is computed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Feedback attached to a conversation after ingest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feedback {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_rating: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ops_review: Option<OpsReview>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<Annotation>,
}

/// A free-form quality note from an operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpsReview {
    pub quality: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// One annotator's label on a conversation or turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Annotation {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<i64>,
    pub annotator_id: String,
    #[serde(rename = "type")]
    pub annotation_type: String,
    pub label: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Inter-annotator agreement over one conversation's annotations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgreementMetrics {
    pub cohen_kappa: f64,
    pub fleiss_kappa: f64,
    pub percent_agree: f64,
    pub needs_review: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_feedback_deserializes() {
        let json = r#"{"annotations": [{"annotator_id": "a1", "type": "quality", "label": "good"}]}"#;
        let feedback: Feedback = serde_json::from_str(json).unwrap();
        assert!(feedback.user_rating.is_none());
        assert_eq!(feedback.annotations.len(), 1);
        assert_eq!(feedback.annotations[0].label, "good");
    }
}
