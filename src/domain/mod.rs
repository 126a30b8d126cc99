//! Domain types shared across the pipeline.

pub mod annotation;
pub mod conversation;
pub mod evaluation;
pub mod review;

pub use annotation::{AgreementMetrics, Annotation, Feedback, OpsReview};
pub use conversation::{Conversation, ToolCall, ToolResult, Turn};
pub use evaluation::{
    AggregatedEvaluation, AggregatedStatus, AggregatedTokenUsage, EvalStatus, Evaluation,
    EvaluatorFailure, EvaluatorType, Issue, Scores, Severity, TokenUsage, ToolEvaluation,
};
pub use review::{ReviewQueueItem, ReviewStatus};
