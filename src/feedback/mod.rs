//! Human-feedback processing: inter-annotator agreement and the
//! confidence-based review router.

pub mod agreement;
pub mod router;

pub use agreement::AgreementCalculator;
pub use router::{ConfidenceRouter, ReviewDecision, ReviewRouter};
