//! Inter-annotator agreement over conversation labels.
//!
//! Two annotators get Cohen's kappa, three or more get Fleiss'
//! kappa over a single item. Fewer than two annotators is perfect
//! agreement by definition. Agreement below 0.6 flags the
//! conversation for human review.

use crate::domain::{AgreementMetrics, Annotation};

/// Kappa below this marks the annotations as needing review.
const REVIEW_THRESHOLD: f64 = 0.6;

#[derive(Default)]
pub struct AgreementCalculator;

impl AgreementCalculator {
    pub fn new() -> Self {
        Self
    }

    pub fn calculate(&self, annotations: &[Annotation]) -> AgreementMetrics {
        if annotations.len() < 2 {
            return AgreementMetrics {
                cohen_kappa: 1.0,
                fleiss_kappa: 1.0,
                percent_agree: 1.0,
                needs_review: false,
            };
        }

        let percent_agree = modal_share(annotations);

        let kappa = if annotations.len() == 2 {
            cohen_kappa(annotations)
        } else {
            fleiss_kappa(annotations)
        };

        AgreementMetrics {
            cohen_kappa: kappa,
            fleiss_kappa: kappa,
            percent_agree,
            needs_review: kappa < REVIEW_THRESHOLD,
        }
    }
}

/// Share of the most common label.
fn modal_share(annotations: &[Annotation]) -> f64 {
    let mut counts = std::collections::HashMap::new();
    for a in annotations {
        *counts.entry(a.label.as_str()).or_insert(0usize) += 1;
    }
    let max = counts.values().copied().max().unwrap_or(0);
    max as f64 / annotations.len() as f64
}

/// Cohen's kappa for exactly two annotators on one item: agreement is
/// total or absent.
fn cohen_kappa(annotations: &[Annotation]) -> f64 {
    if annotations.len() != 2 {
        return 0.0;
    }
    if annotations[0].label == annotations[1].label {
        1.0
    } else {
        0.0
    }
}

/// Fleiss' kappa over one item rated by n annotators.
fn fleiss_kappa(annotations: &[Annotation]) -> f64 {
    let n = annotations.len();
    if n < 2 {
        return 1.0;
    }

    let mut counts = std::collections::HashMap::new();
    for a in annotations {
        *counts.entry(a.label.as_str()).or_insert(0usize) += 1;
    }
    if counts.len() <= 1 {
        return 1.0;
    }

    let n_f = n as f64;
    let p_bar = counts
        .values()
        .map(|&c| (c * c) as f64 - c as f64)
        .sum::<f64>()
        / (n_f * (n_f - 1.0));

    let p_e = counts
        .values()
        .map(|&c| {
            let p = c as f64 / n_f;
            p * p
        })
        .sum::<f64>();

    if p_e >= 1.0 {
        return 1.0;
    }

    (p_bar - p_e) / (1.0 - p_e)
}
