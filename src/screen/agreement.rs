//! Chance-corrected inter-rater agreement.

use serde::{Deserialize, Serialize};

use super::Decision;

const CATEGORIES: [Decision; 3] = [Decision::Include, Decision::Exclude, Decision::Unsure];

/// Stage-level agreement statistic: Cohen's kappa over the raw reviewer
/// decision pairs, plus a warning flag when it falls below the configured
/// floor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgreementStatistic {
    pub kappa: f64,
    pub pairs: usize,
    pub floor: f64,
    pub below_floor: bool,
}

impl AgreementStatistic {
    pub fn compute(pairs: &[(Decision, Decision)], floor: f64) -> Self {
        let kappa = cohen_kappa(pairs);
        Self {
            kappa,
            pairs: pairs.len(),
            floor,
            below_floor: kappa < floor,
        }
    }
}

/// Cohen's kappa over paired categorical decisions.
///
/// kappa = (p_o - p_e) / (1 - p_e), where p_o is observed agreement and p_e
/// is the chance agreement implied by each rater's marginal distribution.
/// Degenerate case: when both raters are concentrated on the same single
/// category, p_e = 1 and agreement is perfect by construction; 1.0 is
/// returned. An empty input also returns 1.0.
pub fn cohen_kappa(pairs: &[(Decision, Decision)]) -> f64 {
    if pairs.is_empty() {
        return 1.0;
    }
    let n = pairs.len() as f64;

    let observed = pairs.iter().filter(|(a, b)| a == b).count() as f64 / n;

    let mut expected = 0.0;
    for category in CATEGORIES {
        let a_share = pairs.iter().filter(|(a, _)| *a == category).count() as f64 / n;
        let b_share = pairs.iter().filter(|(_, b)| *b == category).count() as f64 / n;
        expected += a_share * b_share;
    }

    if (1.0 - expected).abs() < f64::EPSILON {
        return 1.0;
    }
    (observed - expected) / (1.0 - expected)
}
