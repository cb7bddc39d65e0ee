//! Dual-reviewer consensus screening.
//!
//! Two independently-parameterized decision calls per item, a confidence
//! fast-path for lopsided disagreements, and a third adjudication call for
//! genuinely ambiguous cases. The bias profiles and temperature policy behind
//! each reviewer slot belong to the phase; this module only sees decisions,
//! confidences and rationales.

mod agreement;
mod consensus;

pub use agreement::{AgreementStatistic, cohen_kappa};
pub use consensus::ConsensusScreener;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::CallError;
use crate::phase::WorkItem;

/// A screening decision. Ternary: reviewers may abstain with `Unsure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Include,
    Exclude,
    Unsure,
}

/// Which of the two independently-prompted reviewers produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewerSlot {
    A,
    B,
}

/// What one decision call returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewerVerdict {
    pub decision: Decision,
    /// In [0, 1].
    pub confidence: f64,
    pub rationale: String,
}

/// One reviewer's decision on one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewerDecision {
    pub item_id: String,
    pub slot: ReviewerSlot,
    pub decision: Decision,
    pub confidence: f64,
    pub rationale: String,
}

/// What the adjudication call returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjudicatorVerdict {
    pub decision: Decision,
    pub rationale: String,
}

/// How an item's final decision was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdjudicationSource {
    Agreement,
    ConfidenceFastPath,
    Adjudicated,
}

/// The final decision on one item. Exactly one exists per item per screening
/// stage, created once both reviewer decisions exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjudicationResult {
    pub item_id: String,
    pub decision: Decision,
    pub source: AdjudicationSource,
    /// Present only when `source` is `adjudicated`.
    pub rationale: Option<String>,
    pub reviewer_a: ReviewerDecision,
    pub reviewer_b: ReviewerDecision,
}

/// The decision-call primitive a screening phase supplies.
///
/// `decide` carries the slot so the implementation can apply its per-slot
/// prompt bias and temperature policy; `adjudicate` receives both reviewer
/// decisions in full (value, confidence, rationale).
#[async_trait]
pub trait ReviewerCall: Send + Sync {
    async fn decide(
        &self,
        item: &WorkItem,
        slot: ReviewerSlot,
    ) -> Result<ReviewerVerdict, CallError>;

    async fn adjudicate(
        &self,
        item: &WorkItem,
        a: &ReviewerDecision,
        b: &ReviewerDecision,
    ) -> Result<AdjudicatorVerdict, CallError>;
}
