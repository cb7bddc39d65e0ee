//! Consensus resolution over two reviewer decisions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::try_join;

use crate::config::ScreenerConfig;
use crate::errors::CallError;
use crate::phase::WorkItem;

use super::{
    AdjudicationResult, AdjudicationSource, AgreementStatistic, Decision, ReviewerCall,
    ReviewerDecision, ReviewerSlot, ReviewerVerdict,
};

/// Resolves a decision per item from two independently-parameterized reviewer
/// calls, adjudicating only genuinely ambiguous disagreements.
///
/// The screener issues its calls raw: classified failures propagate to the
/// caller, where the engine's uniform retry policy at the processor boundary
/// handles them. Recording is keyed by item id, so a retried item never
/// double-counts in the stage statistic.
pub struct ConsensusScreener {
    call: Arc<dyn ReviewerCall>,
    config: ScreenerConfig,
    /// Raw decision pairs of items resolved by agreement or adjudication —
    /// the population the stage's agreement coefficient is computed over.
    recorded: Mutex<HashMap<String, (Decision, Decision)>>,
}

impl ConsensusScreener {
    pub fn new(call: Arc<dyn ReviewerCall>, config: ScreenerConfig) -> Self {
        Self {
            call,
            config,
            recorded: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve one item.
    ///
    /// Both reviewer calls are issued in parallel and must both exist before
    /// consensus logic runs. Agreement and the confidence fast-path resolve
    /// without a third call; everything else issues exactly one adjudication
    /// call.
    pub async fn screen(&self, item: &WorkItem) -> Result<AdjudicationResult, CallError> {
        let (verdict_a, verdict_b) = try_join!(
            self.call.decide(item, ReviewerSlot::A),
            self.call.decide(item, ReviewerSlot::B),
        )?;
        let a = self.into_decision(item, ReviewerSlot::A, verdict_a)?;
        let b = self.into_decision(item, ReviewerSlot::B, verdict_b)?;

        if a.decision == b.decision {
            self.record(&item.id, a.decision, b.decision);
            return Ok(AdjudicationResult {
                item_id: item.id.clone(),
                decision: a.decision,
                source: AdjudicationSource::Agreement,
                rationale: None,
                reviewer_a: a,
                reviewer_b: b,
            });
        }

        // Fast path: exactly one side is confident in its own direction. When
        // both sides are confident the pair is genuinely ambiguous and goes
        // to adjudication; tune via the screener thresholds.
        let a_confident = self.is_confident(&a);
        let b_confident = self.is_confident(&b);
        if a_confident != b_confident {
            let winner = if a_confident { &a } else { &b };
            tracing::debug!(
                item = %item.id,
                decision = ?winner.decision,
                confidence = winner.confidence,
                "disagreement resolved by confidence fast-path"
            );
            return Ok(AdjudicationResult {
                item_id: item.id.clone(),
                decision: winner.decision,
                source: AdjudicationSource::ConfidenceFastPath,
                rationale: None,
                reviewer_a: a.clone(),
                reviewer_b: b.clone(),
            });
        }

        let verdict = self.call.adjudicate(item, &a, &b).await?;
        self.record(&item.id, a.decision, b.decision);
        Ok(AdjudicationResult {
            item_id: item.id.clone(),
            decision: verdict.decision,
            source: AdjudicationSource::Adjudicated,
            rationale: Some(verdict.rationale),
            reviewer_a: a,
            reviewer_b: b,
        })
    }

    /// Stage agreement over the recorded raw decision pairs.
    pub fn agreement(&self) -> AgreementStatistic {
        let pairs: Vec<(Decision, Decision)> = self
            .recorded
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .copied()
            .collect();
        let statistic = AgreementStatistic::compute(&pairs, self.config.kappa_floor);
        if statistic.below_floor {
            tracing::warn!(
                kappa = statistic.kappa,
                floor = statistic.floor,
                pairs = statistic.pairs,
                "inter-rater agreement below configured floor"
            );
        }
        statistic
    }

    /// Reload decision pairs recorded before an interruption so the stage
    /// statistic covers the whole stage, not just the items screened after
    /// resume.
    pub fn seed_pairs(&self, pairs: impl IntoIterator<Item = (String, Decision, Decision)>) {
        let mut recorded = self
            .recorded
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (item_id, a, b) in pairs {
            recorded.insert(item_id, (a, b));
        }
    }

    pub fn recorded_pairs(&self) -> usize {
        self.recorded
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    fn record(&self, item_id: &str, a: Decision, b: Decision) {
        self.recorded
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(item_id.to_string(), (a, b));
    }

    fn into_decision(
        &self,
        item: &WorkItem,
        slot: ReviewerSlot,
        verdict: ReviewerVerdict,
    ) -> Result<ReviewerDecision, CallError> {
        if !(0.0..=1.0).contains(&verdict.confidence) {
            return Err(CallError::Malformed(format!(
                "reviewer confidence {} outside [0, 1]",
                verdict.confidence
            )));
        }
        Ok(ReviewerDecision {
            item_id: item.id.clone(),
            slot,
            decision: verdict.decision,
            confidence: verdict.confidence,
            rationale: verdict.rationale,
        })
    }

    /// A decision is confident when it clears the threshold configured for
    /// its own direction. `Unsure` has no direction and never fast-paths.
    fn is_confident(&self, decision: &ReviewerDecision) -> bool {
        match decision.decision {
            Decision::Include => decision.confidence >= self.config.confident_include,
            Decision::Exclude => decision.confidence >= self.config.confident_exclude,
            Decision::Unsure => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::screen::AdjudicatorVerdict;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedCall {
        a: ReviewerVerdict,
        b: ReviewerVerdict,
        adjudication: AdjudicatorVerdict,
        adjudications: AtomicUsize,
    }

    impl ScriptedCall {
        fn new(a: (Decision, f64), b: (Decision, f64), adjudicated: Decision) -> Arc<Self> {
            Arc::new(Self {
                a: verdict(a.0, a.1),
                b: verdict(b.0, b.1),
                adjudication: AdjudicatorVerdict {
                    decision: adjudicated,
                    rationale: "tiebreak".into(),
                },
                adjudications: AtomicUsize::new(0),
            })
        }

        fn adjudication_calls(&self) -> usize {
            self.adjudications.load(Ordering::SeqCst)
        }
    }

    fn verdict(decision: Decision, confidence: f64) -> ReviewerVerdict {
        ReviewerVerdict {
            decision,
            confidence,
            rationale: "scripted".into(),
        }
    }

    #[async_trait]
    impl ReviewerCall for ScriptedCall {
        async fn decide(
            &self,
            _item: &WorkItem,
            slot: ReviewerSlot,
        ) -> Result<ReviewerVerdict, CallError> {
            Ok(match slot {
                ReviewerSlot::A => self.a.clone(),
                ReviewerSlot::B => self.b.clone(),
            })
        }

        async fn adjudicate(
            &self,
            _item: &WorkItem,
            _a: &ReviewerDecision,
            _b: &ReviewerDecision,
        ) -> Result<AdjudicatorVerdict, CallError> {
            self.adjudications.fetch_add(1, Ordering::SeqCst);
            Ok(self.adjudication.clone())
        }
    }

    fn screener(call: Arc<ScriptedCall>) -> ConsensusScreener {
        ConsensusScreener::new(call, ScreenerConfig::default())
    }

    #[tokio::test]
    async fn agreement_skips_adjudication() {
        let call = ScriptedCall::new(
            (Decision::Include, 0.6),
            (Decision::Include, 0.4),
            Decision::Exclude,
        );
        let s = screener(call.clone());
        let result = s.screen(&WorkItem::bare("rec-1")).await.unwrap();

        assert_eq!(result.decision, Decision::Include);
        assert_eq!(result.source, AdjudicationSource::Agreement);
        assert!(result.rationale.is_none());
        assert_eq!(call.adjudication_calls(), 0);
    }

    #[tokio::test]
    async fn lopsided_disagreement_takes_fast_path() {
        let call = ScriptedCall::new(
            (Decision::Include, 0.95),
            (Decision::Exclude, 0.5),
            Decision::Exclude,
        );
        let s = screener(call.clone());
        let result = s.screen(&WorkItem::bare("rec-1")).await.unwrap();

        assert_eq!(result.source, AdjudicationSource::ConfidenceFastPath);
        assert_eq!(result.decision, Decision::Include, "confident side wins");
        assert_eq!(call.adjudication_calls(), 0);
    }

    #[tokio::test]
    async fn both_confident_disagreement_adjudicates() {
        let call = ScriptedCall::new(
            (Decision::Include, 0.95),
            (Decision::Exclude, 0.9),
            Decision::Exclude,
        );
        let s = screener(call.clone());
        let result = s.screen(&WorkItem::bare("rec-1")).await.unwrap();

        assert_eq!(result.source, AdjudicationSource::Adjudicated);
        assert_eq!(result.decision, Decision::Exclude);
        assert_eq!(result.rationale.as_deref(), Some("tiebreak"));
        assert_eq!(call.adjudication_calls(), 1);
    }

    #[tokio::test]
    async fn neither_confident_disagreement_adjudicates() {
        let call = ScriptedCall::new(
            (Decision::Include, 0.6),
            (Decision::Exclude, 0.55),
            Decision::Include,
        );
        let s = screener(call.clone());
        let result = s.screen(&WorkItem::bare("rec-1")).await.unwrap();

        assert_eq!(result.source, AdjudicationSource::Adjudicated);
        assert_eq!(call.adjudication_calls(), 1);
    }

    #[tokio::test]
    async fn unsure_never_wins_fast_path() {
        // Unsure at high confidence has no direction; the confident include
        // side wins the fast path instead.
        let call = ScriptedCall::new(
            (Decision::Unsure, 0.99),
            (Decision::Include, 0.9),
            Decision::Exclude,
        );
        let s = screener(call.clone());
        let result = s.screen(&WorkItem::bare("rec-1")).await.unwrap();

        assert_eq!(result.source, AdjudicationSource::ConfidenceFastPath);
        assert_eq!(result.decision, Decision::Include);
    }

    #[tokio::test]
    async fn out_of_range_confidence_is_malformed() {
        let call = ScriptedCall::new(
            (Decision::Include, 1.3),
            (Decision::Include, 0.5),
            Decision::Include,
        );
        let s = screener(call);
        let err = s.screen(&WorkItem::bare("rec-1")).await.unwrap_err();
        assert!(err.is_malformed());
    }

    #[tokio::test]
    async fn fast_path_pairs_excluded_from_agreement_population() {
        let fast = ScriptedCall::new(
            (Decision::Include, 0.95),
            (Decision::Exclude, 0.5),
            Decision::Exclude,
        );
        let s = screener(fast);
        s.screen(&WorkItem::bare("rec-1")).await.unwrap();
        assert_eq!(s.recorded_pairs(), 0, "fast-path pair must not be recorded");
    }

    #[tokio::test]
    async fn rescreening_same_item_does_not_double_count() {
        let call = ScriptedCall::new(
            (Decision::Include, 0.6),
            (Decision::Include, 0.4),
            Decision::Exclude,
        );
        let s = screener(call);
        s.screen(&WorkItem::bare("rec-1")).await.unwrap();
        s.screen(&WorkItem::bare("rec-1")).await.unwrap();
        assert_eq!(s.recorded_pairs(), 1);
    }

    #[tokio::test]
    async fn seeded_pairs_feed_the_statistic() {
        let call = ScriptedCall::new(
            (Decision::Include, 0.6),
            (Decision::Include, 0.4),
            Decision::Exclude,
        );
        let s = screener(call);
        s.seed_pairs(vec![
            ("rec-a".to_string(), Decision::Include, Decision::Exclude),
            ("rec-b".to_string(), Decision::Exclude, Decision::Include),
        ]);
        s.screen(&WorkItem::bare("rec-1")).await.unwrap();

        let stat = s.agreement();
        assert_eq!(stat.pairs, 3);
        assert!(stat.kappa < 1.0);
    }
}
