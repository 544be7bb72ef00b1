//! Overall score aggregation.
//!
//! overall = Σ(weight × stage_score) / Σ(weight) over stages with status `ok`.
//! Failed and skipped stages drop out of both sums: they contribute zero
//! weight, not a zero score.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::analysis::model::StageResult;

#[derive(Debug, Clone, PartialEq, Error)]
#[error("weight for stage `{stage}` must be a positive finite number, got {weight}")]
pub struct InvalidWeight {
    pub stage: String,
    pub weight: f64,
}

/// Per-stage weights. Stages without an explicit weight count 1.0.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScoringPolicy {
    weights: BTreeMap<String, f64>,
}

impl ScoringPolicy {
    pub fn new(weights: BTreeMap<String, f64>) -> Result<Self, InvalidWeight> {
        if let Some((stage, weight)) = weights
            .iter()
            .find(|(_, w)| !w.is_finite() || **w <= 0.0)
        {
            return Err(InvalidWeight {
                stage: stage.clone(),
                weight: *weight,
            });
        }
        Ok(Self { weights })
    }

    pub fn weight_for(&self, stage: &str) -> f64 {
        self.weights.get(stage).copied().unwrap_or(1.0)
    }

    /// Stages named in the policy that the pipeline does not run.
    pub fn unknown_stages<'a>(&'a self, stages: &'a [&str]) -> impl Iterator<Item = &'a str> {
        self.weights
            .keys()
            .map(String::as_str)
            .filter(move |name| !stages.contains(name))
    }

    /// `None` when no stage contributed a score.
    pub fn overall(&self, results: &[StageResult]) -> Option<f64> {
        let (weighted, total_weight) = results
            .iter()
            .filter_map(|r| r.stage_score().map(|s| (s, self.weight_for(&r.stage))))
            .fold((0.0, 0.0), |(acc, total), (score, weight)| {
                (acc + score * weight, total + weight)
            });
        (total_weight > 0.0).then(|| weighted / total_weight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::model::StageError;

    fn ok(stage: &str, score: f64) -> StageResult {
        StageResult::ok(stage, BTreeMap::from([("score".to_string(), score)]), vec![])
    }

    #[test]
    fn test_default_weights_give_simple_average() {
        let policy = ScoringPolicy::default();
        assert_eq!(policy.overall(&[ok("structure", 80.0), ok("appeal", 90.0)]), Some(85.0));
    }

    #[test]
    fn test_custom_weights() {
        let policy =
            ScoringPolicy::new(BTreeMap::from([("structure".to_string(), 3.0)])).unwrap();
        // (3×80 + 1×40) / 4 = 70
        assert_eq!(policy.overall(&[ok("structure", 80.0), ok("appeal", 40.0)]), Some(70.0));
    }

    #[test]
    fn test_failed_and_skipped_stages_carry_no_weight() {
        let policy = ScoringPolicy::default();
        let with_gaps = [
            ok("structure", 80.0),
            StageResult::skipped("ats"),
            StageResult::failed("impact", StageError::Timeout { after_ms: 1 }),
            ok("appeal", 90.0),
        ];
        let without = [ok("structure", 80.0), ok("appeal", 90.0)];
        assert_eq!(policy.overall(&with_gaps), policy.overall(&without));
    }

    #[test]
    fn test_no_contributing_stage_means_no_score() {
        let policy = ScoringPolicy::default();
        assert_eq!(policy.overall(&[StageResult::skipped("ats")]), None);
        assert_eq!(policy.overall(&[]), None);
    }

    #[test]
    fn test_non_positive_weight_rejected() {
        let err = ScoringPolicy::new(BTreeMap::from([("structure".to_string(), 0.0)])).unwrap_err();
        assert_eq!(err.stage, "structure");
        assert!(ScoringPolicy::new(BTreeMap::from([("x".to_string(), f64::NAN)])).is_err());
    }

    #[test]
    fn test_unknown_stages_are_reported() {
        let policy = ScoringPolicy::new(BTreeMap::from([
            ("structure".to_string(), 2.0),
            ("typo_stage".to_string(), 1.0),
        ]))
        .unwrap();
        let unknown: Vec<&str> = policy.unknown_stages(&["structure", "appeal"]).collect();
        assert_eq!(unknown, vec!["typo_stage"]);
    }
}
