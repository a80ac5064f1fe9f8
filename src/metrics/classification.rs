//! Confusion-matrix metrics for binary outcomes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of comparing one prediction with its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchType {
    TruePositive,
    TrueNegative,
    FalsePositive,
    FalseNegative,
}

impl MatchType {
    /// Positive prediction iff `prediction >= threshold`; positive target iff `target >= 0.5`.
    pub fn from_threshold(prediction: f32, target: f32, threshold: f32) -> Self {
        match (prediction >= threshold, target >= 0.5) {
            (true, true) => MatchType::TruePositive,
            (true, false) => MatchType::FalsePositive,
            (false, true) => MatchType::FalseNegative,
            (false, false) => MatchType::TrueNegative,
        }
    }
}

/// Classifies a `(prediction, target)` row pair on its first entry.
pub fn threshold_match(threshold: f32) -> impl Fn(&[f32], &[f32]) -> MatchType {
    move |prediction: &[f32], target: &[f32]| {
        let p = prediction.first().copied().unwrap_or(0.0);
        let t = target.first().copied().unwrap_or(0.0);
        MatchType::from_threshold(p, t, threshold)
    }
}

/// Count per [`MatchType`]. Every ratio is 0 when its denominator is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub true_positives: usize,
    pub true_negatives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
}

impl ConfusionMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, outcome: MatchType) {
        match outcome {
            MatchType::TruePositive => self.true_positives += 1,
            MatchType::TrueNegative => self.true_negatives += 1,
            MatchType::FalsePositive => self.false_positives += 1,
            MatchType::FalseNegative => self.false_negatives += 1,
        }
    }

    pub fn count(&self, outcome: MatchType) -> usize {
        match outcome {
            MatchType::TruePositive => self.true_positives,
            MatchType::TrueNegative => self.true_negatives,
            MatchType::FalsePositive => self.false_positives,
            MatchType::FalseNegative => self.false_negatives,
        }
    }

    pub fn total(&self) -> usize {
        self.true_positives + self.true_negatives + self.false_positives + self.false_negatives
    }

    /// `(TP + TN) / total`
    pub fn accuracy(&self) -> f64 {
        ratio(self.true_positives + self.true_negatives, self.total())
    }

    /// `TP / (TP + FP)`
    pub fn precision(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_positives)
    }

    /// `TP / (TP + FN)`
    pub fn recall(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_negatives)
    }

    /// `2TP / (2TP + FP + FN)`
    pub fn f1(&self) -> f64 {
        let tp2 = 2 * self.true_positives;
        ratio(tp2, tp2 + self.false_positives + self.false_negatives)
    }
}

fn ratio(num: usize, denom: usize) -> f64 {
    if denom == 0 {
        return 0.0;
    }
    num as f64 / denom as f64
}

impl fmt::Display for ConfusionMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TP={} TN={} FP={} FN={} accuracy={:.4} precision={:.4} recall={:.4} f1={:.4}",
            self.true_positives,
            self.true_negatives,
            self.false_positives,
            self.false_negatives,
            self.accuracy(),
            self.precision(),
            self.recall(),
            self.f1()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratios_from_counts() {
        let m = ConfusionMatrix { true_positives: 3, true_negatives: 2, false_positives: 1, false_negatives: 0 };
        assert!((m.accuracy() - 5.0 / 6.0).abs() < 1e-12);
        assert!((m.precision() - 0.75).abs() < 1e-12);
        assert!((m.recall() - 1.0).abs() < 1e-12);
        assert!((m.f1() - 6.0 / 7.0).abs() < 1e-12);
    }

    #[test]
    fn empty_matrix_reports_zero() {
        let m = ConfusionMatrix::new();
        assert_eq!(m.accuracy(), 0.0);
        assert_eq!(m.f1(), 0.0);
    }

    #[test]
    fn threshold_classifier_fills_the_matrix() {
        let classify = threshold_match(0.5);
        let mut m = ConfusionMatrix::new();
        for (p, t) in [(0.9, 1.0), (0.2, 0.0), (0.7, 0.0), (0.1, 1.0), (0.5, 1.0)] {
            m.record(classify(&[p], &[t]));
        }
        assert_eq!(m.count(MatchType::TruePositive), 2);
        assert_eq!(m.count(MatchType::TrueNegative), 1);
        assert_eq!(m.count(MatchType::FalsePositive), 1);
        assert_eq!(m.count(MatchType::FalseNegative), 1);
        assert_eq!(m.total(), 5);
    }
}
