//! Streaming evaluation metrics.

use std::collections::BTreeMap;

/// Running (optionally weighted) fraction of matches.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Accuracy {
    correct: f64,
    total: f64,
}

impl Accuracy {
    pub fn update<T: PartialEq>(&mut self, prediction: T, target: T) {
        self.update_weighted(prediction, target, 1.0);
    }

    pub fn update_weighted<T: PartialEq>(&mut self, prediction: T, target: T, weight: f64) {
        if prediction == target {
            self.correct += weight;
        }
        self.total += weight;
    }

    /// 0 before any weighted update.
    pub fn value(&self) -> f64 {
        if self.total > 0.0 {
            self.correct / self.total
        } else {
            0.0
        }
    }
}

/// Running mean.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Mean {
    sum: f64,
    count: u64,
}

impl Mean {
    pub fn update(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    pub fn value(&self) -> f64 {
        if self.count > 0 {
            self.sum / self.count as f64
        } else {
            0.0
        }
    }
}

/// Whether `target` is among the `k` highest scores. Ties with the k-th
/// score count as hits.
pub fn in_top_k(scores: &[f32], target: usize, k: usize) -> bool {
    let Some(&score) = scores.get(target) else {
        return false;
    };
    scores.iter().filter(|&&s| s > score).count() < k
}

/// Indices and values of the `k` highest scores, best first.
pub fn top_k(scores: &[f32], k: usize) -> Vec<(usize, f32)> {
    let mut indexed: Vec<(usize, f32)> = scores.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    indexed.truncate(k);
    indexed
}

/// Index of the highest score, first one on ties.
pub fn argmax(scores: &[f32]) -> usize {
    top_k(scores, 1).first().map_or(0, |&(i, _)| i)
}

/// Named metrics accumulated over one evaluation pass.
#[derive(Debug, Clone, Default)]
pub struct MetricSet {
    accuracies: BTreeMap<String, Accuracy>,
    means: BTreeMap<String, Mean>,
}

impl MetricSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The accuracy named `name`, created on first use.
    pub fn accuracy(&mut self, name: &str) -> &mut Accuracy {
        self.accuracies.entry(name.to_string()).or_default()
    }

    /// The mean named `name`, created on first use.
    pub fn mean(&mut self, name: &str) -> &mut Mean {
        self.means.entry(name.to_string()).or_default()
    }

    pub fn reset(&mut self) {
        self.accuracies.clear();
        self.means.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.accuracies.is_empty() && self.means.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.accuracies
            .get(name)
            .map(Accuracy::value)
            .or_else(|| self.means.get(name).map(Mean::value))
    }

    /// Current values sorted by name.
    pub fn report(&self) -> BTreeMap<String, f64> {
        let accuracies = self.accuracies.iter().map(|(n, m)| (n.clone(), m.value()));
        let means = self.means.iter().map(|(n, m)| (n.clone(), m.value()));
        accuracies.chain(means).collect()
    }
}
