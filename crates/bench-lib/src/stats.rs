//! Summary statistics shared by the scenarios

use serde::{Deserialize, Serialize};

/// Coefficient of variation below which a distribution counts as balanced
const BALANCED_MAX_CV: f64 = 0.2;

/// Min/max ratio above which a distribution counts as balanced
const BALANCED_MIN_RATIO: f64 = 0.7;

/// Descriptive statistics over a set of observations
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SummaryStats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stdev: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

impl SummaryStats {
    /// Returns `None` for an empty input
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        Some(Self {
            count: sorted.len(),
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            mean: round_to(mean(&sorted), 3),
            stdev: round_to(stdev(&sorted), 3),
            p50: percentile(&sorted, 50.0),
            p95: percentile(&sorted, 95.0),
            p99: percentile(&sorted, 99.0),
        })
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (n - 1 denominator)
pub fn stdev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let sum_sq: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    (sum_sq / (values.len() - 1) as f64).sqrt()
}

/// Nearest-rank percentile over an already sorted slice
///
/// Index is `floor(len * p / 100)`, clamped to the last element.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((p / 100.0) * sorted.len() as f64).floor() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Load distribution metrics across responders
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FairnessMetrics {
    pub responders: usize,
    pub min: u64,
    pub max: u64,
    pub mean: f64,
    pub stdev: f64,
    pub coefficient_of_variation: f64,
    pub min_max_ratio: f64,
    pub jains_index: f64,
    pub is_balanced: bool,
}

/// Compute fairness metrics over per-responder request counts
pub fn fairness(counts: &[u64]) -> Option<FairnessMetrics> {
    if counts.is_empty() {
        return None;
    }
    let values: Vec<f64> = counts.iter().map(|&c| c as f64).collect();
    let m = mean(&values);
    let sd = stdev(&values);
    let min = counts.iter().copied().min().unwrap_or(0);
    let max = counts.iter().copied().max().unwrap_or(0);

    let cv = if m > 0.0 { sd / m } else { 0.0 };
    let min_max_ratio = if max > 0 { min as f64 / max as f64 } else { 0.0 };

    let sum: f64 = values.iter().sum();
    let sum_sq: f64 = values.iter().map(|v| v * v).sum();
    let jains_index = if sum_sq > 0.0 {
        (sum * sum) / (values.len() as f64 * sum_sq)
    } else {
        0.0
    };

    Some(FairnessMetrics {
        responders: counts.len(),
        min,
        max,
        mean: round_to(m, 2),
        stdev: round_to(sd, 2),
        coefficient_of_variation: round_to(cv, 4),
        min_max_ratio: round_to(min_max_ratio, 4),
        jains_index: round_to(jains_index, 4),
        is_balanced: cv < BALANCED_MAX_CV && min_max_ratio > BALANCED_MIN_RATIO,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_nearest_rank() {
        let sorted: Vec<f64> = (1..=100).map(|v| v as f64).collect();
        assert_eq!(percentile(&sorted, 50.0), 51.0);
        assert_eq!(percentile(&sorted, 95.0), 96.0);
        assert_eq!(percentile(&sorted, 100.0), 100.0);
        assert_eq!(percentile(&[], 95.0), 0.0);
    }

    #[test]
    fn test_stdev_uses_sample_denominator() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let sd = stdev(&values);
        assert!((sd - 2.138).abs() < 0.001);
        assert_eq!(stdev(&[3.0]), 0.0);
    }

    #[test]
    fn test_summary_stats() {
        let stats = SummaryStats::from_values(&[30.0, 10.0, 20.0]).unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.min, 10.0);
        assert_eq!(stats.max, 30.0);
        assert_eq!(stats.mean, 20.0);
        assert!(SummaryStats::from_values(&[]).is_none());
    }

    #[test]
    fn test_fairness_even_distribution() {
        let metrics = fairness(&[100, 100, 100]).unwrap();
        assert_eq!(metrics.jains_index, 1.0);
        assert_eq!(metrics.coefficient_of_variation, 0.0);
        assert_eq!(metrics.min_max_ratio, 1.0);
        assert!(metrics.is_balanced);
    }

    #[test]
    fn test_fairness_skewed_distribution() {
        let metrics = fairness(&[450, 25, 25]).unwrap();
        assert!(metrics.jains_index < 0.5);
        assert!(metrics.min_max_ratio < 0.1);
        assert!(!metrics.is_balanced);
        assert!(fairness(&[]).is_none());
    }
}
