use serde::{Deserialize, Serialize};

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample standard deviation (one delta degree of freedom).
pub fn std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let mean = mean(values)?;
    let squares: f64 = values.iter().map(|v| (v - mean) * (v - mean)).sum();
    Some((squares / (values.len() - 1) as f64).sqrt())
}

/// Percentile `p` (0 to 100) using linear interpolation between the closest ranks.
pub fn percentile(values: &[f64], p: f64) -> Option<f64> {
    if values.is_empty() || p.is_nan() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let rank = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let fraction = rank - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * fraction)
}

pub fn median(values: &[f64]) -> Option<f64> {
    percentile(values, 50.)
}

/// Flags every value further than `num_stds` standard deviations from the mean.
///
/// The mean and deviation are taken once over the whole series; nothing is
/// recomputed after flagging. A series without spread flags nothing.
pub fn outliers(values: &[f64], num_stds: f64) -> Vec<bool> {
    let (Some(mean), Some(std)) = (mean(values), std(values)) else {
        return vec![false; values.len()];
    };
    if std.is_nan() || std <= 0. {
        return vec![false; values.len()];
    }
    let threshold = num_stds * std;
    values.iter().map(|v| (v - mean).abs() > threshold).collect()
}

/// The aggregates reported for a latency or throughput series.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

impl Summary {
    /// All zeros for an empty series.
    pub fn of(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let at = |p| percentile(values, p).unwrap_or_default();
        Self {
            mean: mean(values).unwrap_or_default(),
            median: at(50.),
            min: at(0.),
            max: at(100.),
            p90: at(90.),
            p95: at(95.),
            p99: at(99.),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn identical_values_are_never_outliers() {
        let values = vec![42.; 100];
        assert_eq!(outliers(&values, 0.), vec![false; 100]);
        assert_eq!(outliers(&values, 3.), vec![false; 100]);
    }

    #[test]
    fn tiny_series_have_no_outliers() {
        assert_eq!(outliers(&[], 1.), Vec::<bool>::new());
        assert_eq!(outliers(&[7.], 0.), vec![false]);
    }

    #[test]
    fn single_extreme_value_is_flagged() {
        let mut values = vec![10.; 99];
        values.push(1000.);
        // mean 19.9, sample std 99, so the extreme value sits 9.9 stds out
        for num_stds in [1., 3., 5., 9.] {
            let mask = outliers(&values, num_stds);
            assert_eq!(mask.iter().filter(|flag| **flag).count(), 1);
            assert!(mask[99]);
        }
        assert_eq!(outliers(&values, 10.), vec![false; 100]);
    }

    #[test]
    fn outliers_are_not_trimmed_iteratively() {
        // after dropping 1000 the 100 would stand out, but only one pass is made
        let mut values = vec![10.; 50];
        values.push(100.);
        values.push(1000.);
        let mask = outliers(&values, 3.);
        assert!(mask[51]);
        assert!(!mask[50]);
    }

    #[test]
    fn percentile_interpolates_linearly() {
        let values = [4., 1., 3., 2.];
        assert_eq!(percentile(&values, 0.), Some(1.));
        assert_eq!(percentile(&values, 100.), Some(4.));
        assert_eq!(percentile(&values, 50.), Some(2.5));
        let p90 = percentile(&values, 90.).unwrap();
        assert!((p90 - 3.7).abs() < 1e-12);
        assert_eq!(median(&[5.]), Some(5.));
        assert_eq!(percentile(&[], 50.), None);
    }

    #[test]
    fn mean_and_std() {
        let values = [2., 4., 4., 4., 5., 5., 7., 9.];
        assert_eq!(mean(&values), Some(5.));
        let std = std(&values).unwrap();
        assert!((std - 2.138089935299395).abs() < 1e-12);
        assert_eq!(super::std(&[1.]), None);
        assert_eq!(mean(&[]), None);
    }

    #[test]
    fn summary_of_empty_is_zero() {
        assert_eq!(Summary::of(&[]), Summary::default());
    }

    #[test]
    fn summary_of_series() {
        let values: Vec<f64> = (1..=101).map(f64::from).collect();
        let summary = Summary::of(&values);
        assert_eq!(summary.mean, 51.);
        assert_eq!(summary.median, 51.);
        assert_eq!(summary.min, 1.);
        assert_eq!(summary.max, 101.);
        assert_eq!(summary.p90, 91.);
        assert_eq!(summary.p95, 96.);
        assert_eq!(summary.p99, 100.);
    }
}
