use std::time::Duration;

use paxbench_stats::{drop_prefix, outliers, rate, throughput, SampleLog, Summary};
use serde::{Deserialize, Serialize};

use crate::{directory::TrialId, scrape::MetricsTable};

/// How raw samples are turned into an [`Output`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOptions {
    /// Samples starting within this long of the first sample are ignored.
    pub drop: Duration,
    /// Latencies further than this many standard deviations from the mean are
    /// ignored. The default keeps everything.
    pub outlier_stds: f64,
    /// Scraped counter of completed requests.
    pub request_counter: String,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            drop: Duration::ZERO,
            outlier_stds: 1e20,
            request_counter: "requests_total".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyOutput {
    pub mean_ms: f64,
    pub median_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

impl From<Summary> for LatencyOutput {
    fn from(s: Summary) -> Self {
        Self {
            mean_ms: s.mean,
            median_ms: s.median,
            min_ms: s.min,
            max_ms: s.max,
            p90_ms: s.p90,
            p95_ms: s.p95,
            p99_ms: s.p99,
        }
    }
}

/// Requests per second across the windows of a throughput series.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ThroughputOutput {
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

impl From<Summary> for ThroughputOutput {
    fn from(s: Summary) -> Self {
        Self {
            mean: s.mean,
            median: s.median,
            min: s.min,
            max: s.max,
            p90: s.p90,
            p95: s.p95,
            p99: s.p99,
        }
    }
}

/// What a finished trial measured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Output {
    pub trial: TrialId,
    /// Raw samples collected, before anything was dropped.
    pub num_samples: usize,
    pub latency: LatencyOutput,
    /// 1 second throughput over the whole trial, including the dropped prefix.
    pub start_throughput_1s: ThroughputOutput,
    pub throughput_1s: ThroughputOutput,
    pub throughput_2s: ThroughputOutput,
    pub throughput_5s: ThroughputOutput,
    pub prometheus_throughput_1s: Option<ThroughputOutput>,
}

impl Output {
    pub fn compute(
        trial: TrialId,
        log: &SampleLog,
        metrics: Option<&MetricsTable>,
        options: &AnalysisOptions,
    ) -> Self {
        let sorted = log.clone().sorted();
        let start_throughput_1s =
            Summary::of(&throughput(&sorted, Duration::from_secs(1)).values()).into();

        let dropped = drop_prefix(&sorted, options.drop);
        let latencies = dropped.latencies_ms();
        let mask = outliers(&latencies, options.outlier_stds);
        let kept: Vec<f64> = latencies
            .iter()
            .zip(&mask)
            .filter(|(_, outlier)| !**outlier)
            .map(|(latency, _)| *latency)
            .collect();

        // every completed request counts towards throughput, outlier or not
        let windowed = |secs| -> ThroughputOutput {
            Summary::of(&throughput(&dropped, Duration::from_secs(secs)).values()).into()
        };

        let prometheus_throughput_1s = metrics.and_then(|table| {
            let counter = table.drop_prefix(options.drop).column(&options.request_counter);
            let series = rate(&counter, Duration::from_secs(1));
            (!series.is_empty()).then(|| Summary::of(&series.values()).into())
        });

        Self {
            trial,
            num_samples: log.len(),
            latency: Summary::of(&kept).into(),
            start_throughput_1s,
            throughput_1s: windowed(1),
            throughput_2s: windowed(2),
            throughput_5s: windowed(5),
            prometheus_throughput_1s,
        }
    }

    pub fn median_latency_ms(&self) -> f64 {
        self.latency.median_ms
    }

    pub fn median_1_second_throughput(&self) -> f64 {
        self.throughput_1s.median
    }

    pub fn p90_1_second_throughput(&self) -> f64 {
        self.throughput_1s.p90
    }

    pub fn p95_1_second_throughput(&self) -> f64 {
        self.throughput_1s.p95
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use paxbench_stats::Sample;
    use pretty_assertions::assert_eq;

    use super::*;

    fn log_at_100_per_second(seconds: i64) -> SampleLog {
        let base = Utc.timestamp_opt(1_600_000_000, 0).unwrap();
        (0..seconds * 100)
            .map(|i| {
                let start = base + chrono::Duration::milliseconds(i * 10);
                Sample::new(start, start + chrono::Duration::milliseconds(2))
            })
            .collect()
    }

    #[test]
    fn uniform_load() {
        let output = Output::compute(
            TrialId::new(1),
            &log_at_100_per_second(10),
            None,
            &AnalysisOptions::default(),
        );
        assert_eq!(output.num_samples, 1000);
        assert!((output.median_latency_ms() - 2.).abs() < 1e-9);
        assert!((output.median_1_second_throughput() - 100.).abs() < 1e-9);
        assert!((output.p95_1_second_throughput() - 100.).abs() < 1e-9);
        assert_eq!(output.prometheus_throughput_1s, None);
    }

    #[test]
    fn empty_log_has_zeroed_output() {
        let output = Output::compute(
            TrialId::new(7),
            &SampleLog::default(),
            None,
            &AnalysisOptions::default(),
        );
        assert_eq!(output.num_samples, 0);
        assert_eq!(output.latency, LatencyOutput::default());
        assert_eq!(output.throughput_5s, ThroughputOutput::default());
    }

    #[test]
    fn dropped_prefix_only_affects_steady_state() {
        let options = AnalysisOptions {
            drop: Duration::from_secs(2),
            ..Default::default()
        };
        let output = Output::compute(TrialId::new(1), &log_at_100_per_second(10), None, &options);
        assert_eq!(output.num_samples, 1000);
        assert!((output.start_throughput_1s.median - 100.).abs() < 1e-9);
        assert!((output.throughput_1s.min - 100.).abs() < 1e-9);
    }

    #[test]
    fn outliers_are_trimmed_from_latency() {
        let base = Utc.timestamp_opt(1_600_000_000, 0).unwrap();
        let mut samples: Vec<Sample> = (0..20)
            .map(|i| {
                let start = base + chrono::Duration::milliseconds(i * 10);
                Sample::new(start, start + chrono::Duration::milliseconds(1))
            })
            .collect();
        let start = base + chrono::Duration::milliseconds(200);
        samples.push(Sample::new(start, start + chrono::Duration::seconds(1)));

        let options = AnalysisOptions {
            outlier_stds: 2.,
            ..Default::default()
        };
        let output = Output::compute(TrialId::new(1), &SampleLog::new(samples), None, &options);
        assert!((output.latency.max_ms - 1.).abs() < 1e-9);
        assert_eq!(output.num_samples, 21);
    }

    #[test]
    fn latency_outliers_still_count_towards_throughput() {
        let base = Utc.timestamp_opt(1_600_000_000, 0).unwrap();
        // 90 fast requests and 10 slow ones, all completing within the first second
        let samples: Vec<Sample> = (0..100)
            .map(|i| {
                let start = base + chrono::Duration::milliseconds(i);
                let latency = if i % 10 == 9 { 890 } else { 1 };
                Sample::new(start, start + chrono::Duration::milliseconds(latency))
            })
            .collect();
        let log = SampleLog::new(samples);

        let trimmed = Output::compute(
            TrialId::new(1),
            &log,
            None,
            &AnalysisOptions {
                outlier_stds: 2.,
                ..Default::default()
            },
        );
        let untrimmed = Output::compute(TrialId::new(1), &log, None, &AnalysisOptions::default());

        assert!((trimmed.latency.max_ms - 1.).abs() < 1e-9);
        assert!(untrimmed.latency.max_ms > 800.);
        assert_eq!(trimmed.throughput_1s, untrimmed.throughput_1s);
        assert!((trimmed.throughput_1s.max - 100.).abs() < 1e-9);
    }

    #[test]
    fn prometheus_rate_from_counter() {
        let base = Utc.timestamp_opt(1_600_000_000, 0).unwrap();
        let mut table = MetricsTable::new(vec!["requests_total".to_owned()]);
        for i in 0..5 {
            table.push(
                base + chrono::Duration::seconds(i),
                [("requests_total".to_owned(), (i * 50) as f64)].into(),
            );
        }
        let output = Output::compute(
            TrialId::new(1),
            &log_at_100_per_second(5),
            Some(&table),
            &AnalysisOptions::default(),
        );
        let prometheus = output.prometheus_throughput_1s.unwrap();
        assert!((prometheus.median - 50.).abs() < 1e-9);
    }
}
