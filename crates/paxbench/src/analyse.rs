//! Offline analysis of suites and trials that already ran.

use std::{
    cmp::Ordering,
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use paxbench_stats::{
    bands as group_bands, drop_prefix, outliers, rate, throughput, TimeSeries,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    directory::{read_metrics, read_samples, Artifact, SuiteDirectory, TrialId},
    input::Input,
    output::{AnalysisOptions, Output},
    suite::SummaryRow,
    trial::TrialState,
};

/// Recomputes the output of every finished trial in a suite directory and writes
/// `reanalysed_results.csv` next to the original results.
pub fn reanalyse(
    path: &Path,
    analysis: &AnalysisOptions,
    columns: &[String],
    summary: impl Fn(&Input, &Output) -> SummaryRow,
) -> anyhow::Result<Vec<(TrialId, SummaryRow)>> {
    let directory = SuiteDirectory::open(path)
        .with_context(|| format!("Failed to open suite at {}", path.display()))?;
    let mut rows = Vec::new();
    for trial in directory.trial_ids()? {
        let record = match directory.load(trial) {
            Ok(record) => record,
            Err(error) => {
                warn!(%trial, %error, "Skipping unreadable trial");
                continue;
            }
        };
        let finalized = record
            .status
            .as_ref()
            .map_or(record.output.is_some(), |s| s.state == TrialState::Finalized);
        if !finalized {
            continue;
        }
        let output = Output::compute(trial, &record.log, record.metrics.as_ref(), analysis);
        directory.persist(trial, Artifact::Output(&output))?;
        let row = summary(&record.input, &output);
        info!(%trial, %row, "Reanalysed trial");
        rows.push((trial, row));
    }
    directory.write_table("reanalysed_results.csv", columns, &rows)?;
    Ok(rows)
}

#[derive(Debug, Serialize)]
struct LatencyRecord {
    start: DateTime<Utc>,
    latency_ms: f64,
}

#[derive(Debug, Serialize)]
struct ThroughputRecord<'a> {
    series: &'a str,
    start: DateTime<Utc>,
    value: f64,
}

/// Writes `latency.csv` and `throughput.csv` for one trial's samples into
/// `out_dir`, the series the latency and throughput plots draw.
pub fn series(
    data: &Path,
    prometheus_data: Option<&Path>,
    analysis: &AnalysisOptions,
    out_dir: &Path,
) -> anyhow::Result<(PathBuf, PathBuf)> {
    let log = read_samples(data)
        .with_context(|| format!("Failed to read samples from {}", data.display()))?
        .sorted();
    let dropped = drop_prefix(&log, analysis.drop);
    let mask = outliers(&dropped.latencies_ms(), analysis.outlier_stds);
    let kept: Vec<_> = dropped
        .iter()
        .zip(&mask)
        .filter(|(_, outlier)| !**outlier)
        .map(|(sample, _)| sample)
        .collect();
    info!(
        samples = log.len(),
        dropped = log.len() - dropped.len(),
        outliers = dropped.len() - kept.len(),
        "Loaded samples"
    );

    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;

    let latency_path = out_dir.join("latency.csv");
    let mut writer = csv::Writer::from_path(&latency_path)?;
    for sample in kept {
        writer.serialize(LatencyRecord {
            start: sample.start,
            latency_ms: sample.latency_ms(),
        })?;
    }
    writer.flush()?;

    let mut all = vec![
        ("250ms", throughput(&dropped, Duration::from_millis(250))),
        ("500ms", throughput(&dropped, Duration::from_millis(500))),
        ("1s", throughput(&dropped, Duration::from_secs(1))),
    ];
    if let Some(path) = prometheus_data {
        let table = read_metrics(path)?.drop_prefix(analysis.drop);
        let counter = table.column(&analysis.request_counter);
        if counter.is_empty() {
            warn!(counter = %analysis.request_counter, "Counter missing from metrics");
        }
        all.push(("1s (Prometheus)", rate(&counter, Duration::from_secs(1))));
    }

    let throughput_path = out_dir.join("throughput.csv");
    let mut writer = csv::Writer::from_path(&throughput_path)?;
    for (label, series) in &all {
        write_series(&mut writer, label, series)?;
    }
    writer.flush()?;
    Ok((latency_path, throughput_path))
}

fn write_series<W: std::io::Write>(
    writer: &mut csv::Writer<W>,
    label: &str,
    series: &TimeSeries,
) -> csv::Result<()> {
    for point in &series.points {
        writer.serialize(ThroughputRecord {
            series: label,
            start: point.start,
            value: point.value,
        })?;
    }
    Ok(())
}

/// A numeric group key, ordered numerically.
#[derive(Debug, Clone, Copy)]
struct GroupKey(f64);

impl PartialEq for GroupKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for GroupKey {}

impl PartialOrd for GroupKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GroupKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Debug, Serialize)]
struct BandRecord<'a> {
    group: f64,
    metric: &'a str,
    mean: f64,
    std: f64,
    count: usize,
}

/// Reads a results table and writes the mean and standard deviation of every
/// numeric column for each value of `group_by`.
pub fn bands(results: &Path, group_by: &str, out: &Path) -> anyhow::Result<usize> {
    let mut reader = csv::Reader::from_path(results)
        .with_context(|| format!("Failed to read {}", results.display()))?;
    let headers = reader.headers()?.clone();
    let column = |name: &str| headers.iter().position(|h| h == name);
    let group_column = column(group_by);
    let derived = (column("num_client_procs"), column("num_clients_per_proc"));
    let derivable = group_by == "num_clients" && derived.0.is_some() && derived.1.is_some();
    if group_column.is_none() && !derivable {
        bail!("{} has no column {group_by}", results.display());
    }

    let mut metrics: BTreeMap<&str, Vec<(GroupKey, f64)>> = BTreeMap::new();
    for record in reader.records() {
        let record = record?;
        let number = |index: Option<usize>| -> Option<f64> {
            record.get(index?)?.trim().parse().ok()
        };
        let key = match group_column {
            Some(index) => number(Some(index)),
            None => number(derived.0).zip(number(derived.1)).map(|(p, c)| p * c),
        };
        let Some(key) = key else {
            warn!(?record, "Skipping row without a group");
            continue;
        };
        for (index, name) in headers.iter().enumerate() {
            if Some(index) == group_column || name == "trial" {
                continue;
            }
            if let Some(value) = number(Some(index)) {
                metrics.entry(name).or_default().push((GroupKey(key), value));
            }
        }
    }

    let mut writer = csv::Writer::from_path(out)
        .with_context(|| format!("Failed to create {}", out.display()))?;
    let mut written = 0;
    for (metric, rows) in metrics {
        for (key, band) in group_bands(rows) {
            writer.serialize(BandRecord {
                group: key.0,
                metric,
                mean: band.mean,
                std: band.std,
                count: band.count,
            })?;
            written += 1;
        }
    }
    writer.flush()?;
    info!(bands = written, path = ?out, "Wrote bands");
    Ok(written)
}
